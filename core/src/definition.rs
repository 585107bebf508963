//! The compiled, immutable tree definition.

use crate::binding::{CopyBatch, PropertyRefBinding};
use crate::context::ContextDescriptor;
use crate::handle::{
    BatchIndex, DefinitionId, NodeIndex, NodeRange, StateIndex, TransitionIndex,
};
use crate::instance::InstanceStorage;
use crate::node::Node;
use crate::shared::SharedInstanceCache;
use crate::state::{CompactState, CompactTransition, StateKind};
use crate::status::CompletionPolicy;
use crate::value::{StructType, StructValue};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TreeSettings {
    /// How global task statuses combine into a tree-wide completion.
    pub global_completion: CompletionPolicy,
}

/// Read-only compiled tree, shared by every execution that runs it.
pub struct TreeDefinition {
    pub(crate) id: DefinitionId,
    pub(crate) name: String,
    pub(crate) settings: TreeSettings,
    pub(crate) states: Vec<CompactState>,
    pub(crate) nodes: Vec<Node>,
    pub(crate) transitions: Vec<CompactTransition>,
    pub(crate) evaluators: NodeRange,
    pub(crate) global_tasks: NodeRange,
    pub(crate) global_completion_mask: u32,
    pub(crate) instance_types: Vec<Arc<StructType>>,
    pub(crate) batches: Vec<CopyBatch>,
    pub(crate) property_refs: Vec<PropertyRefBinding>,
    pub(crate) parameters: StructValue,
    pub(crate) state_parameters: Vec<Option<StructValue>>,
    pub(crate) context: Vec<ContextDescriptor>,
    pub(crate) state_names: AHashMap<String, StateIndex>,
    pub(crate) state_ids: AHashMap<Uuid, StateIndex>,
    pub(crate) node_ids: AHashMap<Uuid, NodeIndex>,
    pub(crate) transition_ids: AHashMap<Uuid, TransitionIndex>,
    pub(crate) shared: SharedInstanceCache,
}

impl TreeDefinition {
    pub fn id(&self) -> DefinitionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &TreeSettings {
        &self.settings
    }

    pub fn states(&self) -> &[CompactState] {
        &self.states
    }

    pub fn state(&self, index: StateIndex) -> Option<&CompactState> {
        self.states.get(index.index())
    }

    /// Name of a state, for diagnostics.
    pub fn state_name(&self, index: StateIndex) -> &str {
        self.state(index).map_or("(invalid)", |s| s.name.as_str())
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, index: NodeIndex) -> Option<&Node> {
        self.nodes.get(index.index())
    }

    pub fn transitions(&self) -> &[CompactTransition] {
        &self.transitions
    }

    pub fn transition(&self, index: TransitionIndex) -> Option<&CompactTransition> {
        self.transitions.get(index.index())
    }

    pub fn evaluators(&self) -> NodeRange {
        self.evaluators
    }

    pub fn global_tasks(&self) -> NodeRange {
        self.global_tasks
    }

    pub fn global_completion_mask(&self) -> u32 {
        self.global_completion_mask
    }

    pub fn instance_types(&self) -> &[Arc<StructType>] {
        &self.instance_types
    }

    pub fn batch(&self, index: BatchIndex) -> Option<&CopyBatch> {
        self.batches.get(index.index())
    }

    pub fn batches(&self) -> &[CopyBatch] {
        &self.batches
    }

    pub fn property_ref(&self, index: u16) -> Option<&PropertyRefBinding> {
        self.property_refs.get(index as usize)
    }

    pub fn default_parameters(&self) -> &StructValue {
        &self.parameters
    }

    pub fn context_descriptors(&self) -> &[ContextDescriptor] {
        &self.context
    }

    pub fn context_index(&self, name: &str) -> Option<u16> {
        self.context
            .iter()
            .position(|d| d.name == name)
            .map(|i| i as u16)
    }

    pub fn shared_instances(&self) -> &SharedInstanceCache {
        &self.shared
    }

    pub fn state_by_name(&self, name: &str) -> Option<StateIndex> {
        self.state_names.get(name).copied()
    }

    pub fn state_by_id(&self, id: Uuid) -> Option<StateIndex> {
        self.state_ids.get(&id).copied()
    }

    pub fn node_by_id(&self, id: Uuid) -> Option<NodeIndex> {
        self.node_ids.get(&id).copied()
    }

    pub fn transition_by_id(&self, id: Uuid) -> Option<TransitionIndex> {
        self.transition_ids.get(&id).copied()
    }

    /// Direct children of a state, in declaration order.
    pub fn children(&self, parent: StateIndex) -> Children<'_> {
        let end = self.state(parent).map_or(0, |s| s.subtree_end);
        Children {
            states: &self.states,
            next: parent.0.saturating_add(1),
            end,
        }
    }

    /// States from the top-level ancestor down to `state`, inclusive.
    pub fn path_to(&self, state: StateIndex) -> Vec<StateIndex> {
        let mut path = Vec::new();
        let mut current = Some(state);
        while let Some(index) = current {
            path.push(index);
            current = self.state(index).and_then(|s| s.parent);
        }
        path.reverse();
        path
    }

    /// Top-level state that contains `state`.
    pub fn top_level_of(&self, state: StateIndex) -> StateIndex {
        self.path_to(state).first().copied().unwrap_or(state)
    }

    /// First [`StateKind::Subtree`] state named `name`, for linking.
    pub fn subtree(&self, name: &str) -> Option<StateIndex> {
        self.state_by_name(name)
            .filter(|s| self.state(*s).is_some_and(|s| s.kind == StateKind::Subtree))
    }

    /// Fresh per-frame storage with the given (or default) parameters.
    pub fn new_storage(&self, parameters: Option<StructValue>) -> InstanceStorage {
        let parameters = match parameters {
            Some(p) if p.ty().name() == self.parameters.ty().name() => p,
            Some(p) => {
                tracing::warn!(
                    tree = %self.name,
                    expected = self.parameters.type_name(),
                    found = p.type_name(),
                    "parameters of the wrong type, using defaults"
                );
                self.parameters.clone()
            }
            None => self.parameters.clone(),
        };
        InstanceStorage::new(&self.instance_types, parameters, self.state_parameters.clone())
    }
}

impl fmt::Debug for TreeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("states", &self.states.len())
            .field("nodes", &self.nodes.len())
            .field("transitions", &self.transitions.len())
            .finish()
    }
}

pub struct Children<'a> {
    states: &'a [CompactState],
    next: u16,
    end: u16,
}

impl Iterator for Children<'_> {
    type Item = StateIndex;

    fn next(&mut self) -> Option<StateIndex> {
        if self.next >= self.end {
            return None;
        }
        let current = self.next;
        self.next = self.states.get(current as usize)?.subtree_end;
        Some(StateIndex(current))
    }
}

/// Definitions addressable by id, for linked asset states.
#[derive(Debug, Default, Clone)]
pub struct TreeLibrary {
    trees: AHashMap<DefinitionId, Arc<TreeDefinition>>,
}

impl TreeLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tree: Arc<TreeDefinition>) {
        self.trees.insert(tree.id(), tree);
    }

    pub fn with(mut self, tree: Arc<TreeDefinition>) -> Self {
        self.insert(tree);
        self
    }

    pub fn get(&self, id: DefinitionId) -> Option<&Arc<TreeDefinition>> {
        self.trees.get(&id)
    }

    pub fn len(&self) -> usize {
        self.trees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }
}
