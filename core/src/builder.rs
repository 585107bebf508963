//! Builds compact definitions from nested state descriptions.
//!
//! States are laid out depth-first so a state's descendants occupy the
//! contiguous range `index + 1 .. subtree_end`. Nodes of one list (enter
//! conditions, considerations, tasks, transition conditions) are contiguous;
//! property functions are placed right before the node that consumes them.
//!
//! Binding sources are scoped the way they will be available at runtime:
//! evaluators and global tasks everywhere, a state's tasks in its own
//! transitions and in its descendants, and earlier tasks of the same state.

use crate::binding::{BindingDesc, CopyBatch, DataHandle, PropertyPath, PropertyRefBinding};
use crate::context::{ContextDescriptor, ContextKind};
use crate::definition::{TreeDefinition, TreeSettings};
use crate::delegate::DelegateId;
use crate::error::{BindingError, LinkError, TreeResult};
use crate::event::EventDesc;
use crate::handle::{
    BatchIndex, DefinitionId, InstanceHandle, InstanceIndex, NodeIndex, NodeRange, SharedIndex,
    StateIndex, TransitionIndex,
};
use crate::node::{
    Condition, Consideration, Evaluator, Linker, Node, NodeKind, Operand, PropertyFunction, Task,
};
use crate::shared::SharedInstanceCache;
use crate::state::{
    CompactState, CompactTransition, Priority, SelectionBehavior, SelectionFallback, StateKind,
    TransitionDelay, TransitionTarget, TransitionTrigger,
};
use crate::status::{CompletionPolicy, MAX_TASKS_PER_GROUP};
use crate::value::{StructType, StructValue, ValueType};
use ahash::AHashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Deepest indent a condition or consideration expression may use.
pub const MAX_EXPRESSION_INDENT: i32 = 4;

/// Authored source of a property binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingSource {
    /// Struct context data, by descriptor name.
    Context(String),
    /// The tree's parameters.
    Parameters,
    /// Parameter block of a state, by state name.
    StateParameters(String),
    /// Instance data of a task, evaluator or property function, by node name.
    Node(String),
}

impl fmt::Display for BindingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingSource::Context(name) => write!(f, "context '{name}'"),
            BindingSource::Parameters => f.write_str("parameters"),
            BindingSource::StateParameters(state) => write!(f, "parameters of state '{state}'"),
            BindingSource::Node(name) => write!(f, "node '{name}'"),
        }
    }
}

#[derive(Debug, Clone)]
struct BindingSpec {
    source: BindingSource,
    source_path: String,
    target_path: String,
}

#[derive(Debug, Clone)]
struct ReferenceSpec {
    field: String,
    source: BindingSource,
    path: String,
}

pub struct NodeDesc {
    id: Uuid,
    name: Option<String>,
    kind: NodeKind,
    enabled: bool,
    considered_for_completion: bool,
    operand: Operand,
    indent: i32,
    invert: bool,
    bindings: Vec<BindingSpec>,
    references: Vec<ReferenceSpec>,
    functions: Vec<NodeDesc>,
}

impl NodeDesc {
    fn with_kind(kind: NodeKind) -> Self {
        NodeDesc {
            id: Uuid::new_v4(),
            name: None,
            kind,
            enabled: true,
            considered_for_completion: true,
            operand: Operand::And,
            indent: 0,
            invert: false,
            bindings: Vec::new(),
            references: Vec::new(),
            functions: Vec::new(),
        }
    }

    pub fn task(task: impl Task + 'static) -> Self {
        Self::with_kind(NodeKind::Task(Box::new(task)))
    }

    pub fn evaluator(evaluator: impl Evaluator + 'static) -> Self {
        Self::with_kind(NodeKind::Evaluator(Box::new(evaluator)))
    }

    pub fn condition(condition: impl Condition + 'static) -> Self {
        Self::with_kind(NodeKind::Condition(Box::new(condition)))
    }

    pub fn consideration(consideration: impl Consideration + 'static) -> Self {
        Self::with_kind(NodeKind::Consideration(Box::new(consideration)))
    }

    pub fn function(function: impl PropertyFunction + 'static) -> Self {
        Self::with_kind(NodeKind::PropertyFunction(Box::new(function)))
    }

    pub fn id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn considered_for_completion(mut self, considered: bool) -> Self {
        self.considered_for_completion = considered;
        self
    }

    pub fn operand(mut self, operand: Operand) -> Self {
        self.operand = operand;
        self
    }

    pub fn indent(mut self, indent: i32) -> Self {
        self.indent = indent;
        self
    }

    pub fn invert(mut self) -> Self {
        self.invert = true;
        self
    }

    /// Copies `source_path` of `source` into `target_path` of this node's instance data.
    pub fn bind(mut self, source: BindingSource, source_path: &str, target_path: &str) -> Self {
        self.bindings.push(BindingSpec {
            source,
            source_path: source_path.to_string(),
            target_path: target_path.to_string(),
        });
        self
    }

    /// Points the reference field `field` at `path` of `source`.
    pub fn reference(mut self, field: &str, source: BindingSource, path: &str) -> Self {
        self.references.push(ReferenceSpec {
            field: field.to_string(),
            source,
            path: path.to_string(),
        });
        self
    }

    /// Adds a property function evaluated right before this node's bindings.
    /// Bind to its output with [`BindingSource::Node`] and the function's name.
    pub fn with_function(mut self, function: NodeDesc) -> Self {
        self.functions.push(function);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetDesc {
    State(String),
    NextState,
    /// The next sibling, falling through to the following ones if it cannot be selected.
    NextSelectableState,
    Succeeded,
    Failed,
    Stopped,
    None,
}

impl TargetDesc {
    pub fn state(name: impl Into<String>) -> Self {
        TargetDesc::State(name.into())
    }
}

pub struct TransitionDesc {
    id: Uuid,
    trigger: TransitionTrigger,
    event: Option<EventDesc>,
    consume_event: bool,
    target: TargetDesc,
    priority: Priority,
    conditions: Vec<NodeDesc>,
    delay: Option<TransitionDelay>,
    enabled: bool,
}

impl TransitionDesc {
    pub fn new(trigger: TransitionTrigger, target: TargetDesc) -> Self {
        TransitionDesc {
            id: Uuid::new_v4(),
            trigger,
            event: None,
            consume_event: true,
            target,
            priority: Priority::Normal,
            conditions: Vec::new(),
            delay: None,
            enabled: true,
        }
    }

    pub fn on_tick(target: TargetDesc) -> Self {
        Self::new(TransitionTrigger::OnTick, target)
    }

    pub fn on_event(event: EventDesc, target: TargetDesc) -> Self {
        let mut desc = Self::new(TransitionTrigger::OnEvent, target);
        desc.event = Some(event);
        desc
    }

    /// Fires when `delegate` is broadcast by a task of the same tree.
    pub fn on_delegate(delegate: DelegateId, target: TargetDesc) -> Self {
        Self::new(TransitionTrigger::OnDelegate(delegate), target)
    }

    pub fn on_completed(target: TargetDesc) -> Self {
        Self::new(TransitionTrigger::OnStateCompleted, target)
    }

    pub fn on_succeeded(target: TargetDesc) -> Self {
        Self::new(TransitionTrigger::OnStateSucceeded, target)
    }

    pub fn on_failed(target: TargetDesc) -> Self {
        Self::new(TransitionTrigger::OnStateFailed, target)
    }

    pub fn id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn condition(mut self, condition: NodeDesc) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn delay(mut self, duration: f32, variance: f32) -> Self {
        self.delay = Some(TransitionDelay { duration, variance });
        self
    }

    pub fn consume_event(mut self, consume: bool) -> Self {
        self.consume_event = consume;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

pub struct StateDesc {
    id: Uuid,
    name: String,
    kind: StateKind,
    selection: SelectionBehavior,
    completion: CompletionPolicy,
    enabled: bool,
    weight: f32,
    check_prerequisites: bool,
    required_event: Option<EventDesc>,
    linked_subtree: Option<String>,
    linked_asset: Option<DefinitionId>,
    parameters: Option<StructValue>,
    parameter_bindings: Vec<BindingSpec>,
    enter_conditions: Vec<NodeDesc>,
    considerations: Vec<NodeDesc>,
    tasks: Vec<NodeDesc>,
    transitions: Vec<TransitionDesc>,
    children: Vec<StateDesc>,
}

impl StateDesc {
    pub fn new(name: impl Into<String>) -> Self {
        StateDesc {
            id: Uuid::new_v4(),
            name: name.into(),
            kind: StateKind::State,
            selection: SelectionBehavior::default(),
            completion: CompletionPolicy::default(),
            enabled: true,
            weight: 1.0,
            check_prerequisites: false,
            required_event: None,
            linked_subtree: None,
            linked_asset: None,
            parameters: None,
            parameter_bindings: Vec::new(),
            enter_conditions: Vec::new(),
            considerations: Vec::new(),
            tasks: Vec::new(),
            transitions: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn group(name: impl Into<String>) -> Self {
        let mut desc = Self::new(name);
        desc.kind = StateKind::Group;
        desc
    }

    pub fn subtree(name: impl Into<String>) -> Self {
        let mut desc = Self::new(name);
        desc.kind = StateKind::Subtree;
        desc
    }

    /// Runs the subtree state `subtree` of the same definition.
    pub fn linked(name: impl Into<String>, subtree: impl Into<String>) -> Self {
        let mut desc = Self::new(name);
        desc.kind = StateKind::Linked;
        desc.linked_subtree = Some(subtree.into());
        desc
    }

    /// Runs the definition `asset`, looked up in the execution's library.
    pub fn linked_asset(name: impl Into<String>, asset: DefinitionId) -> Self {
        let mut desc = Self::new(name);
        desc.kind = StateKind::LinkedAsset;
        desc.linked_asset = Some(asset);
        desc
    }

    pub fn id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn selection(mut self, selection: SelectionBehavior) -> Self {
        self.selection = selection;
        self
    }

    pub fn completion(mut self, completion: CompletionPolicy) -> Self {
        self.completion = completion;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn weight(mut self, weight: f32) -> Self {
        self.weight = weight;
        self
    }

    /// Also test this state's enter conditions when a descendant is targeted directly.
    pub fn check_prerequisites(mut self, check: bool) -> Self {
        self.check_prerequisites = check;
        self
    }

    pub fn required_event(mut self, event: EventDesc) -> Self {
        self.required_event = Some(event);
        self
    }

    pub fn parameters(mut self, parameters: StructValue) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn bind_parameter(mut self, source: BindingSource, source_path: &str, target_path: &str) -> Self {
        self.parameter_bindings.push(BindingSpec {
            source,
            source_path: source_path.to_string(),
            target_path: target_path.to_string(),
        });
        self
    }

    pub fn enter_condition(mut self, condition: NodeDesc) -> Self {
        self.enter_conditions.push(condition);
        self
    }

    pub fn consideration(mut self, consideration: NodeDesc) -> Self {
        self.considerations.push(consideration);
        self
    }

    pub fn task(mut self, task: NodeDesc) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn transition(mut self, transition: TransitionDesc) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn child(mut self, child: StateDesc) -> Self {
        self.children.push(child);
        self
    }
}

pub struct TreeBuilder {
    id: DefinitionId,
    name: String,
    settings: TreeSettings,
    parameters: Option<StructValue>,
    context: Vec<ContextDescriptor>,
    evaluators: Vec<NodeDesc>,
    global_tasks: Vec<NodeDesc>,
    states: Vec<StateDesc>,
}

impl TreeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        TreeBuilder {
            id: DefinitionId::new(),
            name: name.into(),
            settings: TreeSettings::default(),
            parameters: None,
            context: Vec::new(),
            evaluators: Vec::new(),
            global_tasks: Vec::new(),
            states: Vec::new(),
        }
    }

    /// Uses a known id, so other definitions can link to this one before it is built.
    pub fn id(mut self, id: DefinitionId) -> Self {
        self.id = id;
        self
    }

    pub fn settings(mut self, settings: TreeSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn parameters(mut self, parameters: StructValue) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn context(mut self, descriptor: ContextDescriptor) -> Self {
        self.context.push(descriptor);
        self
    }

    pub fn evaluator(mut self, evaluator: NodeDesc) -> Self {
        self.evaluators.push(evaluator);
        self
    }

    pub fn global_task(mut self, task: NodeDesc) -> Self {
        self.global_tasks.push(task);
        self
    }

    /// Adds a top-level state. The first one is the root.
    pub fn state(mut self, state: StateDesc) -> Self {
        self.states.push(state);
        self
    }

    pub fn build(self) -> TreeResult<TreeDefinition> {
        let span = tracing::debug_span!("build_tree", tree = %self.name);
        let _enter = span.enter();

        if self.states.is_empty() {
            return Err(LinkError::EmptyTree(self.name).into());
        }
        let parameters = self
            .parameters
            .unwrap_or_else(|| StructValue::new(&StructType::new("Parameters", Vec::new())));

        let mut compiler = Compiler::new(self.name.clone(), parameters.ty().clone(), self.context);
        let mut flat = Vec::new();
        for state in self.states {
            compiler.layout(state, None, 0, &mut flat)?;
        }
        compiler.state_parameters = vec![None; compiler.states.len()];

        let begin = compiler.node_cursor()?;
        for evaluator in self.evaluators {
            expect_kind(&evaluator, "evaluator")?;
            compiler.compile_node(evaluator)?;
        }
        let evaluators = NodeRange::new(begin, compiler.node_cursor()?);

        let (global_tasks, global_completion_mask) =
            compiler.compile_tasks(&self.name, self.global_tasks)?;

        for (i, desc) in flat.into_iter().enumerate() {
            compiler.compile_state(StateIndex(i as u16), desc)?;
        }

        tracing::debug!(
            states = compiler.states.len(),
            nodes = compiler.nodes.len(),
            transitions = compiler.transitions.len(),
            "tree built"
        );

        Ok(TreeDefinition {
            id: self.id,
            name: self.name,
            settings: self.settings,
            states: compiler.states,
            nodes: compiler.nodes,
            transitions: compiler.transitions,
            evaluators,
            global_tasks,
            global_completion_mask,
            instance_types: compiler.instance_types,
            batches: compiler.batches,
            property_refs: compiler.property_refs,
            parameters,
            state_parameters: compiler.state_parameters,
            context: compiler.context,
            state_names: compiler.state_names,
            state_ids: compiler.state_ids,
            node_ids: compiler.node_ids,
            transition_ids: compiler.transition_ids,
            shared: SharedInstanceCache::new(compiler.shared_types),
        })
    }
}

fn expect_kind(desc: &NodeDesc, expected: &'static str) -> Result<(), LinkError> {
    let found = desc.kind.kind_name();
    if found == expected {
        return Ok(());
    }
    Err(LinkError::NodeLinkFailed {
        node: desc
            .name
            .clone()
            .unwrap_or_else(|| short_type_name(desc.kind.base().type_name())),
        reason: format!("expected a {expected}, found a {found}"),
    })
}

fn short_type_name(full: &str) -> String {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

struct Scope {
    state: Option<StateIndex>,
    names: Vec<String>,
}

struct Compiler {
    tree_name: String,
    parameters_type: Arc<StructType>,
    states: Vec<CompactState>,
    nodes: Vec<Node>,
    transitions: Vec<CompactTransition>,
    instance_types: Vec<Arc<StructType>>,
    shared_types: Vec<Arc<StructType>>,
    batches: Vec<CopyBatch>,
    property_refs: Vec<PropertyRefBinding>,
    state_parameters: Vec<Option<StructValue>>,
    context: Vec<ContextDescriptor>,
    state_names: AHashMap<String, StateIndex>,
    state_ids: AHashMap<Uuid, StateIndex>,
    node_ids: AHashMap<Uuid, NodeIndex>,
    transition_ids: AHashMap<Uuid, TransitionIndex>,
    sources: AHashMap<String, (DataHandle, Arc<StructType>)>,
    scopes: Vec<Scope>,
    next_delegate: u16,
}

impl Compiler {
    fn new(tree_name: String, parameters_type: Arc<StructType>, context: Vec<ContextDescriptor>) -> Self {
        Compiler {
            tree_name,
            parameters_type,
            states: Vec::new(),
            nodes: Vec::new(),
            transitions: Vec::new(),
            instance_types: Vec::new(),
            shared_types: Vec::new(),
            batches: Vec::new(),
            property_refs: Vec::new(),
            state_parameters: Vec::new(),
            context,
            state_names: AHashMap::new(),
            state_ids: AHashMap::new(),
            node_ids: AHashMap::new(),
            transition_ids: AHashMap::new(),
            sources: AHashMap::new(),
            scopes: vec![Scope {
                state: None,
                names: Vec::new(),
            }],
            next_delegate: 0,
        }
    }

    fn to_u16(&self, value: usize) -> Result<u16, LinkError> {
        u16::try_from(value).map_err(|_| LinkError::TooLarge(self.tree_name.clone()))
    }

    fn node_cursor(&self) -> Result<u16, LinkError> {
        self.to_u16(self.nodes.len())
    }

    fn layout(
        &mut self,
        mut desc: StateDesc,
        parent: Option<StateIndex>,
        depth: u16,
        flat: &mut Vec<StateDesc>,
    ) -> TreeResult<()> {
        let index = StateIndex(self.to_u16(self.states.len())?);
        if self.state_names.insert(desc.name.clone(), index).is_some() {
            return Err(LinkError::DuplicateState(desc.name).into());
        }
        self.state_ids.insert(desc.id, index);
        let children = std::mem::take(&mut desc.children);
        self.states.push(CompactState {
            id: desc.id,
            name: desc.name.clone(),
            kind: desc.kind,
            parent,
            subtree_end: index.0 + 1,
            depth,
            linked_state: None,
            linked_asset: desc.linked_asset,
            selection: desc.selection,
            completion: desc.completion,
            enter_conditions: NodeRange::EMPTY,
            considerations: NodeRange::EMPTY,
            tasks: NodeRange::EMPTY,
            transitions: (TransitionIndex(0), TransitionIndex(0)),
            completion_mask: 0,
            parameter_bindings: None,
            has_parameters: desc.parameters.is_some(),
            weight: desc.weight,
            enabled: desc.enabled,
            check_prerequisites_when_activating_child_directly: desc.check_prerequisites,
            required_event: desc.required_event.clone(),
        });
        flat.push(desc);
        for child in children {
            self.layout(child, Some(index), depth + 1, flat)?;
        }
        let end = self.to_u16(self.states.len())?;
        self.states[index.index()].subtree_end = end;
        Ok(())
    }

    /// Drops sources of states that are not ancestors of `state`, then opens its scope.
    fn enter_scope(&mut self, state: StateIndex) {
        while let Some(scope) = self.scopes.last() {
            let Some(open) = scope.state else { break };
            let open_end = self.states[open.index()].subtree_end;
            if state.0 > open.0 && state.0 < open_end {
                break;
            }
            if let Some(scope) = self.scopes.pop() {
                for name in scope.names {
                    self.sources.remove(&name);
                }
            }
        }
        self.scopes.push(Scope {
            state: Some(state),
            names: Vec::new(),
        });
    }

    fn register_source(&mut self, name: String, handle: DataHandle, ty: Arc<StructType>) {
        self.sources.insert(name.clone(), (handle, ty));
        if let Some(scope) = self.scopes.last_mut() {
            scope.names.push(name);
        }
    }

    fn resolve_source(&self, source: &BindingSource) -> Result<(DataHandle, Arc<StructType>), LinkError> {
        let unknown = || LinkError::UnknownBindingSource(source.to_string());
        match source {
            BindingSource::Parameters => Ok((DataHandle::GlobalParameters, self.parameters_type.clone())),
            BindingSource::Context(name) => {
                let index = self.context.iter().position(|d| &d.name == name).ok_or_else(unknown)?;
                match &self.context[index].kind {
                    ContextKind::Struct(ty) => Ok((DataHandle::Context(self.to_u16(index)?), ty.clone())),
                    ContextKind::External { .. } => Err(unknown()),
                }
            }
            BindingSource::StateParameters(state) => {
                let index = *self.state_names.get(state).ok_or_else(unknown)?;
                let params = self
                    .state_parameters
                    .get(index.index())
                    .and_then(Option::as_ref)
                    .ok_or_else(unknown)?;
                Ok((DataHandle::StateParameters(index), params.ty().clone()))
            }
            BindingSource::Node(name) => self.sources.get(name).cloned().ok_or_else(unknown),
        }
    }

    fn binding_desc(&self, spec: BindingSpec) -> TreeResult<BindingDesc> {
        let (source, source_type) = self.resolve_source(&spec.source)?;
        Ok(BindingDesc {
            source,
            source_type,
            source_path: PropertyPath::parse(&spec.source_path)?,
            target_path: PropertyPath::parse(&spec.target_path)?,
        })
    }

    fn compile_batch(
        &mut self,
        owner: &str,
        target: &Arc<StructType>,
        specs: Vec<BindingSpec>,
        functions: NodeRange,
    ) -> TreeResult<BatchIndex> {
        let bindings = specs
            .into_iter()
            .map(|spec| self.binding_desc(spec))
            .collect::<TreeResult<Vec<_>>>()?;
        let batch = CopyBatch::compile(target, bindings, functions).inspect_err(|error| {
            tracing::error!(tree = %self.tree_name, node = owner, %error, "static binding failed to resolve");
        })?;
        let index = BatchIndex(self.to_u16(self.batches.len())?);
        self.batches.push(batch);
        Ok(index)
    }

    fn compile_node(&mut self, desc: NodeDesc) -> TreeResult<NodeIndex> {
        let NodeDesc {
            id,
            name,
            mut kind,
            enabled,
            considered_for_completion,
            operand,
            indent,
            invert,
            bindings,
            references,
            functions,
        } = desc;
        let name = name.unwrap_or_else(|| short_type_name(kind.base().type_name()));

        let functions_begin = self.node_cursor()?;
        for function in functions {
            expect_kind(&function, "property_function")?;
            self.compile_node(function)?;
        }
        let functions_range = NodeRange::new(functions_begin, self.node_cursor()?);

        let index = NodeIndex(self.node_cursor()?);
        if !(0..=MAX_EXPRESSION_INDENT).contains(&indent) {
            return Err(LinkError::ExpressionTooDeep {
                node: name,
                indent,
                max: MAX_EXPRESSION_INDENT,
            }
            .into());
        }

        let instance_type = kind.base().instance_type();
        let instance = match &instance_type {
            Some(ty) if kind.uses_shared_instance() => {
                let slot = SharedIndex(self.to_u16(self.shared_types.len())?);
                self.shared_types.push(ty.clone());
                Some(InstanceHandle::Shared(slot))
            }
            Some(ty) => {
                let slot = InstanceIndex(self.to_u16(self.instance_types.len())?);
                self.instance_types.push(ty.clone());
                Some(InstanceHandle::Default(slot))
            }
            None => None,
        };

        let batch = if bindings.is_empty() && functions_range.is_empty() {
            None
        } else {
            let Some(target) = &instance_type else {
                return Err(LinkError::NodeLinkFailed {
                    node: name,
                    reason: "bindings on a node without instance data".to_string(),
                }
                .into());
            };
            Some(self.compile_batch(&name, target, bindings, functions_range)?)
        };

        let mut reference_slots = Vec::with_capacity(references.len());
        for reference in references {
            let Some(target) = &instance_type else {
                return Err(LinkError::NodeLinkFailed {
                    node: name,
                    reason: "references on a node without instance data".to_string(),
                }
                .into());
            };
            let field = target.field_index(&reference.field).and_then(|i| target.field(i));
            let expected = match field.map(|f| &f.ty) {
                Some(ValueType::PropertyRef(inner)) => (**inner).clone(),
                Some(_) => return Err(BindingError::NotAReference(reference.field).into()),
                None => {
                    return Err(BindingError::MissingField {
                        path: reference.field.clone(),
                        segment: reference.field,
                        type_name: target.name().to_string(),
                    }
                    .into());
                }
            };
            let (source, source_type) = self.resolve_source(&reference.source)?;
            let binding = PropertyRefBinding::compile(
                source,
                &source_type,
                PropertyPath::parse(&reference.path)?,
                &expected,
            )?;
            let slot = self.to_u16(self.property_refs.len())?;
            self.property_refs.push(binding);
            reference_slots.push((reference.field, slot));
        }

        {
            let mut linker = Linker::new(
                &self.tree_name,
                &name,
                &self.states,
                &self.state_names,
                &mut self.context,
                &mut self.next_delegate,
            );
            kind.base_mut().link(&mut linker).inspect_err(|error| {
                tracing::error!(tree = %self.tree_name, node = %name, %error, "node failed to link");
            })?;
        }

        if let (Some(ty), Some(handle)) = (&instance_type, instance) {
            let source = match handle {
                InstanceHandle::Default(slot) => Some(DataHandle::Instance(slot)),
                InstanceHandle::Shared(slot) if matches!(kind, NodeKind::PropertyFunction(_)) => {
                    Some(DataHandle::Shared(slot))
                }
                InstanceHandle::Shared(_) => None,
            };
            if let Some(source) = source {
                self.register_source(name.clone(), source, ty.clone());
            }
        }

        self.node_ids.insert(id, index);
        self.nodes.push(Node {
            id,
            name,
            kind,
            instance,
            bindings: batch,
            references: reference_slots,
            operand,
            indent,
            invert,
            enabled,
            considered_for_completion,
        });
        Ok(index)
    }

    fn compile_list(&mut self, descs: Vec<NodeDesc>, expected: &'static str) -> TreeResult<NodeRange> {
        let begin = self.node_cursor()?;
        for desc in descs {
            expect_kind(&desc, expected)?;
            self.compile_node(desc)?;
        }
        Ok(NodeRange::new(begin, self.node_cursor()?))
    }

    fn compile_tasks(&mut self, owner: &str, tasks: Vec<NodeDesc>) -> TreeResult<(NodeRange, u32)> {
        if tasks.len() > MAX_TASKS_PER_GROUP {
            return Err(LinkError::TooManyTasks {
                state: owner.to_string(),
                count: tasks.len(),
                max: MAX_TASKS_PER_GROUP,
            }
            .into());
        }
        let mask = tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.enabled && t.considered_for_completion)
            .fold(0u32, |mask, (i, _)| mask | (1 << i));
        let range = self.compile_list(tasks, "task")?;
        Ok((range, mask))
    }

    fn compile_state(&mut self, index: StateIndex, desc: StateDesc) -> TreeResult<()> {
        self.enter_scope(index);

        if let Some(subtree) = &desc.linked_subtree {
            let target = self
                .state_names
                .get(subtree)
                .copied()
                .filter(|s| self.states[s.index()].kind == StateKind::Subtree)
                .ok_or_else(|| LinkError::UnknownState(subtree.clone()))?;
            self.states[index.index()].linked_state = Some(target);
        }

        if let Some(parameters) = desc.parameters {
            let ty = parameters.ty().clone();
            self.state_parameters[index.index()] = Some(parameters);
            if !desc.parameter_bindings.is_empty() {
                let batch = self.compile_batch(&desc.name, &ty, desc.parameter_bindings, NodeRange::EMPTY)?;
                self.states[index.index()].parameter_bindings = Some(batch);
            }
        }

        let enter_conditions = self.compile_list(desc.enter_conditions, "condition")?;
        let considerations = self.compile_list(desc.considerations, "consideration")?;
        let (tasks, completion_mask) = self.compile_tasks(&desc.name, desc.tasks)?;

        let first_transition = TransitionIndex(self.to_u16(self.transitions.len())?);
        for transition in desc.transitions {
            self.compile_transition(index, transition)?;
        }
        let last_transition = TransitionIndex(self.to_u16(self.transitions.len())?);

        let state = &mut self.states[index.index()];
        state.enter_conditions = enter_conditions;
        state.considerations = considerations;
        state.tasks = tasks;
        state.completion_mask = completion_mask;
        state.transitions = (first_transition, last_transition);
        Ok(())
    }

    fn next_sibling(&self, state: StateIndex) -> Option<StateIndex> {
        let current = &self.states[state.index()];
        let next = current.subtree_end;
        let limit = match current.parent {
            Some(parent) => self.states[parent.index()].subtree_end,
            None => self.to_u16(self.states.len()).ok()?,
        };
        (next < limit).then_some(StateIndex(next))
    }

    fn compile_transition(&mut self, source: StateIndex, desc: TransitionDesc) -> TreeResult<()> {
        let source_name = self.states[source.index()].name.clone();
        let (target, fallback) = match &desc.target {
            TargetDesc::State(name) => {
                let index = self
                    .state_names
                    .get(name)
                    .copied()
                    .ok_or_else(|| LinkError::UnknownState(name.clone()))?;
                (TransitionTarget::State(index), SelectionFallback::None)
            }
            TargetDesc::NextState | TargetDesc::NextSelectableState => {
                let next = self
                    .next_sibling(source)
                    .ok_or_else(|| LinkError::UnknownState(format!("next state after '{source_name}'")))?;
                let fallback = if desc.target == TargetDesc::NextSelectableState {
                    SelectionFallback::NextSelectableSibling
                } else {
                    SelectionFallback::None
                };
                (TransitionTarget::State(next), fallback)
            }
            TargetDesc::Succeeded => (TransitionTarget::Succeeded, SelectionFallback::None),
            TargetDesc::Failed => (TransitionTarget::Failed, SelectionFallback::None),
            TargetDesc::Stopped => (TransitionTarget::Stopped, SelectionFallback::None),
            TargetDesc::None => (TransitionTarget::None, SelectionFallback::None),
        };
        if desc.trigger == TransitionTrigger::OnEvent && !desc.event.as_ref().is_some_and(EventDesc::is_valid) {
            tracing::warn!(tree = %self.tree_name, state = %source_name, "event transition without an event never triggers");
        }

        let conditions = self.compile_list(desc.conditions, "condition")?;
        let index = TransitionIndex(self.to_u16(self.transitions.len())?);
        self.transition_ids.insert(desc.id, index);
        self.transitions.push(CompactTransition {
            id: desc.id,
            source,
            trigger: desc.trigger,
            required_event: desc.event,
            consume_event: desc.consume_event,
            target,
            fallback,
            priority: desc.priority,
            conditions,
            delay: desc.delay,
            enabled: desc.enabled,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TreeError;
    use crate::node::{NodeBase, NodeContext};
    use crate::value::FieldDesc;

    struct Noop;
    impl NodeBase for Noop {}
    impl Task for Noop {}

    struct Counter;
    impl NodeBase for Counter {
        fn instance_type(&self) -> Option<Arc<StructType>> {
            Some(StructType::new("Counter", vec![FieldDesc::new("Count", ValueType::Int)]))
        }
    }
    impl Task for Counter {}

    struct Always;
    impl NodeBase for Always {}
    impl Condition for Always {
        fn test_condition(&self, _ctx: &mut NodeContext<'_>) -> bool {
            true
        }
    }

    struct AtLeast;
    impl NodeBase for AtLeast {
        fn instance_type(&self) -> Option<Arc<StructType>> {
            Some(StructType::new("AtLeast", vec![FieldDesc::new("Value", ValueType::Int)]))
        }
    }
    impl Condition for AtLeast {
        fn test_condition(&self, ctx: &mut NodeContext<'_>) -> bool {
            ctx.instance().and_then(|i| i.int("Value")).unwrap_or(0) > 0
        }
    }

    #[test]
    fn test_layout_is_depth_first() {
        let tree = TreeBuilder::new("layout")
            .state(
                StateDesc::new("Root")
                    .child(StateDesc::new("A").child(StateDesc::new("A1")))
                    .child(StateDesc::new("B")),
            )
            .build()
            .unwrap();
        let names: Vec<_> = tree.states().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["Root", "A", "A1", "B"]);
        assert_eq!(tree.states()[0].subtree_end, 4);
        assert_eq!(tree.states()[1].subtree_end, 3);
        assert_eq!(tree.states()[2].depth, 2);
        let children: Vec<_> = tree.children(StateIndex::ROOT).collect();
        assert_eq!(children, [StateIndex(1), StateIndex(3)]);
    }

    #[test]
    fn test_duplicate_state_name_is_rejected() {
        let err = TreeBuilder::new("dup")
            .state(StateDesc::new("Root").child(StateDesc::new("A")).child(StateDesc::new("A")))
            .build()
            .unwrap_err();
        assert!(matches!(err, TreeError::Link(LinkError::DuplicateState(name)) if name == "A"));
    }

    #[test]
    fn test_empty_tree_is_rejected() {
        let err = TreeBuilder::new("empty").build().unwrap_err();
        assert!(matches!(err, TreeError::Link(LinkError::EmptyTree(_))));
    }

    #[test]
    fn test_unknown_transition_target() {
        let err = TreeBuilder::new("unknown")
            .state(StateDesc::new("Root").transition(TransitionDesc::on_tick(TargetDesc::state("Nowhere"))))
            .build()
            .unwrap_err();
        assert!(matches!(err, TreeError::Link(LinkError::UnknownState(name)) if name == "Nowhere"));
    }

    #[test]
    fn test_too_many_tasks() {
        let mut state = StateDesc::new("Busy");
        for _ in 0..=MAX_TASKS_PER_GROUP {
            state = state.task(NodeDesc::task(Noop));
        }
        let err = TreeBuilder::new("busy").state(state).build().unwrap_err();
        assert!(matches!(
            err,
            TreeError::Link(LinkError::TooManyTasks { count: 33, max: 32, .. })
        ));
    }

    #[test]
    fn test_next_state_resolves_to_sibling() {
        let tree = TreeBuilder::new("next")
            .state(
                StateDesc::new("Root")
                    .child(
                        StateDesc::new("A")
                            .child(StateDesc::new("A1"))
                            .transition(TransitionDesc::on_completed(TargetDesc::NextSelectableState)),
                    )
                    .child(StateDesc::new("B")),
            )
            .build()
            .unwrap();
        let transition = &tree.transitions()[0];
        assert_eq!(transition.target, TransitionTarget::State(StateIndex(3)));
        assert_eq!(transition.fallback, SelectionFallback::NextSelectableSibling);
    }

    #[test]
    fn test_next_state_without_sibling_fails() {
        let err = TreeBuilder::new("last")
            .state(
                StateDesc::new("Root")
                    .child(StateDesc::new("A").transition(TransitionDesc::on_tick(TargetDesc::NextState))),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, TreeError::Link(LinkError::UnknownState(_))));
    }

    #[test]
    fn test_completion_mask_skips_uncounted_tasks() {
        let tree = TreeBuilder::new("mask")
            .state(
                StateDesc::new("Root")
                    .task(NodeDesc::task(Noop))
                    .task(NodeDesc::task(Noop).considered_for_completion(false))
                    .task(NodeDesc::task(Noop)),
            )
            .build()
            .unwrap();
        assert_eq!(tree.states()[0].completion_mask, 0b101);
        assert_eq!(tree.states()[0].tasks.len(), 3);
    }

    #[test]
    fn test_binding_to_earlier_task_in_scope() {
        let tree = TreeBuilder::new("scope")
            .state(
                StateDesc::new("Root")
                    .task(NodeDesc::task(Counter).named("Source"))
                    .child(
                        StateDesc::new("Child").enter_condition(
                            NodeDesc::condition(AtLeast).bind(BindingSource::Node("Source".into()), "Count", "Value"),
                        ),
                    ),
            )
            .build()
            .unwrap();
        let condition = &tree.nodes()[tree.states()[1].enter_conditions.begin as usize];
        let batch = tree.batch(condition.bindings.unwrap()).unwrap();
        assert_eq!(batch.copies().len(), 1);
        assert!(matches!(condition.instance, Some(InstanceHandle::Shared(_))));
    }

    #[test]
    fn test_binding_to_sibling_task_fails() {
        let err = TreeBuilder::new("scope")
            .state(
                StateDesc::new("Root")
                    .child(StateDesc::new("A").task(NodeDesc::task(Counter).named("Source")))
                    .child(
                        StateDesc::new("B").enter_condition(
                            NodeDesc::condition(AtLeast).bind(BindingSource::Node("Source".into()), "Count", "Value"),
                        ),
                    ),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, TreeError::Link(LinkError::UnknownBindingSource(_))));
    }

    #[test]
    fn test_node_kind_is_checked_per_list() {
        let err = TreeBuilder::new("kinds")
            .state(StateDesc::new("Root").task(NodeDesc::condition(Always)))
            .build()
            .unwrap_err();
        assert!(matches!(err, TreeError::Link(LinkError::NodeLinkFailed { .. })));
    }

    #[test]
    fn test_expression_depth_is_limited() {
        let err = TreeBuilder::new("deep")
            .state(StateDesc::new("Root").enter_condition(NodeDesc::condition(Always).indent(MAX_EXPRESSION_INDENT + 1)))
            .build()
            .unwrap_err();
        assert!(matches!(err, TreeError::Link(LinkError::ExpressionTooDeep { .. })));
    }

    #[test]
    fn test_linked_state_needs_subtree() {
        let tree = TreeBuilder::new("linked")
            .state(StateDesc::new("Root").child(StateDesc::linked("Call", "Routine")))
            .state(StateDesc::subtree("Routine").task(NodeDesc::task(Noop)))
            .build()
            .unwrap();
        let call = tree.state_by_name("Call").unwrap();
        assert_eq!(tree.state(call).unwrap().linked_state, tree.subtree("Routine"));

        let err = TreeBuilder::new("linked")
            .state(StateDesc::new("Root").child(StateDesc::linked("Call", "Root")))
            .build()
            .unwrap_err();
        assert!(matches!(err, TreeError::Link(LinkError::UnknownState(_))));
    }

    #[test]
    fn test_default_node_name_is_type_name() {
        let tree = TreeBuilder::new("names")
            .state(StateDesc::new("Root").task(NodeDesc::task(Counter)))
            .build()
            .unwrap();
        assert_eq!(tree.nodes()[0].name, "Counter");
        assert_eq!(tree.instance_types().len(), 1);
    }

    struct Pointer;
    impl NodeBase for Pointer {
        fn instance_type(&self) -> Option<Arc<StructType>> {
            Some(StructType::new(
                "Pointer",
                vec![FieldDesc::new("Target", ValueType::PropertyRef(Box::new(ValueType::Int)))],
            ))
        }
    }
    impl Task for Pointer {}

    #[test]
    fn test_reference_needs_property_ref_field() {
        let err = TreeBuilder::new("refs")
            .state(
                StateDesc::new("Root").task(NodeDesc::task(Counter).named("Source")).child(
                    StateDesc::new("Child").task(NodeDesc::task(Counter).named("Plain").reference(
                        "Count",
                        BindingSource::Node("Source".into()),
                        "Count",
                    )),
                ),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, TreeError::Binding(BindingError::NotAReference(ref field)) if field == "Count"));

        let tree = TreeBuilder::new("refs")
            .state(
                StateDesc::new("Root").task(NodeDesc::task(Counter).named("Source")).child(
                    StateDesc::new("Child").task(NodeDesc::task(Pointer).reference(
                        "Target",
                        BindingSource::Node("Source".into()),
                        "Count",
                    )),
                ),
            )
            .build()
            .unwrap();
        assert!(tree.property_ref(0).is_some());
    }
}
