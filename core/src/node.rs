//! Node contracts and the context handed to node callbacks.
//!
//! Every node variant shares [`NodeBase`] (instance data shape and linking)
//! and adds the callbacks of its role. All callbacks have no-op defaults
//! except the ones that define the role (`test_condition`, `score`,
//! `execute`).

use crate::context::{ContextData, ContextDescriptor, ContextKind, ExternalHandle};
use crate::definition::TreeDefinition;
use crate::delegate::DelegateId;
use crate::error::LinkError;
use crate::event::{Event, EventDesc, EventQueue};
use crate::handle::{BatchIndex, FrameId, InstanceHandle, NodeIndex, StateIndex};
use crate::instance::InstanceStorage;
use crate::object::ObjectRegistry;
use crate::state::{CompactState, Priority, SelectionFallback, TransitionTarget};
use crate::status::RunStatus;
use crate::tag::Tag;
use crate::value::{StructType, StructValue, Value};
use crate::binding::{DataHandle, PropertyRefBinding};
use ahash::AHashMap;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::any::TypeId;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

pub trait NodeBase: Send + Sync {
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Shape of this node's instance data block, if it has one.
    fn instance_type(&self) -> Option<Arc<StructType>> {
        None
    }

    /// Resolves external data handles and state references when the definition is built.
    fn link(&mut self, _linker: &mut Linker<'_>) -> Result<(), LinkError> {
        Ok(())
    }
}

/// Behavior switches of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFlags {
    pub should_call_tick: bool,
    /// Call enter/exit again when the owning state is reselected.
    pub should_state_change_on_reselect: bool,
    pub should_copy_bound_properties_on_tick: bool,
    pub should_copy_bound_properties_on_exit: bool,
    /// Call `trigger_transitions` during transition resolution.
    pub should_affect_transitions: bool,
}

impl Default for TaskFlags {
    fn default() -> Self {
        TaskFlags {
            should_call_tick: true,
            should_state_change_on_reselect: true,
            should_copy_bound_properties_on_tick: true,
            should_copy_bound_properties_on_exit: true,
            should_affect_transitions: false,
        }
    }
}

pub trait Task: NodeBase {
    fn flags(&self) -> TaskFlags {
        TaskFlags::default()
    }

    fn enter_state(&self, _ctx: &mut NodeContext<'_>, _transition: &TransitionInfo) -> RunStatus {
        RunStatus::Running
    }

    fn exit_state(&self, _ctx: &mut NodeContext<'_>, _transition: &TransitionInfo) {}

    /// Called leaf to root once the active states completed with `status`.
    fn state_completed(&self, _ctx: &mut NodeContext<'_>, _status: RunStatus, _completed: &[StateIndex]) {}

    fn tick(&self, _ctx: &mut NodeContext<'_>, _delta_time: f32) -> RunStatus {
        RunStatus::Running
    }

    fn trigger_transitions(&self, _ctx: &mut NodeContext<'_>) {}

    /// A dispatcher this task listens to was broadcast.
    fn on_delegate(&self, _ctx: &mut NodeContext<'_>, _delegate: DelegateId) {}
}

pub trait Evaluator: NodeBase {
    fn tree_start(&self, _ctx: &mut NodeContext<'_>) {}

    fn tree_stop(&self, _ctx: &mut NodeContext<'_>) {}

    fn tick(&self, _ctx: &mut NodeContext<'_>, _delta_time: f32) {}
}

pub trait Condition: NodeBase {
    fn test_condition(&self, ctx: &mut NodeContext<'_>) -> bool;
}

pub trait Consideration: NodeBase {
    /// Score in `[0, 1]`; values outside are clamped.
    fn score(&self, ctx: &mut NodeContext<'_>) -> f32;
}

pub trait PropertyFunction: NodeBase {
    /// Writes outputs into the instance data before the consumer's bindings are copied.
    fn execute(&self, ctx: &mut NodeContext<'_>);
}

/// How a condition or consideration combines with the expression before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Operand {
    /// Starts a new expression; used for the first item.
    Copy,
    #[default]
    And,
    Or,
}

pub enum NodeKind {
    Task(Box<dyn Task>),
    Evaluator(Box<dyn Evaluator>),
    Condition(Box<dyn Condition>),
    Consideration(Box<dyn Consideration>),
    PropertyFunction(Box<dyn PropertyFunction>),
}

impl NodeKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            NodeKind::Task(_) => "task",
            NodeKind::Evaluator(_) => "evaluator",
            NodeKind::Condition(_) => "condition",
            NodeKind::Consideration(_) => "consideration",
            NodeKind::PropertyFunction(_) => "property_function",
        }
    }

    pub fn base(&self) -> &dyn NodeBase {
        match self {
            NodeKind::Task(n) => n.as_ref(),
            NodeKind::Evaluator(n) => n.as_ref(),
            NodeKind::Condition(n) => n.as_ref(),
            NodeKind::Consideration(n) => n.as_ref(),
            NodeKind::PropertyFunction(n) => n.as_ref(),
        }
    }

    pub fn base_mut(&mut self) -> &mut dyn NodeBase {
        match self {
            NodeKind::Task(n) => n.as_mut(),
            NodeKind::Evaluator(n) => n.as_mut(),
            NodeKind::Condition(n) => n.as_mut(),
            NodeKind::Consideration(n) => n.as_mut(),
            NodeKind::PropertyFunction(n) => n.as_mut(),
        }
    }

    /// Shared (per-thread) instance data for stateless node roles.
    pub fn uses_shared_instance(&self) -> bool {
        matches!(
            self,
            NodeKind::Condition(_) | NodeKind::Consideration(_) | NodeKind::PropertyFunction(_)
        )
    }
}

/// A compiled node.
pub struct Node {
    pub id: Uuid,
    pub name: String,
    pub kind: NodeKind,
    pub instance: Option<InstanceHandle>,
    pub bindings: Option<BatchIndex>,
    /// Reference fields of the instance data, by name, into the definition's reference table.
    pub references: Vec<(String, u16)>,
    pub operand: Operand,
    pub indent: i32,
    pub invert: bool,
    pub enabled: bool,
    pub considered_for_completion: bool,
}

impl Node {
    pub fn as_task(&self) -> Option<&dyn Task> {
        match &self.kind {
            NodeKind::Task(task) => Some(task.as_ref()),
            _ => None,
        }
    }

    pub fn as_evaluator(&self) -> Option<&dyn Evaluator> {
        match &self.kind {
            NodeKind::Evaluator(evaluator) => Some(evaluator.as_ref()),
            _ => None,
        }
    }

    pub fn as_condition(&self) -> Option<&dyn Condition> {
        match &self.kind {
            NodeKind::Condition(condition) => Some(condition.as_ref()),
            _ => None,
        }
    }

    pub fn as_consideration(&self) -> Option<&dyn Consideration> {
        match &self.kind {
            NodeKind::Consideration(consideration) => Some(consideration.as_ref()),
            _ => None,
        }
    }

    pub fn as_property_function(&self) -> Option<&dyn PropertyFunction> {
        match &self.kind {
            NodeKind::PropertyFunction(function) => Some(function.as_ref()),
            _ => None,
        }
    }

    pub fn task_flags(&self) -> TaskFlags {
        self.as_task().map(|task| task.flags()).unwrap_or_default()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind.kind_name())
            .field("type", &self.kind.base().type_name())
            .field("instance", &self.instance)
            .field("bindings", &self.bindings)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Whether a state was newly entered or kept across a reselection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    Changed,
    Sustained,
}

/// Passed to `enter_state` and `exit_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionInfo {
    pub change: ChangeType,
    pub current_run_status: RunStatus,
    pub source_state: Option<StateIndex>,
    pub target_state: Option<StateIndex>,
    pub priority: Option<Priority>,
}

/// A transition requested by a node, resolved by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRequest {
    pub frame_id: FrameId,
    pub source_state: Option<StateIndex>,
    pub target: TransitionTarget,
    pub priority: Priority,
    pub fallback: SelectionFallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegateOp {
    Bind(DelegateId),
    Unbind(DelegateId),
    Broadcast(DelegateId),
}

/// Side effects recorded by a node call and applied by the runtime afterwards.
#[derive(Debug, Default)]
pub struct NodeRequests {
    pub transitions: Vec<TransitionRequest>,
    pub events: Vec<Event>,
    /// `(frame, state, node, status)` of tasks that finished themselves.
    pub finished: Vec<(FrameId, Option<StateIndex>, NodeIndex, RunStatus)>,
    pub delegates: Vec<(FrameId, Option<StateIndex>, NodeIndex, DelegateOp)>,
    pub stop: Option<RunStatus>,
}

impl NodeRequests {
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
            && self.events.is_empty()
            && self.finished.is_empty()
            && self.delegates.is_empty()
            && self.stop.is_none()
    }
}

/// Everything a node callback can see and do.
pub struct NodeContext<'a> {
    tree: &'a TreeDefinition,
    frame_id: FrameId,
    state: Option<StateIndex>,
    node: NodeIndex,
    instance: Option<&'a mut StructValue>,
    storage: Option<&'a mut InstanceStorage>,
    context: &'a ContextData,
    events: &'a EventQueue,
    objects: &'a ObjectRegistry,
    rng: &'a mut StdRng,
    requests: &'a mut NodeRequests,
}

impl<'a> NodeContext<'a> {
    pub fn new(
        tree: &'a TreeDefinition,
        frame_id: FrameId,
        state: Option<StateIndex>,
        node: NodeIndex,
        instance: Option<&'a mut StructValue>,
        storage: Option<&'a mut InstanceStorage>,
        context: &'a ContextData,
        events: &'a EventQueue,
        objects: &'a ObjectRegistry,
        rng: &'a mut StdRng,
        requests: &'a mut NodeRequests,
    ) -> Self {
        NodeContext {
            tree,
            frame_id,
            state,
            node,
            instance,
            storage,
            context,
            events,
            objects,
            rng,
            requests,
        }
    }

    pub fn tree(&self) -> &TreeDefinition {
        self.tree
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Owning state; `None` for global tasks and evaluators.
    pub fn state(&self) -> Option<StateIndex> {
        self.state
    }

    pub fn node(&self) -> NodeIndex {
        self.node
    }

    pub fn node_name(&self) -> &str {
        self.tree
            .node(self.node)
            .map(|n| n.name.as_str())
            .unwrap_or_default()
    }

    pub fn instance(&self) -> Option<&StructValue> {
        self.instance.as_deref()
    }

    pub fn instance_mut(&mut self) -> Option<&mut StructValue> {
        self.instance.as_deref_mut()
    }

    pub fn external<T: 'static>(&self, handle: &ExternalHandle<T>) -> Option<&T> {
        debug_assert!(
            (handle.index() as usize) < self.tree.context_descriptors().len(),
            "external handle from another definition"
        );
        self.context.get::<T>()
    }

    pub fn context_struct(&self, name: &str) -> Option<&StructValue> {
        self.context.struct_view(name)
    }

    pub fn events(&self) -> &EventQueue {
        self.events
    }

    pub fn has_event(&self, desc: &EventDesc) -> bool {
        self.events.contains(desc)
    }

    pub fn objects(&self) -> &ObjectRegistry {
        self.objects
    }

    pub fn rng(&mut self) -> &mut StdRng {
        self.rng
    }

    /// Queues an event; it is visible to transitions in the next resolution pass.
    pub fn send_event(&mut self, tag: impl Into<Tag>, payload: Option<StructValue>) {
        let mut event = Event::new(tag).with_origin(self.node_name().to_string());
        event.payload = payload;
        self.requests.events.push(event);
    }

    pub fn request_transition(
        &mut self,
        target: TransitionTarget,
        priority: Priority,
        fallback: SelectionFallback,
    ) {
        self.requests.transitions.push(TransitionRequest {
            frame_id: self.frame_id,
            source_state: self.state,
            target,
            priority,
            fallback,
        });
    }

    /// Sets this task's completion status directly, outside of `tick`.
    pub fn finish_task(&mut self, status: RunStatus) {
        self.requests
            .finished
            .push((self.frame_id, self.state, self.node, status));
    }

    pub fn bind_delegate(&mut self, delegate: DelegateId) {
        self.delegate_op(DelegateOp::Bind(delegate));
    }

    pub fn unbind_delegate(&mut self, delegate: DelegateId) {
        self.delegate_op(DelegateOp::Unbind(delegate));
    }

    pub fn broadcast(&mut self, delegate: DelegateId) {
        self.delegate_op(DelegateOp::Broadcast(delegate));
    }

    /// Asks the execution to stop at the end of the current phase.
    pub fn stop(&mut self, status: RunStatus) {
        self.requests.stop = Some(status);
    }

    pub fn property_ref(&self, field: &str) -> Option<&Value> {
        let (handle, binding) = self.reference(field)?;
        let storage = self.storage.as_deref()?;
        let root = match handle {
            DataHandle::GlobalParameters => Some(storage.parameters()),
            DataHandle::StateParameters(state) => storage.state_parameters(state),
            DataHandle::Instance(index) => storage.get(index),
            DataHandle::Context(_) | DataHandle::Shared(_) => None,
        }?;
        binding.get(root).ok()
    }

    /// Writable access to the property a reference field is bound to.
    ///
    /// A reference into this node's own instance data is not reachable here;
    /// use [`NodeContext::instance_mut`].
    pub fn property_ref_mut(&mut self, field: &str) -> Option<&mut Value> {
        let tree = self.tree;
        let (handle, binding) = Self::lookup_reference(tree, self.node, field)?;
        let storage = self.storage.as_deref_mut()?;
        let root = match handle {
            DataHandle::GlobalParameters => Some(storage.parameters_mut()),
            DataHandle::StateParameters(state) => storage.state_parameters_mut(state),
            DataHandle::Instance(index) => storage.get_mut(index),
            DataHandle::Context(_) | DataHandle::Shared(_) => None,
        }?;
        match binding.get_mut(root) {
            Ok(value) => Some(value),
            Err(error) => {
                tracing::warn!(field, %error, "property reference could not be resolved");
                None
            }
        }
    }

    fn reference(&self, field: &str) -> Option<(DataHandle, &'a PropertyRefBinding)> {
        Self::lookup_reference(self.tree, self.node, field)
    }

    fn lookup_reference(
        tree: &'a TreeDefinition,
        node: NodeIndex,
        field: &str,
    ) -> Option<(DataHandle, &'a PropertyRefBinding)> {
        let node = tree.node(node)?;
        let (_, index) = node.references.iter().find(|(name, _)| name == field)?;
        let binding = tree.property_ref(*index)?;
        Some((binding.source(), binding))
    }

    fn delegate_op(&mut self, op: DelegateOp) {
        self.requests
            .delegates
            .push((self.frame_id, self.state, self.node, op));
    }
}

/// Passed to [`NodeBase::link`] while a definition is built.
pub struct Linker<'a> {
    tree_name: &'a str,
    node_name: &'a str,
    states: &'a [CompactState],
    state_names: &'a AHashMap<String, StateIndex>,
    context: &'a mut Vec<ContextDescriptor>,
    next_delegate: &'a mut u16,
}

impl<'a> Linker<'a> {
    pub fn new(
        tree_name: &'a str,
        node_name: &'a str,
        states: &'a [CompactState],
        state_names: &'a AHashMap<String, StateIndex>,
        context: &'a mut Vec<ContextDescriptor>,
        next_delegate: &'a mut u16,
    ) -> Self {
        Linker {
            tree_name,
            node_name,
            states,
            state_names,
            context,
            next_delegate,
        }
    }

    pub fn tree_name(&self) -> &str {
        self.tree_name
    }

    pub fn node_name(&self) -> &str {
        self.node_name
    }

    /// Requires a host value of type `T` to be present before the tree starts.
    pub fn external<T: Send + Sync + 'static>(&mut self, name: &str) -> ExternalHandle<T> {
        self.add_external::<T>(name, true)
    }

    pub fn optional_external<T: Send + Sync + 'static>(&mut self, name: &str) -> ExternalHandle<T> {
        self.add_external::<T>(name, false)
    }

    pub fn state(&self, name: &str) -> Result<StateIndex, LinkError> {
        self.state_names
            .get(name)
            .copied()
            .ok_or_else(|| LinkError::UnknownState(name.to_string()))
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// Allocates a new dispatcher for this definition.
    pub fn delegate(&mut self) -> DelegateId {
        let id = DelegateId(*self.next_delegate);
        *self.next_delegate += 1;
        id
    }

    /// Builds a link failure attributed to the node being linked.
    pub fn fail(&self, reason: impl Into<String>) -> LinkError {
        LinkError::NodeLinkFailed {
            node: self.node_name.to_string(),
            reason: reason.into(),
        }
    }

    fn add_external<T: Send + Sync + 'static>(&mut self, name: &str, required: bool) -> ExternalHandle<T> {
        let type_id = TypeId::of::<T>();
        let existing = self.context.iter().position(|d| {
            matches!(d.kind, ContextKind::External { type_id: t, .. } if t == type_id)
        });
        let index = match existing {
            Some(index) => {
                if required {
                    self.context[index].required = true;
                }
                index
            }
            None => {
                let mut descriptor = ContextDescriptor::external::<T>(name);
                descriptor.required = required;
                self.context.push(descriptor);
                self.context.len() - 1
            }
        };
        ExternalHandle::new(index as u16)
    }
}
