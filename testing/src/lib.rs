//! Test nodes for Sylva state trees.
//!
//! Every node writes `"<name>.<Callback>"` into a shared [`CallLog`], so a
//! scenario can assert on the exact order of lifecycle calls.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use sylva_core::{
    Condition, Consideration, DelegateId, Evaluator, FieldDesc, Linker, LinkError, NodeBase, NodeContext,
    Priority, RunStatus, SelectionFallback, StateIndex, StructType, Task, TaskFlags, TransitionInfo,
    TransitionTarget, ValueType,
};
use tracing_subscriber::EnvFilter;

/// Installs a stdout subscriber for tests. Safe to call more than once.
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,sylva_runtime=debug"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
}

/// Ordered record of node callbacks, shared between a scenario and its nodes.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.0.lock().iter().any(|e| e == entry)
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().iter().filter(|e| *e == entry).count()
    }

    /// Index of the first occurrence of `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e == entry)
    }

    /// True if `first` is logged before `second`.
    pub fn ordered(&self, first: &str, second: &str) -> bool {
        matches!((self.position(first), self.position(second)), (Some(a), Some(b)) if a < b)
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// Scripted task.
///
/// Instance data has a single `CurrentTick` field counting ticks since the
/// last enter. The task completes with `result` after `ticks_to_completion`
/// ticks, or runs forever when that is `None`.
pub struct TestTask {
    name: String,
    log: CallLog,
    ticks_to_completion: Option<i64>,
    result: RunStatus,
    enter_status: RunStatus,
    flags: TaskFlags,
    transition_on_tick: Option<(String, Priority)>,
    resolved_target: Option<StateIndex>,
    event_on_tick: Option<String>,
    listen: bool,
    delegate: Option<DelegateId>,
    broadcast_on_tick: Option<DelegateId>,
}

impl TestTask {
    pub const CURRENT_TICK: &'static str = "CurrentTick";

    pub fn new(name: impl Into<String>, log: &CallLog) -> Self {
        TestTask {
            name: name.into(),
            log: log.clone(),
            ticks_to_completion: None,
            result: RunStatus::Succeeded,
            enter_status: RunStatus::Running,
            flags: TaskFlags::default(),
            transition_on_tick: None,
            resolved_target: None,
            event_on_tick: None,
            listen: false,
            delegate: None,
            broadcast_on_tick: None,
        }
    }

    pub fn ticks_to_completion(mut self, ticks: i64) -> Self {
        self.ticks_to_completion = Some(ticks);
        self
    }

    pub fn result(mut self, status: RunStatus) -> Self {
        self.result = status;
        self
    }

    pub fn enter_status(mut self, status: RunStatus) -> Self {
        self.enter_status = status;
        self
    }

    pub fn with_flags(mut self, flags: TaskFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Requests a transition to `state` on every tick.
    pub fn transition_on_tick(mut self, state: impl Into<String>, priority: Priority) -> Self {
        self.transition_on_tick = Some((state.into(), priority));
        self
    }

    pub fn event_on_tick(mut self, tag: impl Into<String>) -> Self {
        self.event_on_tick = Some(tag.into());
        self
    }

    /// Allocates a delegate, binds to it on enter and finishes when it is broadcast.
    /// Delegates are numbered from zero in build order.
    pub fn listen_to_delegate(mut self) -> Self {
        self.listen = true;
        self
    }

    pub fn broadcast_on_tick(mut self, delegate: DelegateId) -> Self {
        self.broadcast_on_tick = Some(delegate);
        self
    }

    fn record(&self, callback: &str) {
        self.log.push(format!("{}.{}", self.name, callback));
    }
}

impl NodeBase for TestTask {
    fn instance_type(&self) -> Option<Arc<StructType>> {
        Some(StructType::new(
            "TestTaskData",
            vec![FieldDesc::new(Self::CURRENT_TICK, ValueType::Int)],
        ))
    }

    fn link(&mut self, linker: &mut Linker<'_>) -> Result<(), LinkError> {
        if let Some((state, _)) = &self.transition_on_tick {
            self.resolved_target = Some(linker.state(state)?);
        }
        if self.listen {
            self.delegate = Some(linker.delegate());
        }
        Ok(())
    }
}

impl Task for TestTask {
    fn flags(&self) -> TaskFlags {
        self.flags
    }

    fn enter_state(&self, ctx: &mut NodeContext<'_>, transition: &TransitionInfo) -> RunStatus {
        self.record("EnterState");
        if let Some(data) = ctx.instance_mut() {
            data.set_int(Self::CURRENT_TICK, 0);
        }
        if let Some(delegate) = self.delegate {
            ctx.bind_delegate(delegate);
        }
        tracing::trace!(task = %self.name, change = ?transition.change, "test task entered");
        self.enter_status
    }

    fn exit_state(&self, _ctx: &mut NodeContext<'_>, _transition: &TransitionInfo) {
        self.record("ExitState");
    }

    fn state_completed(&self, _ctx: &mut NodeContext<'_>, status: RunStatus, _completed: &[StateIndex]) {
        self.record(&format!("StateCompleted:{status}"));
    }

    fn tick(&self, ctx: &mut NodeContext<'_>, _delta_time: f32) -> RunStatus {
        self.record("Tick");
        if let (Some(target), Some((_, priority))) = (self.resolved_target, &self.transition_on_tick) {
            ctx.request_transition(TransitionTarget::State(target), *priority, SelectionFallback::None);
        }
        if let Some(tag) = &self.event_on_tick {
            ctx.send_event(tag.as_str(), None);
        }
        if let Some(delegate) = self.broadcast_on_tick {
            ctx.broadcast(delegate);
        }
        let ticks = match ctx.instance_mut() {
            Some(data) => {
                let ticks = data.int(Self::CURRENT_TICK).unwrap_or(0) + 1;
                data.set_int(Self::CURRENT_TICK, ticks);
                ticks
            }
            None => 0,
        };
        match self.ticks_to_completion {
            Some(limit) if ticks >= limit => self.result,
            _ => RunStatus::Running,
        }
    }

    fn trigger_transitions(&self, _ctx: &mut NodeContext<'_>) {
        self.record("TriggerTransitions");
    }

    fn on_delegate(&self, ctx: &mut NodeContext<'_>, _delegate: DelegateId) {
        self.record("Delegate");
        ctx.finish_task(self.result);
    }
}

/// Condition whose result is flipped from outside the tree.
pub struct TestCondition {
    name: String,
    log: CallLog,
    value: Arc<AtomicBool>,
}

impl TestCondition {
    pub fn new(name: impl Into<String>, log: &CallLog, value: bool) -> Self {
        TestCondition {
            name: name.into(),
            log: log.clone(),
            value: Arc::new(AtomicBool::new(value)),
        }
    }

    /// Handle that changes the result of every later test.
    pub fn switch(&self) -> Arc<AtomicBool> {
        self.value.clone()
    }
}

impl NodeBase for TestCondition {}

impl Condition for TestCondition {
    fn test_condition(&self, _ctx: &mut NodeContext<'_>) -> bool {
        self.log.push(format!("{}.TestCondition", self.name));
        self.value.load(Ordering::SeqCst)
    }
}

/// Consideration with a fixed score.
pub struct TestConsideration {
    score: f32,
}

impl TestConsideration {
    pub fn new(score: f32) -> Self {
        TestConsideration { score }
    }
}

impl NodeBase for TestConsideration {}

impl Consideration for TestConsideration {
    fn score(&self, _ctx: &mut NodeContext<'_>) -> f32 {
        self.score
    }
}

/// Evaluator counting its ticks in the `Ticks` field, usable as a binding source.
pub struct TestEvaluator {
    name: String,
    log: CallLog,
}

impl TestEvaluator {
    pub const TICKS: &'static str = "Ticks";

    pub fn new(name: impl Into<String>, log: &CallLog) -> Self {
        TestEvaluator {
            name: name.into(),
            log: log.clone(),
        }
    }
}

impl NodeBase for TestEvaluator {
    fn instance_type(&self) -> Option<Arc<StructType>> {
        Some(StructType::new(
            "TestEvaluatorData",
            vec![FieldDesc::new(Self::TICKS, ValueType::Int)],
        ))
    }
}

impl Evaluator for TestEvaluator {
    fn tree_start(&self, _ctx: &mut NodeContext<'_>) {
        self.log.push(format!("{}.TreeStart", self.name));
    }

    fn tree_stop(&self, _ctx: &mut NodeContext<'_>) {
        self.log.push(format!("{}.TreeStop", self.name));
    }

    fn tick(&self, ctx: &mut NodeContext<'_>, _delta_time: f32) {
        self.log.push(format!("{}.Tick", self.name));
        if let Some(data) = ctx.instance_mut() {
            let ticks = data.int(Self::TICKS).unwrap_or(0) + 1;
            data.set_int(Self::TICKS, ticks);
        }
    }
}
