use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use sylva_core::{
    FieldDesc, NodeBase, NodeContext, RunStatus, StructType, StructValue, Tag, Task, TaskFlags, TransitionInfo, Value,
    ValueType,
};

/// Succeeds after a duration in seconds, measured in tick time.
///
/// `Duration` and `RandomDeviation` live in the instance data so they can be
/// bound; the struct fields are their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayTask {
    pub duration: f32,
    pub random_deviation: f32,
    /// Never completes; the state must be left by a transition.
    pub run_forever: bool,
}

impl DelayTask {
    pub const DURATION: &'static str = "Duration";
    pub const RANDOM_DEVIATION: &'static str = "RandomDeviation";
    pub const REMAINING: &'static str = "Remaining";

    pub fn new(duration: f32) -> Self {
        Self {
            duration,
            random_deviation: 0.0,
            run_forever: false,
        }
    }

    pub fn with_deviation(mut self, deviation: f32) -> Self {
        self.random_deviation = deviation.abs();
        self
    }

    pub fn forever() -> Self {
        Self {
            duration: 0.0,
            random_deviation: 0.0,
            run_forever: true,
        }
    }
}

impl NodeBase for DelayTask {
    fn instance_type(&self) -> Option<Arc<StructType>> {
        Some(StructType::new(
            "DelayTaskData",
            vec![
                FieldDesc::new(Self::DURATION, ValueType::Float).with_default(Value::Float(self.duration as f64)),
                FieldDesc::new(Self::RANDOM_DEVIATION, ValueType::Float)
                    .with_default(Value::Float(self.random_deviation as f64)),
                FieldDesc::new(Self::REMAINING, ValueType::Float),
            ],
        ))
    }
}

impl Task for DelayTask {
    fn flags(&self) -> TaskFlags {
        TaskFlags {
            should_call_tick: !self.run_forever,
            ..TaskFlags::default()
        }
    }

    fn enter_state(&self, ctx: &mut NodeContext<'_>, _transition: &TransitionInfo) -> RunStatus {
        if self.run_forever {
            return RunStatus::Running;
        }
        let (duration, deviation) = match ctx.instance() {
            Some(data) => (
                data.float(Self::DURATION).unwrap_or(self.duration as f64),
                data.float(Self::RANDOM_DEVIATION).unwrap_or(0.0).abs(),
            ),
            None => (self.duration as f64, 0.0),
        };
        let jitter = if deviation > 0.0 {
            ctx.rng().gen_range(-deviation..=deviation)
        } else {
            0.0
        };
        let remaining = (duration + jitter).max(0.0);
        if let Some(data) = ctx.instance_mut() {
            data.set_float(Self::REMAINING, remaining);
        }
        tracing::trace!(node = ctx.node_name(), remaining, "delay started");
        RunStatus::Running
    }

    fn tick(&self, ctx: &mut NodeContext<'_>, delta_time: f32) -> RunStatus {
        let Some(data) = ctx.instance_mut() else {
            return RunStatus::Failed;
        };
        let remaining = data.float(Self::REMAINING).unwrap_or(0.0) - delta_time as f64;
        data.set_float(Self::REMAINING, remaining);
        if remaining <= 0.0 {
            RunStatus::Succeeded
        } else {
            RunStatus::Running
        }
    }
}

/// Completes its state with a fixed status on the first tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FinishTask {
    pub status: RunStatus,
}

impl FinishTask {
    pub fn new(status: RunStatus) -> Self {
        Self { status }
    }

    pub fn succeed() -> Self {
        Self::new(RunStatus::Succeeded)
    }

    pub fn fail() -> Self {
        Self::new(RunStatus::Failed)
    }
}

impl NodeBase for FinishTask {}

impl Task for FinishTask {
    fn tick(&self, _ctx: &mut NodeContext<'_>, _delta_time: f32) -> RunStatus {
        if self.status.is_completed() {
            self.status
        } else {
            RunStatus::Running
        }
    }
}

/// When [`SendEventTask`] sends its event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SendOn {
    #[default]
    Enter,
    Tick,
    Exit,
}

/// Sends an event with an optional payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendEventTask {
    pub tag: Tag,
    pub on: SendOn,
    #[serde(skip)]
    pub payload: Option<StructValue>,
}

impl SendEventTask {
    pub fn new(tag: impl Into<Tag>) -> Self {
        Self {
            tag: tag.into(),
            on: SendOn::Enter,
            payload: None,
        }
    }

    pub fn on(mut self, on: SendOn) -> Self {
        self.on = on;
        self
    }

    pub fn with_payload(mut self, payload: StructValue) -> Self {
        self.payload = Some(payload);
        self
    }

    fn send(&self, ctx: &mut NodeContext<'_>) {
        tracing::debug!(node = ctx.node_name(), tag = %self.tag, "sending event");
        ctx.send_event(self.tag.clone(), self.payload.clone());
    }
}

impl NodeBase for SendEventTask {}

impl Task for SendEventTask {
    fn flags(&self) -> TaskFlags {
        TaskFlags {
            should_call_tick: self.on == SendOn::Tick,
            ..TaskFlags::default()
        }
    }

    fn enter_state(&self, ctx: &mut NodeContext<'_>, _transition: &TransitionInfo) -> RunStatus {
        if self.on == SendOn::Enter {
            self.send(ctx);
        }
        RunStatus::Running
    }

    fn exit_state(&self, ctx: &mut NodeContext<'_>, _transition: &TransitionInfo) {
        if self.on == SendOn::Exit {
            self.send(ctx);
        }
    }

    fn tick(&self, ctx: &mut NodeContext<'_>, _delta_time: f32) -> RunStatus {
        self.send(ctx);
        RunStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sylva_core::{EventDesc, NodeDesc, StateDesc, TargetDesc, TransitionDesc, TreeBuilder};
    use sylva_runtime::{EngineConfig, ExecutionContext};
    use sylva_test::{CallLog, TestTask};

    #[test]
    fn test_delay_task_succeeds_after_duration() {
        sylva_test::init_test_tracing();
        let log = CallLog::new();
        let tree = TreeBuilder::new("delay")
            .state(
                StateDesc::new("Root")
                    .child(
                        StateDesc::new("Wait")
                            .task(NodeDesc::task(DelayTask::new(1.0)).named("Delay"))
                            .transition(TransitionDesc::on_succeeded(TargetDesc::state("Done"))),
                    )
                    .child(StateDesc::new("Done").task(NodeDesc::task(TestTask::new("TD", &log)))),
            )
            .build()
            .unwrap();
        let mut ctx = ExecutionContext::new(Arc::new(tree));
        ctx.start(None);
        assert_eq!(ctx.node_instance("Delay").and_then(|d| d.float(DelayTask::REMAINING)), Some(1.0));

        ctx.tick(0.4);
        ctx.tick(0.4);
        assert_eq!(ctx.active_state_names(), ["Root", "Wait"]);
        ctx.tick(0.4);
        assert_eq!(ctx.active_state_names(), ["Root", "Done"]);
    }

    #[test]
    fn test_delay_deviation_stays_in_range() {
        let tree = TreeBuilder::new("jitter")
            .state(StateDesc::new("Root").task(NodeDesc::task(DelayTask::new(2.0).with_deviation(0.5)).named("Delay")))
            .build()
            .unwrap();
        let tree = Arc::new(tree);
        for seed in 0..16 {
            let mut config = EngineConfig::default();
            config.random.seed = Some(seed);
            let mut ctx = ExecutionContext::with_config(tree.clone(), config);
            ctx.start(None);
            let remaining = ctx.node_instance("Delay").and_then(|d| d.float(DelayTask::REMAINING)).unwrap();
            assert!((1.5..=2.5).contains(&remaining), "remaining {remaining}");
        }
    }

    #[test]
    fn test_finish_task_completes_on_first_tick() {
        let tree = TreeBuilder::new("finish")
            .state(
                StateDesc::new("Root")
                    .child(
                        StateDesc::new("Try")
                            .task(NodeDesc::task(FinishTask::fail()))
                            .transition(TransitionDesc::on_failed(TargetDesc::state("Recover"))),
                    )
                    .child(StateDesc::new("Recover").task(NodeDesc::task(DelayTask::forever()))),
            )
            .build()
            .unwrap();
        let mut ctx = ExecutionContext::new(Arc::new(tree));
        ctx.start(None);
        ctx.tick(0.1);
        assert_eq!(ctx.active_state_names(), ["Root", "Recover"]);
        ctx.tick(10.0);
        assert_eq!(ctx.active_state_names(), ["Root", "Recover"]);
    }

    #[test]
    fn test_sent_event_triggers_transition() {
        let tree = TreeBuilder::new("send")
            .state(
                StateDesc::new("Root")
                    .transition(TransitionDesc::on_event(EventDesc::tag("Alarm"), TargetDesc::state("Alert")))
                    .child(StateDesc::new("Patrol").task(NodeDesc::task(SendEventTask::new("Alarm.Intruder").on(SendOn::Tick))))
                    .child(StateDesc::new("Alert").task(NodeDesc::task(DelayTask::forever()))),
            )
            .build()
            .unwrap();
        let mut ctx = ExecutionContext::new(Arc::new(tree));
        ctx.start(None);
        assert_eq!(ctx.pending_events(), 0);
        ctx.tick(0.1);
        assert_eq!(ctx.active_state_names(), ["Root", "Alert"]);
    }
}
