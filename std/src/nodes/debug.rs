use serde::{Deserialize, Serialize};
use sylva_core::{NodeBase, NodeContext, RunStatus, Task, TaskFlags, TransitionInfo};

/// Writes a message to the log when its state is entered, and optionally on
/// every tick and on exit. Never completes the state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTask {
    pub message: String,
    pub level: String,
    pub every_tick: bool,
    pub on_exit: bool,
}

impl LogTask {
    pub fn new(message: impl Into<String>, level: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: level.into(),
            every_tick: false,
            on_exit: false,
        }
    }

    pub fn every_tick(mut self) -> Self {
        self.every_tick = true;
        self
    }

    pub fn on_exit(mut self) -> Self {
        self.on_exit = true;
        self
    }

    fn emit(&self, ctx: &NodeContext<'_>, callback: &str) {
        let state = ctx.state().map(|s| ctx.tree().state_name(s).to_string()).unwrap_or_default();
        let tree = ctx.tree().name();
        match self.level.as_str() {
            "error" => tracing::error!(tree, state = %state, callback, "{}", self.message),
            "warn" => tracing::warn!(tree, state = %state, callback, "{}", self.message),
            "debug" => tracing::debug!(tree, state = %state, callback, "{}", self.message),
            "trace" => tracing::trace!(tree, state = %state, callback, "{}", self.message),
            _ => tracing::info!(tree, state = %state, callback, "{}", self.message),
        }
    }
}

impl NodeBase for LogTask {}

impl Task for LogTask {
    fn flags(&self) -> TaskFlags {
        TaskFlags {
            should_call_tick: self.every_tick,
            should_state_change_on_reselect: false,
            ..TaskFlags::default()
        }
    }

    fn enter_state(&self, ctx: &mut NodeContext<'_>, _transition: &TransitionInfo) -> RunStatus {
        self.emit(ctx, "enter");
        RunStatus::Running
    }

    fn exit_state(&self, ctx: &mut NodeContext<'_>, _transition: &TransitionInfo) {
        if self.on_exit {
            self.emit(ctx, "exit");
        }
    }

    fn tick(&self, ctx: &mut NodeContext<'_>, _delta_time: f32) -> RunStatus {
        self.emit(ctx, "tick");
        RunStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use sylva_core::{NodeDesc, StateDesc, TreeBuilder};
    use sylva_runtime::ExecutionContext;

    #[test]
    fn test_log_task_keeps_state_running() {
        sylva_test::init_test_tracing();
        let tree = TreeBuilder::new("log")
            .state(StateDesc::new("Root").task(NodeDesc::task(LogTask::new("hello", "debug").every_tick().on_exit())))
            .build()
            .unwrap();
        let mut ctx = ExecutionContext::new(Arc::new(tree));
        assert_eq!(ctx.start(None), RunStatus::Running);
        for _ in 0..3 {
            assert_eq!(ctx.tick(0.1), RunStatus::Running);
        }
        assert_eq!(ctx.active_state_names(), ["Root"]);
        assert_eq!(ctx.stop(), RunStatus::Stopped);
    }

    #[test]
    fn test_quiet_log_task_is_not_ticked() {
        let task = LogTask::new("once", "info");
        assert!(!task.flags().should_call_tick);
        assert!(task.clone().every_tick().flags().should_call_tick);
    }
}
