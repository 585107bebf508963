use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use sylva_core::{ChangeType, FrameId, Priority, RunStatus};

/// A discrete event in the execution trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TraceEvent {
    TreeStarted {
        tree: String,
    },
    TreeStopped {
        status: RunStatus,
    },
    EnterState {
        frame_id: FrameId,
        state: String,
        change: ChangeType,
    },
    ExitState {
        frame_id: FrameId,
        state: String,
        change: ChangeType,
    },
    StateCompleted {
        frame_id: FrameId,
        state: String,
        status: RunStatus,
    },
    TaskTick {
        frame_id: FrameId,
        task: String,
        status: RunStatus,
    },
    TransitionTriggered {
        frame_id: FrameId,
        source: Option<String>,
        target: String,
        priority: Priority,
    },
    TransitionDelayed {
        frame_id: FrameId,
        source: String,
        delay: f32,
    },
    Event {
        tag: String,
    },
    SelectionFailed {
        state: String,
        reason: String,
    },
}

impl TraceEvent {
    /// Short label used by [`ExecutionTrace::labels`].
    pub fn label(&self) -> String {
        match self {
            TraceEvent::TreeStarted { tree } => format!("Start:{tree}"),
            TraceEvent::TreeStopped { status } => format!("Stop:{status}"),
            TraceEvent::EnterState { state, .. } => format!("Enter:{state}"),
            TraceEvent::ExitState { state, .. } => format!("Exit:{state}"),
            TraceEvent::StateCompleted { state, status, .. } => format!("Completed:{state}:{status}"),
            TraceEvent::TaskTick { task, .. } => format!("Tick:{task}"),
            TraceEvent::TransitionTriggered { target, .. } => format!("Transition:{target}"),
            TraceEvent::TransitionDelayed { source, .. } => format!("Delayed:{source}"),
            TraceEvent::Event { tag } => format!("Event:{tag}"),
            TraceEvent::SelectionFailed { state, .. } => format!("SelectionFailed:{state}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Ticks completed when the event was recorded; `Start` is tick 0.
    pub tick: u64,
    pub event: TraceEvent,
}

/// Bounded, ordered record of an execution. Oldest entries are dropped first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionTrace {
    enabled: bool,
    capacity: usize,
    entries: VecDeque<TraceEntry>,
}

impl ExecutionTrace {
    pub fn new(enabled: bool, capacity: usize) -> Self {
        ExecutionTrace {
            enabled,
            capacity,
            entries: VecDeque::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn push(&mut self, tick: u64, event: TraceEvent) {
        if !self.enabled || self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(TraceEntry { tick, event });
    }

    pub fn entries(&self) -> impl Iterator<Item = &TraceEntry> {
        self.entries.iter()
    }

    pub fn labels(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.event.label()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
