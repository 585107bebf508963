//! Point-in-time view of a running tree, for debuggers and tests.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sylva_core::{DefinitionId, FrameId, RunStatus};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub taken_at: DateTime<Utc>,
    pub status: RunStatus,
    /// Ticks completed since start.
    pub tick: u64,
    /// Active frames, root frame first.
    pub frames: Vec<FrameSnapshot>,
    pub pending_events: Vec<String>,
    pub delayed: Vec<DelayedSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSnapshot {
    pub tree: DefinitionId,
    pub frame_id: FrameId,
    pub parent: Option<FrameId>,
    pub root_state: Option<Uuid>,
    /// Stable state IDs, root first.
    pub active_states: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayedSnapshot {
    pub frame_id: FrameId,
    pub transition: Uuid,
    pub remaining: f32,
}

impl ExecutionSnapshot {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize execution snapshot")
    }

    pub fn from_json(source: &str) -> Result<Self> {
        serde_json::from_str(source).context("invalid execution snapshot")
    }

    /// Number of active states over all frames.
    pub fn depth(&self) -> usize {
        self.frames.iter().map(|f| f.active_states.len()).sum()
    }

    pub fn is_active(&self, state: Uuid) -> bool {
        self.frames.iter().any(|f| f.active_states.contains(&state))
    }
}
