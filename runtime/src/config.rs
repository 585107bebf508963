//! Engine configuration, loadable from TOML.
//!
//! ```toml
//! [schedule]
//! global_tasks_first = true
//!
//! [transitions]
//! max_iterations = 5
//!
//! [random]
//! seed = 42
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub schedule: ScheduleConfig,
    pub transitions: TransitionConfig,
    pub events: EventConfig,
    pub trace: TraceConfig,
    pub selection: SelectionConfig,
    pub random: RandomConfig,
}

impl EngineConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(source).context("invalid engine configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine configuration {}", path.display()))?;
        Self::from_toml_str(&source).with_context(|| format!("in {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        if self.transitions.max_iterations == 0 {
            anyhow::bail!("transitions.max_iterations must be at least 1");
        }
        if self.selection.max_depth == 0 {
            anyhow::bail!("selection.max_depth must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Tick global tasks before the state hierarchy and exit them after it.
    pub global_tasks_first: bool,
    /// Handle each frame's globals while walking the frames instead of all up front.
    pub tick_global_tasks_with_hierarchy: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig {
            global_tasks_first: true,
            tick_global_tasks_with_hierarchy: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitionConfig {
    /// Resolve/enter iterations per tick.
    pub max_iterations: u32,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        TransitionConfig { max_iterations: 5 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    pub max_pending: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        EventConfig { max_pending: 64 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    pub enabled: bool,
    pub capacity: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig {
            enabled: false,
            capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Most states a single frame may have active at once.
    pub max_depth: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        SelectionConfig { max_depth: 16 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomConfig {
    pub seed: Option<u64>,
}
