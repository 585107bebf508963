pub mod config;
pub mod execution;
pub mod frame;
pub mod snapshot;
pub mod trace;

pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::execution::ExecutionContext;
    pub use crate::snapshot::ExecutionSnapshot;
    pub use crate::trace::{ExecutionTrace, TraceEvent};
}

pub use config::EngineConfig;
pub use execution::ExecutionContext;
pub use frame::DelayedTransition;
pub use snapshot::ExecutionSnapshot;
pub use trace::{ExecutionTrace, TraceEntry, TraceEvent};
