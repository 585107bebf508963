//! Sylva facade crate.
//!
//! Re-exports the definition model, the execution engine and the standard
//! node library behind one entry point.
//!
//! ```ignore
//! use sylva::prelude::*;
//!
//! let tree = TreeBuilder::new("guard")
//!     .state(
//!         StateDesc::new("Root")
//!             .child(
//!                 StateDesc::new("Patrol")
//!                     .task(NodeDesc::task(DelayTask::new(2.0)))
//!                     .transition(TransitionDesc::on_succeeded(TargetDesc::state("Rest"))),
//!             )
//!             .child(StateDesc::new("Rest").task(NodeDesc::task(DelayTask::forever()))),
//!     )
//!     .build()?;
//! let mut ctx = ExecutionContext::new(Arc::new(tree));
//! ctx.start(None);
//! ```

pub use sylva_core as core;
pub use sylva_runtime as runtime;
#[cfg(feature = "std")]
pub use sylva_std as std;

pub use sylva_core::{RunStatus, TreeBuilder, TreeDefinition};
pub use sylva_runtime::{EngineConfig, ExecutionContext};

pub mod prelude {
    pub use sylva_core::prelude::*;
    pub use sylva_runtime::prelude::*;
    #[cfg(feature = "std")]
    pub use sylva_std::prelude::*;
    pub use ::std::sync::Arc;
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_prelude_runs_a_tree() {
        sylva_test::init_test_tracing();
        let tree = TreeBuilder::new("guard")
            .state(
                StateDesc::new("Root")
                    .child(
                        StateDesc::new("Patrol")
                            .task(NodeDesc::task(DelayTask::new(0.5)))
                            .transition(TransitionDesc::on_succeeded(TargetDesc::state("Rest"))),
                    )
                    .child(StateDesc::new("Rest").task(NodeDesc::task(DelayTask::forever()))),
            )
            .build()
            .unwrap();
        let mut ctx = ExecutionContext::new(Arc::new(tree));
        assert_eq!(ctx.start(None), RunStatus::Running);
        assert_eq!(ctx.active_state_names(), ["Root", "Patrol"]);
        ctx.tick(0.6);
        assert_eq!(ctx.active_state_names(), ["Root", "Rest"]);
    }
}
