//! # Sylva Standard Library
//!
//! Ready-made nodes for Sylva state trees:
//!
//! - **Tasks**: [`DelayTask`], [`FinishTask`], [`SendEventTask`], [`LogTask`]
//! - **Conditions**: [`CompareCondition`], [`RandomCondition`], [`TagCondition`]
//! - **Considerations**: [`ConstantConsideration`], [`CurveConsideration`]
//! - **Property functions**: [`ArithmeticFunction`]
//!
//! Every node keeps its tunable inputs in instance data, so they can be bound
//! to parameters, context data or other nodes' outputs.

pub mod nodes;
pub mod prelude;

pub use nodes::debug::LogTask;
pub use nodes::flow::{DelayTask, FinishTask, SendEventTask, SendOn};
pub use nodes::logic::{CompareCondition, Comparison, RandomCondition, TagCondition};
pub use nodes::math::{ArithmeticFunction, ArithmeticOperation};
pub use nodes::utility::{ConstantConsideration, CurveConsideration, ResponseCurve};
