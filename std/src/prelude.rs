pub use crate::nodes::debug::LogTask;
pub use crate::nodes::flow::{DelayTask, FinishTask, SendEventTask, SendOn};
pub use crate::nodes::logic::{CompareCondition, Comparison, RandomCondition, TagCondition};
pub use crate::nodes::math::{ArithmeticFunction, ArithmeticOperation};
pub use crate::nodes::utility::{ConstantConsideration, CurveConsideration, ResponseCurve};
