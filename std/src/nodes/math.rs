use serde::{Deserialize, Serialize};
use std::sync::Arc;
use sylva_core::{FieldDesc, NodeBase, NodeContext, PropertyFunction, StructType, Value, ValueType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArithmeticOperation {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
}

impl ArithmeticOperation {
    /// `None` for a division by zero.
    pub fn apply(self, left: f64, right: f64) -> Option<f64> {
        Some(match self {
            ArithmeticOperation::Add => left + right,
            ArithmeticOperation::Sub => left - right,
            ArithmeticOperation::Mul => left * right,
            ArithmeticOperation::Div if right == 0.0 => return None,
            ArithmeticOperation::Div => left / right,
            ArithmeticOperation::Min => left.min(right),
            ArithmeticOperation::Max => left.max(right),
        })
    }
}

/// Property function writing `Left <op> Right` into `Result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArithmeticFunction {
    pub operation: ArithmeticOperation,
    pub left: f64,
    pub right: f64,
}

impl ArithmeticFunction {
    pub const LEFT: &'static str = "Left";
    pub const RIGHT: &'static str = "Right";
    pub const RESULT: &'static str = "Result";

    pub fn new(operation: ArithmeticOperation) -> Self {
        Self {
            operation,
            left: 0.0,
            right: 0.0,
        }
    }

    pub fn with_right(mut self, right: f64) -> Self {
        self.right = right;
        self
    }
}

impl NodeBase for ArithmeticFunction {
    fn instance_type(&self) -> Option<Arc<StructType>> {
        Some(StructType::new(
            "ArithmeticFunctionData",
            vec![
                FieldDesc::new(Self::LEFT, ValueType::Float).with_default(Value::Float(self.left)),
                FieldDesc::new(Self::RIGHT, ValueType::Float).with_default(Value::Float(self.right)),
                FieldDesc::new(Self::RESULT, ValueType::Float),
            ],
        ))
    }
}

impl PropertyFunction for ArithmeticFunction {
    fn execute(&self, ctx: &mut NodeContext<'_>) {
        let node = ctx.node_name().to_string();
        let Some(data) = ctx.instance_mut() else {
            return;
        };
        let left = data.float(Self::LEFT).unwrap_or(self.left);
        let right = data.float(Self::RIGHT).unwrap_or(self.right);
        let result = self.operation.apply(left, right).unwrap_or_else(|| {
            tracing::warn!(node = %node, left, "division by zero, result set to 0");
            0.0
        });
        data.set_float(Self::RESULT, result);
    }
}
