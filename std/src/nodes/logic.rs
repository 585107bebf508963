use anyhow::bail;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use sylva_core::{Condition, FieldDesc, NodeBase, NodeContext, StructType, Tag, Value, ValueType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Comparison {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

impl Comparison {
    pub fn apply(self, left: f64, right: f64) -> bool {
        match self {
            Comparison::Equal => left == right,
            Comparison::NotEqual => left != right,
            Comparison::Less => left < right,
            Comparison::LessOrEqual => left <= right,
            Comparison::Greater => left > right,
            Comparison::GreaterOrEqual => left >= right,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Comparison::Equal => "==",
            Comparison::NotEqual => "!=",
            Comparison::Less => "<",
            Comparison::LessOrEqual => "<=",
            Comparison::Greater => ">",
            Comparison::GreaterOrEqual => ">=",
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Comparison {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "==" | "eq" => Comparison::Equal,
            "!=" | "ne" => Comparison::NotEqual,
            "<" | "lt" => Comparison::Less,
            "<=" | "le" => Comparison::LessOrEqual,
            ">" | "gt" => Comparison::Greater,
            ">=" | "ge" => Comparison::GreaterOrEqual,
            _ => bail!("unknown comparison `{s}`"),
        })
    }
}

/// Compares the `Left` and `Right` instance fields, usually bound to
/// parameters or evaluator outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareCondition {
    pub comparison: Comparison,
    pub left: f64,
    pub right: f64,
}

impl CompareCondition {
    pub const LEFT: &'static str = "Left";
    pub const RIGHT: &'static str = "Right";

    pub fn new(comparison: Comparison) -> Self {
        Self {
            comparison,
            left: 0.0,
            right: 0.0,
        }
    }

    /// Compares the bound `Left` against a constant.
    pub fn against(comparison: Comparison, right: f64) -> Self {
        Self {
            comparison,
            left: 0.0,
            right,
        }
    }
}

impl NodeBase for CompareCondition {
    fn instance_type(&self) -> Option<Arc<StructType>> {
        Some(StructType::new(
            "CompareConditionData",
            vec![
                FieldDesc::new(Self::LEFT, ValueType::Float).with_default(Value::Float(self.left)),
                FieldDesc::new(Self::RIGHT, ValueType::Float).with_default(Value::Float(self.right)),
            ],
        ))
    }
}

impl Condition for CompareCondition {
    fn test_condition(&self, ctx: &mut NodeContext<'_>) -> bool {
        let Some(data) = ctx.instance() else {
            return false;
        };
        let left = data.float(Self::LEFT).unwrap_or(self.left);
        let right = data.float(Self::RIGHT).unwrap_or(self.right);
        self.comparison.apply(left, right)
    }
}

/// Passes with probability `Threshold`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomCondition {
    pub threshold: f32,
}

impl RandomCondition {
    pub const THRESHOLD: &'static str = "Threshold";

    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }
}

impl NodeBase for RandomCondition {
    fn instance_type(&self) -> Option<Arc<StructType>> {
        Some(StructType::new(
            "RandomConditionData",
            vec![FieldDesc::new(Self::THRESHOLD, ValueType::Float).with_default(Value::Float(self.threshold as f64))],
        ))
    }
}

impl Condition for RandomCondition {
    fn test_condition(&self, ctx: &mut NodeContext<'_>) -> bool {
        let threshold = ctx
            .instance()
            .and_then(|d| d.float(Self::THRESHOLD))
            .map_or(self.threshold, |t| t as f32);
        ctx.rng().r#gen::<f32>() < threshold
    }
}

/// Tests the `Tag` instance field against an expected tag.
///
/// Non-exact matching accepts descendants: a bound `Ai.Alert.Noise` passes
/// for the expected `Ai.Alert`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagCondition {
    pub expected: Tag,
    pub exact: bool,
}

impl TagCondition {
    pub const TAG: &'static str = "Tag";

    pub fn new(expected: impl Into<Tag>) -> Self {
        Self {
            expected: expected.into(),
            exact: false,
        }
    }

    pub fn exact(mut self) -> Self {
        self.exact = true;
        self
    }

    pub fn check(&self, tag: &Tag) -> bool {
        if self.exact {
            tag == &self.expected
        } else {
            tag.matches(&self.expected)
        }
    }
}

impl NodeBase for TagCondition {
    fn instance_type(&self) -> Option<Arc<StructType>> {
        Some(StructType::new("TagConditionData", vec![FieldDesc::new(Self::TAG, ValueType::Name)]))
    }
}

impl Condition for TagCondition {
    fn test_condition(&self, ctx: &mut NodeContext<'_>) -> bool {
        let Some(tag) = ctx.instance().and_then(|d| d.name(Self::TAG)) else {
            return false;
        };
        self.check(&Tag::new(tag))
    }
}
