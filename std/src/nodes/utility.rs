use serde::{Deserialize, Serialize};
use std::sync::Arc;
use sylva_core::{Consideration, FieldDesc, NodeBase, NodeContext, StructType, Value, ValueType};

/// Scores a fixed `Value`, bindable like any other instance field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstantConsideration {
    pub value: f32,
}

impl ConstantConsideration {
    pub const VALUE: &'static str = "Value";

    pub fn new(value: f32) -> Self {
        Self { value }
    }
}

impl NodeBase for ConstantConsideration {
    fn instance_type(&self) -> Option<Arc<StructType>> {
        Some(StructType::new(
            "ConstantConsiderationData",
            vec![FieldDesc::new(Self::VALUE, ValueType::Float).with_default(Value::Float(self.value as f64))],
        ))
    }
}

impl Consideration for ConstantConsideration {
    fn score(&self, ctx: &mut NodeContext<'_>) -> f32 {
        ctx.instance()
            .and_then(|d| d.float(Self::VALUE))
            .map_or(self.value, |v| v as f32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ResponseCurve {
    Linear,
    InverseLinear,
    Quadratic,
    Exponent(f32),
    /// 0 below the threshold, 1 from it on.
    Step(f32),
    /// Logistic curve with the given steepness, centered at 0.5.
    Logistic(f32),
}

impl ResponseCurve {
    /// Maps `x` in `[0, 1]` to a score in `[0, 1]`.
    pub fn evaluate(self, x: f32) -> f32 {
        let x = x.clamp(0.0, 1.0);
        let y = match self {
            ResponseCurve::Linear => x,
            ResponseCurve::InverseLinear => 1.0 - x,
            ResponseCurve::Quadratic => x * x,
            ResponseCurve::Exponent(power) => x.powf(power.max(0.0)),
            ResponseCurve::Step(threshold) => {
                if x >= threshold {
                    1.0
                } else {
                    0.0
                }
            }
            ResponseCurve::Logistic(steepness) => 1.0 / (1.0 + (-steepness * (x - 0.5)).exp()),
        };
        if y.is_nan() { 0.0 } else { y.clamp(0.0, 1.0) }
    }
}

/// Normalizes the `Input` field over `[min, max]` and shapes it with a curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurveConsideration {
    pub min: f32,
    pub max: f32,
    pub curve: ResponseCurve,
}

impl CurveConsideration {
    pub const INPUT: &'static str = "Input";

    pub fn new(min: f32, max: f32, curve: ResponseCurve) -> Self {
        Self { min, max, curve }
    }

    pub fn normalize(&self, input: f32) -> f32 {
        let range = self.max - self.min;
        if range.abs() <= f32::EPSILON {
            return if input >= self.max { 1.0 } else { 0.0 };
        }
        ((input - self.min) / range).clamp(0.0, 1.0)
    }
}

impl NodeBase for CurveConsideration {
    fn instance_type(&self) -> Option<Arc<StructType>> {
        Some(StructType::new(
            "CurveConsiderationData",
            vec![FieldDesc::new(Self::INPUT, ValueType::Float)],
        ))
    }
}

impl Consideration for CurveConsideration {
    fn score(&self, ctx: &mut NodeContext<'_>) -> f32 {
        let input = ctx.instance().and_then(|d| d.float(Self::INPUT)).unwrap_or(0.0) as f32;
        self.curve.evaluate(self.normalize(input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sylva_core::{BindingSource, NodeDesc, SelectionBehavior, StateDesc, StructValue, TreeBuilder};
    use sylva_runtime::ExecutionContext;

    #[test]
    fn test_curves_stay_in_unit_range() {
        let curves = [
            ResponseCurve::Linear,
            ResponseCurve::InverseLinear,
            ResponseCurve::Quadratic,
            ResponseCurve::Exponent(3.0),
            ResponseCurve::Step(0.5),
            ResponseCurve::Logistic(10.0),
        ];
        for curve in curves {
            for x in [-1.0, 0.0, 0.25, 0.5, 1.0, 2.0, f32::NAN] {
                let y = curve.evaluate(x);
                assert!((0.0..=1.0).contains(&y), "{curve:?}({x}) = {y}");
            }
        }
        assert_eq!(ResponseCurve::Quadratic.evaluate(0.5), 0.25);
        assert_eq!(ResponseCurve::InverseLinear.evaluate(0.25), 0.75);
        assert_eq!(ResponseCurve::Step(0.5).evaluate(0.49), 0.0);
        assert_eq!(ResponseCurve::Logistic(8.0).evaluate(0.5), 0.5);
    }

    #[test]
    fn test_normalize_clamps_and_handles_flat_range() {
        let consideration = CurveConsideration::new(10.0, 20.0, ResponseCurve::Linear);
        assert_eq!(consideration.normalize(15.0), 0.5);
        assert_eq!(consideration.normalize(5.0), 0.0);
        assert_eq!(consideration.normalize(30.0), 1.0);

        let flat = CurveConsideration::new(5.0, 5.0, ResponseCurve::Linear);
        assert_eq!(flat.normalize(4.0), 0.0);
        assert_eq!(flat.normalize(5.0), 1.0);
    }

    #[test]
    fn test_curve_consideration_drives_utility_selection() {
        sylva_test::init_test_tracing();
        let params = StructType::new("Params", vec![FieldDesc::new("Threat", ValueType::Float)]);
        let tree = TreeBuilder::new("utility")
            .parameters(StructValue::new(&params))
            .state(
                StateDesc::new("Root")
                    .selection(SelectionBehavior::TrySelectChildrenWithHighestUtility)
                    .child(StateDesc::new("Idle").consideration(NodeDesc::consideration(ConstantConsideration::new(0.4))))
                    .child(
                        StateDesc::new("Flee").consideration(
                            NodeDesc::consideration(CurveConsideration::new(0.0, 100.0, ResponseCurve::Linear)).bind(
                                BindingSource::Parameters,
                                "Threat",
                                CurveConsideration::INPUT,
                            ),
                        ),
                    ),
            )
            .build()
            .unwrap();
        let tree = Arc::new(tree);

        let mut ctx = ExecutionContext::new(tree.clone());
        ctx.start(Some(StructValue::new(&params).with("Threat", Value::Float(90.0))));
        assert_eq!(ctx.active_state_names(), ["Root", "Flee"]);

        let mut ctx = ExecutionContext::new(tree);
        ctx.start(Some(StructValue::new(&params).with("Threat", Value::Float(10.0))));
        assert_eq!(ctx.active_state_names(), ["Root", "Idle"]);
    }
}
