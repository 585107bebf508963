//! Value copy rules between a binding's source and target properties.

use crate::error::BindingError;
use crate::object::{ObjectRegistry, SoftObjectPath};
use crate::value::{Value, ValueType};
use serde::{Deserialize, Serialize};

/// How one binding copies its value, decided once when the batch is compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CopyKind {
    /// Same-type scalar or struct assignment.
    Plain,
    /// Destination resized to the source length, then element-wise assigned.
    DynamicArray,
    ObjectToSoftObject,
    SoftObjectToObject,
    ClassToSoftClass,
    SoftClassToClass,
    PromoteBoolToInt,
    PromoteIntToFloat,
    DemoteFloatToInt,
}

impl CopyKind {
    /// Chooses the copy rule for `from` into `to`.
    pub fn between(from: &ValueType, to: &ValueType) -> Result<CopyKind, BindingError> {
        let incompatible = || BindingError::IncompatibleTypes {
            from: from.type_name(),
            to: to.type_name(),
        };
        let kind = match (from, to) {
            (ValueType::Array(a), ValueType::Array(b)) => {
                if CopyKind::between(a, b)? != CopyKind::Plain {
                    return Err(incompatible());
                }
                CopyKind::DynamicArray
            }
            (ValueType::Object(_), ValueType::SoftObject(_)) => CopyKind::ObjectToSoftObject,
            (ValueType::SoftObject(_), ValueType::Object(_)) => CopyKind::SoftObjectToObject,
            (ValueType::Class(_), ValueType::SoftClass(_)) => CopyKind::ClassToSoftClass,
            (ValueType::SoftClass(_), ValueType::Class(_)) => CopyKind::SoftClassToClass,
            (ValueType::Bool, ValueType::Int) => CopyKind::PromoteBoolToInt,
            (ValueType::Int, ValueType::Float) => CopyKind::PromoteIntToFloat,
            (ValueType::Float, ValueType::Int) => CopyKind::DemoteFloatToInt,
            (ValueType::Struct(a), ValueType::Struct(b)) if a.name() == b.name() => CopyKind::Plain,
            (ValueType::InstancedObject(a), ValueType::InstancedObject(b)) if a.is_a(b) => {
                CopyKind::Plain
            }
            (ValueType::Bool, ValueType::Bool)
            | (ValueType::Int, ValueType::Int)
            | (ValueType::Float, ValueType::Float)
            | (ValueType::Name, ValueType::Name)
            | (ValueType::Object(_), ValueType::Object(_))
            | (ValueType::SoftObject(_), ValueType::SoftObject(_))
            | (ValueType::Class(_), ValueType::Class(_))
            | (ValueType::SoftClass(_), ValueType::SoftClass(_))
            | (ValueType::InstancedStruct, ValueType::InstancedStruct) => CopyKind::Plain,
            _ => return Err(incompatible()),
        };
        Ok(kind)
    }

    /// Writes `source` into `target`.
    ///
    /// Object conversions consult `objects`; without a registry raw handles
    /// convert to null paths and paths to null handles.
    pub fn apply(
        self,
        source: &Value,
        target: &mut Value,
        objects: Option<&ObjectRegistry>,
    ) -> Result<(), BindingError> {
        let target_kind = target.kind_name();
        let mismatch = || BindingError::IncompatibleTypes {
            from: source.kind_name().to_string(),
            to: target_kind.to_string(),
        };
        match self {
            CopyKind::Plain => {
                if std::mem::discriminant(source) != std::mem::discriminant(target) {
                    return Err(mismatch());
                }
                target.clone_from(source);
            }
            CopyKind::DynamicArray => {
                let (Value::Array(from), Value::Array(to)) = (source, &mut *target) else {
                    return Err(mismatch());
                };
                to.truncate(from.len());
                for (slot, item) in to.iter_mut().zip(from.iter()) {
                    slot.clone_from(item);
                }
                let kept = to.len();
                to.extend(from[kept..].iter().cloned());
            }
            CopyKind::ObjectToSoftObject | CopyKind::ClassToSoftClass => {
                let handle = match source {
                    Value::Object(h) | Value::Class(h) => *h,
                    _ => return Err(mismatch()),
                };
                let path = handle
                    .and_then(|h| objects.and_then(|o| o.path_of(h)))
                    .unwrap_or_default();
                match target {
                    Value::SoftObject(p) | Value::SoftClass(p) => *p = path,
                    _ => return Err(mismatch()),
                }
            }
            CopyKind::SoftObjectToObject | CopyKind::SoftClassToClass => {
                let path: &SoftObjectPath = match source {
                    Value::SoftObject(p) | Value::SoftClass(p) => p,
                    _ => return Err(mismatch()),
                };
                let handle = objects.and_then(|o| o.resolve(path));
                match target {
                    Value::Object(h) | Value::Class(h) => *h = handle,
                    _ => return Err(mismatch()),
                }
            }
            CopyKind::PromoteBoolToInt => match (source, target) {
                (Value::Bool(b), Value::Int(i)) => *i = i64::from(*b),
                _ => return Err(mismatch()),
            },
            CopyKind::PromoteIntToFloat => match (source, target) {
                (Value::Int(i), Value::Float(f)) => *f = *i as f64,
                _ => return Err(mismatch()),
            },
            CopyKind::DemoteFloatToInt => match (source, target) {
                (Value::Float(f), Value::Int(i)) => *i = f.trunc() as i64,
                _ => return Err(mismatch()),
            },
        }
        Ok(())
    }
}
