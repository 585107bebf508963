//! Property paths and their resolved indirections.
//!
//! A [`PropertyPath`] is the authored, name-based address of a property
//! (`"Target.Waypoints[2].X"`). Resolving it against a type or a live value
//! yields a [`ResolvedPath`]: a list of [`Indirection`] steps that locate the
//! property without names, plus the leaf type.

use crate::error::BindingError;
use crate::value::{StructType, StructValue, Value, ValueType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct PathSegment {
    pub name: String,
    pub array_index: Option<usize>,
    /// Concrete type used to traverse a polymorphic (instanced) value.
    pub instance_type: Option<Arc<StructType>>,
}

impl PathSegment {
    pub fn new(name: impl Into<String>) -> Self {
        PathSegment {
            name: name.into(),
            array_index: None,
            instance_type: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PropertyPath {
    segments: Vec<PathSegment>,
}

impl PropertyPath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `"A.B[2].C"`. The empty string is the path to the whole struct.
    pub fn parse(text: &str) -> Result<Self, BindingError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Self::default());
        }
        let mut segments = Vec::new();
        for part in text.split('.') {
            let (name, array_index) = match part.split_once('[') {
                Some((name, rest)) => {
                    let index = rest
                        .strip_suffix(']')
                        .and_then(|i| i.parse::<usize>().ok())
                        .ok_or_else(|| BindingError::InvalidPath(text.to_string()))?;
                    (name, Some(index))
                }
                None => (part, None),
            };
            if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
                return Err(BindingError::InvalidPath(text.to_string()));
            }
            segments.push(PathSegment {
                name: name.to_string(),
                array_index,
                instance_type: None,
            });
        }
        Ok(PropertyPath { segments })
    }

    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.segments.push(PathSegment::new(name));
        self
    }

    /// Indexes the last segment.
    pub fn index(mut self, index: usize) -> Self {
        if let Some(last) = self.segments.last_mut() {
            last.array_index = Some(index);
        }
        self
    }

    /// Sets the concrete type of the polymorphic value at `segment`.
    pub fn with_instance_type(mut self, segment: usize, ty: Arc<StructType>) -> Self {
        if let Some(seg) = self.segments.get_mut(segment) {
            seg.instance_type = Some(ty);
        }
        self
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Static resolution against a declared type.
    ///
    /// Array indices cannot be bounds-checked here; paths containing them (or
    /// polymorphic steps) are marked dynamic and re-resolved on every update.
    pub fn resolve_type(&self, root: &Arc<StructType>) -> Result<ResolvedPath, BindingError> {
        let mut indirections = Vec::new();
        let mut current = root.clone();
        let mut leaf = ValueType::Struct(root.clone());
        let mut dynamic = false;

        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                let previous = &self.segments[i - 1];
                current = match leaf {
                    ValueType::Struct(ty) => ty,
                    ValueType::InstancedStruct => {
                        let ty = previous.instance_type.clone().ok_or_else(|| {
                            BindingError::MissingInstanceType {
                                path: self.to_string(),
                                segment: previous.name.clone(),
                            }
                        })?;
                        indirections.push(Indirection::StructInstance(ty.name().to_string()));
                        dynamic = true;
                        ty
                    }
                    ValueType::InstancedObject(base) => {
                        let ty = previous.instance_type.clone().unwrap_or_else(|| base.clone());
                        if !ty.is_a(&base) {
                            return Err(BindingError::InstanceTypeMismatch {
                                path: self.to_string(),
                                expected: base.name().to_string(),
                                found: ty.name().to_string(),
                            });
                        }
                        indirections.push(Indirection::ObjectInstance(ty.name().to_string()));
                        dynamic = true;
                        ty
                    }
                    _ => {
                        return Err(BindingError::NotAStruct {
                            path: self.to_string(),
                            segment: previous.name.clone(),
                        });
                    }
                };
            }

            let (field_index, field_type) = self.lookup_field(&current, segment)?;
            indirections.push(Indirection::Field(field_index));
            leaf = field_type;

            if let Some(array_index) = segment.array_index {
                leaf = match leaf {
                    ValueType::Array(inner) => *inner,
                    _ => {
                        return Err(BindingError::NotAnArray {
                            path: self.to_string(),
                            segment: segment.name.clone(),
                        });
                    }
                };
                indirections.push(Indirection::IndexArray(array_index as u32));
                dynamic = true;
            }
        }

        Ok(ResolvedPath {
            indirections,
            leaf,
            dynamic,
        })
    }

    /// Resolution against a live value; bounds and instance types are checked.
    ///
    /// On failure nothing is produced, never a partial indirection list.
    pub fn resolve_value(&self, root: &StructValue) -> Result<ResolvedPath, BindingError> {
        let mut indirections = Vec::new();
        let mut current: &StructValue = root;
        let mut leaf_value: Option<&Value> = None;
        let mut leaf = ValueType::Struct(root.ty().clone());
        let mut dynamic = false;

        for (i, segment) in self.segments.iter().enumerate() {
            if let Some(value) = leaf_value {
                let previous = &self.segments[i - 1];
                current = match (&leaf, value) {
                    (ValueType::Struct(_), Value::Struct(inner)) => inner,
                    (ValueType::InstancedStruct | ValueType::InstancedObject(_), Value::Instanced(instance)) => {
                        let Some(instance) = instance.as_deref() else {
                            return Err(BindingError::InstanceTypeMismatch {
                                path: self.to_string(),
                                expected: previous
                                    .instance_type
                                    .as_ref()
                                    .map_or_else(|| leaf.type_name(), |t| t.name().to_string()),
                                found: "null".to_string(),
                            });
                        };
                        let step = self.check_instance(&leaf, previous, instance)?;
                        indirections.push(step);
                        dynamic = true;
                        instance
                    }
                    _ => {
                        return Err(BindingError::NotAStruct {
                            path: self.to_string(),
                            segment: previous.name.clone(),
                        });
                    }
                };
            }

            let (field_index, field_type) = self.lookup_field(current.ty(), segment)?;
            indirections.push(Indirection::Field(field_index));
            leaf = field_type;
            let mut value = current
                .field(field_index as usize)
                .ok_or(BindingError::IndirectionMismatch)?;

            if let Some(array_index) = segment.array_index {
                let (ValueType::Array(inner), Value::Array(items)) = (&leaf, value) else {
                    return Err(BindingError::NotAnArray {
                        path: self.to_string(),
                        segment: segment.name.clone(),
                    });
                };
                value = items.get(array_index).ok_or_else(|| BindingError::IndexOutOfRange {
                    path: self.to_string(),
                    index: array_index,
                    len: items.len(),
                })?;
                leaf = (**inner).clone();
                indirections.push(Indirection::IndexArray(array_index as u32));
                dynamic = true;
            }
            leaf_value = Some(value);
        }

        Ok(ResolvedPath {
            indirections,
            leaf,
            dynamic,
        })
    }

    fn lookup_field(
        &self,
        ty: &StructType,
        segment: &PathSegment,
    ) -> Result<(u16, ValueType), BindingError> {
        let index = ty
            .field_index(&segment.name)
            .ok_or_else(|| BindingError::MissingField {
                path: self.to_string(),
                segment: segment.name.clone(),
                type_name: ty.name().to_string(),
            })?;
        Ok((index as u16, ty.fields()[index].ty.clone()))
    }

    fn check_instance(
        &self,
        declared: &ValueType,
        segment: &PathSegment,
        instance: &StructValue,
    ) -> Result<Indirection, BindingError> {
        let mismatch = |expected: &str| BindingError::InstanceTypeMismatch {
            path: self.to_string(),
            expected: expected.to_string(),
            found: instance.type_name().to_string(),
        };
        match declared {
            ValueType::InstancedObject(base) => {
                let expected = segment.instance_type.as_ref().unwrap_or(base);
                if !instance.ty().is_a(expected) {
                    return Err(mismatch(expected.name()));
                }
                Ok(Indirection::ObjectInstance(expected.name().to_string()))
            }
            _ => {
                if let Some(expected) = &segment.instance_type {
                    if expected.name() != instance.type_name() {
                        return Err(mismatch(expected.name()));
                    }
                }
                Ok(Indirection::StructInstance(instance.type_name().to_string()))
            }
        }
    }
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            f.write_str(&segment.name)?;
            if let Some(index) = segment.array_index {
                write!(f, "[{index}]")?;
            }
        }
        Ok(())
    }
}

/// One name-free step towards a property.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Indirection {
    /// Field by declaration index.
    Field(u16),
    /// Element of a dynamic array.
    IndexArray(u32),
    /// Into an instanced struct whose type name must match exactly.
    StructInstance(String),
    /// Into an instanced object that must derive from the named class.
    ObjectInstance(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPath {
    indirections: Vec<Indirection>,
    leaf: ValueType,
    dynamic: bool,
}

impl ResolvedPath {
    pub fn indirections(&self) -> &[Indirection] {
        &self.indirections
    }

    pub fn leaf_type(&self) -> &ValueType {
        &self.leaf
    }

    /// Whether the path must be re-resolved against live values before use.
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// The whole struct rather than one of its properties.
    pub fn is_root(&self) -> bool {
        self.indirections.is_empty()
    }

    pub fn get<'a>(&self, root: &'a StructValue) -> Result<&'a Value, BindingError> {
        apply(&self.indirections, root)
    }

    pub fn get_mut<'a>(&self, root: &'a mut StructValue) -> Result<&'a mut Value, BindingError> {
        apply_mut(&self.indirections, root)
    }
}

enum Cursor<'a> {
    Struct(&'a StructValue),
    Value(&'a Value),
}

enum CursorMut<'a> {
    Struct(&'a mut StructValue),
    Value(&'a mut Value),
}

fn derives_from(ty: &StructType, name: &str) -> bool {
    ty.name() == name || ty.parent().is_some_and(|p| derives_from(p, name))
}

/// Follows indirections from `root`. An empty list does not address a value.
pub fn apply<'a>(indirections: &[Indirection], root: &'a StructValue) -> Result<&'a Value, BindingError> {
    let mut cursor = Cursor::Struct(root);
    for step in indirections {
        cursor = match (step, cursor) {
            (Indirection::Field(i), Cursor::Struct(s))
            | (Indirection::Field(i), Cursor::Value(Value::Struct(s))) => {
                Cursor::Value(s.field(*i as usize).ok_or(BindingError::IndirectionMismatch)?)
            }
            (Indirection::IndexArray(i), Cursor::Value(Value::Array(items))) => {
                Cursor::Value(items.get(*i as usize).ok_or(BindingError::IndirectionMismatch)?)
            }
            (Indirection::StructInstance(name), Cursor::Value(Value::Instanced(Some(s))))
                if s.type_name() == name =>
            {
                Cursor::Struct(s)
            }
            (Indirection::ObjectInstance(name), Cursor::Value(Value::Instanced(Some(s))))
                if derives_from(s.ty(), name) =>
            {
                Cursor::Struct(s)
            }
            _ => return Err(BindingError::IndirectionMismatch),
        };
    }
    match cursor {
        Cursor::Value(value) => Ok(value),
        Cursor::Struct(_) => Err(BindingError::EmptyPath),
    }
}

pub fn apply_mut<'a>(
    indirections: &[Indirection],
    root: &'a mut StructValue,
) -> Result<&'a mut Value, BindingError> {
    let mut cursor = CursorMut::Struct(root);
    for step in indirections {
        cursor = match (step, cursor) {
            (Indirection::Field(i), CursorMut::Struct(s))
            | (Indirection::Field(i), CursorMut::Value(Value::Struct(s))) => CursorMut::Value(
                s.field_mut(*i as usize)
                    .ok_or(BindingError::IndirectionMismatch)?,
            ),
            (Indirection::IndexArray(i), CursorMut::Value(Value::Array(items))) => CursorMut::Value(
                items
                    .get_mut(*i as usize)
                    .ok_or(BindingError::IndirectionMismatch)?,
            ),
            (Indirection::StructInstance(name), CursorMut::Value(Value::Instanced(Some(s)))) => {
                if s.type_name() != name {
                    return Err(BindingError::IndirectionMismatch);
                }
                CursorMut::Struct(s)
            }
            (Indirection::ObjectInstance(name), CursorMut::Value(Value::Instanced(Some(s)))) => {
                if !derives_from(s.ty(), name) {
                    return Err(BindingError::IndirectionMismatch);
                }
                CursorMut::Struct(s)
            }
            _ => return Err(BindingError::IndirectionMismatch),
        };
    }
    match cursor {
        CursorMut::Value(value) => Ok(value),
        CursorMut::Struct(_) => Err(BindingError::EmptyPath),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::FieldDesc;

    fn waypoint() -> Arc<StructType> {
        StructType::new(
            "Waypoint",
            vec![
                FieldDesc::new("X", ValueType::Float),
                FieldDesc::new("Tag", ValueType::Name),
            ],
        )
    }

    fn patrol() -> Arc<StructType> {
        StructType::new(
            "Patrol",
            vec![
                FieldDesc::new("Speed", ValueType::Float),
                FieldDesc::new(
                    "Waypoints",
                    ValueType::Array(Box::new(ValueType::Struct(waypoint()))),
                ),
                FieldDesc::new("Payload", ValueType::InstancedStruct),
            ],
        )
    }

    #[test]
    fn test_parse_and_display() {
        let path = PropertyPath::parse("Waypoints[2].X").unwrap();
        assert_eq!(path.segments().len(), 2);
        assert_eq!(path.segments()[0].array_index, Some(2));
        assert_eq!(path.to_string(), "Waypoints[2].X");
        assert!(PropertyPath::parse("").unwrap().is_empty());
        assert!(PropertyPath::parse("A[x]").is_err());
        assert!(PropertyPath::parse("A..B").is_err());
    }

    #[test]
    fn test_static_path_is_not_dynamic() {
        let resolved = PropertyPath::parse("Speed").unwrap().resolve_type(&patrol()).unwrap();
        assert!(!resolved.is_dynamic());
        assert_eq!(resolved.indirections(), &[Indirection::Field(0)]);
        assert_eq!(resolved.leaf_type(), &ValueType::Float);
    }

    fn instance_path_of(value: &StructValue) -> ResolvedPath {
        PropertyPath::parse("Payload.X")
            .unwrap()
            .with_instance_type(0, waypoint())
            .resolve_value(value)
            .unwrap()
    }

    #[test]
    fn test_indirections_survive_serialization() {
        let tagged = |tag: &str| Value::Struct(StructValue::new(&waypoint()).with("Tag", Value::Name(tag.into())));
        let value = StructValue::new(&patrol())
            .with("Waypoints", Value::Array(vec![tagged("Gate"), tagged("Tower")]))
            .with(
                "Payload",
                Value::Instanced(Some(Box::new(StructValue::new(&waypoint()).with("X", Value::Float(7.5))))),
            );

        let array_path = PropertyPath::parse("Waypoints[1].Tag").unwrap();
        let instance_path = PropertyPath::parse("Payload.X").unwrap().with_instance_type(0, waypoint());
        for path in [array_path, instance_path] {
            let resolved = path.resolve_value(&value).unwrap();
            let json = serde_json::to_string(resolved.indirections()).unwrap();
            let restored: Vec<Indirection> = serde_json::from_str(&json).unwrap();
            assert_eq!(restored, resolved.indirections());
            assert_eq!(apply(&restored, &value), resolved.get(&value));
            assert!(apply(&restored, &value).is_ok());
        }

        let tower = PropertyPath::parse("Waypoints[1].Tag").unwrap().resolve_value(&value).unwrap();
        assert!(tower.indirections().contains(&Indirection::IndexArray(1)));
        assert_eq!(tower.get(&value), Ok(&Value::Name("Tower".into())));
        let payload = instance_path_of(&value);
        assert!(payload.indirections().contains(&Indirection::StructInstance("Waypoint".into())));
        assert_eq!(payload.get(&value), Ok(&Value::Float(7.5)));
    }

    #[test]
    fn test_apply_mut_checks_instance_type() {
        let mut value = StructValue::new(&patrol()).with(
            "Payload",
            Value::Instanced(Some(Box::new(StructValue::new(&waypoint())))),
        );
        let resolved = PropertyPath::parse("Payload.X")
            .unwrap()
            .with_instance_type(0, waypoint())
            .resolve_value(&value)
            .unwrap();
        *apply_mut(resolved.indirections(), &mut value).unwrap() = Value::Float(2.0);
        assert_eq!(apply(resolved.indirections(), &value), Ok(&Value::Float(2.0)));

        let other = StructType::new("Other", vec![FieldDesc::new("X", ValueType::Float)]);
        value.set("Payload", Value::Instanced(Some(Box::new(StructValue::new(&other)))));
        assert_eq!(
            apply_mut(resolved.indirections(), &mut value).map(|v| v.clone()),
            Err(BindingError::IndirectionMismatch)
        );

        let object_step = [Indirection::Field(2), Indirection::ObjectInstance("Waypoint".into()), Indirection::Field(0)];
        value.set("Payload", Value::Instanced(Some(Box::new(StructValue::new(&waypoint())))));
        assert!(apply_mut(&object_step, &mut value).is_ok());
        value.set("Payload", Value::Instanced(Some(Box::new(StructValue::new(&other)))));
        assert!(apply_mut(&object_step, &mut value).is_err());
    }

    #[test]
    fn test_out_of_range_index_fails_without_partial_result() {
        let value = StructValue::new(&patrol()).with(
            "Waypoints",
            Value::Array(vec![Value::Struct(StructValue::new(&waypoint()))]),
        );
        let path = PropertyPath::parse("Waypoints[3].X").unwrap();
        match path.resolve_value(&value) {
            Err(BindingError::IndexOutOfRange { index, len, .. }) => {
                assert_eq!((index, len), (3, 1));
            }
            other => panic!("unexpected {other:?}"),
        }

        let ok = PropertyPath::parse("Waypoints[0].X").unwrap().resolve_value(&value).unwrap();
        assert_eq!(ok.get(&value), Ok(&Value::Float(0.0)));
    }

    #[test]
    fn test_instanced_struct_requires_matching_type() {
        let ty = patrol();
        let path = PropertyPath::parse("Payload.X")
            .unwrap()
            .with_instance_type(0, waypoint());
        assert!(PropertyPath::parse("Payload.X").unwrap().resolve_type(&ty).is_err());
        assert!(path.resolve_type(&ty).is_ok());

        let mut value = StructValue::new(&ty);
        value.set(
            "Payload",
            Value::Instanced(Some(Box::new(StructValue::new(&waypoint()).with("X", Value::Float(4.0))))),
        );
        let resolved = path.resolve_value(&value).unwrap();
        assert_eq!(resolved.get(&value), Ok(&Value::Float(4.0)));

        let other = StructType::new("Other", vec![FieldDesc::new("X", ValueType::Float)]);
        value.set("Payload", Value::Instanced(Some(Box::new(StructValue::new(&other)))));
        assert!(matches!(
            path.resolve_value(&value),
            Err(BindingError::InstanceTypeMismatch { .. })
        ));
        assert_eq!(resolved.get(&value), Err(BindingError::IndirectionMismatch));
    }
}
