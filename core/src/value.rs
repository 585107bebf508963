//! Dynamic value model for node instance data.
//!
//! Nodes declare the shape of their instance block as a [`StructType`]; the
//! runtime stores a [`StructValue`] per block. The property binding runtime
//! walks these values by field index, array index and polymorphic instance.

use crate::object::{ObjectHandle, SoftObjectPath};
use std::fmt;
use std::sync::Arc;

/// Declared type of a field.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueType {
    Bool,
    Int,
    Float,
    Name,
    Struct(Arc<StructType>),
    Array(Box<ValueType>),
    /// Weak handle to a live object of the given class.
    Object(String),
    /// Path to an object of the given class; survives collection.
    SoftObject(String),
    Class(String),
    SoftClass(String),
    /// Owned struct of any type, checked at each traversal.
    InstancedStruct,
    /// Owned object deriving from the given base class.
    InstancedObject(Arc<StructType>),
    /// Handle bound at build time to a property of another node's instance data.
    PropertyRef(Box<ValueType>),
}

impl ValueType {
    pub fn default_value(&self) -> Value {
        match self {
            ValueType::Bool => Value::Bool(false),
            ValueType::Int => Value::Int(0),
            ValueType::Float => Value::Float(0.0),
            ValueType::Name => Value::Name(String::new()),
            ValueType::Struct(ty) => Value::Struct(StructValue::new(ty)),
            ValueType::Array(_) => Value::Array(Vec::new()),
            ValueType::Object(_) => Value::Object(None),
            ValueType::SoftObject(_) => Value::SoftObject(SoftObjectPath::default()),
            ValueType::Class(_) => Value::Class(None),
            ValueType::SoftClass(_) => Value::SoftClass(SoftObjectPath::default()),
            ValueType::InstancedStruct | ValueType::InstancedObject(_) => Value::Instanced(None),
            ValueType::PropertyRef(_) => Value::PropertyRef(None),
        }
    }

    pub fn is_polymorphic(&self) -> bool {
        matches!(self, ValueType::InstancedStruct | ValueType::InstancedObject(_))
    }

    pub fn type_name(&self) -> String {
        match self {
            ValueType::Bool => "bool".into(),
            ValueType::Int => "int".into(),
            ValueType::Float => "float".into(),
            ValueType::Name => "name".into(),
            ValueType::Struct(ty) => ty.name().to_string(),
            ValueType::Array(inner) => format!("array<{}>", inner.type_name()),
            ValueType::Object(class) => format!("object<{class}>"),
            ValueType::SoftObject(class) => format!("soft_object<{class}>"),
            ValueType::Class(class) => format!("class<{class}>"),
            ValueType::SoftClass(class) => format!("soft_class<{class}>"),
            ValueType::InstancedStruct => "instanced_struct".into(),
            ValueType::InstancedObject(base) => format!("instanced<{}>", base.name()),
            ValueType::PropertyRef(inner) => format!("ref<{}>", inner.type_name()),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.type_name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDesc {
    pub name: String,
    pub ty: ValueType,
    pub default: Option<Value>,
}

impl FieldDesc {
    pub fn new(name: impl Into<String>, ty: ValueType) -> Self {
        FieldDesc {
            name: name.into(),
            ty,
            default: None,
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn default_value(&self) -> Value {
        self.default
            .clone()
            .unwrap_or_else(|| self.ty.default_value())
    }
}

/// Shape of an instance data block, or of a nested struct / object class.
#[derive(Debug, PartialEq)]
pub struct StructType {
    name: String,
    parent: Option<Arc<StructType>>,
    fields: Vec<FieldDesc>,
}

impl StructType {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDesc>) -> Arc<Self> {
        Arc::new(StructType {
            name: name.into(),
            parent: None,
            fields,
        })
    }

    /// A subtype: inherits the parent's fields first, then adds its own.
    pub fn derived(
        name: impl Into<String>,
        parent: &Arc<StructType>,
        extra: Vec<FieldDesc>,
    ) -> Arc<Self> {
        let mut fields = parent.fields.clone();
        fields.extend(extra);
        Arc::new(StructType {
            name: name.into(),
            parent: Some(parent.clone()),
            fields,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&Arc<StructType>> {
        self.parent.as_ref()
    }

    pub fn fields(&self) -> &[FieldDesc] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> Option<&FieldDesc> {
        self.fields.get(index)
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// True if this type is `other` or derives from it.
    pub fn is_a(&self, other: &StructType) -> bool {
        if self.name == other.name {
            return true;
        }
        self.parent.as_ref().is_some_and(|p| p.is_a(other))
    }
}

/// Live value stored in a field.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Name(String),
    Struct(StructValue),
    Array(Vec<Value>),
    Object(Option<ObjectHandle>),
    SoftObject(SoftObjectPath),
    Class(Option<ObjectHandle>),
    SoftClass(SoftObjectPath),
    Instanced(Option<Box<StructValue>>),
    /// Index into the definition's property reference table.
    PropertyRef(Option<u16>),
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Name(_) => "name",
            Value::Struct(_) => "struct",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::SoftObject(_) => "soft_object",
            Value::Class(_) => "class",
            Value::SoftClass(_) => "soft_class",
            Value::Instanced(_) => "instanced",
            Value::PropertyRef(_) => "property_ref",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            Value::Name(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructValue> {
        match self {
            Value::Struct(v) => Some(v),
            Value::Instanced(Some(v)) => Some(v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(v) => Some(v),
            _ => None,
        }
    }

    /// Whether this value may be stored in a field of type `ty`.
    pub fn conforms_to(&self, ty: &ValueType) -> bool {
        match (self, ty) {
            (Value::Bool(_), ValueType::Bool)
            | (Value::Int(_), ValueType::Int)
            | (Value::Float(_), ValueType::Float)
            | (Value::Name(_), ValueType::Name)
            | (Value::Object(_), ValueType::Object(_))
            | (Value::SoftObject(_), ValueType::SoftObject(_))
            | (Value::Class(_), ValueType::Class(_))
            | (Value::SoftClass(_), ValueType::SoftClass(_))
            | (Value::PropertyRef(_), ValueType::PropertyRef(_)) => true,
            (Value::Struct(v), ValueType::Struct(t)) => v.ty().name() == t.name(),
            (Value::Array(items), ValueType::Array(inner)) => {
                items.iter().all(|item| item.conforms_to(inner))
            }
            (Value::Instanced(None), ValueType::InstancedStruct | ValueType::InstancedObject(_)) => {
                true
            }
            (Value::Instanced(Some(_)), ValueType::InstancedStruct) => true,
            (Value::Instanced(Some(v)), ValueType::InstancedObject(base)) => v.ty().is_a(base),
            _ => false,
        }
    }

    /// Resets to `default`, reusing array storage where possible.
    fn reset_to(&mut self, default: Value) {
        match (self, default) {
            (Value::Array(items), Value::Array(defaults)) => {
                items.clear();
                items.extend(defaults);
            }
            (Value::Struct(current), Value::Struct(default)) if current.ty == default.ty => {
                current.reset_to_defaults();
            }
            (slot, default) => *slot = default,
        }
    }
}

/// One instance of a [`StructType`].
#[derive(Debug, Clone)]
pub struct StructValue {
    ty: Arc<StructType>,
    fields: Vec<Value>,
}

impl PartialEq for StructValue {
    fn eq(&self, other: &Self) -> bool {
        self.ty.name() == other.ty.name() && self.fields == other.fields
    }
}

impl StructValue {
    pub fn new(ty: &Arc<StructType>) -> Self {
        StructValue {
            ty: ty.clone(),
            fields: ty.fields().iter().map(FieldDesc::default_value).collect(),
        }
    }

    pub fn ty(&self) -> &Arc<StructType> {
        &self.ty
    }

    pub fn type_name(&self) -> &str {
        self.ty.name()
    }

    pub fn fields(&self) -> &[Value] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> Option<&Value> {
        self.fields.get(index)
    }

    pub fn field_mut(&mut self, index: usize) -> Option<&mut Value> {
        self.fields.get_mut(index)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.ty.field_index(name).and_then(|i| self.fields.get(i))
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        let index = self.ty.field_index(name)?;
        self.fields.get_mut(index)
    }

    /// Assigns a field, rejecting values that do not fit the declared type.
    pub fn set(&mut self, name: &str, value: Value) -> bool {
        let Some(index) = self.ty.field_index(name) else {
            return false;
        };
        if !value.conforms_to(&self.ty.fields()[index].ty) {
            return false;
        }
        self.fields[index] = value;
        true
    }

    /// Builder form of [`StructValue::set`]; mismatches are logged and ignored.
    pub fn with(mut self, name: &str, value: Value) -> Self {
        if !self.set(name, value) {
            tracing::warn!(struct_type = %self.ty.name(), field = name, "ignored mismatched field value");
        }
        self
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_int)
    }

    pub fn float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_float)
    }

    pub fn name(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_name)
    }

    pub fn set_bool(&mut self, name: &str, value: bool) -> bool {
        self.set(name, Value::Bool(value))
    }

    pub fn set_int(&mut self, name: &str, value: i64) -> bool {
        self.set(name, Value::Int(value))
    }

    pub fn set_float(&mut self, name: &str, value: f64) -> bool {
        self.set(name, Value::Float(value))
    }

    /// Restores declared defaults. Array fields keep their allocation.
    pub fn reset_to_defaults(&mut self) {
        let ty = self.ty.clone();
        for (value, desc) in self.fields.iter_mut().zip(ty.fields()) {
            value.reset_to(desc.default_value());
        }
    }
}
