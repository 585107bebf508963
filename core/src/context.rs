//! Context data - host-supplied data views.
//!
//! A definition declares the context data it needs as [`ContextDescriptor`]s.
//! Two kinds exist: struct-typed views that property bindings can read from,
//! and opaque host values (anything `Send + Sync`) that nodes reach through an
//! [`ExternalHandle`] resolved when the definition links.

use crate::error::LinkError;
use crate::value::{StructType, StructValue};
use ahash::AHashMap;
use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum ContextKind {
    /// Bindable struct view, looked up by descriptor name.
    Struct(Arc<StructType>),
    /// Opaque host value, looked up by Rust type.
    External {
        type_id: TypeId,
        type_name: &'static str,
    },
}

#[derive(Debug, Clone)]
pub struct ContextDescriptor {
    pub name: String,
    pub kind: ContextKind,
    pub required: bool,
}

impl ContextDescriptor {
    pub fn structure(name: impl Into<String>, ty: Arc<StructType>) -> Self {
        ContextDescriptor {
            name: name.into(),
            kind: ContextKind::Struct(ty),
            required: true,
        }
    }

    pub fn external<T: Send + Sync + 'static>(name: impl Into<String>) -> Self {
        ContextDescriptor {
            name: name.into(),
            kind: ContextKind::External {
                type_id: TypeId::of::<T>(),
                type_name: std::any::type_name::<T>(),
            },
            required: true,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn type_name(&self) -> String {
        match &self.kind {
            ContextKind::Struct(ty) => ty.name().to_string(),
            ContextKind::External { type_name, .. } => (*type_name).to_string(),
        }
    }
}

/// Typed handle to an external context value, produced by the linker.
pub struct ExternalHandle<T> {
    index: u16,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ExternalHandle<T> {
    pub(crate) fn new(index: u16) -> Self {
        ExternalHandle {
            index,
            _marker: PhantomData,
        }
    }

    /// Descriptor index in the owning definition.
    pub fn index(&self) -> u16 {
        self.index
    }
}

impl<T> Clone for ExternalHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ExternalHandle<T> {}

impl<T> fmt::Debug for ExternalHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalHandle")
            .field("index", &self.index)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

/// Data views supplied by the owner of an execution context.
///
/// Host values are keyed by type (TypeMap pattern), struct views by name.
#[derive(Default)]
pub struct ContextData {
    externals: AHashMap<TypeId, Box<dyn Any + Send + Sync>>,
    structs: AHashMap<String, StructValue>,
}

impl ContextData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a host value. A value of the same type is replaced.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) {
        self.externals.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.externals
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref())
    }

    pub fn get_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.externals
            .get_mut(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_mut())
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.externals.contains_key(&TypeId::of::<T>())
    }

    pub fn remove<T: 'static>(&mut self) -> Option<T> {
        self.externals
            .remove(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast().ok())
            .map(|boxed| *boxed)
    }

    /// Sets the struct view for descriptor `name`.
    pub fn set_struct(&mut self, name: impl Into<String>, value: StructValue) {
        self.structs.insert(name.into(), value);
    }

    pub fn struct_view(&self, name: &str) -> Option<&StructValue> {
        self.structs.get(name)
    }

    pub fn struct_view_mut(&mut self, name: &str) -> Option<&mut StructValue> {
        self.structs.get_mut(name)
    }

    /// Checks that every required descriptor has a value of the right type.
    pub fn validate(&self, descriptors: &[ContextDescriptor]) -> Result<(), LinkError> {
        for descriptor in descriptors.iter().filter(|d| d.required) {
            let present = match &descriptor.kind {
                ContextKind::Struct(ty) => self
                    .structs
                    .get(&descriptor.name)
                    .is_some_and(|v| v.ty().is_a(ty)),
                ContextKind::External { type_id, .. } => self.externals.contains_key(type_id),
            };
            if !present {
                return Err(LinkError::MissingContextData {
                    name: descriptor.name.clone(),
                    type_name: descriptor.type_name(),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ContextData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextData")
            .field("external_count", &self.externals.len())
            .field("structs", &self.structs.keys().collect::<Vec<_>>())
            .finish()
    }
}
