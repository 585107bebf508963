use super::batch::DataHandle;
use super::copy::CopyKind;
use super::path::{PropertyPath, ResolvedPath};
use crate::error::BindingError;
use crate::value::{StructType, StructValue, Value, ValueType};
use std::sync::Arc;

/// A writable handle from one node's instance data into another property.
///
/// References are resolved once when the definition links. Context data and
/// shared instance data are rejected: the first belongs to the host, the
/// second is reused across executions on the same thread.
#[derive(Debug, Clone)]
pub struct PropertyRefBinding {
    source: DataHandle,
    path: PropertyPath,
    resolved: ResolvedPath,
}

impl PropertyRefBinding {
    pub fn compile(
        source: DataHandle,
        source_type: &Arc<StructType>,
        path: PropertyPath,
        expected: &ValueType,
    ) -> Result<Self, BindingError> {
        if source.is_read_only() {
            return Err(BindingError::ReadOnlyReferenceSource(source.to_string()));
        }
        let resolved = path.resolve_type(source_type)?;
        if resolved.is_root() {
            return Err(BindingError::EmptyPath);
        }
        if CopyKind::between(resolved.leaf_type(), expected)? != CopyKind::Plain
            && resolved.leaf_type() != expected
        {
            return Err(BindingError::IncompatibleTypes {
                from: resolved.leaf_type().type_name(),
                to: expected.type_name(),
            });
        }
        Ok(PropertyRefBinding {
            source,
            path,
            resolved,
        })
    }

    pub fn source(&self) -> DataHandle {
        self.source
    }

    pub fn path(&self) -> &PropertyPath {
        &self.path
    }

    pub fn leaf_type(&self) -> &ValueType {
        self.resolved.leaf_type()
    }

    pub fn get<'a>(&self, root: &'a StructValue) -> Result<&'a Value, BindingError> {
        if self.resolved.is_dynamic() {
            self.path.resolve_value(root)?.get(root)
        } else {
            self.resolved.get(root)
        }
    }

    pub fn get_mut<'a>(&self, root: &'a mut StructValue) -> Result<&'a mut Value, BindingError> {
        if self.resolved.is_dynamic() {
            let resolved = self.path.resolve_value(root)?;
            resolved.get_mut(root)
        } else {
            self.resolved.get_mut(root)
        }
    }
}
