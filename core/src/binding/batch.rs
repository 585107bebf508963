use super::copy::CopyKind;
use super::path::{PropertyPath, ResolvedPath};
use crate::error::BindingError;
use crate::handle::{InstanceIndex, NodeRange, SharedIndex, StateIndex};
use crate::object::ObjectRegistry;
use crate::value::{StructType, StructValue, Value};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// Where a binding reads its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataHandle {
    /// Struct-typed context data, by descriptor index.
    Context(u16),
    /// Parameters of the frame's tree.
    GlobalParameters,
    /// Parameter block of an active state.
    StateParameters(StateIndex),
    /// Default instance data of a task or evaluator.
    Instance(InstanceIndex),
    /// Shared instance data of a condition, consideration or property function.
    Shared(SharedIndex),
}

impl DataHandle {
    /// Sources a property reference may never point at.
    pub fn is_read_only(&self) -> bool {
        matches!(self, DataHandle::Context(_) | DataHandle::Shared(_))
    }
}

impl fmt::Display for DataHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataHandle::Context(i) => write!(f, "context[{i}]"),
            DataHandle::GlobalParameters => f.write_str("parameters"),
            DataHandle::StateParameters(s) => write!(f, "state_parameters[{}]", s.0),
            DataHandle::Instance(i) => write!(f, "instance[{}]", i.0),
            DataHandle::Shared(i) => write!(f, "shared[{}]", i.0),
        }
    }
}

/// Read access to binding sources while a target block is being populated.
pub trait DataView {
    fn view(&self, handle: DataHandle) -> Option<&StructValue>;

    fn objects(&self) -> Option<&ObjectRegistry> {
        None
    }
}

/// Authored binding, input to [`CopyBatch::compile`].
#[derive(Debug, Clone)]
pub struct BindingDesc {
    pub source: DataHandle,
    pub source_type: Arc<StructType>,
    pub source_path: PropertyPath,
    pub target_path: PropertyPath,
}

#[derive(Debug, Clone)]
pub struct PropertyCopy {
    source: DataHandle,
    source_path: PropertyPath,
    target_path: PropertyPath,
    resolved_source: ResolvedPath,
    resolved_target: ResolvedPath,
    kind: CopyKind,
}

impl PropertyCopy {
    pub fn source(&self) -> DataHandle {
        self.source
    }

    pub fn source_path(&self) -> &PropertyPath {
        &self.source_path
    }

    pub fn target_path(&self) -> &PropertyPath {
        &self.target_path
    }

    pub fn kind(&self) -> CopyKind {
        self.kind
    }

    pub fn resolved_target(&self) -> &ResolvedPath {
        &self.resolved_target
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CopyReport {
    pub copied: usize,
    pub failed: usize,
}

impl CopyReport {
    pub fn is_ok(&self) -> bool {
        self.failed == 0
    }
}

/// Bindings that all write into one destination struct.
#[derive(Debug, Clone)]
pub struct CopyBatch {
    target_type: Arc<StructType>,
    copies: Vec<PropertyCopy>,
    functions: NodeRange,
}

impl CopyBatch {
    /// Resolves every static path and orders the copies by target access order,
    /// so a coarse copy (a whole array) lands before a narrower one (one element).
    pub fn compile(
        target_type: &Arc<StructType>,
        bindings: Vec<BindingDesc>,
        functions: NodeRange,
    ) -> Result<Self, BindingError> {
        let mut copies = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let resolved_source = binding.source_path.resolve_type(&binding.source_type)?;
            let resolved_target = binding.target_path.resolve_type(target_type)?;
            if resolved_target.is_root() {
                return Err(BindingError::EmptyPath);
            }
            let kind = CopyKind::between(resolved_source.leaf_type(), resolved_target.leaf_type())?;
            copies.push(PropertyCopy {
                source: binding.source,
                source_path: binding.source_path,
                target_path: binding.target_path,
                resolved_source,
                resolved_target,
                kind,
            });
        }
        copies.sort_by(|a, b| {
            a.resolved_target
                .indirections()
                .cmp(b.resolved_target.indirections())
        });
        Ok(CopyBatch {
            target_type: target_type.clone(),
            copies,
            functions,
        })
    }

    pub fn target_type(&self) -> &Arc<StructType> {
        &self.target_type
    }

    pub fn copies(&self) -> &[PropertyCopy] {
        &self.copies
    }

    /// Property functions that must run before this batch is copied.
    pub fn functions(&self) -> NodeRange {
        self.functions
    }

    /// Copies every binding into `target`.
    ///
    /// A binding that fails (unavailable source, out-of-range index, wrong
    /// instance type) leaves its destination untouched and is reported.
    pub fn execute(&self, target: &mut StructValue, view: &dyn DataView) -> CopyReport {
        let mut report = CopyReport::default();
        for copy in &self.copies {
            match Self::copy_one(copy, target, view) {
                Ok(()) => report.copied += 1,
                Err(error) => {
                    report.failed += 1;
                    tracing::warn!(
                        source = %copy.source,
                        source_path = %copy.source_path,
                        target_path = %copy.target_path,
                        %error,
                        "skipped property binding"
                    );
                }
            }
        }
        report
    }

    fn copy_one(
        copy: &PropertyCopy,
        target: &mut StructValue,
        view: &dyn DataView,
    ) -> Result<(), BindingError> {
        let root = view
            .view(copy.source)
            .ok_or_else(|| BindingError::SourceUnavailable(copy.source.to_string()))?;

        let source: Cow<'_, Value> = if copy.resolved_source.is_root() {
            Cow::Owned(Value::Struct(root.clone()))
        } else if copy.resolved_source.is_dynamic() {
            let resolved = copy.source_path.resolve_value(root)?;
            Cow::Borrowed(resolved.get(root)?)
        } else {
            Cow::Borrowed(copy.resolved_source.get(root)?)
        };

        let slot = if copy.resolved_target.is_dynamic() {
            let resolved = copy.target_path.resolve_value(target)?;
            resolved.get_mut(target)?
        } else {
            copy.resolved_target.get_mut(target)?
        };

        copy.kind.apply(&source, slot, view.objects())
    }
}
