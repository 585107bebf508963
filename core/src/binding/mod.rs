//! Property binding: paths, copy rules, batches and references.

pub mod batch;
pub mod copy;
pub mod path;
pub mod reference;

pub use batch::{BindingDesc, CopyBatch, CopyReport, DataHandle, DataView, PropertyCopy};
pub use copy::CopyKind;
pub use path::{Indirection, PathSegment, PropertyPath, ResolvedPath};
pub use reference::PropertyRefBinding;
