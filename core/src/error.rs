//! Error taxonomy.
//!
//! Structural errors ([`LinkError`], [`SelectionError`]) surface to callers as a
//! terminal run status. [`BindingError`] is fatal for paths resolved while
//! building a definition and is logged-and-skipped for paths resolved against
//! live values. A task reporting `Failed` is a normal run status, not an error.

use thiserror::Error;

pub type TreeResult<T> = Result<T, TreeError>;

#[derive(Error, Debug)]
pub enum TreeError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error(transparent)]
    Binding(#[from] BindingError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failure to make a definition ready to run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    #[error("node '{node}' failed to link: {reason}")]
    NodeLinkFailed { node: String, reason: String },
    #[error("missing required context data '{name}' ({type_name})")]
    MissingContextData { name: String, type_name: String },
    #[error("unknown state '{0}'")]
    UnknownState(String),
    #[error("state name '{0}' is used more than once")]
    DuplicateState(String),
    #[error("unknown binding source '{0}'")]
    UnknownBindingSource(String),
    #[error("state '{state}' has {count} tasks, at most {max} are supported")]
    TooManyTasks {
        state: String,
        count: usize,
        max: usize,
    },
    #[error("condition '{node}' indent {indent} exceeds the maximum expression depth {max}")]
    ExpressionTooDeep { node: String, indent: i32, max: i32 },
    #[error("tree '{0}' has no states")]
    EmptyTree(String),
    #[error("tree '{0}' has too many elements to be addressed")]
    TooLarge(String),
    #[error("tree '{0}' is not linked")]
    NotLinked(String),
}

/// Failure of one selection attempt. The engine stays usable afterwards.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SelectionError {
    #[error("loop detected when selecting '{state}' (visited: {visited})")]
    LoopDetected { state: String, visited: String },
    #[error("trying to recursively enter subtree '{state}' of tree '{tree}'")]
    RecursiveLinkedAsset { tree: String, state: String },
    #[error("linked asset {0} is not available")]
    MissingLinkedAsset(String),
    #[error("no selectable state for '{0}'")]
    NoSelectableState(String),
    #[error("active state path deeper than {0}")]
    DepthExceeded(usize),
    #[error("state '{0}' is not part of any active frame")]
    UnknownFrame(String),
}

/// Failure to resolve or apply a property binding.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BindingError {
    #[error("empty property path")]
    EmptyPath,
    #[error("invalid property path '{0}'")]
    InvalidPath(String),
    #[error("property '{segment}' not found on '{type_name}' (path '{path}')")]
    MissingField {
        path: String,
        segment: String,
        type_name: String,
    },
    #[error("'{segment}' is not an array (path '{path}')")]
    NotAnArray { path: String, segment: String },
    #[error("'{segment}' is not a struct (path '{path}')")]
    NotAStruct { path: String, segment: String },
    #[error("index {index} out of range for array of length {len} (path '{path}')")]
    IndexOutOfRange {
        path: String,
        index: usize,
        len: usize,
    },
    #[error("'{segment}' needs an instance type to be traversed (path '{path}')")]
    MissingInstanceType { path: String, segment: String },
    #[error("expected an instance of '{expected}' but found '{found}' (path '{path}')")]
    InstanceTypeMismatch {
        path: String,
        expected: String,
        found: String,
    },
    #[error("cannot copy '{from}' into '{to}'")]
    IncompatibleTypes { from: String, to: String },
    #[error("indirection does not match the value it is applied to")]
    IndirectionMismatch,
    #[error("binding source {0} is not available")]
    SourceUnavailable(String),
    #[error("property reference cannot point at read-only source {0}")]
    ReadOnlyReferenceSource(String),
    #[error("'{0}' is not a property reference")]
    NotAReference(String),
}
