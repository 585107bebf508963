//! Compact index types used by the compiled tree.
//!
//! Everything inside a [`TreeDefinition`](crate::definition::TreeDefinition) is
//! addressed by index, never by pointer, so a definition can be shared
//! read-only across any number of running instances.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use uuid::Uuid;

/// Index of a state in the flat state array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateIndex(pub u16);

impl StateIndex {
    /// The first top-level state of every definition.
    pub const ROOT: StateIndex = StateIndex(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StateIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Index of a node in the flat node array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeIndex(pub u16);

impl NodeIndex {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a slot in the default (per-instance) instance data layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceIndex(pub u16);

impl InstanceIndex {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a slot in the shared (per-thread) instance data layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SharedIndex(pub u16);

impl SharedIndex {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a transition in the flat transition array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransitionIndex(pub u16);

impl TransitionIndex {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a property copy batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchIndex(pub u16);

impl BatchIndex {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Where a node keeps its instance data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceHandle {
    /// One block per running tree instance (tasks, evaluators).
    Default(InstanceIndex),
    /// One block per calling thread (conditions, considerations, property functions).
    Shared(SharedIndex),
}

/// Stable identifier of one activation of a tree definition.
///
/// Frame IDs come from a monotonic counter owned by the execution state and
/// are never reused within its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FrameId(pub u32);

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame:{}", self.0)
    }
}

/// Stable identity of a compiled tree definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DefinitionId(pub Uuid);

impl DefinitionId {
    pub fn new() -> Self {
        DefinitionId(Uuid::new_v4())
    }
}

impl Default for DefinitionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DefinitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Half-open range of nodes belonging to one list (conditions, tasks, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeRange {
    pub begin: u16,
    pub end: u16,
}

impl NodeRange {
    pub const EMPTY: NodeRange = NodeRange { begin: 0, end: 0 };

    pub fn new(begin: u16, end: u16) -> Self {
        NodeRange { begin, end }
    }

    pub fn len(&self) -> usize {
        (self.end - self.begin) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn contains(&self, node: NodeIndex) -> bool {
        node.0 >= self.begin && node.0 < self.end
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = NodeIndex> + use<> {
        (self.begin..self.end).map(NodeIndex)
    }

    pub fn as_range(&self) -> Range<usize> {
        self.begin as usize..self.end as usize
    }
}
