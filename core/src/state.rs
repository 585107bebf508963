//! Compact states and transitions.

use crate::delegate::DelegateId;
use crate::event::EventDesc;
use crate::handle::{BatchIndex, DefinitionId, NodeRange, StateIndex, TransitionIndex};
use crate::status::{CompletionPolicy, RunStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StateKind {
    /// Regular state with tasks.
    #[default]
    State,
    /// Container without tasks of its own.
    Group,
    /// Top-level state that is only entered through a linked state.
    Subtree,
    /// Runs a subtree of the same definition in a new frame.
    Linked,
    /// Runs another definition in a new frame.
    LinkedAsset,
}

impl StateKind {
    pub fn is_linked(self) -> bool {
        matches!(self, StateKind::Linked | StateKind::LinkedAsset)
    }
}

/// How a state picks what to select below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SelectionBehavior {
    /// Never selectable.
    None,
    /// Select this state as a leaf, ignoring children.
    TryEnterState,
    /// First selectable child in order; a state without children selects itself.
    #[default]
    TrySelectChildrenInOrder,
    TrySelectChildrenAtRandom,
    TrySelectChildrenWithHighestUtility,
    TrySelectChildrenAtRandomWeightedByUtility,
    /// Evaluate this state's transitions as if it were active and select their target.
    TryFollowTransitions,
}

impl SelectionBehavior {
    pub fn selects_children(self) -> bool {
        matches!(
            self,
            SelectionBehavior::TrySelectChildrenInOrder
                | SelectionBehavior::TrySelectChildrenAtRandom
                | SelectionBehavior::TrySelectChildrenWithHighestUtility
                | SelectionBehavior::TrySelectChildrenAtRandomWeightedByUtility
        )
    }

    pub fn uses_utility(self) -> bool {
        matches!(
            self,
            SelectionBehavior::TrySelectChildrenWithHighestUtility
                | SelectionBehavior::TrySelectChildrenAtRandomWeightedByUtility
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactState {
    pub id: Uuid,
    pub name: String,
    pub kind: StateKind,
    pub parent: Option<StateIndex>,
    /// One past the last descendant in depth-first order.
    pub subtree_end: u16,
    pub depth: u16,
    /// Subtree state entered by a [`StateKind::Linked`] state.
    pub linked_state: Option<StateIndex>,
    /// Definition run by a [`StateKind::LinkedAsset`] state.
    pub linked_asset: Option<DefinitionId>,
    pub selection: SelectionBehavior,
    pub completion: CompletionPolicy,
    pub enter_conditions: NodeRange,
    pub considerations: NodeRange,
    pub tasks: NodeRange,
    pub transitions: (TransitionIndex, TransitionIndex),
    /// Bit per task in `tasks` that counts toward completion.
    pub completion_mask: u32,
    /// Copy batch feeding this state's parameter block.
    pub parameter_bindings: Option<BatchIndex>,
    pub has_parameters: bool,
    pub weight: f32,
    pub enabled: bool,
    pub check_prerequisites_when_activating_child_directly: bool,
    pub required_event: Option<EventDesc>,
}

impl CompactState {
    pub fn has_children(&self, index: StateIndex) -> bool {
        self.subtree_end > index.0 + 1
    }

    pub fn transition_indices(&self) -> impl DoubleEndedIterator<Item = TransitionIndex> + use<> {
        (self.transitions.0.0..self.transitions.1.0).map(TransitionIndex)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransitionTrigger {
    OnTick,
    OnEvent,
    /// Any completion.
    OnStateCompleted,
    OnStateSucceeded,
    OnStateFailed,
    /// The dispatcher was broadcast since the last transition pass.
    OnDelegate(DelegateId),
}

impl TransitionTrigger {
    pub fn is_completion(self) -> bool {
        matches!(
            self,
            TransitionTrigger::OnStateCompleted
                | TransitionTrigger::OnStateSucceeded
                | TransitionTrigger::OnStateFailed
        )
    }

    pub fn accepts(self, status: RunStatus) -> bool {
        match self {
            TransitionTrigger::OnStateCompleted => status.is_completed(),
            TransitionTrigger::OnStateSucceeded => status == RunStatus::Succeeded,
            TransitionTrigger::OnStateFailed => status == RunStatus::Failed,
            TransitionTrigger::OnTick | TransitionTrigger::OnEvent | TransitionTrigger::OnDelegate(_) => false,
        }
    }
}

/// Where a transition goes, resolved at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransitionTarget {
    State(StateIndex),
    Succeeded,
    Failed,
    Stopped,
    /// Blocks lower-priority transitions without going anywhere.
    None,
}

impl TransitionTarget {
    /// Completion status for the Succeeded/Failed/Stopped targets.
    pub fn completion_status(self) -> Option<RunStatus> {
        match self {
            TransitionTarget::Succeeded => Some(RunStatus::Succeeded),
            TransitionTarget::Failed => Some(RunStatus::Failed),
            TransitionTarget::Stopped => Some(RunStatus::Stopped),
            TransitionTarget::State(_) | TransitionTarget::None => None,
        }
    }
}

impl fmt::Display for TransitionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionTarget::State(index) => write!(f, "{index}"),
            TransitionTarget::Succeeded => f.write_str("(Succeeded)"),
            TransitionTarget::Failed => f.write_str("(Failed)"),
            TransitionTarget::Stopped => f.write_str("(Stopped)"),
            TransitionTarget::None => f.write_str("(None)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SelectionFallback {
    #[default]
    None,
    /// Try the following siblings of the target when the target cannot be selected.
    NextSelectableSibling,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TransitionDelay {
    pub duration: f32,
    pub variance: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactTransition {
    pub id: Uuid,
    pub source: StateIndex,
    pub trigger: TransitionTrigger,
    pub required_event: Option<EventDesc>,
    pub consume_event: bool,
    pub target: TransitionTarget,
    pub fallback: SelectionFallback,
    pub priority: Priority,
    pub conditions: NodeRange,
    pub delay: Option<TransitionDelay>,
    pub enabled: bool,
}
