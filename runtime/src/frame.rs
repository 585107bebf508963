//! Active frames: one activation of a tree definition on the execution stack.

use std::sync::Arc;
use sylva_core::{
    ContextData, DataHandle, DataView, FrameId, InstanceStorage, NodeIndex, NodeRange, ObjectRegistry,
    RunStatus, SharedInstancePool, StateIndex, StructValue, TasksCompletion, TransitionIndex, TreeDefinition,
};

/// Runtime status of one active state.
#[derive(Debug, Clone)]
pub struct ActiveState {
    pub state: StateIndex,
    pub completion: TasksCompletion,
    /// Completion forced from outside the task bits (no-task leaf, finished subtree).
    pub forced: RunStatus,
    /// Tasks that received `enter_state`, counted from the first.
    pub entered: usize,
}

impl ActiveState {
    pub fn new(tree: &TreeDefinition, state: StateIndex) -> Self {
        let completion = match tree.state(state) {
            Some(s) => {
                let count = s.tasks.iter().filter(|n| tree.node(*n).is_some_and(|n| n.as_task().is_some())).count();
                TasksCompletion::new(count, s.completion_mask, s.completion)
            }
            None => TasksCompletion::default(),
        };
        ActiveState {
            state,
            completion,
            forced: RunStatus::Unset,
            entered: 0,
        }
    }

    pub fn status(&self) -> RunStatus {
        if self.forced.is_completed() {
            return self.forced;
        }
        self.completion.status()
    }
}

pub struct ActiveFrame {
    pub tree: Arc<TreeDefinition>,
    pub frame_id: FrameId,
    /// First state of the frame: the tree root or a subtree state.
    pub root_state: StateIndex,
    /// Linking frame and state, `None` for the root frame.
    pub parent: Option<(FrameId, StateIndex)>,
    pub states: Vec<ActiveState>,
    pub storage: InstanceStorage,
    /// Runs the evaluators and global tasks of its tree.
    pub owns_globals: bool,
    pub globals_started: bool,
    pub globals_entered: usize,
    pub global_completion: TasksCompletion,
    /// Created while selecting and not yet part of the active path.
    pub tentative: bool,
}

impl ActiveFrame {
    pub fn new(
        tree: Arc<TreeDefinition>,
        frame_id: FrameId,
        root_state: StateIndex,
        parent: Option<(FrameId, StateIndex)>,
        storage: InstanceStorage,
        owns_globals: bool,
    ) -> Self {
        let global_count = tree
            .global_tasks()
            .iter()
            .filter(|n| tree.node(*n).is_some_and(|n| n.as_task().is_some()))
            .count();
        let global_completion = TasksCompletion::new(
            global_count,
            tree.global_completion_mask(),
            tree.settings().global_completion,
        );
        ActiveFrame {
            tree,
            frame_id,
            root_state,
            parent,
            states: Vec::new(),
            storage,
            owns_globals,
            globals_started: false,
            globals_entered: 0,
            global_completion,
            tentative: false,
        }
    }

    pub fn active_states(&self) -> Vec<StateIndex> {
        self.states.iter().map(|s| s.state).collect()
    }

    pub fn position_of(&self, state: StateIndex) -> Option<usize> {
        self.states.iter().position(|s| s.state == state)
    }

    pub fn is_active(&self, state: StateIndex) -> bool {
        self.position_of(state).is_some()
    }

    /// Combined status of the state at `depth` and everything below it in this frame.
    pub fn status_from(&self, depth: usize) -> RunStatus {
        self.states
            .iter()
            .skip(depth)
            .map(ActiveState::status)
            .filter(|s| s.is_completed())
            .fold(RunStatus::Running, RunStatus::merge)
    }

    /// Status of the whole frame: completed if any active state completed.
    pub fn status(&self) -> RunStatus {
        if self.states.is_empty() {
            return RunStatus::Unset;
        }
        self.status_from(0)
    }

    pub fn leaf(&self) -> Option<StateIndex> {
        self.states.last().map(|s| s.state)
    }
}

/// Position of a task among the tasks of its list, skipping property functions.
pub fn task_position(tree: &TreeDefinition, range: NodeRange, node: NodeIndex) -> Option<usize> {
    if !range.contains(node) {
        return None;
    }
    let tasks_before = (range.begin..node.0)
        .filter(|i| tree.node(NodeIndex(*i)).is_some_and(|n| n.as_task().is_some()))
        .count();
    Some(tasks_before)
}

/// Task nodes of a list with their task positions, skipping property functions.
pub fn task_nodes(tree: &TreeDefinition, range: NodeRange) -> Vec<(usize, NodeIndex)> {
    range
        .iter()
        .filter(|i| tree.node(*i).is_some_and(|n| n.as_task().is_some()))
        .enumerate()
        .collect()
}

/// Indices of the frames reachable from `slot` through parent links, `slot` first.
pub fn frame_chain(frames: &[ActiveFrame], slot: usize) -> Vec<usize> {
    let mut chain = Vec::new();
    let mut current = Some(slot);
    while let Some(index) = current {
        if chain.contains(&index) {
            break;
        }
        chain.push(index);
        current = frames
            .get(index)
            .and_then(|f| f.parent)
            .and_then(|(id, _)| frames.iter().position(|f| f.frame_id == id));
    }
    chain
}

/// A delayed transition waiting for its time to run out.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayedTransition {
    pub frame_id: FrameId,
    pub state: StateIndex,
    pub transition: TransitionIndex,
    pub remaining: f32,
}

/// Binding sources as seen from one frame.
///
/// Instance data and state parameters not found in the frame itself are
/// looked up along the parent chain, in frames running the same definition.
pub struct FrameView<'a> {
    pub frames: &'a [ActiveFrame],
    pub slot: usize,
    pub context: &'a ContextData,
    pub objects: &'a ObjectRegistry,
    pub shared: Option<&'a SharedInstancePool>,
}

impl FrameView<'_> {
    fn same_tree_chain(&self) -> impl Iterator<Item = &ActiveFrame> {
        let tree = self.frames.get(self.slot).map(|f| f.tree.id());
        frame_chain(self.frames, self.slot)
            .into_iter()
            .filter_map(|i| self.frames.get(i))
            .filter(move |f| Some(f.tree.id()) == tree)
    }
}

impl DataView for FrameView<'_> {
    fn view(&self, handle: DataHandle) -> Option<&StructValue> {
        let frame = self.frames.get(self.slot)?;
        match handle {
            DataHandle::Context(index) => {
                let descriptor = frame.tree.context_descriptors().get(index as usize)?;
                self.context.struct_view(&descriptor.name)
            }
            DataHandle::GlobalParameters => Some(frame.storage.parameters()),
            DataHandle::StateParameters(state) => self
                .same_tree_chain()
                .find_map(|f| f.storage.state_parameters(state)),
            DataHandle::Instance(index) => self
                .same_tree_chain()
                .find_map(|f| f.storage.is_active(index).then(|| f.storage.get(index)).flatten()),
            DataHandle::Shared(index) => self.shared.and_then(|pool| pool.get(index)),
        }
    }

    fn objects(&self) -> Option<&ObjectRegistry> {
        Some(self.objects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sylva_core::{CompletionPolicy, StateDesc, TreeBuilder};

    fn frame(tree: &Arc<TreeDefinition>, id: u32, parent: Option<(FrameId, StateIndex)>) -> ActiveFrame {
        ActiveFrame::new(tree.clone(), FrameId(id), StateIndex::ROOT, parent, tree.new_storage(None), parent.is_none())
    }

    #[test]
    fn test_frame_status_merges_from_depth() {
        let tree = Arc::new(TreeBuilder::new("t").state(StateDesc::new("Root").child(StateDesc::new("A"))).build().unwrap());
        let mut f = frame(&tree, 0, None);
        assert_eq!(f.status(), RunStatus::Unset);
        f.states.push(ActiveState::new(&tree, StateIndex(0)));
        f.states.push(ActiveState::new(&tree, StateIndex(1)));
        assert_eq!(f.status(), RunStatus::Running);
        f.states[1].forced = RunStatus::Succeeded;
        assert_eq!(f.status_from(0), RunStatus::Succeeded);
        assert_eq!(f.status_from(2), RunStatus::Running);
        assert_eq!(f.states[0].completion.policy(), CompletionPolicy::Any);
    }

    #[test]
    fn test_frame_chain_follows_parents() {
        let tree = Arc::new(TreeBuilder::new("t").state(StateDesc::new("Root")).build().unwrap());
        let frames = vec![
            frame(&tree, 0, None),
            frame(&tree, 5, Some((FrameId(0), StateIndex::ROOT))),
            frame(&tree, 9, Some((FrameId(5), StateIndex::ROOT))),
        ];
        assert_eq!(frame_chain(&frames, 2), [2, 1, 0]);
        assert_eq!(frame_chain(&frames, 0), [0]);
    }
}
