//! State selection: finding the new active path for a transition target.
//!
//! Selection never touches the committed path. Frames it needs for linked
//! states are appended as tentative frames and dropped again when the
//! selection fails or loses to another candidate.

use super::ExecutionContext;
use crate::frame::ActiveFrame;
use rand::Rng;
use rand::seq::SliceRandom;
use std::sync::Arc;
use sylva_core::{
    DefinitionId, FrameId, InstanceStorage, SelectionBehavior, SelectionError, SelectionFallback, StateIndex,
    StateKind, TransitionTarget, TransitionTrigger, TreeDefinition,
};

#[derive(Debug, Clone)]
pub(crate) struct SelectedFrame {
    /// Index into the execution's frame list.
    pub slot: usize,
    pub frame_id: FrameId,
    pub states: Vec<StateIndex>,
}

/// A candidate active path, root frame first.
#[derive(Debug, Clone, Default)]
pub(crate) struct Selection {
    pub frames: Vec<SelectedFrame>,
    /// Flat position of the selected state; entries from here on are re-entered.
    pub reselect_from: usize,
}

impl Selection {
    pub fn len(&self) -> usize {
        self.frames.iter().map(|f| f.states.len()).sum()
    }

    /// `(frame index, frame id, state)` for every entry, root first.
    pub fn entries(&self) -> Vec<(usize, FrameId, StateIndex)> {
        self.frames
            .iter()
            .enumerate()
            .flat_map(|(index, frame)| frame.states.iter().map(move |state| (index, frame.frame_id, *state)))
            .collect()
    }
}

type Visited = Vec<(DefinitionId, StateIndex)>;

impl ExecutionContext {
    /// Selects `target` as requested from `source_slot`.
    ///
    /// The target is looked up in the source frame and its parents; ancestors
    /// of the target that are already active are kept.
    pub(crate) fn select(
        &mut self,
        source_slot: usize,
        source_state: Option<StateIndex>,
        target: StateIndex,
        fallback: SelectionFallback,
    ) -> Result<Selection, SelectionError> {
        let mark = self.exec.frames.len();
        let result = self.select_inner(source_slot, target, fallback);
        match &result {
            Ok(_) => {}
            Err(error) => {
                self.exec.frames.truncate(mark);
                let state = self
                    .exec
                    .frames
                    .get(source_slot)
                    .map(|f| f.tree.state_name(target).to_string())
                    .unwrap_or_default();
                tracing::debug!(
                    from = ?source_state,
                    target = %state,
                    %error,
                    "selection failed"
                );
                self.trace.push(
                    self.exec.tick_count,
                    crate::trace::TraceEvent::SelectionFailed {
                        state,
                        reason: error.to_string(),
                    },
                );
            }
        }
        result
    }

    fn select_inner(
        &mut self,
        source_slot: usize,
        target: StateIndex,
        fallback: SelectionFallback,
    ) -> Result<Selection, SelectionError> {
        let slot = self.frame_containing(source_slot, target).ok_or_else(|| {
            let name = self
                .exec
                .frames
                .get(source_slot)
                .map(|f| f.tree.state_name(target).to_string())
                .unwrap_or_default();
            SelectionError::UnknownFrame(name)
        })?;
        let tree = self.exec.frames[slot].tree.clone();

        let mut selection = Selection::default();
        for frame in &self.exec.frames[..slot] {
            selection.frames.push(SelectedFrame {
                slot: selection.frames.len(),
                frame_id: frame.frame_id,
                states: frame.active_states(),
            });
        }

        let root = self.exec.frames[slot].root_state;
        let path = tree.path_to(target);
        let start = path.iter().position(|s| *s == root).unwrap_or(0);
        let ancestors = &path[start..path.len().saturating_sub(1)];
        for (depth, ancestor) in ancestors.iter().enumerate() {
            let active = self.exec.frames[slot].states.get(depth).map(|s| s.state) == Some(*ancestor);
            if !active && !self.ancestor_prerequisites_pass(slot, *ancestor) {
                return Err(SelectionError::NoSelectableState(tree.state_name(target).to_string()));
            }
        }
        selection.frames.push(SelectedFrame {
            slot,
            frame_id: self.exec.frames[slot].frame_id,
            states: ancestors.to_vec(),
        });
        selection.reselect_from = selection.len();

        let mut visited = Visited::new();
        let mut selected = self.select_state(&mut selection, target, &mut visited)?;
        if !selected && fallback == SelectionFallback::NextSelectableSibling {
            if let Some(parent) = tree.state(target).and_then(|s| s.parent) {
                let siblings: Vec<StateIndex> = tree.children(parent).skip_while(|s| *s != target).skip(1).collect();
                for sibling in siblings {
                    if self.select_state(&mut selection, sibling, &mut visited)? {
                        selected = true;
                        break;
                    }
                }
            }
        }
        if !selected {
            return Err(SelectionError::NoSelectableState(tree.state_name(target).to_string()));
        }
        Ok(selection)
    }

    /// Committed frame that runs `target`, searching from `source_slot` up
    /// through its parents.
    fn frame_containing(&self, source_slot: usize, target: StateIndex) -> Option<usize> {
        let source_tree = self.exec.frames.get(source_slot)?.tree.id();
        crate::frame::frame_chain(&self.exec.frames, source_slot)
            .into_iter()
            .find(|slot| {
                let frame = &self.exec.frames[*slot];
                frame.tree.id() == source_tree
                    && frame
                        .tree
                        .state(frame.root_state)
                        .is_some_and(|root| target >= frame.root_state && target.0 < root.subtree_end)
            })
    }

    fn ancestor_prerequisites_pass(&mut self, slot: usize, ancestor: StateIndex) -> bool {
        let tree = self.exec.frames[slot].tree.clone();
        let Some(state) = tree.state(ancestor) else {
            return false;
        };
        if !state.check_prerequisites_when_activating_child_directly {
            return true;
        }
        if !state.enabled {
            return false;
        }
        if state.required_event.as_ref().is_some_and(|e| !self.exec.events.contains(e)) {
            return false;
        }
        self.test_conditions(slot, Some(ancestor), state.enter_conditions)
    }

    /// Tries to select `state` below the last frame of `selection`.
    ///
    /// Returns `Ok(false)` if the state or everything below it is not
    /// selectable, leaving `selection` as it was.
    fn select_state(
        &mut self,
        selection: &mut Selection,
        state: StateIndex,
        visited: &mut Visited,
    ) -> Result<bool, SelectionError> {
        let Some(last) = selection.frames.last() else {
            return Ok(false);
        };
        let slot = last.slot;
        let depth = last.states.len();
        let tree = self.exec.frames[slot].tree.clone();
        let Some(compact) = tree.state(state) else {
            return Ok(false);
        };

        if depth >= self.config.selection.max_depth {
            return Err(SelectionError::DepthExceeded(self.config.selection.max_depth));
        }
        if !compact.enabled || compact.selection == SelectionBehavior::None {
            return Ok(false);
        }
        if let Some(required) = &compact.required_event {
            if !self.exec.events.contains(required) {
                return Ok(false);
            }
        }
        if !self.test_conditions(slot, Some(state), compact.enter_conditions) {
            return Ok(false);
        }

        if compact.selection == SelectionBehavior::TryFollowTransitions && !compact.kind.is_linked() {
            return self.select_by_following(selection, state, visited);
        }

        if let Some(frame) = selection.frames.last_mut() {
            frame.states.push(state);
        }
        let selected = match compact.kind {
            StateKind::Linked => self.select_linked(selection, &tree, state, visited)?,
            StateKind::LinkedAsset => self.select_linked_asset(selection, &tree, state, visited)?,
            _ => self.select_children(selection, &tree, state, visited)?,
        };
        if !selected {
            if let Some(frame) = selection.frames.last_mut() {
                frame.states.truncate(depth);
            }
        }
        Ok(selected)
    }

    fn select_children(
        &mut self,
        selection: &mut Selection,
        tree: &Arc<TreeDefinition>,
        state: StateIndex,
        visited: &mut Visited,
    ) -> Result<bool, SelectionError> {
        let Some(compact) = tree.state(state) else {
            return Ok(false);
        };
        if compact.selection == SelectionBehavior::TryEnterState || !compact.has_children(state) {
            return Ok(true);
        }
        let slot = selection.frames.last().map_or(0, |f| f.slot);
        for child in self.ordered_children(slot, tree, state, compact.selection) {
            if self.select_state(selection, child, visited)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn ordered_children(
        &mut self,
        slot: usize,
        tree: &Arc<TreeDefinition>,
        state: StateIndex,
        behavior: SelectionBehavior,
    ) -> Vec<StateIndex> {
        let mut children: Vec<StateIndex> = tree.children(state).collect();
        match behavior {
            SelectionBehavior::TrySelectChildrenAtRandom => {
                children.shuffle(&mut self.rng);
                children
            }
            SelectionBehavior::TrySelectChildrenWithHighestUtility => {
                let mut scored = self.utilities(slot, tree, &children);
                scored.sort_by(|a, b| b.1.total_cmp(&a.1));
                scored.into_iter().map(|(state, _)| state).collect()
            }
            SelectionBehavior::TrySelectChildrenAtRandomWeightedByUtility => {
                let mut remaining = self.utilities(slot, tree, &children);
                let mut ordered = Vec::with_capacity(remaining.len());
                while !remaining.is_empty() {
                    let total: f32 = remaining.iter().map(|(_, u)| u.max(0.0)).sum();
                    if total <= 0.0 {
                        ordered.extend(remaining.drain(..).map(|(state, _)| state));
                        break;
                    }
                    let mut pick = self.rng.r#gen::<f32>() * total;
                    let mut chosen = remaining.len() - 1;
                    for (index, (_, utility)) in remaining.iter().enumerate() {
                        let utility = utility.max(0.0);
                        if pick < utility {
                            chosen = index;
                            break;
                        }
                        pick -= utility;
                    }
                    ordered.push(remaining.remove(chosen).0);
                }
                ordered
            }
            _ => children,
        }
    }

    /// `weight × score` for each candidate, in input order.
    fn utilities(&mut self, slot: usize, tree: &Arc<TreeDefinition>, states: &[StateIndex]) -> Vec<(StateIndex, f32)> {
        states
            .iter()
            .map(|state| {
                let (weight, considerations) = tree
                    .state(*state)
                    .map_or((0.0, Default::default()), |s| (s.weight, s.considerations));
                let utility = weight * self.score_considerations(slot, *state, considerations);
                tracing::trace!(state = tree.state_name(*state), utility, "utility");
                (*state, utility)
            })
            .collect()
    }

    /// Evaluates the transitions of `state` as if it were active and selects
    /// the first target that can be selected. `state` itself is not kept.
    fn select_by_following(
        &mut self,
        selection: &mut Selection,
        state: StateIndex,
        visited: &mut Visited,
    ) -> Result<bool, SelectionError> {
        let Some(last) = selection.frames.last() else {
            return Ok(false);
        };
        let slot = last.slot;
        let tree = self.exec.frames[slot].tree.clone();
        let key = (tree.id(), state);
        if visited.contains(&key) {
            let path: Vec<&str> = visited.iter().map(|(_, s)| tree.state_name(*s)).collect();
            tracing::error!(state = tree.state_name(state), "loop detected while following transitions");
            return Err(SelectionError::LoopDetected {
                state: tree.state_name(state).to_string(),
                visited: path.join(" -> "),
            });
        }
        visited.push(key);

        let Some(compact) = tree.state(state) else {
            return Ok(false);
        };
        let mut candidates: Vec<_> = compact
            .transition_indices()
            .filter_map(|index| tree.transition(index))
            .filter(|t| {
                t.enabled
                    && match t.trigger {
                        TransitionTrigger::OnTick => true,
                        TransitionTrigger::OnEvent => {
                            t.required_event.as_ref().is_some_and(|e| self.exec.events.contains(e))
                        }
                        TransitionTrigger::OnDelegate(delegate) => self.exec.was_broadcast(tree.id(), delegate),
                        _ => false,
                    }
            })
            .collect();
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority));

        let root = self.exec.frames[slot].root_state;
        for transition in candidates {
            let TransitionTarget::State(target) = transition.target else {
                continue;
            };
            if !self.test_conditions(slot, Some(state), transition.conditions) {
                continue;
            }
            let path = tree.path_to(target);
            let Some(start) = path.iter().position(|s| *s == root) else {
                continue;
            };
            let index = selection.frames.len() - 1;
            let saved_states = selection.frames[index].states.clone();
            let saved_from = selection.reselect_from;
            selection.frames[index].states = path[start..path.len() - 1].to_vec();
            selection.reselect_from = saved_from.min(selection.len());
            if self.select_state(selection, target, visited)? {
                return Ok(true);
            }
            selection.frames[index].states = saved_states;
            selection.reselect_from = saved_from;
        }
        Ok(false)
    }

    fn select_linked(
        &mut self,
        selection: &mut Selection,
        tree: &Arc<TreeDefinition>,
        state: StateIndex,
        visited: &mut Visited,
    ) -> Result<bool, SelectionError> {
        let Some(root) = tree.state(state).and_then(|s| s.linked_state) else {
            tracing::error!(state = tree.state_name(state), "linked state has no subtree");
            return Ok(false);
        };
        let recursive = selection.frames.iter().any(|f| {
            let frame = &self.exec.frames[f.slot];
            frame.tree.id() == tree.id() && frame.root_state == root
        });
        if recursive {
            return Ok(self.reject_recursion(tree.name(), tree.state_name(state)));
        }
        let parent_slot = selection.frames.last().map_or(0, |f| f.slot);
        let subtree = tree.clone();
        self.select_in_linked_frame(selection, tree.clone(), root, state, false, visited, move |exec| {
            let parent = &exec.frames[parent_slot].storage;
            let mut storage = subtree.new_storage(Some(parent.parameters().clone()));
            seed_subtree_parameters(parent, state, &mut storage, root);
            storage
        })
    }

    fn select_linked_asset(
        &mut self,
        selection: &mut Selection,
        tree: &Arc<TreeDefinition>,
        state: StateIndex,
        visited: &mut Visited,
    ) -> Result<bool, SelectionError> {
        let Some(asset_id) = tree.state(state).and_then(|s| s.linked_asset) else {
            tracing::error!(state = tree.state_name(state), "linked asset state has no asset");
            return Ok(false);
        };
        let asset = if asset_id == self.tree.id() {
            Some(self.tree.clone())
        } else {
            self.library.get(asset_id).cloned()
        };
        let Some(asset) = asset else {
            let error = SelectionError::MissingLinkedAsset(asset_id.to_string());
            tracing::error!(state = tree.state_name(state), %error, "cannot select linked asset");
            self.trace_selection_failure(tree.state_name(state), &error);
            return Ok(false);
        };
        let recursive = selection
            .frames
            .iter()
            .any(|f| self.exec.frames[f.slot].tree.id() == asset.id());
        if recursive {
            return Ok(self.reject_recursion(asset.name(), tree.state_name(state)));
        }
        if let Err(error) = self.context.validate(asset.context_descriptors()) {
            tracing::error!(asset = %asset.name(), %error, "linked asset cannot run with this context");
            return Ok(false);
        }
        let parent_slot = selection.frames.last().map_or(0, |f| f.slot);
        let linked = asset.clone();
        self.select_in_linked_frame(selection, asset, sylva_core::StateIndex::ROOT, state, true, visited, move |exec| {
            let parameters = exec.frames[parent_slot].storage.state_parameters(state).cloned();
            linked.new_storage(parameters)
        })
    }

    fn reject_recursion(&mut self, tree: &str, state: &str) -> bool {
        let error = SelectionError::RecursiveLinkedAsset {
            tree: tree.to_string(),
            state: state.to_string(),
        };
        tracing::error!(%error, "linked state rejected");
        self.trace_selection_failure(state, &error);
        false
    }

    fn trace_selection_failure(&mut self, state: &str, error: &SelectionError) {
        self.trace.push(
            self.exec.tick_count,
            crate::trace::TraceEvent::SelectionFailed {
                state: state.to_string(),
                reason: error.to_string(),
            },
        );
    }

    /// Selects `root` in the frame run by the linked state `linked`.
    ///
    /// The committed frame at the same stack position is reused when it runs
    /// the same subtree for the same linked state; otherwise a tentative frame
    /// is created with `make_storage`.
    #[allow(clippy::too_many_arguments)]
    fn select_in_linked_frame(
        &mut self,
        selection: &mut Selection,
        tree: Arc<TreeDefinition>,
        root: StateIndex,
        linked: StateIndex,
        owns_globals: bool,
        visited: &mut Visited,
        make_storage: impl FnOnce(&super::ExecutionState) -> InstanceStorage,
    ) -> Result<bool, SelectionError> {
        let Some(parent_id) = selection.frames.last().map(|f| f.frame_id) else {
            return Ok(false);
        };
        let position = selection.frames.len();
        let mark = self.exec.frames.len();
        let reusable = position < self.exec.committed()
            && self.exec.frames.get(position).is_some_and(|f| {
                f.tree.id() == tree.id() && f.root_state == root && f.parent == Some((parent_id, linked))
            });

        let (slot, frame_id) = if reusable {
            (position, self.exec.frames[position].frame_id)
        } else {
            let storage = make_storage(&self.exec);
            let frame_id = self.exec.allocate_frame_id();
            let mut frame = ActiveFrame::new(tree, frame_id, root, Some((parent_id, linked)), storage, owns_globals);
            frame.tentative = true;
            self.exec.frames.push(frame);
            (self.exec.frames.len() - 1, frame_id)
        };

        selection.frames.push(SelectedFrame {
            slot,
            frame_id,
            states: Vec::new(),
        });
        let selected = self.select_state(selection, root, visited)?;
        if !selected {
            selection.frames.pop();
            self.exec.frames.truncate(mark);
        }
        Ok(selected)
    }
}

/// Copies the parameters of a linked state into the subtree root it runs.
pub(crate) fn seed_subtree_parameters(
    parent: &InstanceStorage,
    linked: StateIndex,
    storage: &mut InstanceStorage,
    root: StateIndex,
) {
    let (Some(source), Some(target)) = (parent.state_parameters(linked), storage.state_parameters_mut(root)) else {
        return;
    };
    if source.type_name() == target.type_name() {
        *target = source.clone();
    } else {
        tracing::warn!(
            expected = target.type_name(),
            found = source.type_name(),
            "linked state parameters do not match the subtree"
        );
    }
}
