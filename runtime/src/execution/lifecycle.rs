//! Entering, ticking and exiting states and global nodes.

use super::select::{Selection, seed_subtree_parameters};
use super::transitions::TransitionSource;
use super::{ExecutionContext, Phase};
use crate::frame::{ActiveState, task_nodes};
use crate::trace::TraceEvent;
use sylva_core::{ChangeType, FrameId, InstanceHandle, NodeIndex, RunStatus, StateIndex, StateKind, TaskStatus};

impl ExecutionContext {
    /// Makes `selection` the active path.
    ///
    /// States below the first difference are exited leaf to root, then the new
    /// states are entered root to leaf. A reselected state is exited and entered
    /// as `Sustained`; everything else as `Changed`.
    pub(crate) fn commit(&mut self, selection: Selection, source: &TransitionSource) {
        let committed = self.exec.committed();
        let old: Vec<(usize, FrameId, StateIndex)> = self.exec.frames[..committed]
            .iter()
            .enumerate()
            .flat_map(|(slot, frame)| frame.states.iter().map(move |s| (slot, frame.frame_id, s.state)))
            .collect();
        let new = selection.entries();
        let common = old
            .iter()
            .zip(&new)
            .take_while(|(a, b)| a.1 == b.1 && a.2 == b.2)
            .count();
        let changed_from = common.min(selection.reselect_from);

        for (i, (slot, _, state)) in old.iter().enumerate().skip(changed_from).rev() {
            let change = if i < common { ChangeType::Sustained } else { ChangeType::Changed };
            self.exit_state(*slot, *state, change, source);
        }

        let kept: Vec<FrameId> = selection.frames.iter().map(|f| f.frame_id).collect();
        for slot in (0..committed).rev() {
            let frame_id = self.exec.frames[slot].frame_id;
            if !kept.contains(&frame_id) {
                self.stop_globals(slot, source);
                self.release_frame(frame_id);
            }
        }

        let mut pool: Vec<Option<_>> = std::mem::take(&mut self.exec.frames).into_iter().map(Some).collect();
        let mut frames = Vec::with_capacity(selection.frames.len());
        let mut flat = 0;
        for selected in &selection.frames {
            let Some(mut frame) = pool.get_mut(selected.slot).and_then(Option::take) else {
                tracing::error!(frame = %selected.frame_id, "selected frame is missing");
                break;
            };
            frame.tentative = false;
            frame.states.truncate(selected.states.len().min(changed_from.saturating_sub(flat)));
            flat += selected.states.len();
            frames.push(frame);
        }
        self.exec.frames = frames;

        for (i, (index, _, state)) in new.iter().enumerate().skip(changed_from) {
            if *index >= self.exec.frames.len() {
                break;
            }
            let change = if i < common { ChangeType::Sustained } else { ChangeType::Changed };
            if self.exec.frames[*index].states.is_empty() {
                self.prepare_frame(*index);
            }
            if !self.enter_state(*index, *state, change, source) {
                self.exec.frames.truncate(index + 1);
                break;
            }
        }
    }

    /// Refreshes the parameters a linked frame receives and starts its globals.
    fn prepare_frame(&mut self, slot: usize) {
        if slot > 0 {
            if let Some((_, linked)) = self.exec.frames[slot].parent {
                let (parents, rest) = self.exec.frames.split_at_mut(slot);
                let parent = &parents[slot - 1];
                let frame = &mut rest[0];
                let kind = parent.tree.state(linked).map(|s| s.kind);
                match kind {
                    Some(StateKind::LinkedAsset) => {
                        if let Some(parameters) = parent.storage.state_parameters(linked) {
                            if parameters.type_name() == frame.storage.parameters().type_name() {
                                *frame.storage.parameters_mut() = parameters.clone();
                            }
                        }
                    }
                    _ => {
                        *frame.storage.parameters_mut() = parent.storage.parameters().clone();
                        seed_subtree_parameters(&parent.storage, linked, &mut frame.storage, frame.root_state);
                    }
                }
            }
        }
        let frame = &self.exec.frames[slot];
        if frame.owns_globals && !frame.globals_started {
            self.start_globals(slot);
        }
    }

    /// Enters one state. Returns false if a task failed to enter, in which
    /// case nothing below it is entered.
    fn enter_state(&mut self, slot: usize, state: StateIndex, change: ChangeType, source: &TransitionSource) -> bool {
        let tree = self.exec.frames[slot].tree.clone();
        let Some(compact) = tree.state(state) else {
            return false;
        };
        if let Some(batch) = compact.parameter_bindings {
            self.copy_state_parameters(slot, state, batch);
        }
        let frame_id = self.exec.frames[slot].frame_id;
        self.exec.frames[slot].states.push(ActiveState::new(&tree, state));
        let depth = self.exec.frames[slot].states.len() - 1;

        tracing::debug!(%frame_id, state = %compact.name, ?change, "enter state");
        self.trace.push(
            self.exec.tick_count,
            TraceEvent::EnterState {
                frame_id,
                state: compact.name.clone(),
                change,
            },
        );

        let info = source.info(change, RunStatus::Running);
        for (position, node_index) in task_nodes(&tree, compact.tasks) {
            let Some(node) = tree.node(node_index) else {
                continue;
            };
            let skip = !node.enabled
                || (change == ChangeType::Sustained && !node.task_flags().should_state_change_on_reselect);
            if skip {
                self.exec.frames[slot].states[depth].entered = position + 1;
                continue;
            }
            if let Some(InstanceHandle::Default(index)) = node.instance {
                if !self.exec.frames[slot].storage.activate(index) {
                    tracing::error!(task = %node.name, state = %compact.name, "task instance data is already active");
                    self.exec.frames[slot].states[depth]
                        .completion
                        .set(position, TaskStatus::Failed);
                    return false;
                }
            }
            self.copy_bindings(slot, node_index);
            let status = self
                .call_node(slot, Some(state), node_index, |node, ctx| {
                    node.as_task().map_or(RunStatus::Running, |task| task.enter_state(ctx, &info))
                })
                .unwrap_or(RunStatus::Failed);

            let active = &mut self.exec.frames[slot].states[depth];
            active.entered = position + 1;
            if status.is_completed() {
                active.completion.set(position, status.into());
            }
            if status == RunStatus::Failed {
                tracing::debug!(task = %node.name, state = %compact.name, "task failed to enter");
                return false;
            }
        }
        true
    }

    fn exit_state(&mut self, slot: usize, state: StateIndex, change: ChangeType, source: &TransitionSource) {
        let tree = self.exec.frames[slot].tree.clone();
        let frame_id = self.exec.frames[slot].frame_id;
        let (Some(compact), Some(depth)) = (tree.state(state), self.exec.frames[slot].position_of(state)) else {
            return;
        };
        let active = &self.exec.frames[slot].states[depth];
        let status = active.status();
        let entered = active.entered;

        tracing::debug!(%frame_id, state = %compact.name, ?change, "exit state");
        self.trace.push(
            self.exec.tick_count,
            TraceEvent::ExitState {
                frame_id,
                state: compact.name.clone(),
                change,
            },
        );

        let reported = source
            .run_status
            .unwrap_or(if status.is_completed() { status } else { RunStatus::Running });
        let info = source.info(change, reported);
        for (position, node_index) in task_nodes(&tree, compact.tasks).into_iter().rev() {
            let Some(node) = tree.node(node_index) else {
                continue;
            };
            if position >= entered || !node.enabled {
                continue;
            }
            let flags = node.task_flags();
            if change == ChangeType::Sustained && !flags.should_state_change_on_reselect {
                continue;
            }
            if flags.should_copy_bound_properties_on_exit {
                self.copy_bindings(slot, node_index);
            }
            self.call_node(slot, Some(state), node_index, |node, ctx| {
                if let Some(task) = node.as_task() {
                    task.exit_state(ctx, &info);
                }
            });
            if let Some(InstanceHandle::Default(index)) = node.instance {
                self.exec.frames[slot].storage.deactivate(index);
            }
        }

        if change == ChangeType::Changed {
            self.exec
                .delegates
                .remove_where(|owner| owner.frame_id == frame_id && owner.state == Some(state));
            self.exec
                .delayed
                .retain(|d| !(d.frame_id == frame_id && d.state == state));
        }
    }

    /// Drops listeners and delayed transitions of a frame leaving the path.
    fn release_frame(&mut self, frame_id: FrameId) {
        self.exec.delegates.remove_where(|owner| owner.frame_id == frame_id);
        self.exec.delayed.retain(|d| d.frame_id != frame_id);
    }

    /// Starts evaluators, then enters global tasks.
    pub(crate) fn start_globals(&mut self, slot: usize) {
        let frame = &mut self.exec.frames[slot];
        frame.globals_started = true;
        if !frame.owns_globals {
            return;
        }
        let tree = frame.tree.clone();

        for node_index in tree.evaluators().iter() {
            let Some(node) = tree.node(node_index).filter(|n| n.enabled && n.as_evaluator().is_some()) else {
                continue;
            };
            if let Some(InstanceHandle::Default(index)) = node.instance {
                self.exec.frames[slot].storage.activate(index);
            }
            self.copy_bindings(slot, node_index);
            self.call_node(slot, None, node_index, |node, ctx| {
                if let Some(evaluator) = node.as_evaluator() {
                    evaluator.tree_start(ctx);
                }
            });
        }

        let info = TransitionSource::initial().info(ChangeType::Changed, RunStatus::Running);
        for (position, node_index) in task_nodes(&tree, tree.global_tasks()) {
            let Some(node) = tree.node(node_index) else {
                continue;
            };
            if !node.enabled {
                self.exec.frames[slot].globals_entered = position + 1;
                continue;
            }
            if let Some(InstanceHandle::Default(index)) = node.instance {
                self.exec.frames[slot].storage.activate(index);
            }
            self.copy_bindings(slot, node_index);
            let status = self
                .call_node(slot, None, node_index, |node, ctx| {
                    node.as_task().map_or(RunStatus::Running, |task| task.enter_state(ctx, &info))
                })
                .unwrap_or(RunStatus::Failed);
            let frame = &mut self.exec.frames[slot];
            frame.globals_entered = position + 1;
            if status.is_completed() {
                frame.global_completion.set(position, status.into());
            }
            if status == RunStatus::Failed {
                tracing::warn!(task = %node.name, "global task failed to enter");
                break;
            }
        }
    }

    /// Exits global tasks in reverse, then stops evaluators.
    fn stop_globals(&mut self, slot: usize, source: &TransitionSource) {
        let frame = &self.exec.frames[slot];
        if !frame.owns_globals || !frame.globals_started {
            return;
        }
        let tree = frame.tree.clone();
        let entered = frame.globals_entered;
        let status = source.run_status.unwrap_or(frame.global_completion.status());
        let info = source.info(ChangeType::Changed, status);

        for (position, node_index) in task_nodes(&tree, tree.global_tasks()).into_iter().rev() {
            let Some(node) = tree.node(node_index).filter(|n| n.enabled) else {
                continue;
            };
            if position >= entered {
                continue;
            }
            if node.task_flags().should_copy_bound_properties_on_exit {
                self.copy_bindings(slot, node_index);
            }
            self.call_node(slot, None, node_index, |node, ctx| {
                if let Some(task) = node.as_task() {
                    task.exit_state(ctx, &info);
                }
            });
            if let Some(InstanceHandle::Default(index)) = node.instance {
                self.exec.frames[slot].storage.deactivate(index);
            }
        }

        for node_index in tree.evaluators().iter().rev() {
            let Some(node) = tree.node(node_index).filter(|n| n.enabled && n.as_evaluator().is_some()) else {
                continue;
            };
            self.call_node(slot, None, node_index, |node, ctx| {
                if let Some(evaluator) = node.as_evaluator() {
                    evaluator.tree_stop(ctx);
                }
            });
            if let Some(InstanceHandle::Default(index)) = node.instance {
                self.exec.frames[slot].storage.deactivate(index);
            }
        }

        let frame = &mut self.exec.frames[slot];
        frame.globals_started = false;
        frame.globals_entered = 0;
    }

    /// Ticks evaluators, global tasks and the active states in the configured order.
    pub(crate) fn tick_update_tasks(&mut self, delta_time: f32) {
        let schedule = self.config.schedule;
        let count = self.exec.committed();

        if schedule.global_tasks_first && !schedule.tick_global_tasks_with_hierarchy {
            for slot in 0..count {
                self.tick_globals(slot, delta_time);
            }
        }

        let root_globals_done = self.exec.frames.first().is_some_and(|f| f.global_completion.is_completed());
        let mut ticking = !root_globals_done;
        for slot in 0..count {
            if schedule.tick_global_tasks_with_hierarchy {
                self.tick_globals(slot, delta_time);
            }
            if ticking {
                self.tick_frame_states(slot, delta_time, &mut ticking);
            }
        }

        if !schedule.global_tasks_first && !schedule.tick_global_tasks_with_hierarchy {
            for slot in 0..count {
                self.tick_globals(slot, delta_time);
            }
        }

        self.handle_global_completion();
        let previous = self.exec.last_tick_status;
        self.exec.last_tick_status = self.exec.aggregate_status();
        // Only on the Running -> completed edge; a held completed state is not notified again.
        if previous == RunStatus::Running && self.exec.last_tick_status.is_completed() {
            self.notify_state_completed();
        }
    }

    fn tick_globals(&mut self, slot: usize, delta_time: f32) {
        let frame = &self.exec.frames[slot];
        if !frame.owns_globals || !frame.globals_started {
            return;
        }
        let tree = frame.tree.clone();
        let frame_id = frame.frame_id;
        let entered = frame.globals_entered;

        for node_index in tree.evaluators().iter() {
            if !tree.node(node_index).is_some_and(|n| n.enabled && n.as_evaluator().is_some()) {
                continue;
            }
            self.copy_bindings(slot, node_index);
            self.call_node(slot, None, node_index, |node, ctx| {
                if let Some(evaluator) = node.as_evaluator() {
                    evaluator.tick(ctx, delta_time);
                }
            });
        }

        for (position, node_index) in task_nodes(&tree, tree.global_tasks()) {
            let Some(node) = tree.node(node_index).filter(|n| n.enabled) else {
                continue;
            };
            let flags = node.task_flags();
            if position >= entered || !flags.should_call_tick {
                continue;
            }
            if flags.should_copy_bound_properties_on_tick {
                self.copy_bindings(slot, node_index);
            }
            let status = self.tick_task(slot, None, node_index, delta_time);
            self.trace.push(
                self.exec.tick_count,
                TraceEvent::TaskTick {
                    frame_id,
                    task: node.name.clone(),
                    status,
                },
            );
            self.exec.frames[slot]
                .global_completion
                .set_with_priority(position, status.into());
        }
    }

    /// Ticks the tasks of one frame root to leaf. Ticking stops for good once
    /// a state completes.
    fn tick_frame_states(&mut self, slot: usize, delta_time: f32, ticking: &mut bool) {
        let tree = self.exec.frames[slot].tree.clone();
        let frame_id = self.exec.frames[slot].frame_id;
        let last_frame = slot + 1 == self.exec.committed();

        for depth in 0..self.exec.frames[slot].states.len() {
            let active = &self.exec.frames[slot].states[depth];
            if active.status().is_completed() {
                *ticking = false;
                return;
            }
            let state = active.state;
            let entered = active.entered;
            let Some(compact) = tree.state(state) else {
                continue;
            };

            let mut has_tasks = false;
            for (position, node_index) in task_nodes(&tree, compact.tasks) {
                let Some(node) = tree.node(node_index).filter(|n| n.enabled) else {
                    continue;
                };
                has_tasks = true;
                let flags = node.task_flags();
                if position >= entered || !flags.should_call_tick {
                    continue;
                }
                if flags.should_copy_bound_properties_on_tick {
                    self.copy_bindings(slot, node_index);
                }
                let status = self.tick_task(slot, Some(state), node_index, delta_time);
                self.trace.push(
                    self.exec.tick_count,
                    TraceEvent::TaskTick {
                        frame_id,
                        task: node.name.clone(),
                        status,
                    },
                );
                let active = &mut self.exec.frames[slot].states[depth];
                active.completion.set_with_priority(position, status.into());
                if active.status().is_completed() {
                    *ticking = false;
                    return;
                }
            }

            let is_leaf = last_frame && depth + 1 == self.exec.frames[slot].states.len();
            if !has_tasks && is_leaf && !compact.kind.is_linked() {
                tracing::trace!(state = %compact.name, "leaf without tasks succeeds");
                self.exec.frames[slot].states[depth].forced = RunStatus::Succeeded;
                *ticking = false;
                return;
            }
        }
    }

    fn tick_task(&mut self, slot: usize, state: Option<StateIndex>, node: NodeIndex, delta_time: f32) -> RunStatus {
        self.call_node(slot, state, node, |node, ctx| {
            node.as_task().map_or(RunStatus::Running, |task| task.tick(ctx, delta_time))
        })
        .unwrap_or(RunStatus::Failed)
    }

    /// Completed global tasks stop the tree from the root frame and complete
    /// the linking state from a linked asset frame.
    fn handle_global_completion(&mut self) {
        for slot in 0..self.exec.committed() {
            let frame = &self.exec.frames[slot];
            if !frame.owns_globals || !frame.globals_started {
                continue;
            }
            let status = frame.global_completion.status();
            let parent = frame.parent;
            if !status.is_completed() {
                continue;
            }
            match parent {
                None => {
                    tracing::debug!(%status, "global tasks completed");
                    self.exec.request_stop(status);
                }
                Some((parent_id, linked)) => {
                    let Some(parent_slot) = self.exec.slot_of(parent_id) else {
                        continue;
                    };
                    let parent = &mut self.exec.frames[parent_slot];
                    if let Some(depth) = parent.position_of(linked) {
                        if !parent.states[depth].forced.is_completed() {
                            parent.states[depth].forced = status;
                        }
                    }
                }
            }
        }
    }

    /// Calls `state_completed` on every entered task, deepest frame and state
    /// first, with the combined status of the active path.
    pub(crate) fn notify_state_completed(&mut self) {
        let status = self.exec.last_tick_status;
        for slot in (0..self.exec.committed()).rev() {
            let tree = self.exec.frames[slot].tree.clone();
            let frame_id = self.exec.frames[slot].frame_id;
            let active = self.exec.frames[slot].active_states();
            for (depth, state) in active.iter().enumerate().rev() {
                let Some(compact) = tree.state(*state) else {
                    continue;
                };
                let Some(entered) = self.exec.frames[slot].states.get(depth).map(|s| s.entered) else {
                    continue;
                };
                self.trace.push(
                    self.exec.tick_count,
                    TraceEvent::StateCompleted {
                        frame_id,
                        state: compact.name.clone(),
                        status,
                    },
                );
                for (position, node_index) in task_nodes(&tree, compact.tasks).into_iter().rev() {
                    if position >= entered || !tree.node(node_index).is_some_and(|n| n.enabled) {
                        continue;
                    }
                    self.call_node(slot, Some(*state), node_index, |node, ctx| {
                        if let Some(task) = node.as_task() {
                            task.state_completed(ctx, status, &active);
                        }
                    });
                }
            }
        }
    }

    /// Exits everything and clears the run. Nodes cannot request another stop
    /// while this runs.
    pub(crate) fn stop_internal(&mut self, status: RunStatus) {
        self.exec.phase = Phase::Stopping;
        self.exec.discard_tentative();
        let source = TransitionSource::stopping(status);
        let count = self.exec.frames.len();
        let globals_first = self.config.schedule.global_tasks_first;

        if !globals_first {
            for slot in (0..count).rev() {
                self.stop_globals(slot, &source);
            }
        }
        for slot in (0..count).rev() {
            for state in self.exec.frames[slot].active_states().into_iter().rev() {
                self.exit_state(slot, state, ChangeType::Changed, &source);
            }
        }
        if globals_first {
            for slot in (0..count).rev() {
                self.stop_globals(slot, &source);
            }
        }

        self.exec.frames.clear();
        self.exec.delayed.clear();
        self.exec.delegates.clear();
        self.exec.requests.clear();
        self.exec.events.clear();
        self.exec.pending_stop = None;
        self.exec.status = status;
        self.exec.last_tick_status = status;
        self.exec.phase = Phase::Idle;
        tracing::info!(tree = %self.tree.name(), %status, "tree stopped");
        self.trace.push(self.exec.tick_count, TraceEvent::TreeStopped { status });
    }
}
