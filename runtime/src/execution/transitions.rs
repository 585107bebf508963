//! Transition resolution.
//!
//! One pass collects candidates from task requests, then from the transitions
//! of the active states (deepest frame and state first), then falls back to
//! completion transitions. A candidate only replaces the current best if its
//! priority is strictly higher, so the first candidate wins ties.

use super::ExecutionContext;
use super::select::Selection;
use crate::frame::{DelayedTransition, task_nodes};
use crate::trace::TraceEvent;
use rand::Rng;
use sylva_core::{
    ChangeType, NodeIndex, Priority, RunStatus, SelectionFallback, StateIndex, TransitionInfo, TransitionTarget,
    TransitionTrigger, TreeDefinition,
};

/// What caused a change of the active path, reported to entered and exited tasks.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TransitionSource {
    pub source_state: Option<StateIndex>,
    pub target_state: Option<StateIndex>,
    pub priority: Option<Priority>,
    /// Reported to exited tasks instead of their state's status.
    pub run_status: Option<RunStatus>,
}

impl TransitionSource {
    pub fn initial() -> Self {
        Self::default()
    }

    pub fn stopping(status: RunStatus) -> Self {
        TransitionSource {
            run_status: Some(status),
            ..Self::default()
        }
    }

    pub fn info(&self, change: ChangeType, current_run_status: RunStatus) -> TransitionInfo {
        TransitionInfo {
            change,
            current_run_status,
            source_state: self.source_state,
            target_state: self.target_state,
            priority: self.priority,
        }
    }
}

struct Candidate {
    slot: usize,
    source_state: Option<StateIndex>,
    target: TransitionTarget,
    priority: Priority,
    selection: Option<Selection>,
    /// Completion handling of a subtree frame does not apply.
    forced: bool,
}

pub(crate) enum Resolution {
    Select(Selection, TransitionSource),
    Stop(RunStatus),
}

impl ExecutionContext {
    /// Resolves and applies transitions until the tree is running again or
    /// the iteration limit is reached.
    pub(crate) fn tick_trigger_transitions(&mut self) {
        let mut from_frame = None;
        for iteration in 0..self.config.transitions.max_iterations {
            match self.trigger_transitions(&mut from_frame) {
                Some(Resolution::Select(selection, source)) => {
                    from_frame = None;
                    self.commit(selection, &source);
                    self.exec.last_tick_status = self.exec.aggregate_status();
                    if self.exec.last_tick_status.is_completed() {
                        self.notify_state_completed();
                    }
                }
                Some(Resolution::Stop(status)) => {
                    tracing::debug!(%status, iteration, "transition completes the tree");
                    self.exec.request_stop(status);
                    break;
                }
                None => {}
            }
            if self.exec.last_tick_status == RunStatus::Running || self.exec.pending_stop.is_some() {
                break;
            }
        }
        self.exec.broadcasted.clear();
        self.exec.discard_tentative();
    }

    /// One resolution pass. `from_frame` limits the frames considered after a
    /// subtree frame completed into its parent.
    fn trigger_transitions(&mut self, from_frame: &mut Option<usize>) -> Option<Resolution> {
        let committed = self.exec.committed();
        let limit = from_frame.map_or(committed, |f| f + 1).min(committed);
        let event_count = self.exec.events.len();
        let mut best: Option<Candidate> = None;

        self.call_transition_tasks(limit);

        let requests = std::mem::take(&mut self.exec.requests);
        for request in requests {
            let Some(slot) = self.exec.slot_of(request.frame_id).filter(|s| *s < limit) else {
                continue;
            };
            self.try_request(
                &mut best,
                slot,
                request.source_state,
                request.target,
                request.priority,
                request.fallback,
            );
        }

        for slot in (0..limit).rev() {
            let states = self.exec.frames[slot].active_states();
            for state in states.into_iter().rev() {
                self.trigger_state_transitions(&mut best, slot, state);
            }
        }

        self.exec.events.retire(event_count);

        if best.is_none() {
            self.trigger_completion_transitions(&mut best, limit);
        }

        let best = best?;
        match best.target {
            TransitionTarget::None => {
                tracing::trace!("transition to none masks lower priorities");
                None
            }
            TransitionTarget::State(target) => {
                let selection = best.selection?;
                let frame = &self.exec.frames[best.slot];
                let source = best.source_state.map(|s| frame.tree.state_name(s).to_string());
                let target_name = frame.tree.state_name(target).to_string();
                tracing::debug!(
                    frame = %frame.frame_id,
                    from = ?source,
                    to = %target_name,
                    priority = ?best.priority,
                    "transition triggered"
                );
                self.trace.push(
                    self.exec.tick_count,
                    TraceEvent::TransitionTriggered {
                        frame_id: frame.frame_id,
                        source,
                        target: target_name,
                        priority: best.priority,
                    },
                );
                Some(Resolution::Select(
                    selection,
                    TransitionSource {
                        source_state: best.source_state,
                        target_state: Some(target),
                        priority: Some(best.priority),
                        run_status: None,
                    },
                ))
            }
            completion => {
                let status = completion.completion_status().unwrap_or(RunStatus::Failed);
                if best.slot > 0 && !best.forced {
                    self.complete_subtree(best.slot, status, from_frame);
                    return None;
                }
                Some(Resolution::Stop(status))
            }
        }
    }

    /// Completes the linked state running the frame at `slot`.
    fn complete_subtree(&mut self, slot: usize, status: RunStatus, from_frame: &mut Option<usize>) {
        let Some((parent_id, linked)) = self.exec.frames[slot].parent else {
            return;
        };
        let Some(parent_slot) = self.exec.slot_of(parent_id) else {
            return;
        };
        let parent = &mut self.exec.frames[parent_slot];
        if let Some(depth) = parent.position_of(linked) {
            parent.states[depth].forced = status;
        }
        tracing::debug!(
            frame = %self.exec.frames[slot].frame_id,
            %status,
            "subtree completed"
        );
        *from_frame = Some(parent_slot);
        self.exec.last_tick_status = self.exec.aggregate_status();
    }

    fn call_transition_tasks(&mut self, limit: usize) {
        for slot in (0..limit).rev() {
            let tree = self.exec.frames[slot].tree.clone();
            for active in self.exec.frames[slot].states.clone().into_iter().rev() {
                let Some(state) = tree.state(active.state).filter(|s| s.enabled) else {
                    continue;
                };
                let tasks: Vec<NodeIndex> = task_nodes(&tree, state.tasks)
                    .into_iter()
                    .filter(|(position, node)| *position < active.entered && affects_transitions(&tree, *node))
                    .map(|(_, node)| node)
                    .collect();
                for node in tasks {
                    self.copy_bindings(slot, node);
                    self.call_node(slot, Some(active.state), node, |node, ctx| {
                        if let Some(task) = node.as_task() {
                            task.trigger_transitions(ctx);
                        }
                    });
                }
            }
            if self.exec.frames[slot].owns_globals && self.exec.frames[slot].globals_started {
                let entered = self.exec.frames[slot].globals_entered;
                let tasks: Vec<NodeIndex> = task_nodes(&tree, tree.global_tasks())
                    .into_iter()
                    .filter(|(position, node)| *position < entered && affects_transitions(&tree, *node))
                    .map(|(_, node)| node)
                    .collect();
                for node in tasks {
                    self.copy_bindings(slot, node);
                    self.call_node(slot, None, node, |node, ctx| {
                        if let Some(task) = node.as_task() {
                            task.trigger_transitions(ctx);
                        }
                    });
                }
            }
        }
    }

    fn trigger_state_transitions(&mut self, best: &mut Option<Candidate>, slot: usize, state: StateIndex) {
        let tree = self.exec.frames[slot].tree.clone();
        let frame_id = self.exec.frames[slot].frame_id;
        let Some(compact) = tree.state(state).filter(|s| s.enabled) else {
            return;
        };
        for index in compact.transition_indices() {
            let Some(transition) = tree.transition(index) else {
                continue;
            };
            if !transition.enabled || transition.trigger.is_completion() {
                continue;
            }
            if best.as_ref().is_some_and(|b| transition.priority <= b.priority) {
                continue;
            }

            if transition.delay.is_some() {
                let expired = self.exec.delayed.iter().position(|d| {
                    d.frame_id == frame_id && d.state == state && d.transition == index && d.remaining <= 0.0
                });
                // An expired delay is consumed even if the selection it requests fails;
                // it re-arms the next time its trigger fires.
                if let Some(position) = expired {
                    self.exec.delayed.remove(position);
                    tracing::debug!(state = tree.state_name(state), "delayed transition expired");
                    self.try_request(best, slot, Some(state), transition.target, transition.priority, transition.fallback);
                    continue;
                }
            }

            let events: Vec<Option<usize>> = match transition.trigger {
                TransitionTrigger::OnTick => vec![None],
                TransitionTrigger::OnEvent => match &transition.required_event {
                    Some(desc) => self
                        .exec
                        .events
                        .iter()
                        .enumerate()
                        .filter(|(_, queued)| !queued.consumed && desc.matches(&queued.event))
                        .map(|(i, _)| Some(i))
                        .collect(),
                    None => Vec::new(),
                },
                TransitionTrigger::OnDelegate(delegate) if self.exec.was_broadcast(tree.id(), delegate) => vec![None],
                _ => Vec::new(),
            };

            for event in events {
                if !self.test_conditions(slot, Some(state), transition.conditions) {
                    continue;
                }
                if let Some(delay) = transition.delay {
                    let armed = self
                        .exec
                        .delayed
                        .iter()
                        .any(|d| d.frame_id == frame_id && d.state == state && d.transition == index);
                    if armed {
                        break;
                    }
                    let duration = if delay.variance > 0.0 {
                        delay.duration + self.rng.gen_range(-delay.variance..=delay.variance)
                    } else {
                        delay.duration
                    };
                    if duration > 0.0 {
                        self.exec.delayed.push(DelayedTransition {
                            frame_id,
                            state,
                            transition: index,
                            remaining: duration,
                        });
                        self.trace.push(
                            self.exec.tick_count,
                            TraceEvent::TransitionDelayed {
                                frame_id,
                                source: tree.state_name(state).to_string(),
                                delay: duration,
                            },
                        );
                        tracing::debug!(state = tree.state_name(state), duration, "transition delayed");
                        break;
                    }
                }
                if self.try_request(best, slot, Some(state), transition.target, transition.priority, transition.fallback) {
                    if let (Some(event), true) = (event, transition.consume_event) {
                        self.exec.events.consume(event);
                    }
                    break;
                }
            }
        }
    }

    /// Handles the shallowest completed state: its completion transitions and
    /// those of its ancestors are tried, in parent frames too. Without one, the
    /// root is reselected.
    fn trigger_completion_transitions(&mut self, best: &mut Option<Candidate>, limit: usize) {
        let Some((start_slot, start_depth, status)) = self.first_completed(limit) else {
            return;
        };

        for slot in (0..=start_slot).rev() {
            let tree = self.exec.frames[slot].tree.clone();
            let states = self.exec.frames[slot].active_states();
            let deepest = if slot == start_slot {
                start_depth
            } else {
                states.len().saturating_sub(1)
            };
            for state in states.iter().take(deepest + 1).rev() {
                let Some(compact) = tree.state(*state).filter(|s| s.enabled) else {
                    continue;
                };
                for index in compact.transition_indices() {
                    let Some(transition) = tree.transition(index) else {
                        continue;
                    };
                    let accepted = if status == RunStatus::Stopped {
                        transition.trigger == TransitionTrigger::OnStateCompleted
                    } else {
                        transition.trigger.accepts(status)
                    };
                    if !transition.enabled || !accepted {
                        continue;
                    }
                    if !self.test_conditions(slot, Some(*state), transition.conditions) {
                        continue;
                    }
                    if self.try_request(best, slot, Some(*state), transition.target, Priority::Normal, transition.fallback)
                    {
                        return;
                    }
                }
            }
        }

        tracing::debug!(%status, "no completion transition, reselecting the root");
        let root = self.exec.frames[0].root_state;
        if !self.try_request(best, 0, None, TransitionTarget::State(root), Priority::Normal, SelectionFallback::None) {
            tracing::warn!("failed to reselect the root after completion");
            *best = Some(Candidate {
                slot: 0,
                source_state: None,
                target: TransitionTarget::Failed,
                priority: Priority::Normal,
                selection: None,
                forced: true,
            });
        }
    }

    /// Shallowest completed state as `(slot, depth, status)`.
    fn first_completed(&self, limit: usize) -> Option<(usize, usize, RunStatus)> {
        self.exec.frames[..limit].iter().enumerate().find_map(|(slot, frame)| {
            frame
                .states
                .iter()
                .enumerate()
                .find(|(_, s)| s.status().is_completed())
                .map(|(depth, s)| (slot, depth, s.status()))
        })
    }

    /// Offers a candidate. Returns true if it became the best one.
    fn try_request(
        &mut self,
        best: &mut Option<Candidate>,
        slot: usize,
        source_state: Option<StateIndex>,
        target: TransitionTarget,
        priority: Priority,
        fallback: SelectionFallback,
    ) -> bool {
        if best.as_ref().is_some_and(|b| priority <= b.priority) {
            return false;
        }
        let selection = match target {
            TransitionTarget::State(state) => match self.select(slot, source_state, state, fallback) {
                Ok(selection) => Some(selection),
                Err(_) => return false,
            },
            _ => None,
        };
        *best = Some(Candidate {
            slot,
            source_state,
            target,
            priority,
            selection,
            forced: false,
        });
        true
    }
}

fn affects_transitions(tree: &TreeDefinition, node: NodeIndex) -> bool {
    tree.node(node)
        .is_some_and(|n| n.enabled && n.task_flags().should_affect_transitions)
}
