//! Calling nodes: instance data hand-off, bindings, and the side effects a
//! node records while it runs.

use super::ExecutionContext;
use crate::frame::{FrameView, task_position};
use crate::trace::TraceEvent;
use sylva_core::node::DelegateOp;
use sylva_core::{
    BatchIndex, DelegateId, FrameId, InstanceHandle, ListenerOwner, MAX_EXPRESSION_INDENT, Node, NodeContext,
    NodeIndex, NodeRange, NodeRequests, Operand, RunStatus, StateIndex,
};

/// Nested broadcasts deeper than this are dropped.
const MAX_BROADCAST_DEPTH: u32 = 8;

impl ExecutionContext {
    /// Calls `f` with the node and a context over its instance data, then
    /// applies whatever the node requested.
    ///
    /// The node's own block is taken out of its storage for the call. The
    /// shared pool lock is only held while taking and restoring the block.
    pub(crate) fn call_node<R>(
        &mut self,
        slot: usize,
        state: Option<StateIndex>,
        node: NodeIndex,
        f: impl FnOnce(&Node, &mut NodeContext<'_>) -> R,
    ) -> Option<R> {
        let tree = self.exec.frames.get(slot)?.tree.clone();
        let node_ref = tree.node(node)?;
        let frame_id = self.exec.frames[slot].frame_id;
        let mut requests = NodeRequests::default();

        let result = match node_ref.instance {
            Some(InstanceHandle::Default(index)) => {
                let frame = &mut self.exec.frames[slot];
                let mut data = frame.storage.take(index);
                let mut ctx = NodeContext::new(
                    &tree,
                    frame_id,
                    state,
                    node,
                    data.as_mut(),
                    Some(&mut frame.storage),
                    &self.context,
                    &self.exec.events,
                    &self.objects,
                    &mut self.rng,
                    &mut requests,
                );
                let result = f(node_ref, &mut ctx);
                if let Some(data) = data {
                    frame.storage.restore(index, data);
                }
                result
            }
            Some(InstanceHandle::Shared(index)) => {
                let pool = tree.shared_instances().for_current_thread();
                let mut data = pool.lock().take(index);
                let frame = &mut self.exec.frames[slot];
                let mut ctx = NodeContext::new(
                    &tree,
                    frame_id,
                    state,
                    node,
                    data.as_mut(),
                    Some(&mut frame.storage),
                    &self.context,
                    &self.exec.events,
                    &self.objects,
                    &mut self.rng,
                    &mut requests,
                );
                let result = f(node_ref, &mut ctx);
                if let Some(data) = data {
                    pool.lock().restore(index, data);
                }
                result
            }
            None => {
                let frame = &mut self.exec.frames[slot];
                let mut ctx = NodeContext::new(
                    &tree,
                    frame_id,
                    state,
                    node,
                    None,
                    Some(&mut frame.storage),
                    &self.context,
                    &self.exec.events,
                    &self.objects,
                    &mut self.rng,
                    &mut requests,
                );
                f(node_ref, &mut ctx)
            }
        };

        if !requests.is_empty() {
            self.apply_requests(requests);
        }
        Some(result)
    }

    fn apply_requests(&mut self, requests: NodeRequests) {
        self.exec.requests.extend(requests.transitions);

        for event in requests.events {
            self.trace.push(
                self.exec.tick_count,
                TraceEvent::Event {
                    tag: event.tag.to_string(),
                },
            );
            self.exec.events.send(event);
        }

        for (frame_id, state, node, status) in requests.finished {
            self.finish_task(frame_id, state, node, status);
        }

        for (frame_id, state, node, op) in requests.delegates {
            let Some(slot) = self.exec.slot_of(frame_id) else {
                continue;
            };
            let tree = self.exec.frames[slot].tree.id();
            let owner = ListenerOwner { frame_id, state, node };
            match op {
                DelegateOp::Bind(delegate) => {
                    self.exec.delegates.bind(tree, delegate, owner);
                }
                DelegateOp::Unbind(delegate) => {
                    self.exec.delegates.unbind_owner(tree, delegate, owner);
                }
                DelegateOp::Broadcast(delegate) => self.broadcast(slot, delegate),
            }
        }

        if let Some(status) = requests.stop {
            tracing::debug!(%status, "stop requested by node");
            self.exec.request_stop(status);
        }
    }

    fn finish_task(&mut self, frame_id: FrameId, state: Option<StateIndex>, node: NodeIndex, status: RunStatus) {
        let Some(slot) = self.exec.slot_of(frame_id) else {
            return;
        };
        let frame = &mut self.exec.frames[slot];
        let tree = frame.tree.clone();
        match state {
            Some(state) => {
                let (Some(depth), Some(compact)) = (frame.position_of(state), tree.state(state)) else {
                    return;
                };
                if let Some(position) = task_position(&tree, compact.tasks, node) {
                    frame.states[depth].completion.set(position, status.into());
                }
            }
            None => {
                if let Some(position) = task_position(&tree, tree.global_tasks(), node) {
                    frame.global_completion.set(position, status.into());
                }
            }
        }
    }

    /// Calls every listener bound to `delegate` when the broadcast starts.
    /// A listener unbound by an earlier one in the same broadcast is skipped.
    fn broadcast(&mut self, slot: usize, delegate: DelegateId) {
        if self.exec.broadcast_depth >= MAX_BROADCAST_DEPTH {
            tracing::warn!(delegate = delegate.0, "delegate broadcast nested too deep, dropped");
            return;
        }
        let tree = self.exec.frames[slot].tree.id();
        if !self.exec.was_broadcast(tree, delegate) {
            self.exec.broadcasted.push((tree, delegate));
        }
        let listeners = self.exec.delegates.snapshot(tree, delegate);
        self.exec.broadcast_depth += 1;
        for (id, owner) in listeners {
            if !self.exec.delegates.is_bound(id) {
                continue;
            }
            let Some(target) = self.exec.slot_of(owner.frame_id) else {
                continue;
            };
            self.call_node(target, owner.state, owner.node, |node, ctx| {
                if let Some(task) = node.as_task() {
                    task.on_delegate(ctx, delegate);
                }
            });
        }
        self.exec.broadcast_depth -= 1;
    }

    /// Runs the property functions feeding `node`, then copies its bindings.
    pub(crate) fn copy_bindings(&mut self, slot: usize, node: NodeIndex) {
        let Some(tree) = self.exec.frames.get(slot).map(|f| f.tree.clone()) else {
            return;
        };
        let Some(batch_index) = tree.node(node).and_then(|n| n.bindings) else {
            return;
        };
        let Some(batch) = tree.batch(batch_index) else {
            return;
        };
        for function in batch.functions().iter() {
            let Some(function_node) = tree.node(function) else {
                continue;
            };
            if function_node.as_property_function().is_none() {
                continue;
            }
            if let Some(own) = function_node.bindings {
                self.copy_batch(slot, function, own);
            }
            self.call_node(slot, None, function, |node, ctx| {
                if let Some(function) = node.as_property_function() {
                    function.execute(ctx);
                }
            });
        }
        self.copy_batch(slot, node, batch_index);
    }

    fn copy_batch(&mut self, slot: usize, node: NodeIndex, batch_index: BatchIndex) {
        let tree = self.exec.frames[slot].tree.clone();
        let (Some(batch), Some(node_ref)) = (tree.batch(batch_index), tree.node(node)) else {
            return;
        };
        let pool = tree.shared_instances().for_current_thread();
        let report = match node_ref.instance {
            Some(InstanceHandle::Default(index)) => {
                let Some(mut target) = self.exec.frames[slot].storage.take(index) else {
                    return;
                };
                let guard = pool.lock();
                let view = FrameView {
                    frames: &self.exec.frames,
                    slot,
                    context: &self.context,
                    objects: &self.objects,
                    shared: Some(&*guard),
                };
                let report = batch.execute(&mut target, &view);
                drop(guard);
                self.exec.frames[slot].storage.restore(index, target);
                report
            }
            Some(InstanceHandle::Shared(index)) => {
                let mut guard = pool.lock();
                let Some(mut target) = guard.take(index) else {
                    return;
                };
                let view = FrameView {
                    frames: &self.exec.frames,
                    slot,
                    context: &self.context,
                    objects: &self.objects,
                    shared: Some(&*guard),
                };
                let report = batch.execute(&mut target, &view);
                guard.restore(index, target);
                report
            }
            None => return,
        };
        if !report.is_ok() {
            tracing::debug!(node = %node_ref.name, failed = report.failed, "some bindings were not copied");
        }
    }

    /// Copies the bindings of a state's parameter block before it is entered.
    pub(crate) fn copy_state_parameters(&mut self, slot: usize, state: StateIndex, batch_index: BatchIndex) {
        let tree = self.exec.frames[slot].tree.clone();
        let Some(batch) = tree.batch(batch_index) else {
            return;
        };
        let Some(mut target) = self.exec.frames[slot].storage.state_parameters(state).cloned() else {
            return;
        };
        let pool = tree.shared_instances().for_current_thread();
        let guard = pool.lock();
        let view = FrameView {
            frames: &self.exec.frames,
            slot,
            context: &self.context,
            objects: &self.objects,
            shared: Some(&*guard),
        };
        batch.execute(&mut target, &view);
        drop(guard);
        if let Some(parameters) = self.exec.frames[slot].storage.state_parameters_mut(state) {
            *parameters = target;
        }
    }

    /// Evaluates a condition list. Disabled conditions count as true and an
    /// empty list passes.
    pub(crate) fn test_conditions(&mut self, slot: usize, state: Option<StateIndex>, range: NodeRange) -> bool {
        let tree = self.exec.frames[slot].tree.clone();
        let mut items = Vec::with_capacity(range.len());
        for index in range.iter() {
            let Some(node) = tree.node(index) else {
                continue;
            };
            if node.as_condition().is_none() {
                continue;
            }
            let value = if node.enabled {
                self.copy_bindings(slot, index);
                let passed = self
                    .call_node(slot, state, index, |node, ctx| {
                        node.as_condition().is_some_and(|c| c.test_condition(ctx))
                    })
                    .unwrap_or(false);
                passed ^ node.invert
            } else {
                true
            };
            items.push((node.operand, node.indent, value));
        }
        if items.is_empty() {
            return true;
        }
        fold_expression(&items, false, |operand, left, right| match operand {
            Operand::Copy => right,
            Operand::And => left && right,
            Operand::Or => left || right,
        })
    }

    /// Combined consideration score in `[0, 1]`; AND takes the minimum and OR
    /// the maximum. A state without considerations scores 1.
    pub(crate) fn score_considerations(&mut self, slot: usize, state: StateIndex, range: NodeRange) -> f32 {
        let tree = self.exec.frames[slot].tree.clone();
        let mut items = Vec::with_capacity(range.len());
        for index in range.iter() {
            let Some(node) = tree.node(index) else {
                continue;
            };
            if node.as_consideration().is_none() || !node.enabled {
                continue;
            }
            self.copy_bindings(slot, index);
            let score = self
                .call_node(slot, Some(state), index, |node, ctx| {
                    node.as_consideration().map_or(0.0, |c| c.score(ctx))
                })
                .unwrap_or(0.0);
            let score = if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) };
            items.push((node.operand, node.indent, score));
        }
        if items.is_empty() {
            return 1.0;
        }
        fold_expression(&items, 0.0, |operand, left, right| match operand {
            Operand::Copy => right,
            Operand::And => left.min(right),
            Operand::Or => left.max(right),
        })
    }
}

/// Folds `(operand, indent, value)` items left to right.
///
/// An item's indent is the depth of the group it joins with the item before
/// it, so `A`, `AND B`, `OR C` with indents 0, 0, 1 reads `A AND (B OR C)`.
pub(crate) fn fold_expression<T: Copy>(items: &[(Operand, i32, T)], zero: T, merge: impl Fn(Operand, T, T) -> T) -> T {
    const DEPTH: usize = MAX_EXPRESSION_INDENT as usize + 2;
    let mut operands = [Operand::Copy; DEPTH];
    let mut values = [zero; DEPTH];
    let mut level = 0usize;

    for (i, (operand, indent, value)) in items.iter().enumerate() {
        let current = if i == 0 { 0 } else { (*indent).clamp(0, MAX_EXPRESSION_INDENT) };
        let next = items
            .get(i + 1)
            .map_or(0, |(_, indent, _)| (*indent).clamp(0, MAX_EXPRESSION_INDENT));
        let delta = next - current;
        let open = delta.max(0) as usize + 1;
        let close = (-delta).max(0) as usize + 1;

        operands[level] = if i == 0 { Operand::Copy } else { *operand };
        level = (level + open).min(DEPTH - 1);
        operands[level] = Operand::Copy;
        values[level] = *value;

        for _ in 0..close {
            if level == 0 {
                break;
            }
            level -= 1;
            values[level] = merge(operands[level], values[level], values[level + 1]);
            operands[level] = Operand::Copy;
        }
    }
    values[0]
}
