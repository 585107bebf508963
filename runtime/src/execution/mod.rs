//! The execution context: runs one tree instance.
//!
//! `start`, `tick` and `stop` never fail; every structural problem is logged
//! and reported through the returned [`RunStatus`].

mod lifecycle;
mod nodes;
mod select;
mod transitions;

#[cfg(test)]
mod tests;

use crate::config::EngineConfig;
use crate::frame::{ActiveFrame, DelayedTransition};
use crate::snapshot::{DelayedSnapshot, ExecutionSnapshot, FrameSnapshot};
use crate::trace::{ExecutionTrace, TraceEvent};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::Arc;
use sylva_core::{
    ContextData, DefinitionId, DelegateHub, DelegateId, Event, EventQueue, FrameId, InstanceHandle, ObjectRegistry, RunStatus,
    StateIndex, StructValue, Tag, TransitionRequest, TreeDefinition, TreeLibrary,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Phase {
    #[default]
    Idle,
    Starting,
    Ticking,
    Stopping,
}

/// Mutable state of one run. Dropped and recreated by `start`.
pub(crate) struct ExecutionState {
    pub(crate) frames: Vec<ActiveFrame>,
    pub(crate) events: EventQueue,
    pub(crate) delayed: Vec<DelayedTransition>,
    pub(crate) delegates: DelegateHub,
    pub(crate) requests: Vec<TransitionRequest>,
    pub(crate) status: RunStatus,
    pub(crate) last_tick_status: RunStatus,
    pub(crate) phase: Phase,
    pub(crate) pending_stop: Option<RunStatus>,
    pub(crate) tick_count: u64,
    pub(crate) next_frame_id: u32,
    pub(crate) broadcast_depth: u32,
    /// Dispatchers broadcast since the last transition pass.
    pub(crate) broadcasted: Vec<(DefinitionId, DelegateId)>,
}

impl ExecutionState {
    fn new(max_events: usize) -> Self {
        ExecutionState {
            frames: Vec::new(),
            events: EventQueue::with_capacity(max_events),
            delayed: Vec::new(),
            delegates: DelegateHub::new(),
            requests: Vec::new(),
            status: RunStatus::Unset,
            last_tick_status: RunStatus::Unset,
            phase: Phase::Idle,
            pending_stop: None,
            tick_count: 0,
            next_frame_id: 0,
            broadcast_depth: 0,
            broadcasted: Vec::new(),
        }
    }

    /// Frame IDs come from a counter that only grows.
    pub(crate) fn allocate_frame_id(&mut self) -> FrameId {
        let id = FrameId(self.next_frame_id);
        self.next_frame_id = self.next_frame_id.wrapping_add(1);
        id
    }

    pub(crate) fn slot_of(&self, frame_id: FrameId) -> Option<usize> {
        self.frames.iter().position(|f| f.frame_id == frame_id)
    }

    /// Frames that are part of the active path, without selection scratch frames.
    pub(crate) fn committed(&self) -> usize {
        self.frames.iter().take_while(|f| !f.tentative).count()
    }

    pub(crate) fn discard_tentative(&mut self) {
        let committed = self.committed();
        self.frames.truncate(committed);
    }

    /// Combined status of every active state, `Running` if none completed.
    pub(crate) fn aggregate_status(&self) -> RunStatus {
        self.frames
            .iter()
            .filter(|f| !f.tentative)
            .map(ActiveFrame::status)
            .filter(|s| s.is_completed())
            .fold(RunStatus::Running, RunStatus::merge)
    }

    pub(crate) fn was_broadcast(&self, tree: DefinitionId, delegate: DelegateId) -> bool {
        self.broadcasted.contains(&(tree, delegate))
    }

    pub(crate) fn request_stop(&mut self, status: RunStatus) {
        if self.phase == Phase::Stopping {
            return;
        }
        self.pending_stop = Some(self.pending_stop.map_or(status, |s| s.merge(status)));
    }
}

/// Runs a [`TreeDefinition`] against host-supplied context data.
///
/// One context drives one instance and must not be shared between threads
/// while running; any number of contexts may run the same definition.
pub struct ExecutionContext {
    pub(crate) tree: Arc<TreeDefinition>,
    pub(crate) library: TreeLibrary,
    pub(crate) config: EngineConfig,
    pub(crate) context: ContextData,
    pub(crate) objects: Arc<ObjectRegistry>,
    pub(crate) exec: ExecutionState,
    pub(crate) trace: ExecutionTrace,
    pub(crate) rng: StdRng,
}

impl ExecutionContext {
    pub fn new(tree: Arc<TreeDefinition>) -> Self {
        Self::with_config(tree, EngineConfig::default())
    }

    pub fn with_config(tree: Arc<TreeDefinition>, config: EngineConfig) -> Self {
        let rng = match config.random.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        ExecutionContext {
            tree,
            library: TreeLibrary::new(),
            exec: ExecutionState::new(config.events.max_pending),
            trace: ExecutionTrace::new(config.trace.enabled, config.trace.capacity),
            config,
            context: ContextData::new(),
            objects: Arc::new(ObjectRegistry::new()),
            rng,
        }
    }

    /// Definitions reachable from linked asset states.
    pub fn with_library(mut self, library: TreeLibrary) -> Self {
        self.library = library;
        self
    }

    pub fn with_objects(mut self, objects: Arc<ObjectRegistry>) -> Self {
        self.objects = objects;
        self
    }

    pub fn with_context(mut self, context: ContextData) -> Self {
        self.context = context;
        self
    }

    pub fn tree(&self) -> &Arc<TreeDefinition> {
        &self.tree
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn context(&self) -> &ContextData {
        &self.context
    }

    /// Context data must be complete before every `start` and `tick`.
    pub fn context_mut(&mut self) -> &mut ContextData {
        &mut self.context
    }

    pub fn objects(&self) -> &Arc<ObjectRegistry> {
        &self.objects
    }

    pub fn status(&self) -> RunStatus {
        self.exec.status
    }

    pub fn last_tick_status(&self) -> RunStatus {
        self.exec.last_tick_status
    }

    pub fn tick_count(&self) -> u64 {
        self.exec.tick_count
    }

    pub fn trace(&self) -> &ExecutionTrace {
        &self.trace
    }

    pub fn trace_mut(&mut self) -> &mut ExecutionTrace {
        &mut self.trace
    }

    /// Starts the tree, stopping a previous run first.
    pub fn start(&mut self, parameters: Option<StructValue>) -> RunStatus {
        let span = tracing::info_span!("start", tree = %self.tree.name());
        let _enter = span.enter();

        if self.exec.status == RunStatus::Running {
            self.stop();
        }
        if let Err(error) = self.context.validate(self.tree.context_descriptors()) {
            tracing::error!(tree = %self.tree.name(), %error, "cannot start");
            self.exec.status = RunStatus::Failed;
            return RunStatus::Failed;
        }

        let mut exec = ExecutionState::new(self.config.events.max_pending);
        exec.next_frame_id = self.exec.next_frame_id;
        // Events sent before start are visible to the first selection.
        std::mem::swap(&mut exec.events, &mut self.exec.events);
        self.exec = exec;
        self.exec.status = RunStatus::Running;
        self.exec.last_tick_status = RunStatus::Running;
        self.exec.phase = Phase::Starting;
        self.trace.push(
            0,
            TraceEvent::TreeStarted {
                tree: self.tree.name().to_string(),
            },
        );

        let frame_id = self.exec.allocate_frame_id();
        let storage = self.tree.new_storage(parameters);
        let root = ActiveFrame::new(self.tree.clone(), frame_id, StateIndex::ROOT, None, storage, true);
        self.exec.frames.push(root);

        self.start_globals(0);
        let global_status = self.exec.frames[0].global_completion.status();
        if global_status.is_completed() {
            tracing::info!(status = %global_status, "global tasks completed on start");
            self.exec.request_stop(global_status);
        } else {
            self.enter_initial_state();
        }

        self.finish_phase();
        self.exec.status
    }

    fn enter_initial_state(&mut self) {
        match self.select(0, None, StateIndex::ROOT, sylva_core::SelectionFallback::None) {
            Ok(selection) => {
                let source = transitions::TransitionSource::initial();
                self.commit(selection, &source);
                self.exec.last_tick_status = self.exec.aggregate_status();
                if self.exec.last_tick_status.is_completed() {
                    self.notify_state_completed();
                }
            }
            Err(error) => {
                tracing::error!(tree = %self.tree.name(), %error, "failed to select initial state");
                self.exec.discard_tentative();
                self.exec.request_stop(RunStatus::Failed);
            }
        }
    }

    /// Advances the tree by `delta_time` seconds.
    pub fn tick(&mut self, delta_time: f32) -> RunStatus {
        if self.exec.status != RunStatus::Running {
            return self.exec.status;
        }
        let span = tracing::debug_span!("tick", tree = %self.tree.name(), tick = self.exec.tick_count + 1);
        let _enter = span.enter();

        if let Err(error) = self.context.validate(self.tree.context_descriptors()) {
            tracing::error!(tree = %self.tree.name(), %error, "cannot tick");
            return RunStatus::Failed;
        }

        self.exec.phase = Phase::Ticking;
        self.exec.tick_count += 1;
        let delta_time = delta_time.max(0.0);
        for delayed in &mut self.exec.delayed {
            delayed.remaining -= delta_time;
        }

        self.tick_update_tasks(delta_time);
        if self.exec.pending_stop.is_none() {
            self.tick_trigger_transitions();
        }

        self.finish_phase();
        self.exec.status
    }

    /// Stops the tree, exiting every active state.
    ///
    /// Called while a phase is running, the stop is recorded and executed when
    /// the phase ends.
    pub fn stop(&mut self) -> RunStatus {
        if self.exec.phase != Phase::Idle {
            self.exec.request_stop(RunStatus::Stopped);
            return RunStatus::Running;
        }
        if self.exec.status != RunStatus::Running {
            return self.exec.status;
        }
        let span = tracing::info_span!("stop", tree = %self.tree.name());
        let _enter = span.enter();
        self.stop_internal(RunStatus::Stopped);
        self.exec.status
    }

    /// Queues an event for the next transition pass.
    pub fn send_event(&mut self, tag: impl Into<Tag>, payload: Option<StructValue>) {
        let mut event = Event::new(tag);
        event.payload = payload;
        self.trace.push(
            self.exec.tick_count,
            TraceEvent::Event {
                tag: event.tag.to_string(),
            },
        );
        self.exec.events.send(event);
    }

    pub fn pending_events(&self) -> usize {
        self.exec.events.len()
    }

    pub fn delayed_transitions(&self) -> &[DelayedTransition] {
        &self.exec.delayed
    }

    pub fn frame_ids(&self) -> Vec<FrameId> {
        self.exec.frames.iter().map(|f| f.frame_id).collect()
    }

    /// Active states of every frame, root first.
    pub fn active_states(&self) -> Vec<(FrameId, StateIndex)> {
        self.exec
            .frames
            .iter()
            .flat_map(|f| f.states.iter().map(move |s| (f.frame_id, s.state)))
            .collect()
    }

    pub fn active_state_names(&self) -> Vec<String> {
        self.exec
            .frames
            .iter()
            .flat_map(|f| f.states.iter().map(move |s| f.tree.state_name(s.state).to_string()))
            .collect()
    }

    /// Instance data of the first active node named `name`.
    pub fn node_instance(&self, name: &str) -> Option<&StructValue> {
        self.exec.frames.iter().find_map(|frame| {
            let node = frame.tree.nodes().iter().find(|n| n.name == name)?;
            match node.instance? {
                InstanceHandle::Default(index) if frame.storage.is_active(index) => frame.storage.get(index),
                _ => None,
            }
        })
    }

    /// Global parameters of the root frame.
    pub fn parameters(&self) -> Option<&StructValue> {
        self.exec.frames.first().map(|f| f.storage.parameters())
    }

    pub fn snapshot(&self) -> ExecutionSnapshot {
        let frames = self
            .exec
            .frames
            .iter()
            .map(|frame| FrameSnapshot {
                tree: frame.tree.id(),
                frame_id: frame.frame_id,
                parent: frame.parent.map(|(id, _)| id),
                root_state: frame.tree.state(frame.root_state).map(|s| s.id),
                active_states: frame
                    .states
                    .iter()
                    .filter_map(|s| frame.tree.state(s.state).map(|s| s.id))
                    .collect(),
            })
            .collect();
        let delayed = self
            .exec
            .delayed
            .iter()
            .filter_map(|d| {
                let frame = &self.exec.frames[self.exec.slot_of(d.frame_id)?];
                Some(DelayedSnapshot {
                    frame_id: d.frame_id,
                    transition: frame.tree.transition(d.transition)?.id,
                    remaining: d.remaining,
                })
            })
            .collect();
        ExecutionSnapshot {
            taken_at: chrono::Utc::now(),
            status: self.exec.status,
            tick: self.exec.tick_count,
            frames,
            pending_events: self.exec.events.iter().map(|e| e.event.tag.to_string()).collect(),
            delayed,
        }
    }

    /// Ends the current phase, running a stop requested during it.
    fn finish_phase(&mut self) {
        self.exec.phase = Phase::Idle;
        self.exec.discard_tentative();
        if let Some(status) = self.exec.pending_stop.take() {
            if self.exec.status == RunStatus::Running {
                tracing::debug!(%status, "executing deferred stop");
                self.stop_internal(status);
            }
        }
    }
}
