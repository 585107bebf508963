use super::*;
use crate::config::EngineConfig;
use crate::trace::TraceEvent;
use sylva_core::{
    BindingSource, ChangeType, CompletionPolicy, ContextDescriptor, DefinitionId, DelegateId, EventDesc, FieldDesc,
    NodeBase, NodeContext, NodeDesc, Operand, Priority, RunStatus, SelectionBehavior, StateDesc, StructType,
    StructValue, TargetDesc, Task, TaskFlags, TransitionDesc, TransitionInfo, TreeBuilder, TreeDefinition,
    TreeLibrary, Value, ValueType,
};
use sylva_test::{CallLog, TestCondition, TestConsideration, TestEvaluator, TestTask, init_test_tracing};

fn traced() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.trace.enabled = true;
    config.random.seed = Some(7);
    config
}

fn running(tree: TreeDefinition) -> ExecutionContext {
    let mut ctx = ExecutionContext::with_config(Arc::new(tree), traced());
    assert_eq!(ctx.start(None), RunStatus::Running);
    ctx
}

/// Requests a stop from inside `tick` and records the status it exits with.
struct StopOnTick {
    log: CallLog,
}

impl NodeBase for StopOnTick {}

impl Task for StopOnTick {
    fn tick(&self, ctx: &mut NodeContext<'_>, _delta_time: f32) -> RunStatus {
        self.log.push("Stopper.Tick");
        ctx.stop(RunStatus::Stopped);
        RunStatus::Running
    }

    fn exit_state(&self, _ctx: &mut NodeContext<'_>, transition: &TransitionInfo) {
        self.log.push(format!("Stopper.ExitState:{}", transition.current_run_status));
    }
}

struct Clock;

fn two_step(log: &CallLog) -> TreeDefinition {
    TreeBuilder::new("two_step")
        .state(
            StateDesc::new("Root")
                .child(
                    StateDesc::new("A")
                        .task(NodeDesc::task(TestTask::new("T", log).ticks_to_completion(2)).named("T"))
                        .transition(TransitionDesc::on_completed(TargetDesc::NextState)),
                )
                .child(StateDesc::new("B").task(NodeDesc::task(TestTask::new("TB", log)).named("TB"))),
        )
        .build()
        .unwrap()
}

#[test]
fn test_completed_state_follows_transition_to_next() {
    init_test_tracing();
    let log = CallLog::new();
    let mut ctx = running(two_step(&log));
    assert_eq!(ctx.active_state_names(), ["Root", "A"]);

    assert_eq!(ctx.tick(0.1), RunStatus::Running);
    assert_eq!(ctx.active_state_names(), ["Root", "A"]);
    assert_eq!(ctx.tick(0.1), RunStatus::Running);
    assert_eq!(ctx.active_state_names(), ["Root", "B"]);
    assert_eq!(
        log.entries(),
        [
            "T.EnterState",
            "T.Tick",
            "T.Tick",
            "T.StateCompleted:Succeeded",
            "T.ExitState",
            "TB.EnterState",
        ]
    );
    assert_eq!(ctx.tick_count(), 2);
}

#[test]
fn test_all_policy_fails_on_first_failed_task() {
    init_test_tracing();
    let log = CallLog::new();
    let tree = TreeBuilder::new("all")
        .state(
            StateDesc::new("Root")
                .child(
                    StateDesc::new("A")
                        .completion(CompletionPolicy::All)
                        .task(NodeDesc::task(
                            TestTask::new("T1", &log).ticks_to_completion(1).result(RunStatus::Failed),
                        ))
                        .task(NodeDesc::task(TestTask::new("T2", &log)))
                        .transition(TransitionDesc::on_failed(TargetDesc::state("Recover"))),
                )
                .child(StateDesc::new("Recover").task(NodeDesc::task(TestTask::new("TR", &log)))),
        )
        .build()
        .unwrap();
    let mut ctx = running(tree);

    ctx.tick(0.1);
    assert_eq!(ctx.active_state_names(), ["Root", "Recover"]);
    assert_eq!(log.count("T1.Tick"), 1);
    assert_eq!(log.count("T2.Tick"), 0);
    assert!(log.ordered("T2.StateCompleted:Failed", "T1.StateCompleted:Failed"));
    assert!(log.ordered("T2.ExitState", "T1.ExitState"));
    assert!(log.ordered("T1.ExitState", "TR.EnterState"));
}

#[test]
fn test_leaf_without_tasks_succeeds_on_tick() {
    init_test_tracing();
    let log = CallLog::new();
    let tree = TreeBuilder::new("empty_leaf")
        .state(
            StateDesc::new("Root")
                .child(StateDesc::new("Wait").transition(TransitionDesc::on_succeeded(TargetDesc::state("B"))))
                .child(StateDesc::new("B").task(NodeDesc::task(TestTask::new("TB", &log)))),
        )
        .build()
        .unwrap();
    let mut ctx = running(tree);
    assert_eq!(ctx.active_state_names(), ["Root", "Wait"]);
    ctx.tick(0.1);
    assert_eq!(ctx.active_state_names(), ["Root", "B"]);
}

#[test]
fn test_completed_tree_without_transitions_reselects_root() {
    init_test_tracing();
    let log = CallLog::new();
    let tree = TreeBuilder::new("loop")
        .state(StateDesc::new("Root").child(StateDesc::new("A").task(NodeDesc::task(
            TestTask::new("T", &log).ticks_to_completion(1),
        ))))
        .build()
        .unwrap();
    let mut ctx = running(tree);

    assert_eq!(ctx.tick(0.1), RunStatus::Running);
    assert_eq!(log.count("T.EnterState"), 2);
    assert_eq!(log.count("T.ExitState"), 1);
    assert_eq!(ctx.active_state_names(), ["Root", "A"]);
    let sustained = ctx.trace().entries().any(|e| {
        matches!(&e.event, TraceEvent::EnterState { state, change: ChangeType::Sustained, .. } if state == "A")
    });
    assert!(sustained);
}

#[test]
fn test_transition_to_self_is_sustained() {
    init_test_tracing();
    let log = CallLog::new();
    let quiet = TaskFlags {
        should_state_change_on_reselect: false,
        ..TaskFlags::default()
    };
    let tree = TreeBuilder::new("reselect")
        .state(
            StateDesc::new("Root").child(
                StateDesc::new("A")
                    .task(NodeDesc::task(TestTask::new("Loud", &log)))
                    .task(NodeDesc::task(TestTask::new("Quiet", &log).with_flags(quiet)))
                    .transition(TransitionDesc::on_tick(TargetDesc::state("A"))),
            ),
        )
        .build()
        .unwrap();
    let mut ctx = running(tree);

    ctx.tick(0.1);
    ctx.tick(0.1);
    assert_eq!(log.count("Loud.EnterState"), 3);
    assert_eq!(log.count("Loud.ExitState"), 2);
    assert_eq!(log.count("Quiet.EnterState"), 1);
    assert_eq!(log.count("Quiet.ExitState"), 0);
    assert_eq!(log.count("Quiet.Tick"), 2);
    let root_exited = ctx
        .trace()
        .entries()
        .any(|e| matches!(&e.event, TraceEvent::ExitState { state, .. } if state == "Root"));
    assert!(!root_exited);
}

#[test]
fn test_higher_priority_wins_and_ties_keep_first() {
    init_test_tracing();
    let log = CallLog::new();
    let tree = TreeBuilder::new("priority")
        .state(
            StateDesc::new("Root")
                .transition(TransitionDesc::on_tick(TargetDesc::state("C")))
                .child(
                    StateDesc::new("A")
                        .task(NodeDesc::task(TestTask::new("TA", &log)))
                        .transition(TransitionDesc::on_tick(TargetDesc::state("B")))
                        .transition(TransitionDesc::on_tick(TargetDesc::state("D")).priority(Priority::Low)),
                )
                .child(StateDesc::new("B").task(NodeDesc::task(TestTask::new("TB", &log))))
                .child(StateDesc::new("C").task(NodeDesc::task(TestTask::new("TC", &log))))
                .child(StateDesc::new("D").task(NodeDesc::task(TestTask::new("TD", &log)))),
        )
        .build()
        .unwrap();
    let mut ctx = running(tree);
    ctx.tick(0.1);
    // The leaf is asked first, so the root's equal priority loses.
    assert_eq!(ctx.active_state_names(), ["Root", "B"]);

    let tree = TreeBuilder::new("priority")
        .state(
            StateDesc::new("Root")
                .transition(TransitionDesc::on_tick(TargetDesc::state("C")).priority(Priority::Critical))
                .child(
                    StateDesc::new("A")
                        .task(NodeDesc::task(TestTask::new("TA", &log)))
                        .transition(TransitionDesc::on_tick(TargetDesc::state("B")).priority(Priority::High)),
                )
                .child(StateDesc::new("B"))
                .child(StateDesc::new("C").task(NodeDesc::task(TestTask::new("TC", &log)))),
        )
        .build()
        .unwrap();
    let mut ctx = running(tree);
    ctx.tick(0.1);
    assert_eq!(ctx.active_state_names(), ["Root", "C"]);
}

#[test]
fn test_none_target_masks_lower_priorities() {
    init_test_tracing();
    let log = CallLog::new();
    let tree = TreeBuilder::new("mask")
        .state(
            StateDesc::new("Root")
                .transition(TransitionDesc::on_tick(TargetDesc::state("B")))
                .child(
                    StateDesc::new("A")
                        .task(NodeDesc::task(TestTask::new("TA", &log)))
                        .transition(TransitionDesc::on_tick(TargetDesc::None).priority(Priority::High)),
                )
                .child(StateDesc::new("B").task(NodeDesc::task(TestTask::new("TB", &log)))),
        )
        .build()
        .unwrap();
    let mut ctx = running(tree);
    for _ in 0..3 {
        assert_eq!(ctx.tick(0.1), RunStatus::Running);
    }
    assert_eq!(ctx.active_state_names(), ["Root", "A"]);
    assert!(!log.contains("TB.EnterState"));
}

#[test]
fn test_task_request_competes_with_state_transitions() {
    init_test_tracing();
    let log = CallLog::new();
    let tree = TreeBuilder::new("request")
        .state(
            StateDesc::new("Root")
                .child(
                    StateDesc::new("A")
                        .task(NodeDesc::task(TestTask::new("TA", &log).transition_on_tick("C", Priority::High)))
                        .transition(TransitionDesc::on_tick(TargetDesc::state("B"))),
                )
                .child(StateDesc::new("B").task(NodeDesc::task(TestTask::new("TB", &log))))
                .child(StateDesc::new("C").task(NodeDesc::task(TestTask::new("TC", &log)))),
        )
        .build()
        .unwrap();
    let mut ctx = running(tree);
    ctx.tick(0.1);
    assert_eq!(ctx.active_state_names(), ["Root", "C"]);
    assert!(!log.contains("TB.EnterState"));
}

fn event_tree(log: &CallLog, consume: bool) -> TreeDefinition {
    TreeBuilder::new("events")
        .state(
            StateDesc::new("Root")
                .transition(
                    TransitionDesc::on_event(EventDesc::tag("Go"), TargetDesc::state("B")).priority(Priority::High),
                )
                .child(
                    StateDesc::new("Idle")
                        .task(NodeDesc::task(TestTask::new("TI", log)))
                        .transition(
                            TransitionDesc::on_event(EventDesc::tag("Go"), TargetDesc::state("A"))
                                .consume_event(consume),
                        ),
                )
                .child(StateDesc::new("A").task(NodeDesc::task(TestTask::new("TA", log))))
                .child(StateDesc::new("B").task(NodeDesc::task(TestTask::new("TB", log)))),
        )
        .build()
        .unwrap()
}

#[test]
fn test_consumed_event_is_hidden_from_later_transitions() {
    init_test_tracing();
    let log = CallLog::new();
    let mut ctx = running(event_tree(&log, true));
    ctx.tick(0.1);
    assert_eq!(ctx.active_state_names(), ["Root", "Idle"]);

    ctx.send_event("Go.Now", None);
    ctx.tick(0.1);
    assert_eq!(ctx.active_state_names(), ["Root", "A"]);
    assert_eq!(ctx.pending_events(), 0);

    let mut ctx = running(event_tree(&log, false));
    ctx.send_event("Go", None);
    ctx.tick(0.1);
    assert_eq!(ctx.active_state_names(), ["Root", "B"]);
}

#[test]
fn test_unhandled_events_are_retired_after_one_pass() {
    init_test_tracing();
    let log = CallLog::new();
    let mut ctx = running(event_tree(&log, true));
    ctx.send_event("Elsewhere", None);
    ctx.send_event("Going", None);
    assert_eq!(ctx.pending_events(), 2);
    ctx.tick(0.1);
    assert_eq!(ctx.pending_events(), 0);
    assert_eq!(ctx.active_state_names(), ["Root", "Idle"]);
}

#[test]
fn test_required_event_gates_selection() {
    init_test_tracing();
    let log = CallLog::new();
    let tree = TreeBuilder::new("required")
        .state(
            StateDesc::new("Root")
                .child(
                    StateDesc::new("Alarm")
                        .required_event(EventDesc::tag("Alarm"))
                        .task(NodeDesc::task(TestTask::new("TA", &log))),
                )
                .child(StateDesc::new("Calm").task(NodeDesc::task(TestTask::new("TC", &log)))),
        )
        .build()
        .unwrap();
    let tree = Arc::new(tree);

    let mut ctx = ExecutionContext::with_config(tree.clone(), traced());
    ctx.start(None);
    assert_eq!(ctx.active_state_names(), ["Root", "Calm"]);

    let mut ctx = ExecutionContext::with_config(tree, traced());
    ctx.send_event("Alarm", None);
    ctx.start(None);
    assert_eq!(ctx.active_state_names(), ["Root", "Alarm"]);
}

fn delayed_tree(log: &CallLog) -> TreeDefinition {
    TreeBuilder::new("delayed")
        .state(
            StateDesc::new("Root")
                .child(
                    StateDesc::new("A")
                        .task(NodeDesc::task(TestTask::new("TA", log)))
                        .transition(TransitionDesc::on_tick(TargetDesc::state("B")).delay(1.0, 0.0))
                        .transition(TransitionDesc::on_event(EventDesc::tag("Leave"), TargetDesc::state("C"))),
                )
                .child(StateDesc::new("B").task(NodeDesc::task(TestTask::new("TB", log))))
                .child(StateDesc::new("C").task(NodeDesc::task(TestTask::new("TC", log)))),
        )
        .build()
        .unwrap()
}

#[test]
fn test_delayed_transition_fires_after_duration() {
    init_test_tracing();
    let log = CallLog::new();
    let mut ctx = running(delayed_tree(&log));

    ctx.tick(0.5);
    assert_eq!(ctx.delayed_transitions().len(), 1);
    assert_eq!(ctx.active_state_names(), ["Root", "A"]);
    ctx.tick(0.6);
    assert_eq!(ctx.delayed_transitions().len(), 1);
    assert!((ctx.delayed_transitions()[0].remaining - 0.4).abs() < 1e-4);
    assert_eq!(ctx.active_state_names(), ["Root", "A"]);
    ctx.tick(0.5);
    assert_eq!(ctx.active_state_names(), ["Root", "B"]);
    assert!(ctx.delayed_transitions().is_empty());
    assert_eq!(ctx.trace().labels().iter().filter(|l| l.starts_with("Delayed:")).count(), 1);
}

#[test]
fn test_delayed_transition_is_dropped_when_state_exits() {
    init_test_tracing();
    let log = CallLog::new();
    let mut ctx = running(delayed_tree(&log));
    ctx.tick(0.5);
    assert_eq!(ctx.delayed_transitions().len(), 1);

    ctx.send_event("Leave", None);
    ctx.tick(0.1);
    assert_eq!(ctx.active_state_names(), ["Root", "C"]);
    assert!(ctx.delayed_transitions().is_empty());
    ctx.tick(5.0);
    assert_eq!(ctx.active_state_names(), ["Root", "C"]);
}

#[test]
fn test_stop_requested_during_tick_is_deferred() {
    init_test_tracing();
    let log = CallLog::new();
    let tree = TreeBuilder::new("stopper")
        .state(
            StateDesc::new("Root").child(
                StateDesc::new("A")
                    .task(NodeDesc::task(StopOnTick { log: log.clone() }))
                    .transition(TransitionDesc::on_tick(TargetDesc::state("B"))),
            )
            .child(StateDesc::new("B").task(NodeDesc::task(TestTask::new("TB", &log)))),
        )
        .build()
        .unwrap();
    let mut ctx = running(tree);

    assert_eq!(ctx.tick(0.1), RunStatus::Stopped);
    assert_eq!(ctx.status(), RunStatus::Stopped);
    assert_eq!(log.entries(), ["Stopper.Tick", "Stopper.ExitState:Stopped"]);
    assert!(ctx.active_states().is_empty());
    assert_eq!(ctx.tick(0.1), RunStatus::Stopped);
    assert_eq!(log.count("Stopper.Tick"), 1);
}

#[test]
fn test_stop_exits_leaf_first() {
    init_test_tracing();
    let log = CallLog::new();
    let tree = TreeBuilder::new("stop")
        .state(
            StateDesc::new("Root")
                .task(NodeDesc::task(TestTask::new("Outer", &log)))
                .child(StateDesc::new("A").task(NodeDesc::task(TestTask::new("Inner", &log)))),
        )
        .build()
        .unwrap();
    let mut ctx = running(tree);
    assert_eq!(ctx.stop(), RunStatus::Stopped);
    assert!(log.ordered("Inner.ExitState", "Outer.ExitState"));
    assert_eq!(ctx.stop(), RunStatus::Stopped);
    assert_eq!(log.count("Outer.ExitState"), 1);
    assert!(ctx.trace().labels().contains(&"Stop:Stopped".to_string()));

    assert_eq!(ctx.start(None), RunStatus::Running);
    assert_eq!(log.count("Inner.EnterState"), 2);
}

fn global_tree(log: &CallLog) -> TreeDefinition {
    TreeBuilder::new("globals")
        .evaluator(NodeDesc::evaluator(TestEvaluator::new("E", log)))
        .global_task(NodeDesc::task(TestTask::new("G", log).ticks_to_completion(2)))
        .state(StateDesc::new("Root").task(NodeDesc::task(TestTask::new("T", log))))
        .build()
        .unwrap()
}

#[test]
fn test_global_task_completion_stops_tree() {
    init_test_tracing();
    let log = CallLog::new();
    let mut ctx = running(global_tree(&log));
    assert!(log.ordered("E.TreeStart", "G.EnterState"));
    assert!(log.ordered("G.EnterState", "T.EnterState"));

    assert_eq!(ctx.tick(0.1), RunStatus::Running);
    assert!(log.ordered("E.Tick", "G.Tick"));
    assert!(log.ordered("G.Tick", "T.Tick"));
    assert_eq!(ctx.tick(0.1), RunStatus::Succeeded);
    assert_eq!(log.count("T.Tick"), 1);
    assert!(log.ordered("T.ExitState", "G.ExitState"));
    assert!(log.ordered("G.ExitState", "E.TreeStop"));
}

#[test]
fn test_globals_last_schedule() {
    init_test_tracing();
    let log = CallLog::new();
    let mut config = traced();
    config.schedule.global_tasks_first = false;
    let mut ctx = ExecutionContext::with_config(Arc::new(global_tree(&log)), config);
    ctx.start(None);

    ctx.tick(0.1);
    assert!(log.ordered("T.Tick", "G.Tick"));
    assert_eq!(ctx.tick(0.1), RunStatus::Succeeded);
    assert_eq!(log.count("T.Tick"), 2);
    assert!(log.ordered("G.ExitState", "T.ExitState"));
}

#[test]
fn test_evaluator_output_binds_into_task() {
    init_test_tracing();
    let log = CallLog::new();
    let tree = TreeBuilder::new("bindings")
        .evaluator(NodeDesc::evaluator(TestEvaluator::new("E", &log)).named("E"))
        .state(
            StateDesc::new("Root").task(
                NodeDesc::task(TestTask::new("T", &log))
                    .named("T")
                    .bind(BindingSource::Node("E".into()), TestEvaluator::TICKS, TestTask::CURRENT_TICK),
            ),
        )
        .build()
        .unwrap();
    let mut ctx = running(tree);
    ctx.tick(0.1);
    ctx.tick(0.1);
    // Copied from the evaluator before each tick, then incremented by the task.
    let data = ctx.node_instance("T").unwrap();
    assert_eq!(data.int(TestTask::CURRENT_TICK), Some(3));
    assert_eq!(ctx.node_instance("E").unwrap().int(TestEvaluator::TICKS), Some(2));
}

#[test]
fn test_start_parameters_are_visible_to_bindings() {
    init_test_tracing();
    let log = CallLog::new();
    let ty = StructType::new("Params", vec![FieldDesc::new("Start", ValueType::Int)]);
    let tree = TreeBuilder::new("params")
        .parameters(StructValue::new(&ty))
        .state(
            StateDesc::new("Root").task(
                NodeDesc::task(TestTask::new("T", &log))
                    .named("T")
                    .bind(BindingSource::Parameters, "Start", TestTask::CURRENT_TICK),
            ),
        )
        .build()
        .unwrap();
    let mut ctx = ExecutionContext::with_config(Arc::new(tree), traced());
    ctx.start(Some(StructValue::new(&ty).with("Start", Value::Int(10))));
    assert_eq!(ctx.parameters().and_then(|p| p.int("Start")), Some(10));
    ctx.tick(0.1);
    assert_eq!(ctx.node_instance("T").unwrap().int(TestTask::CURRENT_TICK), Some(11));
}

#[test]
fn test_delegate_broadcast_finishes_listener() {
    init_test_tracing();
    let log = CallLog::new();
    let tree = TreeBuilder::new("delegates")
        .state(
            StateDesc::new("Root")
                .task(NodeDesc::task(TestTask::new("Caller", &log).broadcast_on_tick(DelegateId(0))))
                .child(
                    StateDesc::new("Wait")
                        .task(NodeDesc::task(TestTask::new("L", &log).listen_to_delegate()))
                        .transition(TransitionDesc::on_succeeded(TargetDesc::state("Done"))),
                )
                .child(StateDesc::new("Done").task(NodeDesc::task(TestTask::new("TD", &log)))),
        )
        .build()
        .unwrap();
    let mut ctx = running(tree);
    ctx.tick(0.1);
    assert!(log.ordered("Caller.Tick", "L.Delegate"));
    assert_eq!(ctx.active_state_names(), ["Root", "Done"]);

    // The listener left with its state, so another broadcast reaches nobody.
    ctx.tick(0.1);
    assert_eq!(log.count("L.Delegate"), 1);
}

#[test]
fn test_enter_conditions_group_by_indent() {
    init_test_tracing();
    let log = CallLog::new();
    let build = |c_indent: i32| {
        TreeBuilder::new("conditions")
            .state(
                StateDesc::new("Root")
                    .child(
                        StateDesc::new("X")
                            .enter_condition(NodeDesc::condition(TestCondition::new("A", &log, false)))
                            .enter_condition(NodeDesc::condition(TestCondition::new("B", &log, false)))
                            .enter_condition(
                                NodeDesc::condition(TestCondition::new("C", &log, true))
                                    .operand(Operand::Or)
                                    .indent(c_indent),
                            ),
                    )
                    .child(StateDesc::new("Y")),
            )
            .build()
            .unwrap()
    };
    // (A AND B) OR C
    let ctx = running(build(0));
    assert_eq!(ctx.active_state_names(), ["Root", "X"]);
    // A AND (B OR C)
    let ctx = running(build(1));
    assert_eq!(ctx.active_state_names(), ["Root", "Y"]);
}

#[test]
fn test_inverted_and_disabled_conditions() {
    init_test_tracing();
    let log = CallLog::new();
    let tree = TreeBuilder::new("invert")
        .state(
            StateDesc::new("Root")
                .child(
                    StateDesc::new("X")
                        .enter_condition(NodeDesc::condition(TestCondition::new("No", &log, false)).invert())
                        .enter_condition(NodeDesc::condition(TestCondition::new("Off", &log, false)).enabled(false)),
                )
                .child(StateDesc::new("Y")),
        )
        .build()
        .unwrap();
    let ctx = running(tree);
    assert_eq!(ctx.active_state_names(), ["Root", "X"]);
    assert!(log.contains("No.TestCondition"));
    assert!(!log.contains("Off.TestCondition"));
}

#[test]
fn test_transition_condition_switch() {
    init_test_tracing();
    let log = CallLog::new();
    let gate = TestCondition::new("Gate", &log, false);
    let switch = gate.switch();
    let tree = TreeBuilder::new("switch")
        .state(
            StateDesc::new("Root")
                .child(
                    StateDesc::new("A")
                        .task(NodeDesc::task(TestTask::new("TA", &log)))
                        .transition(TransitionDesc::on_tick(TargetDesc::state("B")).condition(NodeDesc::condition(gate))),
                )
                .child(StateDesc::new("B").task(NodeDesc::task(TestTask::new("TB", &log)))),
        )
        .build()
        .unwrap();
    let mut ctx = running(tree);
    ctx.tick(0.1);
    assert_eq!(ctx.active_state_names(), ["Root", "A"]);
    switch.store(true, std::sync::atomic::Ordering::SeqCst);
    ctx.tick(0.1);
    assert_eq!(ctx.active_state_names(), ["Root", "B"]);
}

#[test]
fn test_highest_utility_child_is_selected() {
    init_test_tracing();
    let build = |low_weight: f32| {
        TreeBuilder::new("utility")
            .state(
                StateDesc::new("Root")
                    .selection(SelectionBehavior::TrySelectChildrenWithHighestUtility)
                    .child(
                        StateDesc::new("Low")
                            .weight(low_weight)
                            .consideration(NodeDesc::consideration(TestConsideration::new(0.2))),
                    )
                    .child(StateDesc::new("High").consideration(NodeDesc::consideration(TestConsideration::new(0.9)))),
            )
            .build()
            .unwrap()
    };
    assert_eq!(running(build(1.0)).active_state_names(), ["Root", "High"]);
    assert_eq!(running(build(5.0)).active_state_names(), ["Root", "Low"]);
}

#[test]
fn test_weighted_random_skips_zero_utility_until_last() {
    init_test_tracing();
    let tree = TreeBuilder::new("weighted")
        .state(
            StateDesc::new("Root")
                .selection(SelectionBehavior::TrySelectChildrenAtRandomWeightedByUtility)
                .child(StateDesc::new("Never").weight(0.0))
                .child(StateDesc::new("Always").consideration(NodeDesc::consideration(TestConsideration::new(0.5)))),
        )
        .build()
        .unwrap();
    let tree = Arc::new(tree);
    for seed in 0..8 {
        let mut config = traced();
        config.random.seed = Some(seed);
        let mut ctx = ExecutionContext::with_config(tree.clone(), config);
        ctx.start(None);
        assert_eq!(ctx.active_state_names(), ["Root", "Always"]);
    }
}

#[test]
fn test_follow_transitions_selects_target() {
    init_test_tracing();
    let log = CallLog::new();
    let tree = TreeBuilder::new("follow")
        .state(
            StateDesc::new("Root")
                .child(
                    StateDesc::new("Gate")
                        .selection(SelectionBehavior::TryFollowTransitions)
                        .transition(TransitionDesc::on_tick(TargetDesc::state("Target"))),
                )
                .child(StateDesc::new("Other"))
                .child(StateDesc::new("Target").task(NodeDesc::task(TestTask::new("TT", &log)))),
        )
        .build()
        .unwrap();
    let ctx = running(tree);
    assert_eq!(ctx.active_state_names(), ["Root", "Target"]);
}

#[test]
fn test_follow_transitions_loop_fails_start() {
    init_test_tracing();
    let tree = TreeBuilder::new("follow_loop")
        .state(
            StateDesc::new("Root")
                .child(
                    StateDesc::new("Ping")
                        .selection(SelectionBehavior::TryFollowTransitions)
                        .transition(TransitionDesc::on_tick(TargetDesc::state("Pong"))),
                )
                .child(
                    StateDesc::new("Pong")
                        .selection(SelectionBehavior::TryFollowTransitions)
                        .transition(TransitionDesc::on_tick(TargetDesc::state("Ping"))),
                ),
        )
        .build()
        .unwrap();
    let mut ctx = ExecutionContext::with_config(Arc::new(tree), traced());
    assert_eq!(ctx.start(None), RunStatus::Failed);
    assert!(ctx.trace().labels().contains(&"SelectionFailed:Root".to_string()));
}

#[test]
fn test_linked_subtree_runs_in_own_frame() {
    init_test_tracing();
    let log = CallLog::new();
    let tree = TreeBuilder::new("linked")
        .state(
            StateDesc::new("Root")
                .child(
                    StateDesc::linked("Call", "Routine")
                        .transition(TransitionDesc::on_succeeded(TargetDesc::state("Done"))),
                )
                .child(StateDesc::new("Done").task(NodeDesc::task(TestTask::new("TD", &log)))),
        )
        .state(
            StateDesc::subtree("Routine")
                .task(NodeDesc::task(TestTask::new("TR", &log).ticks_to_completion(1)))
                .transition(TransitionDesc::on_succeeded(TargetDesc::Succeeded)),
        )
        .build()
        .unwrap();
    let mut ctx = running(tree);
    assert_eq!(ctx.active_state_names(), ["Root", "Call", "Routine"]);
    let frames = ctx.frame_ids();
    assert_eq!(frames.len(), 2);

    ctx.tick(0.1);
    assert_eq!(ctx.active_state_names(), ["Root", "Done"]);
    assert_eq!(ctx.frame_ids(), [frames[0]]);
    assert!(log.ordered("TR.ExitState", "TD.EnterState"));
}

#[test]
fn test_linked_asset_completion_returns_to_parent() {
    init_test_tracing();
    let log = CallLog::new();
    let routine = TreeBuilder::new("routine")
        .global_task(NodeDesc::task(TestTask::new("RG", &log)))
        .state(StateDesc::new("RootB").task(NodeDesc::task(TestTask::new("TB", &log).ticks_to_completion(1))))
        .build()
        .unwrap();
    let routine = Arc::new(routine);
    let main = TreeBuilder::new("main")
        .state(
            StateDesc::new("RootA")
                .child(
                    StateDesc::linked_asset("CallB", routine.id())
                        .transition(TransitionDesc::on_succeeded(TargetDesc::state("Done"))),
                )
                .child(StateDesc::new("Done").task(NodeDesc::task(TestTask::new("TD", &log)))),
        )
        .build()
        .unwrap();
    let mut ctx = ExecutionContext::with_config(Arc::new(main), traced())
        .with_library(TreeLibrary::new().with(routine));
    assert_eq!(ctx.start(None), RunStatus::Running);
    assert_eq!(ctx.active_state_names(), ["RootA", "CallB", "RootB"]);
    assert!(log.ordered("RG.EnterState", "TB.EnterState"));

    ctx.tick(0.1);
    assert_eq!(ctx.active_state_names(), ["RootA", "Done"]);
    assert!(log.ordered("TB.ExitState", "RG.ExitState"));
    assert!(log.ordered("RG.ExitState", "TD.EnterState"));
}

#[test]
fn test_recursive_linked_assets_fail_start() {
    init_test_tracing();
    let a_id = DefinitionId::new();
    let b_id = DefinitionId::new();
    let a = TreeBuilder::new("a")
        .id(a_id)
        .state(StateDesc::new("RootA").child(StateDesc::linked_asset("CallB", b_id)))
        .build()
        .unwrap();
    let b = TreeBuilder::new("b")
        .id(b_id)
        .state(StateDesc::new("RootB").child(StateDesc::linked_asset("CallA", a_id)))
        .build()
        .unwrap();
    let mut ctx =
        ExecutionContext::with_config(Arc::new(a), traced()).with_library(TreeLibrary::new().with(Arc::new(b)));
    assert_eq!(ctx.start(None), RunStatus::Failed);
    let labels = ctx.trace().labels();
    assert!(labels.contains(&"SelectionFailed:CallA".to_string()));
    assert!(labels.contains(&"Stop:Failed".to_string()));
}

#[test]
fn test_missing_linked_asset_falls_through() {
    init_test_tracing();
    let tree = TreeBuilder::new("missing")
        .state(
            StateDesc::new("Root")
                .child(StateDesc::linked_asset("Call", DefinitionId::new()))
                .child(StateDesc::new("Fallback")),
        )
        .build()
        .unwrap();
    let ctx = running(tree);
    assert_eq!(ctx.active_state_names(), ["Root", "Fallback"]);
    assert!(ctx.trace().labels().contains(&"SelectionFailed:Call".to_string()));
}

#[test]
fn test_missing_context_fails_start() {
    init_test_tracing();
    let tree = TreeBuilder::new("context")
        .context(ContextDescriptor::external::<Clock>("Clock"))
        .state(StateDesc::new("Root"))
        .build()
        .unwrap();
    let tree = Arc::new(tree);
    let mut ctx = ExecutionContext::new(tree.clone());
    assert_eq!(ctx.start(None), RunStatus::Failed);

    let mut ctx = ExecutionContext::new(tree);
    ctx.context_mut().insert(Clock);
    assert_eq!(ctx.start(None), RunStatus::Running);
}

#[test]
fn test_frame_ids_are_not_reused() {
    init_test_tracing();
    let log = CallLog::new();
    let tree = TreeBuilder::new("frames")
        .state(
            StateDesc::new("Root")
                .child(
                    StateDesc::linked("Call", "Routine")
                        .transition(TransitionDesc::on_tick(TargetDesc::state("Call"))),
                ),
        )
        .state(StateDesc::subtree("Routine").task(NodeDesc::task(TestTask::new("TR", &log))))
        .build()
        .unwrap();
    let mut ctx = running(tree);
    let before = ctx.frame_ids();
    ctx.tick(0.1);
    // Reselecting the same linked state keeps its frame.
    assert_eq!(ctx.frame_ids(), before);

    ctx.stop();
    ctx.start(None);
    let after = ctx.frame_ids();
    assert_eq!(after.len(), 2);
    assert!(after.iter().all(|id| !before.contains(id)));
}

#[test]
fn test_trace_and_snapshot_follow_run() {
    init_test_tracing();
    let log = CallLog::new();
    let tree = Arc::new(two_step(&log));
    let mut ctx = ExecutionContext::with_config(tree.clone(), traced());
    ctx.start(None);
    ctx.tick(0.1);
    ctx.tick(0.1);

    let labels = ctx.trace().labels();
    assert_eq!(labels[0], "Start:two_step");
    assert!(labels.contains(&"Completed:A:Succeeded".to_string()));
    assert!(labels.contains(&"Transition:B".to_string()));

    let snapshot = ctx.snapshot();
    assert_eq!(snapshot.tick, 2);
    assert_eq!(snapshot.frames.len(), 1);
    let b = tree.state_by_name("B").and_then(|s| tree.state(s)).unwrap();
    assert!(snapshot.is_active(b.id));
    assert_eq!(snapshot.depth(), 2);
    let parsed = crate::snapshot::ExecutionSnapshot::from_json(&snapshot.to_json().unwrap()).unwrap();
    assert_eq!(parsed.frames, snapshot.frames);
}

#[test]
fn test_contexts_share_definition_across_threads() {
    init_test_tracing();
    let log = CallLog::new();
    let tree = Arc::new(two_step(&log));
    std::thread::scope(|scope| {
        for _ in 0..4 {
            let tree = tree.clone();
            scope.spawn(move || {
                let mut ctx = ExecutionContext::new(tree);
                ctx.start(None);
                ctx.tick(0.1);
                ctx.tick(0.1);
                assert_eq!(ctx.active_state_names(), ["Root", "B"]);
            });
        }
    });
    assert_eq!(log.count("TB.EnterState"), 4);
}

#[test]
fn test_state_completed_fires_once_while_held() {
    init_test_tracing();
    let log = CallLog::new();
    let tree = TreeBuilder::new("held")
        .state(
            StateDesc::new("A")
                .task(NodeDesc::task(TestTask::new("T", &log).ticks_to_completion(1)))
                .transition(TransitionDesc::on_tick(TargetDesc::None).priority(Priority::High))
                .transition(TransitionDesc::on_completed(TargetDesc::Succeeded)),
        )
        .build()
        .unwrap();
    let mut ctx = running(tree);
    for _ in 0..3 {
        ctx.tick(0.1);
    }
    assert_eq!(ctx.active_state_names(), ["A"]);
    assert_eq!(log.count("T.StateCompleted:Succeeded"), 1);
    assert_eq!(ctx.trace().labels().iter().filter(|l| l.starts_with("Completed:")).count(), 1);
}

#[test]
fn test_next_selectable_state_skips_blocked_sibling() {
    init_test_tracing();
    let log = CallLog::new();
    let tree = TreeBuilder::new("next_selectable")
        .state(
            StateDesc::new("Root")
                .child(
                    StateDesc::new("A")
                        .task(NodeDesc::task(TestTask::new("TA", &log).ticks_to_completion(1)))
                        .transition(TransitionDesc::on_completed(TargetDesc::NextSelectableState)),
                )
                .child(
                    StateDesc::new("B")
                        .enter_condition(NodeDesc::condition(TestCondition::new("CB", &log, false)))
                        .task(NodeDesc::task(TestTask::new("TB", &log))),
                )
                .child(StateDesc::new("C").task(NodeDesc::task(TestTask::new("TC", &log)))),
        )
        .build()
        .unwrap();
    let mut ctx = running(tree);
    ctx.tick(0.1);
    assert_eq!(ctx.active_state_names(), ["Root", "C"]);
    assert!(log.contains("CB.TestCondition"));
    assert!(!log.contains("TB.EnterState"));
    assert!(log.contains("TC.EnterState"));
}

/// Holds a counter other nodes write to through a reference.
struct Owner;

impl NodeBase for Owner {
    fn instance_type(&self) -> Option<Arc<StructType>> {
        Some(StructType::new(
            "OwnerData",
            vec![FieldDesc::new("Counter", ValueType::Int).with_default(Value::Int(0))],
        ))
    }
}

impl Task for Owner {
    fn flags(&self) -> TaskFlags {
        TaskFlags {
            should_call_tick: false,
            ..TaskFlags::default()
        }
    }
}

/// Adds 5 to whatever `Target` refers to on every tick.
struct Writer;

impl NodeBase for Writer {
    fn instance_type(&self) -> Option<Arc<StructType>> {
        Some(StructType::new(
            "WriterData",
            vec![FieldDesc::new("Target", ValueType::PropertyRef(Box::new(ValueType::Int)))],
        ))
    }
}

impl Task for Writer {
    fn tick(&self, ctx: &mut NodeContext<'_>, _delta_time: f32) -> RunStatus {
        if let Some(Value::Int(v)) = ctx.property_ref_mut("Target") {
            *v += 5;
        }
        RunStatus::Running
    }
}

#[test]
fn test_property_ref_writes_into_parent_task_data() {
    init_test_tracing();
    let tree = TreeBuilder::new("references")
        .state(
            StateDesc::new("Root").task(NodeDesc::task(Owner).named("Owner")).child(
                StateDesc::new("Work").task(NodeDesc::task(Writer).named("Writer").reference(
                    "Target",
                    BindingSource::Node("Owner".into()),
                    "Counter",
                )),
            ),
        )
        .build()
        .unwrap();
    let mut ctx = running(tree);
    ctx.tick(0.1);
    ctx.tick(0.1);
    assert_eq!(ctx.node_instance("Owner").unwrap().int("Counter"), Some(10));
}

#[test]
fn test_on_delegate_transition_follows_broadcast() {
    init_test_tracing();
    let log = CallLog::new();
    let build = |broadcast: bool| {
        let caller = if broadcast {
            TestTask::new("Caller", &log).broadcast_on_tick(DelegateId(0))
        } else {
            TestTask::new("Caller", &log)
        };
        TreeBuilder::new("on_delegate")
            .state(
                StateDesc::new("Root")
                    .task(NodeDesc::task(caller))
                    .child(
                        StateDesc::new("Wait")
                            .task(NodeDesc::task(TestTask::new("TW", &log)))
                            .transition(TransitionDesc::on_delegate(DelegateId(0), TargetDesc::state("Done"))),
                    )
                    .child(StateDesc::new("Done").task(NodeDesc::task(TestTask::new("TD", &log)))),
            )
            .build()
            .unwrap()
    };

    let mut quiet = running(build(false));
    quiet.tick(0.1);
    quiet.tick(0.1);
    assert_eq!(quiet.active_state_names(), ["Root", "Wait"]);

    let mut ctx = running(build(true));
    ctx.tick(0.1);
    assert_eq!(ctx.active_state_names(), ["Root", "Done"]);
    assert!(log.contains("TW.ExitState"));
}

#[test]
fn test_expired_delay_is_consumed_when_selection_fails() {
    init_test_tracing();
    let log = CallLog::new();
    let tree = TreeBuilder::new("blocked_delay")
        .state(
            StateDesc::new("Root")
                .child(
                    StateDesc::new("A")
                        .task(NodeDesc::task(TestTask::new("TA", &log)))
                        .transition(TransitionDesc::on_tick(TargetDesc::state("B")).delay(1.0, 0.0)),
                )
                .child(
                    StateDesc::new("B")
                        .enter_condition(NodeDesc::condition(TestCondition::new("CB", &log, false)))
                        .task(NodeDesc::task(TestTask::new("TB", &log))),
                ),
        )
        .build()
        .unwrap();
    let mut ctx = running(tree);
    ctx.tick(0.5);
    ctx.tick(0.6);
    assert_eq!(ctx.delayed_transitions().len(), 1);
    ctx.tick(0.5);
    assert!(ctx.delayed_transitions().is_empty());
    assert!(log.contains("CB.TestCondition"));
    assert_eq!(ctx.active_state_names(), ["Root", "A"]);

    ctx.tick(0.1);
    assert_eq!(ctx.delayed_transitions().len(), 1);
    assert_eq!(ctx.active_state_names(), ["Root", "A"]);
}
