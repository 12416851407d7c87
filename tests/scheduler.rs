mod common;

use async_trait::async_trait;
use common::{Scripted, Step, init_tracing, obj};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use storyloom::{
    Agent, AgentOutput, CompletionLedger, FanOutGroup, PlanOutcome, PlannerError, RetryPolicy,
    Scheduler, SchedulerConfig, Task, TaskContext, TaskStatus, Validation, render_graph,
};
use tokio_util::sync::CancellationToken;

fn scheduler() -> Scheduler {
    Scheduler::default()
}

fn passes_of(report: &storyloom::PlanReport, task: &str) -> Vec<usize> {
    report
        .trace
        .iter()
        .filter(|a| a.task == task)
        .map(|a| a.pass)
        .collect()
}

fn wildcard_plan() -> (Vec<Task>, Arc<Scripted>) {
    let c = Arc::new(Scripted::ok("c", json!({"summary": "done"})));
    let tasks = vec![
        Task::new("A", Arc::new(Scripted::ok("a", json!({"a": 1})))).priority(10),
        Task::new("B", Arc::new(Scripted::ok("b", json!({"b": 2})))).depends_on("A"),
        Task::new("C", c.clone()).depends_on("scene_*"),
        Task::new("scene_1", Arc::new(Scripted::ok("s1", json!({"scene_1": "x"})))).depends_on("B"),
        Task::new("scene_2", Arc::new(Scripted::ok("s2", json!({"scene_2": "y"})))).depends_on("B"),
    ];
    (tasks, c)
}

#[tokio::test]
async fn wildcard_plan_completes_in_four_passes() {
    init_tracing();
    let (tasks, c) = wildcard_plan();

    let report = scheduler()
        .execute_plan(CancellationToken::new(), tasks)
        .await
        .unwrap();

    assert_eq!(report.outcome, PlanOutcome::AllCompleted);
    assert_eq!(report.iteration_count, 4);
    assert_eq!(report.completed_count, 5);
    assert_eq!(report.failed_count, 0);

    assert_eq!(passes_of(&report, "A"), vec![1]);
    assert_eq!(passes_of(&report, "B"), vec![2]);
    assert_eq!(passes_of(&report, "scene_1"), vec![3]);
    assert_eq!(passes_of(&report, "scene_2"), vec![3]);
    assert_eq!(passes_of(&report, "C"), vec![4]);
    assert_eq!(
        report.completion_order(),
        vec!["A", "B", "scene_1", "scene_2", "C"]
    );

    // Both scenes completed before C became ready, so both outputs arrived.
    let seen = c.last_context().unwrap();
    assert_eq!(seen.get("scene_1"), Some(&json!("x")));
    assert_eq!(seen.get("scene_2"), Some(&json!("y")));
    assert_eq!(report.output("C"), Some(&obj(json!({"summary": "done"}))));
}

#[tokio::test]
async fn exhausted_budget_stays_failed_with_every_error() {
    init_tracing();
    let agent = Arc::new(Scripted::failing("x", "boom"));
    let tasks = vec![Task::new("X", agent.clone()).max_iterations(2)];

    let report = scheduler()
        .execute_plan(CancellationToken::new(), tasks)
        .await
        .unwrap();

    let x = report.task_status("X").unwrap();
    assert_eq!(x.status, TaskStatus::Failed);
    assert_eq!(x.iteration_count, 2);
    assert_eq!(
        x.errors,
        vec![
            "Task execution failed: boom".to_string(),
            "Task execution failed: boom".to_string()
        ]
    );
    assert_eq!(agent.calls(), 2);
    assert_eq!(report.failed_count, 1);
    assert_eq!(
        report.outcome,
        PlanOutcome::PartialFailure {
            failed: vec!["X".into()],
            skipped: vec![]
        }
    );
    assert!(report.iteration_count <= SchedulerConfig::default().max_global_iterations);
}

#[tokio::test]
async fn outputs_merge_into_existing_context_in_order() {
    let reader = Arc::new(Scripted::ok("reader", json!({})));
    let tasks = vec![
        Task::new("producer", Arc::new(Scripted::ok("p", json!({"arcs": [1], "own": "overwritten"})))),
        Task::new("reader", reader.clone())
            .with_context(obj(json!({"own": "initial", "seed": true})))
            .depends_on("producer"),
    ];

    scheduler()
        .execute_plan(CancellationToken::new(), tasks)
        .await
        .unwrap();

    let seen = reader.last_context().unwrap();
    let keys: Vec<_> = seen.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["own", "seed", "arcs"]);
    assert_eq!(seen.get("own"), Some(&json!("overwritten")));
    assert_eq!(seen.get("seed"), Some(&json!(true)));
}

#[tokio::test]
async fn rejected_result_is_retried() {
    let agent = Arc::new(Scripted::new(
        "picky",
        vec![
            Step::Succeed(obj(json!({"ok": false}))),
            Step::Succeed(obj(json!({"ok": true}))),
        ],
    ));
    let tasks = vec![Task::new("picky", agent.clone()).validator(|result| {
        if result.get("ok") == Some(&json!(true)) {
            Validation::ok()
        } else {
            Validation::invalid("not ok")
        }
    })];

    let report = scheduler()
        .execute_plan(CancellationToken::new(), tasks)
        .await
        .unwrap();

    let picky = report.task_status("picky").unwrap();
    assert_eq!(picky.status, TaskStatus::Completed);
    assert_eq!(picky.iteration_count, 2);
    assert_eq!(picky.errors, vec!["Validation failed: not ok".to_string()]);
    assert_eq!(report.output("picky").and_then(|o| o.get("ok")), Some(&json!(true)));
    assert_eq!(report.iteration_count, 2);
}

#[tokio::test]
async fn slow_attempt_times_out() {
    let config = SchedulerConfig {
        task_timeout_secs: Some(1),
        ..SchedulerConfig::default()
    };
    let slow = Scripted::ok("slow", json!({})).delayed(Duration::from_secs(3));
    let tasks = vec![Task::new("slow", Arc::new(slow)).max_iterations(1)];

    let report = Scheduler::new(config)
        .execute_plan(CancellationToken::new(), tasks)
        .await
        .unwrap();

    let slow = report.task_status("slow").unwrap();
    assert_eq!(slow.status, TaskStatus::Failed);
    assert_eq!(slow.errors, vec!["Task timed out after 1s".to_string()]);
}

fn cyclic_plan() -> Vec<Task> {
    vec![
        Task::new("a", Arc::new(Scripted::ok("a", json!({})))).depends_on("c"),
        Task::new("b", Arc::new(Scripted::ok("b", json!({})))).depends_on("a"),
        Task::new("c", Arc::new(Scripted::ok("c", json!({})))).depends_on("b"),
        Task::new("free", Arc::new(Scripted::ok("free", json!({})))),
    ]
}

#[tokio::test]
async fn cycles_fail_fast() {
    let err = scheduler()
        .execute_plan(CancellationToken::new(), cyclic_plan())
        .await
        .unwrap_err();
    match err {
        PlannerError::CircularDependency(path) => {
            assert_eq!(path.first(), path.last());
            assert_eq!(path.len(), 4);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn cycles_are_reported_stuck_when_detection_is_off() {
    let config = SchedulerConfig {
        detect_cycles: false,
        ..SchedulerConfig::default()
    };
    let report = Scheduler::new(config)
        .execute_plan(CancellationToken::new(), cyclic_plan())
        .await
        .unwrap();

    assert_eq!(
        report.outcome,
        PlanOutcome::Stuck {
            pending: vec!["a".into(), "b".into(), "c".into()]
        }
    );
    assert_eq!(report.iteration_count, 2);
    assert_eq!(report.completed_count, 1);
    assert_eq!(report.status().pending, 3);
}

#[tokio::test]
async fn failure_starves_dependents_without_crashing() {
    let tasks = vec![
        Task::new("x", Arc::new(Scripted::failing("x", "nope"))).max_iterations(1),
        Task::new("y", Arc::new(Scripted::ok("y", json!({})))).depends_on("x"),
        Task::new("z", Arc::new(Scripted::ok("z", json!({})))).depends_on("y"),
        Task::new("w", Arc::new(Scripted::ok("w", json!({})))),
    ];

    let report = scheduler()
        .execute_plan(CancellationToken::new(), tasks)
        .await
        .unwrap();

    assert_eq!(
        report.outcome,
        PlanOutcome::PartialFailure {
            failed: vec!["x".into()],
            skipped: vec!["y".into(), "z".into()]
        }
    );
    assert_eq!(report.task_status("w").unwrap().status, TaskStatus::Completed);
    assert_eq!(report.skipped_tasks().count(), 2);
    assert_eq!(report.iteration_count, 2);
}

#[tokio::test]
async fn unknown_dependency_is_stuck() {
    let tasks = vec![Task::new("lonely", Arc::new(Scripted::ok("l", json!({})))).depends_on("ghost")];
    let report = scheduler()
        .execute_plan(CancellationToken::new(), tasks)
        .await
        .unwrap();
    assert_eq!(
        report.outcome,
        PlanOutcome::Stuck {
            pending: vec!["lonely".into()]
        }
    );
    assert_eq!(report.iteration_count, 1);
}

#[tokio::test]
async fn pass_limit_bounds_retries() {
    let config = SchedulerConfig {
        max_global_iterations: 2,
        ..SchedulerConfig::default()
    };
    let tasks = vec![Task::new("x", Arc::new(Scripted::failing("x", "again"))).max_iterations(5)];

    let report = Scheduler::new(config)
        .execute_plan(CancellationToken::new(), tasks)
        .await
        .unwrap();

    assert_eq!(
        report.outcome,
        PlanOutcome::PartialFailure {
            failed: vec!["x".into()],
            skipped: vec![],
        }
    );
    assert_eq!(report.iteration_count, 2);
    assert_eq!(report.failed_count, 1);
    let x = report.task_status("x").unwrap();
    assert_eq!(x.status, TaskStatus::Failed);
    assert_eq!(x.iteration_count, 2);
    assert_eq!(x.errors.len(), 2);
}

#[tokio::test]
async fn pass_limit_leaves_unstarted_tasks_pending() {
    let config = SchedulerConfig {
        max_global_iterations: 2,
        ..SchedulerConfig::default()
    };
    let agent = || Arc::new(Scripted::ok("step", json!({})));
    let tasks = vec![
        Task::new("one", agent()),
        Task::new("two", agent()).depends_on("one"),
        Task::new("three", agent()).depends_on("two"),
    ];

    let report = Scheduler::new(config)
        .execute_plan(CancellationToken::new(), tasks)
        .await
        .unwrap();

    assert_eq!(
        report.outcome,
        PlanOutcome::PassesExhausted {
            pending: vec!["three".into()]
        }
    );
    assert_eq!(report.status().pending, 1);
}

#[tokio::test]
async fn ready_tasks_run_by_descending_priority() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let agent = |name: &str| Arc::new(Scripted::ok(name, json!({})).logging_to(log.clone()));
    let tasks = vec![
        Task::new("low", agent("low")).priority(1),
        Task::new("tie_first", agent("tie_first")).priority(5),
        Task::new("high", agent("high")).priority(9),
        Task::new("tie_second", agent("tie_second")).priority(5),
    ];

    scheduler()
        .execute_plan(CancellationToken::new(), tasks)
        .await
        .unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec!["high", "tie_first", "tie_second", "low"]
    );
}

#[tokio::test]
async fn concurrent_batches_apply_outcomes_in_priority_order() {
    let config = SchedulerConfig {
        max_concurrency: 3,
        ..SchedulerConfig::default()
    };
    let slow = |name: &str| Arc::new(Scripted::ok(name, json!({name: true})).delayed(Duration::from_millis(200)));
    let sink = Arc::new(Scripted::ok("sink", json!({})));
    let tasks = vec![
        Task::new("p1", slow("p1")).priority(1),
        Task::new("p3", slow("p3")).priority(3),
        Task::new("p2", slow("p2")).priority(2),
        Task::new("sink", sink.clone()).depends_on("p*"),
    ];

    let started = Instant::now();
    let report = Scheduler::new(config)
        .execute_plan(CancellationToken::new(), tasks)
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_millis(550));
    assert_eq!(report.completion_order(), vec!["p3", "p2", "p1", "sink"]);
    let seen = sink.last_context().unwrap();
    assert_eq!(seen.keys().map(String::as_str).collect::<Vec<_>>(), vec!["p3", "p2", "p1"]);
}

#[tokio::test]
async fn group_dependency_waits_for_every_member() {
    let group = FanOutGroup::new("scenes");
    let flaky = Scripted::new(
        "s2",
        vec![Step::Fail("flaky".into()), Step::Succeed(obj(json!({"s2": 2})))],
    );
    let review = Arc::new(Scripted::ok("review", json!({})));
    let tasks = vec![
        Task::new("s1", Arc::new(Scripted::ok("s1", json!({"s1": 1})))).in_group(group.clone()),
        Task::new("s2", Arc::new(flaky)).in_group(group.clone()),
        Task::new("review", review.clone()).depends_on(group),
    ];

    let report = scheduler()
        .execute_plan(CancellationToken::new(), tasks)
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(passes_of(&report, "s2"), vec![1, 2]);
    assert_eq!(passes_of(&report, "review"), vec![3]);
    let seen = review.last_context().unwrap();
    assert_eq!(seen.get("s1"), Some(&json!(1)));
    assert_eq!(seen.get("s2"), Some(&json!(2)));
}

#[tokio::test]
async fn failed_group_member_skips_group_dependents() {
    let group = FanOutGroup::new("scenes");
    let tasks = vec![
        Task::new("s1", Arc::new(Scripted::ok("s1", json!({})))).in_group(group.clone()),
        Task::new("s2", Arc::new(Scripted::failing("s2", "bad"))).in_group(group.clone()).max_iterations(1),
        Task::new("review", Arc::new(Scripted::ok("review", json!({})))).depends_on(group),
    ];

    let report = scheduler()
        .execute_plan(CancellationToken::new(), tasks)
        .await
        .unwrap();

    assert_eq!(
        report.outcome,
        PlanOutcome::PartialFailure {
            failed: vec!["s2".into()],
            skipped: vec!["review".into()]
        }
    );
}

#[tokio::test]
async fn prior_ledger_satisfies_cross_run_dependencies() {
    let first = scheduler()
        .execute_plan(
            CancellationToken::new(),
            vec![Task::new("outline_architect", Arc::new(Scripted::ok("oa", json!({"arcs": []}))))],
        )
        .await
        .unwrap();

    let follow_up = || {
        vec![
            Task::new("character_planner", Arc::new(Scripted::ok("cp", json!({}))))
                .depends_on("outline_architect")
                .expects(["arcs"]),
        ]
    };

    let report = scheduler()
        .execute_plan_with(CancellationToken::new(), follow_up(), &first.ledger)
        .await
        .unwrap();
    assert!(report.is_success());
    assert!(report.ledger.is_completed("outline_architect"));
    assert!(report.ledger.is_completed("character_planner"));

    let err = scheduler()
        .execute_plan_with(CancellationToken::new(), follow_up(), &CompletionLedger::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PlannerError::UndeclaredInput { .. }));
}

#[tokio::test]
async fn prior_failures_skip_dependents() {
    let mut prior = CompletionLedger::new();
    prior.mark_failed("outline_architect");

    let report = scheduler()
        .execute_plan_with(
            CancellationToken::new(),
            vec![Task::new("character_planner", Arc::new(Scripted::ok("cp", json!({})))).depends_on("outline_architect")],
            &prior,
        )
        .await
        .unwrap();

    assert_eq!(
        report.outcome,
        PlanOutcome::PartialFailure {
            failed: vec![],
            skipped: vec!["character_planner".into()]
        }
    );
}

#[tokio::test]
async fn cancellation_aborts_the_run() {
    let ctx = CancellationToken::new();
    ctx.cancel();
    let err = scheduler()
        .execute_plan(ctx, vec![Task::new("a", Arc::new(Scripted::ok("a", json!({}))))])
        .await
        .unwrap_err();
    assert!(matches!(err, PlannerError::Cancelled(_)));

    let ctx = CancellationToken::new();
    let trigger = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let slow = Scripted::ok("slow", json!({})).delayed(Duration::from_secs(5));
    let started = Instant::now();
    let err = scheduler()
        .execute_plan(ctx, vec![Task::new("slow", Arc::new(slow))])
        .await
        .unwrap_err();
    assert!(matches!(err, PlannerError::Cancelled(_)));
    assert!(started.elapsed() < Duration::from_secs(2));
}

/// Ignores cancellation and flags when its work actually finished.
struct Stubborn {
    finished: Arc<AtomicBool>,
}

#[async_trait]
impl Agent for Stubborn {
    fn name(&self) -> &str {
        "stubborn"
    }

    async fn execute(
        &self,
        _ctx: CancellationToken,
        _context: &TaskContext,
    ) -> Result<AgentOutput, PlannerError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(AgentOutput::success(TaskContext::new()))
    }
}

#[tokio::test]
async fn cancelling_a_concurrent_batch_aborts_in_flight_agents() {
    let finished = Arc::new(AtomicBool::new(false));
    let agent = Arc::new(Stubborn {
        finished: finished.clone(),
    });
    let tasks = vec![
        Task::new("left", agent.clone()),
        Task::new("right", agent),
    ];
    let config = SchedulerConfig {
        max_concurrency: 2,
        ..SchedulerConfig::default()
    };

    let ctx = CancellationToken::new();
    let trigger = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let err = Scheduler::new(config).execute_plan(ctx, tasks).await.unwrap_err();
    assert!(matches!(err, PlannerError::Cancelled(_)));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!finished.load(Ordering::SeqCst));
}

#[tokio::test]
async fn malformed_plans_are_rejected() {
    let dupes = vec![
        Task::new("a", Arc::new(Scripted::ok("a", json!({})))),
        Task::new("a", Arc::new(Scripted::ok("a", json!({})))),
    ];
    let err = scheduler()
        .execute_plan(CancellationToken::new(), dupes)
        .await
        .unwrap_err();
    assert!(matches!(err, PlannerError::DuplicateTask(ref name) if name == "a"));

    let undeclared = vec![
        Task::new("producer", Arc::new(Scripted::ok("p", json!({})).declaring(&["themes"]))),
        Task::new("consumer", Arc::new(Scripted::ok("c", json!({}))))
            .depends_on("producer")
            .expects(["arcs"]),
    ];
    let err = scheduler()
        .execute_plan(CancellationToken::new(), undeclared)
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Task consumer expects context key 'arcs' that no dependency can produce"
    );
}

#[tokio::test]
async fn retry_backoff_waits_between_passes() {
    let config = SchedulerConfig {
        retry: RetryPolicy {
            interval_ms: 80,
            ..RetryPolicy::default()
        },
        ..SchedulerConfig::default()
    };
    let flaky = Scripted::new(
        "flaky",
        vec![Step::Fail("first".into()), Step::Succeed(obj(json!({})))],
    );

    let started = Instant::now();
    let report = Scheduler::new(config)
        .execute_plan(CancellationToken::new(), vec![Task::new("flaky", Arc::new(flaky))])
        .await
        .unwrap();

    assert!(report.is_success());
    assert!(started.elapsed() >= Duration::from_millis(80));
}

#[test]
fn graph_and_execution_order_render() {
    let (tasks, _) = wildcard_plan();
    let graph = render_graph(&tasks);
    assert!(graph.starts_with("A\n  └─> B\n"));
    assert!(graph.contains("      └─> scene_1\n          └─> C\n"));
}

#[tokio::test]
async fn execution_order_lists_every_attempt() {
    let tasks = vec![
        Task::new(
            "flaky",
            Arc::new(Scripted::new(
                "flaky",
                vec![Step::Fail("first".into()), Step::Succeed(obj(json!({})))],
            )),
        ),
    ];
    let report = scheduler()
        .execute_plan(CancellationToken::new(), tasks)
        .await
        .unwrap();
    assert_eq!(
        report.execution_order(),
        "\n1. [pass 1] flaky (attempt 1) failed: Task execution failed: first\n2. [pass 2] flaky (attempt 2) ok\n"
    );
}
