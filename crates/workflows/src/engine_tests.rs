// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::definition::{PollStatus, RetryPolicy, StepDef, WorkflowBuilder};
use dk_core::SequentialIdGen;
use dk_events::EventBusConfig;
use dk_jobs::{JobsConfig, JobsEngine};
use dk_logs::test_support::MemoryLogStore;
use dk_logs::{LogsConfig, PersistentLogs};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

struct Harness {
    engine: WorkflowEngine,
    store: Store,
    bus: EventBus,
    jobs: Option<JobsEngine>,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    build_harness(false)
}

fn harness_with_jobs() -> Harness {
    build_harness(true)
}

fn build_harness(with_jobs: bool) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();
    let bus = EventBus::new(EventBusConfig::default());
    let logs = PersistentLogs::new(
        Arc::new(MemoryLogStore::new()),
        bus.clone(),
        LogsConfig::default(),
    );
    let jobs = with_jobs.then(|| {
        let config = JobsConfig {
            poll_interval: Duration::from_millis(10),
            ..JobsConfig::default()
        };
        JobsEngine::new(store.clone(), bus.clone(), logs.clone(), config)
    });
    let engine = WorkflowEngine::with_deps(
        store.clone(),
        bus.clone(),
        logs,
        jobs.clone(),
        WorkflowsConfig::new(dir.path().join("sockets")),
        dk_core::SystemClock,
        SequentialIdGen::new(),
    );
    Harness {
        engine,
        store,
        bus,
        jobs,
        _dir: dir,
    }
}

fn event_names(bus: &EventBus) -> Vec<String> {
    bus.get_history("*", None)
        .into_iter()
        .map(|r| r.name)
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn linear_workflow_completes_with_forwarded_outputs() {
    let h = harness();
    let def = WorkflowBuilder::new("greet")
        .isolated(false)
        .step(
            StepDef::task("validate", |ctx| async move {
                let name = ctx.input["name"].as_str().unwrap_or_default().to_string();
                Ok(json!({ "name": name, "ok": true }))
            })
            .next("send"),
        )
        .step(
            StepDef::task("send", |_ctx| async move { Ok(json!({ "sent": true })) }).next("done"),
        )
        .step(StepDef::pass("done").end())
        .build()
        .unwrap();
    h.engine.register(def);

    let id = h.engine.run("greet", json!({"name": "ada"})).unwrap();
    let instance = h.engine.wait(&id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(instance.output, Some(json!({"sent": true})));
    assert!(instance.current_step.is_none());

    for step in ["validate", "send", "done"] {
        let result = &instance.step_results[step];
        assert_eq!(result.status, StepStatus::Completed, "step {step}");
        assert_eq!(result.attempts, 1);
    }
    assert_eq!(
        instance.step_results["validate"].output,
        Some(json!({"name": "ada", "ok": true}))
    );
    assert_eq!(instance.step_results["validate"].input, json!({"name": "ada"}));
    assert_eq!(instance.step_results["send"].input, json!({"name": "ada", "ok": true}));

    // Progress climbs monotonically to 100
    let percents: Vec<u64> = h
        .bus
        .get_history("workflow.progress", None)
        .iter()
        .map(|r| r.data["percent"].as_u64().unwrap())
        .collect();
    assert_eq!(percents, vec![33, 66, 100]);

    assert_eq!(h.bus.get_history("workflow.started", None).len(), 1);
    assert_eq!(h.bus.get_history("workflow.completed", None).len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_step_retries_then_succeeds() {
    let h = harness();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let def = WorkflowBuilder::new("retryme")
        .isolated(false)
        .step(
            StepDef::task("step", move |_ctx| {
                let seen = Arc::clone(&seen);
                async move {
                    if seen.fetch_add(1, AtomicOrdering::SeqCst) == 0 {
                        Err("first attempt fails".into())
                    } else {
                        Ok(json!(42))
                    }
                }
            })
            .retry(RetryPolicy::new(2, 10, 2.0))
            .end(),
        )
        .build()
        .unwrap();
    h.engine.register(def);

    let id = h.engine.run("retryme", json!({})).unwrap();
    let instance = h.engine.wait(&id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(instance.output, Some(json!(42)));
    assert_eq!(instance.step_results["step"].attempts, 2);

    let retries = h.bus.get_history("workflow.step.retry", None);
    assert_eq!(retries.len(), 1);
    assert_eq!(retries[0].data["attempt"], json!(1));

    // The retry event precedes the completion event
    let names = event_names(&h.bus);
    let retry_at = names.iter().position(|n| n == "workflow.step.retry").unwrap();
    let done_at = names
        .iter()
        .position(|n| n == "workflow.step.completed")
        .unwrap();
    assert!(retry_at < done_at);
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_budget_exhaustion_fails_workflow() {
    let h = harness();
    let def = WorkflowBuilder::new("doomed")
        .isolated(false)
        .step(
            StepDef::task("step", |_ctx| async move { Err("always broken".into()) })
                .retry(RetryPolicy::new(2, 1, 1.0))
                .end(),
        )
        .build()
        .unwrap();
    h.engine.register(def);

    let id = h.engine.run("doomed", json!({})).unwrap();
    let instance = h.engine.wait(&id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(instance.status, WorkflowStatus::Failed);
    assert!(instance.error.as_deref().unwrap().contains("always broken"));
    assert_eq!(instance.step_results["step"].status, StepStatus::Failed);
    assert_eq!(instance.step_results["step"].attempts, 2);
    assert_eq!(h.bus.get_history("workflow.step.failed", None).len(), 1);
    assert_eq!(h.bus.get_history("workflow.failed", None).len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn poll_completes_after_three_checks() {
    let h = harness();
    let checks = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&checks);
    let def = WorkflowBuilder::new("poller")
        .isolated(false)
        .step(
            StepDef::poll("wait", Duration::from_millis(5), move |_input, _ctx| {
                let seen = Arc::clone(&seen);
                async move {
                    if seen.fetch_add(1, AtomicOrdering::SeqCst) + 1 >= 3 {
                        Ok(PollStatus::done(json!({"ok": true})))
                    } else {
                        Ok(PollStatus::pending())
                    }
                }
            })
            .end(),
        )
        .build()
        .unwrap();
    h.engine.register(def);

    let id = h.engine.run("poller", json!({})).unwrap();
    let instance = h.engine.wait(&id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(instance.output, Some(json!({"ok": true})));
    assert_eq!(instance.step_results["wait"].poll_count, 3);

    let polls = h.bus.get_history("workflow.step.poll", None);
    assert_eq!(polls.len(), 3);
    assert_eq!(polls[0].data["done"], json!(false));
    assert_eq!(polls[2].data["done"], json!(true));
    assert_eq!(polls[2].data["pollCount"], json!(3));
}

#[tokio::test(flavor = "multi_thread")]
async fn poll_gives_up_after_max_attempts() {
    let h = harness();
    let def = WorkflowBuilder::new("stuck")
        .isolated(false)
        .step(
            StepDef::poll("wait", Duration::from_millis(2), |_input, _ctx| async move {
                Ok(PollStatus::pending())
            })
            .poll_max_attempts(4)
            .end(),
        )
        .build()
        .unwrap();
    h.engine.register(def);

    let id = h.engine.run("stuck", json!({})).unwrap();
    let instance = h.engine.wait(&id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(instance.status, WorkflowStatus::Failed);
    assert_eq!(instance.step_results["wait"].poll_count, 4);
    assert!(instance.error.as_deref().unwrap().contains("4 attempts"));
}

#[tokio::test(flavor = "multi_thread")]
async fn loop_reaches_condition_then_proceeds() {
    let h = harness();
    let def = WorkflowBuilder::new("counter")
        .isolated(false)
        .step(
            StepDef::task("increment", |ctx| async move {
                let count = ctx
                    .step_output("increment")
                    .and_then(|v| v["count"].as_i64())
                    .unwrap_or(0);
                Ok(json!({ "count": count + 1 }))
            })
            .next("repeat"),
        )
        .step(
            StepDef::loop_step(
                "repeat",
                |ctx| {
                    ctx.step_output("increment")
                        .and_then(|v| v["count"].as_i64())
                        .unwrap_or(0)
                        < 3
                },
                "increment",
            )
            .loop_interval(Duration::from_millis(5))
            .end(),
        )
        .build()
        .unwrap();
    h.engine.register(def);

    let id = h.engine.run("counter", json!({})).unwrap();
    let instance = h.engine.wait(&id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(instance.step_results["repeat"].loop_count, 2);
    assert_eq!(instance.step_results["increment"].attempts, 3);
    assert_eq!(
        instance.step_results["increment"].output,
        Some(json!({"count": 3}))
    );
    assert_eq!(h.bus.get_history("workflow.step.loop", None).len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn loop_iteration_cap_fails_the_workflow() {
    let h = harness();
    let def = WorkflowBuilder::new("spinner")
        .isolated(false)
        .step(StepDef::task("spin", |_ctx| async move { Ok(json!(null)) }).next("again"))
        .step(
            StepDef::loop_step("again", |_ctx| true, "spin")
                .max_iterations(3)
                .end(),
        )
        .build()
        .unwrap();
    h.engine.register(def);

    let id = h.engine.run("spinner", json!({})).unwrap();
    let instance = h.engine.wait(&id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(instance.status, WorkflowStatus::Failed);
    assert!(instance.error.as_deref().unwrap().contains("3 iterations"));
    assert_eq!(instance.step_results["again"].loop_count, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn choice_selects_first_matching_arm() {
    let h = harness();
    let def = WorkflowBuilder::new("router")
        .isolated(false)
        .step(
            StepDef::choice("route")
                .when(|ctx| ctx.input["n"].as_i64().unwrap_or(0) > 5, "big")
                .otherwise("small"),
        )
        .step(StepDef::pass("big").result(json!("big value")).end())
        .step(StepDef::pass("small").result(json!("small value")).end())
        .build()
        .unwrap();
    h.engine.register(def);

    let id = h.engine.run("router", json!({"n": 10})).unwrap();
    let instance = h.engine.wait(&id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(instance.output, Some(json!("big value")));
    assert!(instance.step_results.contains_key("big"));
    assert!(
        !instance.step_results.contains_key("small"),
        "unchosen arm never executes"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn choice_without_match_or_default_fails() {
    let h = harness();
    let def = WorkflowBuilder::new("deadend")
        .isolated(false)
        .step(StepDef::choice("route").when(|_| false, "unreached"))
        .step(StepDef::pass("unreached").end())
        .build()
        .unwrap();
    h.engine.register(def);

    let id = h.engine.run("deadend", json!({})).unwrap();
    let instance = h.engine.wait(&id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(instance.status, WorkflowStatus::Failed);
    assert!(instance.error.as_deref().unwrap().contains("no choice"));
}

fn branch_def(name: &str, body: StepDef) -> WorkflowDefinition {
    WorkflowBuilder::new(name)
        .isolated(false)
        .step(body)
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn parallel_wait_all_gathers_branch_outputs() {
    let h = harness();
    let def = WorkflowBuilder::new("fanout")
        .isolated(false)
        .step(
            StepDef::parallel(
                "split",
                vec![
                    (
                        "left",
                        branch_def(
                            "left-wf",
                            StepDef::task("go", |_ctx| async move { Ok(json!("L")) }).end(),
                        ),
                    ),
                    (
                        "right",
                        branch_def(
                            "right-wf",
                            StepDef::task("go", |_ctx| async move { Ok(json!("R")) }).end(),
                        ),
                    ),
                ],
            )
            .wait_all()
            .end(),
        )
        .build()
        .unwrap();
    h.engine.register(def);

    let id = h.engine.run("fanout", json!({"seed": 1})).unwrap();
    let instance = h.engine.wait(&id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(instance.output, Some(json!({"left": "L", "right": "R"})));

    let child_ids = &instance.branch_instances["split"];
    assert_eq!(child_ids.len(), 2);
    for child_id in child_ids {
        let child = h.store.instance(child_id).unwrap();
        assert_eq!(child.status, WorkflowStatus::Completed);
        assert_eq!(child.parent_id.as_deref(), Some(instance.id.as_str()));
        assert!(child.branch_name.is_some());
        assert_eq!(child.input, json!({"seed": 1}));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn parallel_fail_fast_cancels_remaining_branches() {
    let h = harness();
    let def = WorkflowBuilder::new("fragile")
        .isolated(false)
        .step(
            StepDef::parallel(
                "split",
                vec![
                    (
                        "fails",
                        branch_def(
                            "fails-wf",
                            StepDef::task("boom", |_ctx| async move {
                                tokio::time::sleep(Duration::from_millis(10)).await;
                                Err("branch exploded".into())
                            })
                            .end(),
                        ),
                    ),
                    (
                        "slow",
                        branch_def(
                            "slow-wf",
                            StepDef::task("sleepy", |_ctx| async move {
                                tokio::time::sleep(Duration::from_millis(500)).await;
                                Ok(json!("never"))
                            })
                            .end(),
                        ),
                    ),
                ],
            )
            .end(),
        )
        .build()
        .unwrap();
    h.engine.register(def);

    let id = h.engine.run("fragile", json!({})).unwrap();
    let instance = h.engine.wait(&id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(instance.status, WorkflowStatus::Failed);
    assert!(instance.error.as_deref().unwrap().contains("branch exploded"));

    let children: Vec<WorkflowInstance> = instance.branch_instances["split"]
        .iter()
        .map(|id| h.store.instance(id).unwrap())
        .collect();
    let statuses: Vec<WorkflowStatus> = children.iter().map(|c| c.status).collect();
    assert!(statuses.contains(&WorkflowStatus::Failed));
    assert!(
        statuses.contains(&WorkflowStatus::Cancelled),
        "sibling observed cancellation, got {statuses:?}"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn workflow_timeout_marks_timed_out() {
    let h = harness();
    let def = WorkflowBuilder::new("slowpoke")
        .isolated(false)
        .timeout(Duration::from_millis(50))
        .step(
            StepDef::task("nap", |_ctx| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!(null))
            })
            .end(),
        )
        .build()
        .unwrap();
    h.engine.register(def);

    let id = h.engine.run("slowpoke", json!({})).unwrap();
    let instance = h.engine.wait(&id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(instance.status, WorkflowStatus::TimedOut);
    assert_eq!(instance.error.as_deref(), Some("Workflow timed out"));
    assert_eq!(h.bus.get_history("workflow.failed", None).len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn step_timeout_bounds_a_single_attempt() {
    let h = harness();
    let def = WorkflowBuilder::new("bounded")
        .isolated(false)
        .step(
            StepDef::task("nap", |_ctx| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!(null))
            })
            .timeout(Duration::from_millis(20))
            .end(),
        )
        .build()
        .unwrap();
    h.engine.register(def);

    let id = h.engine.run("bounded", json!({})).unwrap();
    let instance = h.engine.wait(&id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(instance.status, WorkflowStatus::Failed);
    assert!(instance.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(instance.step_results["nap"].status, StepStatus::Failed);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_stops_the_instance_and_discards_late_completion() {
    let h = harness();
    let def = WorkflowBuilder::new("cancellable")
        .isolated(false)
        .step(
            StepDef::task("nap", |_ctx| async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(json!("late result"))
            })
            .end(),
        )
        .build()
        .unwrap();
    h.engine.register(def);

    let id = h.engine.run("cancellable", json!({})).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(h.engine.cancel(&id).await.unwrap());

    tokio::time::sleep(Duration::from_millis(400)).await;
    let instance = h.engine.get(&id).unwrap();
    assert_eq!(instance.status, WorkflowStatus::Cancelled);
    assert!(instance.output.is_none(), "late completion is ignored");
    assert_eq!(h.bus.get_history("workflow.cancelled", None).len(), 1);

    // Cancelling a terminal instance is a no-op
    assert!(!h.engine.cancel(&id).await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn resume_blocking_reuses_completed_step_outputs() {
    let h = harness();
    let reran_first = Arc::new(AtomicUsize::new(0));
    let flag = Arc::clone(&reran_first);
    let def = WorkflowBuilder::new("restartable")
        .isolated(false)
        .step(
            StepDef::task("first", move |_ctx| {
                let flag = Arc::clone(&flag);
                async move {
                    flag.fetch_add(1, AtomicOrdering::SeqCst);
                    Ok(json!("fresh first"))
                }
            })
            .next("second"),
        )
        .step(
            StepDef::task("second", |ctx| async move {
                Ok(json!({ "combined": ctx.prev }))
            })
            .end(),
        )
        .build()
        .unwrap();
    h.engine.register(def);

    // A row stranded mid-run by a previous process: first completed, second not
    let mut stranded = dk_core::test_support::running_instance("wf_stranded", "restartable", "second");
    let mut first = dk_core::StepResult::new("first");
    first.status = StepStatus::Completed;
    first.output = Some(json!("recorded first"));
    stranded.step_results.insert("first".to_string(), first);
    h.store.upsert_instance(stranded).unwrap();

    h.engine.resume(dk_core::ResumeStrategy::Blocking).await.unwrap();

    let instance = h.engine.get("wf_stranded").unwrap();
    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(
        instance.output,
        Some(json!({"combined": "recorded first"})),
        "resume reused the recorded output"
    );
    assert_eq!(reran_first.load(AtomicOrdering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn resume_skip_marks_stranded_instances_failed() {
    let h = harness();
    let stranded = dk_core::test_support::running_instance("wf_left", "ghost", "step");
    h.store.upsert_instance(stranded).unwrap();

    h.engine.resume(dk_core::ResumeStrategy::Skip).await.unwrap();

    let instance = h.engine.get("wf_left").unwrap();
    assert_eq!(instance.status, WorkflowStatus::Failed);
    assert_eq!(instance.error.as_deref(), Some("Workflow resume skipped"));
}

#[tokio::test(flavor = "multi_thread")]
async fn isolated_definition_without_executor_is_refused() {
    let h = harness();
    let def = WorkflowBuilder::new("needs-isolation")
        .step(StepDef::pass("only").end())
        .build()
        .unwrap();
    assert!(def.isolated);
    h.engine.register(def);

    let err = h.engine.run("needs-isolation", json!({})).unwrap_err();
    assert!(matches!(err, WorkflowError::IsolationUnavailable(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn metadata_writes_persist_across_steps() {
    let h = harness();
    let def = WorkflowBuilder::new("remember")
        .isolated(false)
        .step(
            StepDef::task("note", |ctx| async move {
                ctx.set_metadata("written_by", json!("note"));
                Ok(json!(null))
            })
            .next("read"),
        )
        .step(
            StepDef::pass("read")
                .transform(|ctx| Ok(ctx.metadata("written_by").cloned().unwrap_or(json!(null))))
                .end(),
        )
        .build()
        .unwrap();
    h.engine.register(def);

    let id = h.engine.run("remember", json!({})).unwrap();
    let instance = h.engine.wait(&id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(instance.output, Some(json!("note")));
    assert_eq!(instance.metadata.get("written_by"), Some(&json!("note")));
}

#[tokio::test(flavor = "multi_thread")]
async fn input_schema_mismatch_is_terminal_without_retries() {
    let h = harness();
    let def = WorkflowBuilder::new("strict")
        .isolated(false)
        .step(
            StepDef::task("checked", |_ctx| async move { Ok(json!(null)) })
                .validate_input(|input| {
                    input
                        .get("required")
                        .map(|_| ())
                        .ok_or_else(|| "missing field `required`".to_string())
                })
                .retry(RetryPolicy::new(3, 1, 1.0))
                .end(),
        )
        .build()
        .unwrap();
    h.engine.register(def);

    let id = h.engine.run("strict", json!({"other": 1})).unwrap();
    let instance = h.engine.wait(&id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(instance.status, WorkflowStatus::Failed);
    assert!(instance.error.as_deref().unwrap().contains("required"));
    assert_eq!(instance.step_results["checked"].attempts, 1, "no retries on contract errors");
    assert!(h.bus.get_history("workflow.step.retry", None).is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn task_job_step_awaits_job_result() {
    let h = harness_with_jobs();
    let jobs = h.jobs.clone().unwrap();
    jobs.register_fn("double", |payload, _ctx| async move {
        let n = payload["n"].as_i64().unwrap_or(0);
        Ok(json!({ "doubled": n * 2 }))
    });
    jobs.start();

    let def = WorkflowBuilder::new("delegate")
        .isolated(false)
        .step(StepDef::task_job("calc", "double", Duration::from_secs(5)).end())
        .build()
        .unwrap();
    h.engine.register(def);

    let id = h.engine.run("delegate", json!({"n": 21})).unwrap();
    let instance = h.engine.wait(&id, Duration::from_secs(5)).await.unwrap();
    jobs.stop().await;

    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(instance.output, Some(json!({"doubled": 42})));

    // The backing job row settled too
    let job = h
        .store
        .list_jobs(Some(dk_core::JobStatus::Completed))
        .into_iter()
        .find(|j| j.name == "double")
        .unwrap();
    assert_eq!(job.result, Some(json!({"doubled": 42})));
}
