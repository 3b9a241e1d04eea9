// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::support::started_server;
use dk_core::{StepStatus, WorkflowStatus};
use dk_workflows::{PollStatus, RetryPolicy, StepDef, WorkflowBuilder};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn linear_greet_workflow_completes() {
    let t = started_server().await;
    let workflows = t.server.workflows();

    let def = WorkflowBuilder::new("greet")
        .isolated(false)
        .step(
            StepDef::task("validate", |ctx| async move {
                let name = ctx.input["name"].as_str().unwrap_or_default().to_string();
                Ok(json!({ "name": name, "ok": true }))
            })
            .next("send"),
        )
        .step(StepDef::task("send", |_ctx| async move { Ok(json!({"sent": true})) }).next("done"))
        .step(StepDef::pass("done").end())
        .build()
        .unwrap();
    workflows.register(def);

    let id = workflows.run("greet", json!({"name": "ada"})).unwrap();
    let instance = workflows.wait(&id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(instance.output, Some(json!({"sent": true})));
    for step in ["validate", "send", "done"] {
        assert_eq!(instance.step_results[step].status, StepStatus::Completed);
    }

    let percents: Vec<u64> = t
        .server
        .bus()
        .get_history("workflow.progress", None)
        .iter()
        .map(|r| r.data["percent"].as_u64().unwrap())
        .collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]), "monotonic progress");
    assert_eq!(percents.last().copied(), Some(100));

    t.server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_then_succeed_records_both_attempts() {
    let t = started_server().await;
    let workflows = t.server.workflows();

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let def = WorkflowBuilder::new("retryme")
        .isolated(false)
        .step(
            StepDef::task("step", move |_ctx| {
                let seen = Arc::clone(&seen);
                async move {
                    if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err("attempt 1 fails".into())
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
    workflows.register(def);

    let id = workflows.run("retryme", json!({})).unwrap();
    let instance = workflows.wait(&id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(instance.output, Some(json!(42)));
    assert_eq!(instance.step_results["step"].attempts, 2);

    let bus = t.server.bus();
    let retries = bus.get_history("workflow.step.retry", None);
    assert_eq!(retries.len(), 1);
    assert_eq!(retries[0].data["attempt"], json!(1));

    t.server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn poll_completes_after_three_checks() {
    let t = started_server().await;
    let workflows = t.server.workflows();

    let checks = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&checks);
    let def = WorkflowBuilder::new("poller")
        .isolated(false)
        .step(
            StepDef::poll("wait", Duration::from_millis(5), move |_input, _ctx| {
                let seen = Arc::clone(&seen);
                async move {
                    if seen.fetch_add(1, Ordering::SeqCst) + 1 >= 3 {
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
    workflows.register(def);

    let id = workflows.run("poller", json!({})).unwrap();
    let instance = workflows.wait(&id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(instance.step_results["wait"].poll_count, 3);

    let polls = t.server.bus().get_history("workflow.step.poll", None);
    assert_eq!(polls.len(), 3);
    assert_eq!(polls[2].data["done"], json!(true));

    t.server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn loop_counts_iterations_and_attempts() {
    let t = started_server().await;
    let workflows = t.server.workflows();

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
    workflows.register(def);

    let id = workflows.run("counter", json!({})).unwrap();
    let instance = workflows.wait(&id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(instance.step_results["repeat"].loop_count, 2);
    assert_eq!(instance.step_results["increment"].attempts, 3);
    assert_eq!(t.server.bus().get_history("workflow.step.loop", None).len(), 2);

    t.server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn suspended_handler_fails_on_step_timeout_without_leaking() {
    let t = started_server().await;
    let workflows = t.server.workflows();

    let def = WorkflowBuilder::new("hung")
        .isolated(false)
        .step(
            StepDef::task("stall", |_ctx| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!(null))
            })
            .timeout(Duration::from_millis(50))
            .end(),
        )
        .build()
        .unwrap();
    workflows.register(def);

    let start = std::time::Instant::now();
    let id = workflows.run("hung", json!({})).unwrap();
    let instance = workflows.wait(&id, Duration::from_secs(5)).await.unwrap();

    assert!(start.elapsed() < Duration::from_secs(5), "suspension did not leak");
    assert_eq!(instance.status, WorkflowStatus::Failed);
    assert!(instance.error.as_deref().unwrap().contains("timed out"));

    t.server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn parallel_branches_are_persisted_as_child_instances() {
    let t = started_server().await;
    let workflows = t.server.workflows();

    let branch = |name: &str, value: &str| {
        let value = value.to_string();
        WorkflowBuilder::new(name)
            .isolated(false)
            .step(StepDef::pass("emit").result(json!(value)).end())
            .build()
            .unwrap()
    };
    let def = WorkflowBuilder::new("fanout")
        .isolated(false)
        .step(
            StepDef::parallel(
                "split",
                vec![("a", branch("a-wf", "A")), ("b", branch("b-wf", "B"))],
            )
            .wait_all()
            .end(),
        )
        .build()
        .unwrap();
    workflows.register(def);

    let id = workflows.run("fanout", json!({})).unwrap();
    let instance = workflows.wait(&id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(instance.output, Some(json!({"a": "A", "b": "B"})));

    for child_id in &instance.branch_instances["split"] {
        let child = t.server.store().instance(child_id).unwrap();
        assert_eq!(child.parent_id.as_deref(), Some(instance.id.as_str()));
        assert_eq!(child.status, WorkflowStatus::Completed);
    }

    t.server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn completed_instances_have_fully_completed_paths() {
    let t = started_server().await;
    let workflows = t.server.workflows();

    let def = WorkflowBuilder::new("audit")
        .isolated(false)
        .step(StepDef::pass("a").next("b"))
        .step(StepDef::pass("b").end())
        .build()
        .unwrap();
    workflows.register(def);

    let id = workflows.run("audit", json!({})).unwrap();
    let instance = workflows.wait(&id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert!(instance
        .step_results
        .values()
        .all(|r| r.status == StepStatus::Completed));

    t.server.shutdown().await.unwrap();
}
