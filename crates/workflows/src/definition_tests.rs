// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use serde_json::json;

fn noop_task(name: &str) -> StepDef {
    StepDef::task(name, |_ctx| async move { Ok(json!(null)) })
}

#[test]
fn empty_workflow_is_rejected() {
    let err = WorkflowBuilder::new("empty").build().unwrap_err();
    assert_eq!(err, DefinitionError::Empty("empty".to_string()));
}

#[test]
fn duplicate_step_names_are_rejected() {
    let err = WorkflowBuilder::new("dup")
        .step(noop_task("a"))
        .step(noop_task("a"))
        .build()
        .unwrap_err();
    assert_eq!(err, DefinitionError::DuplicateStep("a".to_string()));
}

#[test]
fn unknown_next_target_is_rejected() {
    let err = WorkflowBuilder::new("bad")
        .step(noop_task("a").next("ghost"))
        .build()
        .unwrap_err();
    assert_eq!(
        err,
        DefinitionError::UnknownTarget {
            from: "a".to_string(),
            to: "ghost".to_string(),
        }
    );
}

#[test]
fn last_unlinked_step_becomes_end() {
    let def = WorkflowBuilder::new("linear")
        .step(noop_task("a").next("b"))
        .step(noop_task("b"))
        .build()
        .unwrap();
    assert!(def.step("b").unwrap().end);
    assert!(!def.step("a").unwrap().end);
    assert_eq!(def.first_step(), Some("a"));
}

#[test]
fn explicit_end_is_preserved() {
    let def = WorkflowBuilder::new("short")
        .step(noop_task("a").end())
        .build()
        .unwrap();
    assert!(def.step("a").unwrap().end);
}

#[test]
fn next_cycle_without_loop_is_rejected() {
    let err = WorkflowBuilder::new("cyclic")
        .step(noop_task("a").next("b"))
        .step(noop_task("b").next("a"))
        .build()
        .unwrap_err();
    assert!(matches!(err, DefinitionError::Cycle(_)));
}

#[test]
fn choice_cycle_is_rejected() {
    let err = WorkflowBuilder::new("cyclic-choice")
        .step(noop_task("a").next("pick"))
        .step(
            StepDef::choice("pick")
                .when(|_| true, "a")
                .otherwise("done"),
        )
        .step(noop_task("done"))
        .build()
        .unwrap_err();
    assert!(matches!(err, DefinitionError::Cycle(_)));
}

#[test]
fn loop_back_edge_is_allowed() {
    let def = WorkflowBuilder::new("looping")
        .step(noop_task("work").next("again"))
        .step(StepDef::loop_step("again", |_| true, "work").next("done"))
        .step(noop_task("done"))
        .build()
        .unwrap();
    assert_eq!(def.step_count(), 3);
}

#[test]
fn loop_target_ahead_is_rejected() {
    let err = WorkflowBuilder::new("forward-loop")
        .step(StepDef::loop_step("jump", |_| true, "later").next("later"))
        .step(noop_task("later"))
        .build()
        .unwrap_err();
    assert_eq!(err, DefinitionError::LoopTargetAhead("jump".to_string()));
}

#[test]
fn choice_targets_are_validated() {
    let err = WorkflowBuilder::new("bad-choice")
        .step(StepDef::choice("pick").when(|_| true, "missing"))
        .build()
        .unwrap_err();
    assert!(matches!(err, DefinitionError::UnknownTarget { .. }));
}

#[test]
fn builder_defaults_to_isolated() {
    let def = WorkflowBuilder::new("iso")
        .step(noop_task("a"))
        .build()
        .unwrap();
    assert!(def.isolated);

    let inline = WorkflowBuilder::new("inline")
        .isolated(false)
        .step(noop_task("a"))
        .build()
        .unwrap();
    assert!(!inline.isolated);
}
