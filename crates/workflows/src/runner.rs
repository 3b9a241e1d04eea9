// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The per-instance state machine.
//!
//! One `Runner` drives one instance through its step graph, persisting a
//! StepResult transition before and after every attempt through the sink.
//! Step transitions within an instance are strictly serialized; the only
//! intra-instance concurrency is between the branches of a `parallel` step.

use crate::context::{CoreServices, StepContext};
use crate::definition::{
    ParallelMode, RetryPolicy, StepDef, StepKind, TaskRunner, WorkflowDefinition,
};
use crate::sink::{step_event_data, RunSink};
use dk_core::{
    delay_with_jitter, StepResult, StepStatus, WorkflowInstance, WorkflowStatus,
};
use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Why a drive ended early.
pub(crate) enum RunError {
    Step { step: String, error: String },
    Timeout,
    Cancelled,
}

pub(crate) struct Runner {
    pub definition: Arc<WorkflowDefinition>,
    pub services: Arc<dyn CoreServices>,
    pub sink: Arc<dyn RunSink>,
    pub cancel: CancellationToken,
    pub epoch_ms: Arc<dyn Fn() -> u64 + Send + Sync>,
    pub next_id: Arc<dyn Fn(&str) -> String + Send + Sync>,
    /// Steps that completed before this run began (resume): their recorded
    /// outputs are reused instead of re-executing. Cleared when a loop jumps
    /// backwards.
    pub resumed: Mutex<HashSet<String>>,
}

impl Runner {
    /// Drive the instance to a terminal state and return the final snapshot.
    pub(crate) async fn run(self: &Arc<Self>, mut instance: WorkflowInstance) -> WorkflowInstance {
        let now_ms = (self.epoch_ms)();
        let fresh = instance.status == WorkflowStatus::Pending;
        if fresh {
            instance.status = WorkflowStatus::Running;
            instance.started_at_ms = Some(now_ms);
        }
        self.sink.persist(&instance).await;
        if fresh {
            self.sink
                .emit(
                    "workflow.started",
                    json!({
                        "id": instance.id,
                        "workflowName": instance.workflow_name,
                        "input": instance.input,
                    }),
                )
                .await;
        }

        let result = match self.definition.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.drive(&mut instance)).await {
                Ok(result) => result,
                Err(_) => Err(RunError::Timeout),
            },
            None => self.drive(&mut instance).await,
        };

        let now_ms = (self.epoch_ms)();
        match result {
            Ok(output) => {
                instance.status = WorkflowStatus::Completed;
                instance.output = Some(output.clone());
                instance.error = None;
                instance.current_step = None;
                instance.completed_at_ms = Some(now_ms);
                self.sink.persist(&instance).await;
                self.sink
                    .emit(
                        "workflow.completed",
                        json!({
                            "id": instance.id,
                            "workflowName": instance.workflow_name,
                            "output": output,
                        }),
                    )
                    .await;
            }
            Err(RunError::Cancelled) => {
                // The cancelling side owns the row transition and the
                // `workflow.cancelled` event; a late snapshot from here would
                // be refused by the sink anyway.
                if !instance.is_terminal() {
                    instance.status = WorkflowStatus::Cancelled;
                    instance.completed_at_ms = Some(now_ms);
                }
                self.sink.persist(&instance).await;
            }
            Err(RunError::Timeout) => {
                instance.status = WorkflowStatus::TimedOut;
                instance.error = Some("Workflow timed out".to_string());
                instance.completed_at_ms = Some(now_ms);
                self.sink.persist(&instance).await;
                self.sink
                    .emit(
                        "workflow.failed",
                        json!({
                            "id": instance.id,
                            "workflowName": instance.workflow_name,
                            "error": "Workflow timed out",
                        }),
                    )
                    .await;
            }
            Err(RunError::Step { step, error }) => {
                instance.status = WorkflowStatus::Failed;
                instance.error = Some(error.clone());
                instance.completed_at_ms = Some(now_ms);
                self.sink.persist(&instance).await;
                self.sink
                    .emit(
                        "workflow.failed",
                        json!({
                            "id": instance.id,
                            "workflowName": instance.workflow_name,
                            "step": step,
                            "error": error,
                        }),
                    )
                    .await;
            }
        }

        instance
    }

    /// Walk the step graph from the first step to an end.
    async fn drive(&self, instance: &mut WorkflowInstance) -> Result<Value, RunError> {
        let mut current = self
            .definition
            .first_step()
            .map(str::to_string)
            .ok_or_else(|| RunError::Step {
                step: String::new(),
                error: "workflow has no steps".to_string(),
            })?;
        let mut prev: Option<Value> = None;

        loop {
            if self.cancel.is_cancelled() {
                return Err(RunError::Cancelled);
            }

            let step = self
                .definition
                .step(&current)
                .cloned()
                .ok_or_else(|| RunError::Step {
                    step: current.clone(),
                    error: format!("unknown step {current}"),
                })?;

            instance.current_step = Some(current.clone());
            let (output, jump) = self.execute_step(instance, &step, prev.clone()).await?;
            prev = Some(output);

            if let Some(target) = jump {
                current = target;
            } else if step.end || step.next.is_none() {
                return Ok(prev.unwrap_or(Value::Null));
            } else if let Some(next) = step.next {
                current = next;
            }
        }
    }

    /// Execute one step. Returns its output and, for choice/loop steps, a
    /// navigation override.
    async fn execute_step(
        &self,
        instance: &mut WorkflowInstance,
        step: &StepDef,
        prev: Option<Value>,
    ) -> Result<(Value, Option<String>), RunError> {
        // Resume shortcut: reuse outputs recorded by the interrupted run.
        if self.resumed.lock().remove(&step.name) {
            if let Some(output) = instance
                .step_results
                .get(&step.name)
                .filter(|r| r.status == StepStatus::Completed)
                .and_then(|r| r.output.clone())
            {
                debug!(step = %step.name, "resume: reusing recorded step output");
                return Ok((output, None));
            }
        }

        match &step.kind {
            StepKind::Task {
                run,
                input,
                validate_input,
                validate_output,
                retry,
                timeout,
            } => {
                self.run_task(
                    instance,
                    step,
                    prev,
                    run,
                    input.as_ref(),
                    validate_input.as_deref(),
                    validate_output.as_deref(),
                    *retry,
                    *timeout,
                )
                .await
                .map(|output| (output, None))
            }
            StepKind::Pass { result, transform } => {
                let input = default_input(instance, &prev);
                self.start_attempt(instance, &step.name, input.clone()).await;
                let ctx = self.context(instance, input.clone(), &prev);
                let output = if let Some(result) = result {
                    result.clone()
                } else if let Some(transform) = transform {
                    match transform(&ctx) {
                        Ok(output) => output,
                        Err(e) => {
                            return Err(self
                                .fail_step(instance, &step.name, e.to_string())
                                .await);
                        }
                    }
                } else {
                    input
                };
                self.apply_metadata(instance, &ctx);
                self.complete_step(instance, &step.name, output.clone()).await;
                Ok((output, None))
            }
            StepKind::Choice { choices, default } => {
                let input = default_input(instance, &prev);
                self.start_attempt(instance, &step.name, input.clone()).await;
                let ctx = self.context(instance, input.clone(), &prev);
                let selected = choices
                    .iter()
                    .find(|(condition, _)| condition(&ctx))
                    .map(|(_, target)| target.clone())
                    .or_else(|| default.clone());
                match selected {
                    Some(target) => {
                        self.complete_step(instance, &step.name, input.clone()).await;
                        Ok((input, Some(target)))
                    }
                    None => Err(self
                        .fail_step(
                            instance,
                            &step.name,
                            "no choice condition matched and no default target".to_string(),
                        )
                        .await),
                }
            }
            StepKind::Parallel { branches, mode } => self
                .run_parallel(instance, step, prev, branches, *mode)
                .await
                .map(|output| (output, None)),
            StepKind::Poll {
                check,
                interval,
                timeout,
                max_attempts,
            } => self
                .run_poll(instance, step, prev, check, *interval, *timeout, *max_attempts)
                .await
                .map(|output| (output, None)),
            StepKind::Loop {
                condition,
                target,
                max_iterations,
                timeout,
                interval,
            } => {
                self.run_loop(
                    instance,
                    step,
                    prev,
                    condition,
                    target,
                    *max_iterations,
                    *timeout,
                    *interval,
                )
                .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_task(
        &self,
        instance: &mut WorkflowInstance,
        step: &StepDef,
        prev: Option<Value>,
        run: &TaskRunner,
        input_fn: Option<&crate::definition::TransformFn>,
        validate_input: Option<&(dyn Fn(&Value) -> Result<(), String> + Send + Sync)>,
        validate_output: Option<&(dyn Fn(&Value) -> Result<(), String> + Send + Sync)>,
        retry: Option<RetryPolicy>,
        timeout: Option<Duration>,
    ) -> Result<Value, RunError> {
        let max_attempts = retry.map_or(1, |r| r.max_attempts);

        let input = match input_fn {
            Some(f) => {
                let ctx = self.context(instance, Value::Null, &prev);
                match f(&ctx) {
                    Ok(input) => input,
                    Err(e) => {
                        self.start_attempt(instance, &step.name, Value::Null).await;
                        return Err(self.fail_step(instance, &step.name, e.to_string()).await);
                    }
                }
            }
            None => default_input(instance, &prev),
        };

        loop {
            self.start_attempt(instance, &step.name, input.clone()).await;

            // Schema mismatch is a contract error: terminal, never retried.
            if let Some(validate) = validate_input {
                if let Err(msg) = validate(&input) {
                    return Err(self
                        .fail_step(instance, &step.name, format!("invalid step input: {msg}"))
                        .await);
                }
            }

            let ctx = self.context(instance, input.clone(), &prev);
            let services = ctx.services();
            let execution = async {
                match run {
                    TaskRunner::Inline(f) => f(ctx.clone()).await,
                    TaskRunner::Job { name, timeout } => {
                        services.run_job(name, input.clone(), *timeout).await
                    }
                }
            };
            let bounded = async {
                match timeout {
                    Some(limit) => match tokio::time::timeout(limit, execution).await {
                        Ok(result) => result,
                        Err(_) => Err(format!(
                            "step timed out after {}ms",
                            limit.as_millis()
                        )
                        .into()),
                    },
                    None => execution.await,
                }
            };
            let result = tokio::select! {
                result = bounded => result,
                _ = self.cancel.cancelled() => return Err(RunError::Cancelled),
            };
            self.apply_metadata(instance, &ctx);

            match result {
                Ok(output) => {
                    if let Some(validate) = validate_output {
                        if let Err(msg) = validate(&output) {
                            return Err(self
                                .fail_step(
                                    instance,
                                    &step.name,
                                    format!("invalid step output: {msg}"),
                                )
                                .await);
                        }
                    }
                    self.complete_step(instance, &step.name, output.clone()).await;
                    return Ok(output);
                }
                Err(e) => {
                    let attempts = instance
                        .step_results
                        .get(&step.name)
                        .map_or(1, |r| r.attempts);
                    if attempts < max_attempts {
                        let error = e.to_string();
                        if let Some(result) = instance.step_results.get_mut(&step.name) {
                            result.error = Some(error);
                        }
                        self.sink.persist(instance).await;
                        if let Some(result) = instance.step_results.get(&step.name) {
                            self.sink
                                .emit("workflow.step.retry", step_event_data(instance, result))
                                .await;
                        }

                        let backoff = retry.map(|r| r.backoff).unwrap_or_default();
                        let delay = delay_with_jitter(&backoff, attempts.saturating_sub(1));
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = self.cancel.cancelled() => return Err(RunError::Cancelled),
                        }
                        continue;
                    }
                    return Err(self.fail_step(instance, &step.name, e.to_string()).await);
                }
            }
        }
    }

    async fn run_parallel(
        &self,
        instance: &mut WorkflowInstance,
        step: &StepDef,
        prev: Option<Value>,
        branches: &[(String, WorkflowDefinition)],
        mode: ParallelMode,
    ) -> Result<Value, RunError> {
        let input = default_input(instance, &prev);
        self.start_attempt(instance, &step.name, input.clone()).await;

        let now_ms = (self.epoch_ms)();
        let mut children = Vec::new();
        for (branch_name, branch_def) in branches {
            let child_id = (self.next_id)("wf");
            let mut child =
                WorkflowInstance::new(&child_id, &branch_def.name, input.clone(), now_ms);
            child.parent_id = Some(instance.id.clone());
            child.branch_name = Some(branch_name.clone());
            children.push((branch_name.clone(), branch_def.clone(), child));
        }
        instance.branch_instances.insert(
            step.name.clone(),
            children.iter().map(|(_, _, c)| c.id.clone()).collect(),
        );
        self.sink.persist(instance).await;

        let mut branch_cancels = Vec::new();
        let mut futures = FuturesUnordered::new();
        for (branch_name, branch_def, child) in children {
            let branch_cancel = self.cancel.child_token();
            branch_cancels.push(branch_cancel.clone());
            let runner = Arc::new(Runner {
                definition: Arc::new(branch_def),
                services: Arc::clone(&self.services),
                sink: Arc::clone(&self.sink),
                cancel: branch_cancel,
                epoch_ms: Arc::clone(&self.epoch_ms),
                next_id: Arc::clone(&self.next_id),
                resumed: Mutex::new(HashSet::new()),
            });
            futures.push(async move {
                self.sink.persist(&child).await;
                let finished = runner.run(child).await;
                (branch_name, finished)
            });
        }

        let mut outcomes: Vec<(String, WorkflowInstance)> = Vec::new();
        let mut first_error: Option<String> = None;
        while let Some((branch_name, finished)) = futures.next().await {
            let failed = finished.status != WorkflowStatus::Completed;
            if failed && first_error.is_none() {
                first_error = Some(format!(
                    "branch {branch_name} {}: {}",
                    finished.status,
                    finished.error.clone().unwrap_or_default()
                ));
                if mode == ParallelMode::FailFast {
                    // Cancel the remaining branches, but keep draining: every
                    // branch observes its cancellation before the step fails.
                    for cancel in &branch_cancels {
                        cancel.cancel();
                    }
                }
            }
            outcomes.push((branch_name, finished));
        }

        if self.cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        match first_error {
            Some(error) => Err(self.fail_step(instance, &step.name, error).await),
            None => {
                let mut output = serde_json::Map::new();
                for (branch_name, finished) in outcomes {
                    output.insert(branch_name, finished.output.unwrap_or(Value::Null));
                }
                let output = Value::Object(output);
                self.complete_step(instance, &step.name, output.clone()).await;
                Ok(output)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_poll(
        &self,
        instance: &mut WorkflowInstance,
        step: &StepDef,
        prev: Option<Value>,
        check: &crate::definition::CheckFn,
        interval: Duration,
        timeout: Option<Duration>,
        max_attempts: Option<u32>,
    ) -> Result<Value, RunError> {
        let input = default_input(instance, &prev);
        self.start_attempt(instance, &step.name, input.clone()).await;
        let poll_started_ms = (self.epoch_ms)();

        loop {
            if self.cancel.is_cancelled() {
                return Err(RunError::Cancelled);
            }

            let now_ms = (self.epoch_ms)();
            let poll_count = {
                let Some(result) = instance.step_results.get_mut(&step.name) else {
                    return Err(RunError::Step {
                        step: step.name.clone(),
                        error: "step result vanished".to_string(),
                    });
                };
                result.poll_count += 1;
                result.last_polled_at_ms = Some(now_ms);
                result.poll_count
            };
            self.sink.persist(instance).await;

            let ctx = self.context(instance, input.clone(), &prev);
            let status = tokio::select! {
                status = check(input.clone(), ctx.clone()) => status,
                _ = self.cancel.cancelled() => return Err(RunError::Cancelled),
            };
            self.apply_metadata(instance, &ctx);

            let status = match status {
                Ok(status) => status,
                Err(e) => {
                    return Err(self.fail_step(instance, &step.name, e.to_string()).await);
                }
            };

            self.sink
                .emit(
                    "workflow.step.poll",
                    json!({
                        "id": instance.id,
                        "workflowName": instance.workflow_name,
                        "step": step.name,
                        "pollCount": poll_count,
                        "done": status.done,
                    }),
                )
                .await;

            if status.done {
                let output = status.result.unwrap_or(Value::Null);
                self.complete_step(instance, &step.name, output.clone()).await;
                return Ok(output);
            }

            if max_attempts.is_some_and(|max| poll_count >= max) {
                return Err(self
                    .fail_step(
                        instance,
                        &step.name,
                        format!("poll gave up after {poll_count} attempts"),
                    )
                    .await);
            }
            if timeout.is_some_and(|t| now_ms.saturating_sub(poll_started_ms) >= t.as_millis() as u64)
            {
                return Err(self
                    .fail_step(instance, &step.name, "poll timed out".to_string())
                    .await);
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.cancel.cancelled() => return Err(RunError::Cancelled),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_loop(
        &self,
        instance: &mut WorkflowInstance,
        step: &StepDef,
        prev: Option<Value>,
        condition: &crate::definition::ConditionFn,
        target: &str,
        max_iterations: u32,
        timeout: Option<Duration>,
        interval: Option<Duration>,
    ) -> Result<(Value, Option<String>), RunError> {
        let input = default_input(instance, &prev);
        self.start_attempt(instance, &step.name, input.clone()).await;

        let now_ms = (self.epoch_ms)();
        let (loop_count, loop_started_ms) = {
            let Some(result) = instance.step_results.get_mut(&step.name) else {
                return Err(RunError::Step {
                    step: step.name.clone(),
                    error: "step result vanished".to_string(),
                });
            };
            let started = *result.loop_started_at_ms.get_or_insert(now_ms);
            (result.loop_count, started)
        };

        let ctx = self.context(instance, input.clone(), &prev);
        if condition(&ctx) {
            if loop_count >= max_iterations {
                return Err(self
                    .fail_step(
                        instance,
                        &step.name,
                        format!("loop exceeded {max_iterations} iterations"),
                    )
                    .await);
            }
            if timeout
                .is_some_and(|t| now_ms.saturating_sub(loop_started_ms) >= t.as_millis() as u64)
            {
                return Err(self
                    .fail_step(instance, &step.name, "loop timed out".to_string())
                    .await);
            }

            let loop_count = {
                // The entry was checked above; this re-borrow keeps the
                // mutable window tight.
                let Some(result) = instance.step_results.get_mut(&step.name) else {
                    return Err(RunError::Step {
                        step: step.name.clone(),
                        error: "step result vanished".to_string(),
                    });
                };
                result.loop_count += 1;
                result.last_looped_at_ms = Some(now_ms);
                result.loop_count
            };
            self.sink.persist(instance).await;
            self.sink
                .emit(
                    "workflow.step.loop",
                    json!({
                        "id": instance.id,
                        "workflowName": instance.workflow_name,
                        "step": step.name,
                        "loopCount": loop_count,
                    }),
                )
                .await;

            if let Some(interval) = interval {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = self.cancel.cancelled() => return Err(RunError::Cancelled),
                }
            }

            // Travelling backwards invalidates resume shortcuts.
            self.resumed.lock().clear();
            return Ok((input, Some(target.to_string())));
        }

        self.complete_step(instance, &step.name, input.clone()).await;
        Ok((input, None))
    }

    // ── step bookkeeping ────────────────────────────────────────────────────

    fn context(&self, instance: &WorkflowInstance, input: Value, prev: &Option<Value>) -> StepContext {
        StepContext::new(
            input,
            prev.clone().unwrap_or(Value::Null),
            instance.clone(),
            Arc::clone(&self.services),
        )
    }

    fn apply_metadata(&self, instance: &mut WorkflowInstance, ctx: &StepContext) {
        for (key, value) in ctx.take_metadata_writes() {
            instance.metadata.insert(key, value);
        }
    }

    /// Persist the step entering `running` with a fresh attempt.
    async fn start_attempt(&self, instance: &mut WorkflowInstance, step: &str, input: Value) {
        let now_ms = (self.epoch_ms)();
        let result = instance
            .step_results
            .entry(step.to_string())
            .or_insert_with(|| StepResult::new(step));
        result.status = StepStatus::Running;
        result.attempts += 1;
        result.input = input;
        if result.started_at_ms.is_none() {
            result.started_at_ms = Some(now_ms);
        }
        self.sink.persist(instance).await;
        if let Some(result) = instance.step_results.get(step) {
            self.sink
                .emit("workflow.step.started", step_event_data(instance, result))
                .await;
        }
    }

    /// Persist step completion and emit progress.
    async fn complete_step(&self, instance: &mut WorkflowInstance, step: &str, output: Value) {
        let now_ms = (self.epoch_ms)();
        if let Some(result) = instance.step_results.get_mut(step) {
            result.status = StepStatus::Completed;
            result.output = Some(output);
            result.error = None;
            result.completed_at_ms = Some(now_ms);
        }
        self.sink.persist(instance).await;
        if let Some(result) = instance.step_results.get(step) {
            self.sink
                .emit("workflow.step.completed", step_event_data(instance, result))
                .await;
        }

        let completed = instance.completed_step_count();
        let total = self.definition.step_count().max(1);
        self.sink
            .emit(
                "workflow.progress",
                json!({
                    "id": instance.id,
                    "workflowName": instance.workflow_name,
                    "percent": (completed * 100 / total).min(100),
                    "completed": completed,
                    "total": total,
                }),
            )
            .await;
    }

    /// Persist step failure; the returned error fails the workflow.
    async fn fail_step(
        &self,
        instance: &mut WorkflowInstance,
        step: &str,
        error: String,
    ) -> RunError {
        let now_ms = (self.epoch_ms)();
        if let Some(result) = instance.step_results.get_mut(step) {
            result.status = StepStatus::Failed;
            result.error = Some(error.clone());
            result.completed_at_ms = Some(now_ms);
        }
        self.sink.persist(instance).await;
        if let Some(result) = instance.step_results.get(step) {
            self.sink
                .emit("workflow.step.failed", step_event_data(instance, result))
                .await;
        }
        RunError::Step {
            step: step.to_string(),
            error,
        }
    }
}

/// Default step input: previous step output, or the workflow input for the
/// first executed step.
fn default_input(instance: &WorkflowInstance, prev: &Option<Value>) -> Value {
    match prev {
        Some(value) => value.clone(),
        None => instance.input.clone(),
    }
}
