// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Workflow definitions and the builder that validates them.

use crate::context::StepContext;
use dk_core::BackoffConfig;
use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error type surfaced by step handlers; captured and persisted, never
/// propagated past the engine.
pub type StepError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Inline task handler.
pub type TaskFn =
    Arc<dyn Fn(StepContext) -> BoxFuture<'static, Result<Value, StepError>> + Send + Sync>;
/// Pure transform over the step context.
pub type TransformFn = Arc<dyn Fn(&StepContext) -> Result<Value, StepError> + Send + Sync>;
/// Branch/loop condition over the step context.
pub type ConditionFn = Arc<dyn Fn(&StepContext) -> bool + Send + Sync>;
/// Poll check: invoked every interval until done.
pub type CheckFn =
    Arc<dyn Fn(Value, StepContext) -> BoxFuture<'static, Result<PollStatus, StepError>> + Send + Sync>;
/// Optional input/output schema validation at the step edge.
pub type ValidateFn = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Result of one poll check.
#[derive(Debug, Clone, PartialEq)]
pub struct PollStatus {
    pub done: bool,
    pub result: Option<Value>,
}

impl PollStatus {
    pub fn pending() -> Self {
        Self {
            done: false,
            result: None,
        }
    }

    pub fn done(result: Value) -> Self {
        Self {
            done: true,
            result: Some(result),
        }
    }
}

/// Retry policy for a task step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval_ms: u64, backoff_rate: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: BackoffConfig {
                initial_ms: interval_ms,
                multiplier: backoff_rate,
                max_ms: u64::MAX / 2,
            },
        }
    }
}

/// How a task step executes.
#[derive(Clone)]
pub enum TaskRunner {
    /// Inline handler on the engine's scheduler.
    Inline(TaskFn),
    /// Enqueue a named job and await its result.
    Job { name: String, timeout: Duration },
}

/// Failure mode of a parallel step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParallelMode {
    /// First branch error cancels the remaining branches.
    #[default]
    FailFast,
    /// Gather all branches; fail only if any branch failed.
    WaitAll,
}

/// The six step kinds.
#[derive(Clone)]
pub enum StepKind {
    Task {
        run: TaskRunner,
        input: Option<TransformFn>,
        validate_input: Option<ValidateFn>,
        validate_output: Option<ValidateFn>,
        retry: Option<RetryPolicy>,
        timeout: Option<Duration>,
    },
    Pass {
        result: Option<Value>,
        transform: Option<TransformFn>,
    },
    Choice {
        choices: Vec<(ConditionFn, String)>,
        default: Option<String>,
    },
    Parallel {
        branches: Vec<(String, WorkflowDefinition)>,
        mode: ParallelMode,
    },
    Poll {
        check: CheckFn,
        interval: Duration,
        timeout: Option<Duration>,
        max_attempts: Option<u32>,
    },
    Loop {
        condition: ConditionFn,
        target: String,
        max_iterations: u32,
        timeout: Option<Duration>,
        interval: Option<Duration>,
    },
}

impl StepKind {
    fn kind_name(&self) -> &'static str {
        match self {
            StepKind::Task { .. } => "task",
            StepKind::Pass { .. } => "pass",
            StepKind::Choice { .. } => "choice",
            StepKind::Parallel { .. } => "parallel",
            StepKind::Poll { .. } => "poll",
            StepKind::Loop { .. } => "loop",
        }
    }
}

/// One named step.
#[derive(Clone)]
pub struct StepDef {
    pub name: String,
    pub kind: StepKind,
    /// Successor step; `None` on a non-`end` step also terminates the
    /// workflow (the builder marks the last unlinked step `end`).
    pub next: Option<String>,
    pub end: bool,
}

impl StepDef {
    /// Inline task step.
    pub fn task<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, StepError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            kind: StepKind::Task {
                run: TaskRunner::Inline(Arc::new(move |ctx| Box::pin(f(ctx)))),
                input: None,
                validate_input: None,
                validate_output: None,
                retry: None,
                timeout: None,
            },
            next: None,
            end: false,
        }
    }

    /// Task step that enqueues a job and awaits its result.
    pub fn task_job(name: impl Into<String>, job_name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::Task {
                run: TaskRunner::Job {
                    name: job_name.into(),
                    timeout,
                },
                input: None,
                validate_input: None,
                validate_output: None,
                retry: None,
                timeout: None,
            },
            next: None,
            end: false,
        }
    }

    /// Pass step: static result, transform, or plain forwarding.
    pub fn pass(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::Pass {
                result: None,
                transform: None,
            },
            next: None,
            end: false,
        }
    }

    /// Choice step; add arms with [`Self::when`] and [`Self::otherwise`].
    pub fn choice(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::Choice {
                choices: Vec::new(),
                default: None,
            },
            next: None,
            end: false,
        }
    }

    /// Parallel step over named branch workflows.
    pub fn parallel<S: Into<String>>(
        name: impl Into<String>,
        branches: Vec<(S, WorkflowDefinition)>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::Parallel {
                branches: branches
                    .into_iter()
                    .map(|(n, d)| (n.into(), d))
                    .collect(),
                mode: ParallelMode::default(),
            },
            next: None,
            end: false,
        }
    }

    /// Poll step: run `check` every `interval` until done.
    pub fn poll<F, Fut>(name: impl Into<String>, interval: Duration, check: F) -> Self
    where
        F: Fn(Value, StepContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<PollStatus, StepError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            kind: StepKind::Poll {
                check: Arc::new(move |input, ctx| Box::pin(check(input, ctx))),
                interval,
                timeout: None,
                max_attempts: None,
            },
            next: None,
            end: false,
        }
    }

    /// Loop step: while `condition` holds, jump back to `target`.
    pub fn loop_step(
        name: impl Into<String>,
        condition: impl Fn(&StepContext) -> bool + Send + Sync + 'static,
        target: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::Loop {
                condition: Arc::new(condition),
                target: target.into(),
                max_iterations: 100,
                timeout: None,
                interval: None,
            },
            next: None,
            end: false,
        }
    }

    // ── shared modifiers ────────────────────────────────────────────────────

    pub fn next(mut self, name: impl Into<String>) -> Self {
        self.next = Some(name.into());
        self
    }

    pub fn end(mut self) -> Self {
        self.end = true;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        if let StepKind::Task { retry, .. } = &mut self.kind {
            *retry = Some(policy);
        }
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        match &mut self.kind {
            StepKind::Task { timeout, .. }
            | StepKind::Poll { timeout, .. }
            | StepKind::Loop { timeout, .. } => *timeout = Some(duration),
            _ => {}
        }
        self
    }

    /// Custom step-input computation (default: previous step output, or the
    /// workflow input for the first step).
    pub fn input(mut self, f: impl Fn(&StepContext) -> Result<Value, StepError> + Send + Sync + 'static) -> Self {
        if let StepKind::Task { input, .. } = &mut self.kind {
            *input = Some(Arc::new(f));
        }
        self
    }

    pub fn validate_input(mut self, f: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static) -> Self {
        if let StepKind::Task { validate_input, .. } = &mut self.kind {
            *validate_input = Some(Arc::new(f));
        }
        self
    }

    pub fn validate_output(mut self, f: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static) -> Self {
        if let StepKind::Task { validate_output, .. } = &mut self.kind {
            *validate_output = Some(Arc::new(f));
        }
        self
    }

    // ── kind-specific modifiers ─────────────────────────────────────────────

    pub fn result(mut self, value: Value) -> Self {
        if let StepKind::Pass { result, .. } = &mut self.kind {
            *result = Some(value);
        }
        self
    }

    pub fn transform(mut self, f: impl Fn(&StepContext) -> Result<Value, StepError> + Send + Sync + 'static) -> Self {
        if let StepKind::Pass { transform, .. } = &mut self.kind {
            *transform = Some(Arc::new(f));
        }
        self
    }

    pub fn when(
        mut self,
        condition: impl Fn(&StepContext) -> bool + Send + Sync + 'static,
        target: impl Into<String>,
    ) -> Self {
        if let StepKind::Choice { choices, .. } = &mut self.kind {
            choices.push((Arc::new(condition), target.into()));
        }
        self
    }

    pub fn otherwise(mut self, target: impl Into<String>) -> Self {
        if let StepKind::Choice { default, .. } = &mut self.kind {
            *default = Some(target.into());
        }
        self
    }

    pub fn wait_all(mut self) -> Self {
        if let StepKind::Parallel { mode, .. } = &mut self.kind {
            *mode = ParallelMode::WaitAll;
        }
        self
    }

    pub fn poll_timeout(mut self, duration: Duration) -> Self {
        if let StepKind::Poll { timeout, .. } = &mut self.kind {
            *timeout = Some(duration);
        }
        self
    }

    pub fn poll_max_attempts(mut self, max: u32) -> Self {
        if let StepKind::Poll { max_attempts, .. } = &mut self.kind {
            *max_attempts = Some(max);
        }
        self
    }

    pub fn max_iterations(mut self, max: u32) -> Self {
        if let StepKind::Loop { max_iterations, .. } = &mut self.kind {
            *max_iterations = max;
        }
        self
    }

    pub fn loop_interval(mut self, duration: Duration) -> Self {
        if let StepKind::Loop { interval, .. } = &mut self.kind {
            *interval = Some(duration);
        }
        self
    }
}

/// A validated, named step graph.
#[derive(Clone)]
pub struct WorkflowDefinition {
    pub name: String,
    pub steps: IndexMap<String, StepDef>,
    /// Run each instance in a dedicated executor subprocess.
    pub isolated: bool,
    /// Bound on the whole instance.
    pub timeout: Option<Duration>,
}

impl WorkflowDefinition {
    pub fn first_step(&self) -> Option<&str> {
        self.steps.keys().next().map(String::as_str)
    }

    pub fn step(&self, name: &str) -> Option<&StepDef> {
        self.steps.get(name)
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}

impl std::fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("name", &self.name)
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .field("isolated", &self.isolated)
            .finish_non_exhaustive()
    }
}

/// Errors from building a workflow definition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("workflow {0} has no steps")]
    Empty(String),
    #[error("duplicate step name {0}")]
    DuplicateStep(String),
    #[error("step {from} links to unknown step {to}")]
    UnknownTarget { from: String, to: String },
    #[error("step navigation forms a cycle through {0} (only loop may revisit a step)")]
    Cycle(String),
    #[error("loop step {0} must target an earlier step")]
    LoopTargetAhead(String),
}

/// Builder enforcing graph validity at `build`.
pub struct WorkflowBuilder {
    name: String,
    steps: IndexMap<String, StepDef>,
    isolated: bool,
    timeout: Option<Duration>,
    duplicate: Option<String>,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: IndexMap::new(),
            isolated: true,
            timeout: None,
            duplicate: None,
        }
    }

    pub fn isolated(mut self, isolated: bool) -> Self {
        self.isolated = isolated;
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    pub fn step(mut self, step: StepDef) -> Self {
        if self.steps.contains_key(&step.name) {
            self.duplicate.get_or_insert(step.name.clone());
        }
        self.steps.insert(step.name.clone(), step);
        self
    }

    pub fn build(mut self) -> Result<WorkflowDefinition, DefinitionError> {
        if let Some(name) = self.duplicate {
            return Err(DefinitionError::DuplicateStep(name));
        }
        if self.steps.is_empty() {
            return Err(DefinitionError::Empty(self.name));
        }

        // The last added step terminates the workflow unless explicitly linked.
        if let Some(last) = self.steps.values_mut().last() {
            if last.next.is_none() && !matches!(last.kind, StepKind::Choice { .. }) {
                last.end = true;
            }
        }

        validate_targets(&self.steps)?;
        validate_acyclic(&self.steps)?;

        Ok(WorkflowDefinition {
            name: self.name,
            steps: self.steps,
            isolated: self.isolated,
            timeout: self.timeout,
        })
    }
}

/// Every navigation target must name an existing step, and loop targets must
/// point backwards.
fn validate_targets(steps: &IndexMap<String, StepDef>) -> Result<(), DefinitionError> {
    let positions: std::collections::HashMap<&str, usize> = steps
        .keys()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();

    let check = |from: &str, to: &str| -> Result<(), DefinitionError> {
        if !steps.contains_key(to) {
            return Err(DefinitionError::UnknownTarget {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    };

    for (name, step) in steps {
        if let Some(next) = &step.next {
            check(name, next)?;
        }
        match &step.kind {
            StepKind::Choice { choices, default } => {
                for (_, target) in choices {
                    check(name, target)?;
                }
                if let Some(default) = default {
                    check(name, default)?;
                }
            }
            StepKind::Loop { target, .. } => {
                check(name, target)?;
                if positions[target.as_str()] >= positions[name.as_str()] {
                    return Err(DefinitionError::LoopTargetAhead(name.clone()));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// DFS cycle detection over `next` and choice edges; loop-back edges are
/// excluded by construction (validated to point backwards).
fn validate_acyclic(steps: &IndexMap<String, StepDef>) -> Result<(), DefinitionError> {
    fn forward_edges<'a>(step: &'a StepDef) -> Vec<&'a str> {
        let mut edges = Vec::new();
        if let Some(next) = &step.next {
            edges.push(next.as_str());
        }
        match &step.kind {
            StepKind::Choice { choices, default } => {
                edges.extend(choices.iter().map(|(_, t)| t.as_str()));
                if let Some(default) = default {
                    edges.push(default.as_str());
                }
            }
            StepKind::Loop { .. } => {
                // The loop-back edge is intentionally not a graph edge here.
            }
            _ => {}
        }
        edges
    }

    fn visit<'a>(
        name: &'a str,
        steps: &'a IndexMap<String, StepDef>,
        visiting: &mut HashSet<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> Result<(), DefinitionError> {
        if done.contains(name) {
            return Ok(());
        }
        if !visiting.insert(name) {
            return Err(DefinitionError::Cycle(name.to_string()));
        }
        if let Some(step) = steps.get(name) {
            for edge in forward_edges(step) {
                visit(edge, steps, visiting, done)?;
            }
        }
        visiting.remove(name);
        done.insert(name);
        Ok(())
    }

    let mut visiting = HashSet::new();
    let mut done = HashSet::new();
    for name in steps.keys() {
        visit(name, steps, &mut visiting, &mut done)?;
    }
    Ok(())
}

impl std::fmt::Debug for StepDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDef")
            .field("name", &self.name)
            .field("kind", &self.kind.kind_name())
            .field("next", &self.next)
            .field("end", &self.end)
            .finish()
    }
}

#[cfg(test)]
#[path = "definition_tests.rs"]
mod tests;
