//! Task graph executor: ready-queue scheduling over the plan DAG.
//!
//! The dispatch loop repeatedly computes the set of ready tasks (pending,
//! all dependencies completed), checks each against the ambiguity detector,
//! and dispatches the rest in parallel waves bounded by a concurrency
//! limit. Upstream results are injected into downstream parameters at
//! dispatch time; failures follow the per-task retry policy and optional
//! fallback tool. Ambiguity is not an error: it surfaces as
//! [`DispatchOutcome::Suspended`] carrying the remaining chain.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::ambiguity::{AmbiguityDetector, AmbiguityInfo};
use crate::chain::{TaskChainManager, SYSTEM_TASK_ID};
use crate::tools::{ToolError, ToolRegistry};
use crate::types::{InventoryItem, ParamValue, Task, TaskStatus};

/// Base delay between retry attempts; grows linearly per attempt.
const RETRY_BACKOFF_BASE_MS: u64 = 200;

/// Upper bound on the random jitter added to each backoff.
const RETRY_JITTER_MS: u64 = 100;

/// Executor-level errors. Per-task failures are recorded on the task and
/// do not abort the plan; only structural problems surface here.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// No task is ready yet tasks remain pending: a circular or broken
    /// dependency slipped past validation.
    #[error("plan is stuck: {0}")]
    Stuck(String),
}

/// Result of one run of the dispatch loop.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Every task reached a terminal state.
    Completed,
    /// A ready task needs user confirmation; the plan is paused.
    Suspended {
        /// The ambiguity that caused the suspension.
        ambiguity: AmbiguityInfo,
        /// Non-terminal tasks excluding the ambiguous one, in order.
        remaining: Vec<Task>,
    },
}

/// Outcome of one task's work unit, keyed back by task index.
struct UnitResult {
    index: usize,
    outcome: Result<serde_json::Value, String>,
}

/// Ready-queue scheduler over a plan's task DAG.
pub struct TaskGraphExecutor {
    registry: Arc<ToolRegistry>,
    detector: AmbiguityDetector,
    max_concurrency: usize,
}

impl TaskGraphExecutor {
    /// Create an executor dispatching at most `max_concurrency` tasks at
    /// once.
    pub fn new(registry: Arc<ToolRegistry>, max_concurrency: usize) -> Self {
        Self {
            registry,
            detector: AmbiguityDetector::new(),
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Run the dispatch loop until the plan completes or suspends.
    ///
    /// Task statuses, results and errors are committed onto `tasks`;
    /// every transition is reported to the chain manager.
    pub async fn run(
        &self,
        tasks: &mut [Task],
        inventory: &[InventoryItem],
        auth_token: &str,
        chain: &mut TaskChainManager,
    ) -> Result<DispatchOutcome, ExecutorError> {
        self.run_with_preconfirmed(tasks, inventory, auth_token, chain, &[])
            .await
    }

    /// Like [`run`](Self::run), but tasks whose ids are listed in
    /// `preconfirmed` skip ambiguity detection.
    ///
    /// Used on resumption: the rewritten head task carries the user's
    /// explicit choice, so asking again would loop forever.
    pub async fn run_with_preconfirmed(
        &self,
        tasks: &mut [Task],
        inventory: &[InventoryItem],
        auth_token: &str,
        chain: &mut TaskChainManager,
        preconfirmed: &[String],
    ) -> Result<DispatchOutcome, ExecutorError> {
        loop {
            propagate_skips(tasks, chain);

            if tasks.iter().all(|t| t.status.is_terminal()) {
                return Ok(DispatchOutcome::Completed);
            }

            let ready = ready_indices(tasks);
            if ready.is_empty() {
                // Pending tasks remain but nothing can run: structural
                // failure that validation should have caught.
                warn!("no ready tasks but plan incomplete, marking remainder skipped");
                for task in tasks.iter_mut().filter(|t| !t.status.is_terminal()) {
                    task.status = TaskStatus::Skipped;
                    chain.update_task_progress(&task.id, TaskStatus::Skipped);
                }
                chain.update_task_progress(SYSTEM_TASK_ID, TaskStatus::Failed);
                return Err(ExecutorError::Stuck(
                    "unsatisfiable dependencies in accepted plan".to_owned(),
                ));
            }

            // Confirmation check runs over the whole ready set before any
            // dispatch, so a suspension never races a mutation.
            for &idx in &ready {
                if preconfirmed.contains(&tasks[idx].id) {
                    continue;
                }
                if let Some(ambiguity) = self.detector.detect(&tasks[idx], inventory) {
                    info!(task = %tasks[idx].id, "suspending for user confirmation");
                    let remaining = tasks
                        .iter()
                        .filter(|t| !t.status.is_terminal() && t.id != ambiguity.original_task.id)
                        .cloned()
                        .collect();
                    return Ok(DispatchOutcome::Suspended {
                        ambiguity,
                        remaining,
                    });
                }
            }

            let wave: Vec<usize> = ready.into_iter().take(self.max_concurrency).collect();
            self.dispatch_wave(tasks, &wave, auth_token, chain).await;
        }
    }

    /// Dispatch one wave of ready tasks concurrently and commit results.
    async fn dispatch_wave(
        &self,
        tasks: &mut [Task],
        wave: &[usize],
        auth_token: &str,
        chain: &mut TaskChainManager,
    ) {
        let mut join_set: JoinSet<UnitResult> = JoinSet::new();

        for &idx in wave {
            // Resolve result references against committed upstream results
            // before handing the task to its work unit.
            let resolved = match resolve_parameters(&tasks[idx], tasks) {
                Ok(args) => args,
                Err(reason) => {
                    // Fatal: the upstream cannot change any more.
                    warn!(task = %tasks[idx].id, %reason, "parameter resolution failed");
                    tasks[idx].status = TaskStatus::Failed;
                    tasks[idx].error = Some(reason);
                    chain.update_task_progress(&tasks[idx].id, TaskStatus::Failed);
                    continue;
                }
            };

            tasks[idx].status = TaskStatus::InProgress;
            chain.update_task_progress(&tasks[idx].id, TaskStatus::InProgress);

            let registry = Arc::clone(&self.registry);
            let tool = tasks[idx].tool.clone();
            let fallback = tasks[idx].fallback_tool.clone();
            let max_retries = tasks[idx].max_retries;
            let token = auth_token.to_owned();
            let task_id = tasks[idx].id.clone();

            join_set.spawn(async move {
                let outcome = invoke_with_policy(
                    &registry,
                    &task_id,
                    &tool,
                    fallback.as_deref(),
                    resolved,
                    max_retries,
                    &token,
                )
                .await;
                UnitResult {
                    index: idx,
                    outcome,
                }
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(unit) => {
                    let task = &mut tasks[unit.index];
                    match unit.outcome {
                        Ok(result) => {
                            task.status = TaskStatus::Completed;
                            task.result = Some(result);
                            chain.update_task_progress(&task.id, TaskStatus::Completed);
                        }
                        Err(message) => {
                            task.status = TaskStatus::Failed;
                            task.error = Some(message);
                            chain.update_task_progress(&task.id, TaskStatus::Failed);
                        }
                    }
                }
                Err(join_error) => {
                    // A panicked work unit belongs to no recoverable task
                    // transition; report it at the system level.
                    warn!(error = %join_error, "task work unit panicked");
                    chain.update_task_progress(SYSTEM_TASK_ID, TaskStatus::Failed);
                }
            }
        }
    }

    /// Mark every non-terminal task skipped (user cancel path).
    pub fn skip_remaining(tasks: &mut [Task], chain: &mut TaskChainManager) {
        for task in tasks.iter_mut().filter(|t| !t.status.is_terminal()) {
            task.status = TaskStatus::Skipped;
            chain.update_task_progress(&task.id, TaskStatus::Skipped);
        }
    }
}

/// Indices of tasks that are pending with every dependency completed.
fn ready_indices(tasks: &[Task]) -> Vec<usize> {
    let mut ready: Vec<usize> = tasks
        .iter()
        .enumerate()
        .filter(|(_, t)| t.status == TaskStatus::Pending && deps_completed(t, tasks))
        .map(|(i, _)| i)
        .collect();

    // Priority ascending; declaration order breaks ties (stable sort over
    // an index list already in declaration order).
    ready.sort_by_key(|&i| tasks[i].priority);
    ready
}

/// Whether every dependency of `task` has completed.
fn deps_completed(task: &Task, tasks: &[Task]) -> bool {
    task.dependencies.iter().all(|dep| {
        tasks
            .iter()
            .any(|t| &t.id == dep && t.status == TaskStatus::Completed)
    })
}

/// Skip pending tasks whose dependencies can no longer complete.
fn propagate_skips(tasks: &mut [Task], chain: &mut TaskChainManager) {
    // Repeat until stable so skips cascade through dependency chains.
    loop {
        let mut to_skip = Vec::new();
        for (i, task) in tasks.iter().enumerate() {
            if task.status != TaskStatus::Pending {
                continue;
            }
            let blocked = task.dependencies.iter().any(|dep| {
                tasks
                    .iter()
                    .any(|t| &t.id == dep && t.status.is_terminal() && t.status != TaskStatus::Completed)
            });
            if blocked {
                to_skip.push(i);
            }
        }

        if to_skip.is_empty() {
            return;
        }
        for i in to_skip {
            warn!(task = %tasks[i].id, "skipping task: upstream did not complete");
            tasks[i].status = TaskStatus::Skipped;
            let id = tasks[i].id.clone();
            chain.update_task_progress(&id, TaskStatus::Skipped);
        }
    }
}

/// Resolve a task's parameters into a concrete JSON argument object.
fn resolve_parameters(
    task: &Task,
    tasks: &[Task],
) -> Result<serde_json::Map<String, serde_json::Value>, String> {
    let mut args = serde_json::Map::new();

    for (name, value) in &task.parameters {
        let resolved = match value {
            ParamValue::Literal(v) => v.clone(),
            ParamValue::FromTask { from_task, path } => {
                let upstream = tasks
                    .iter()
                    .find(|t| &t.id == from_task)
                    .ok_or_else(|| format!("parameter {name} references unknown task {from_task}"))?;
                let result = upstream.result.as_ref().ok_or_else(|| {
                    format!("parameter {name} references {from_task} which has no result")
                })?;
                let extracted = resolve_path(result, path).ok_or_else(|| {
                    format!("parameter {name}: path {path:?} not found in result of {from_task}")
                })?;
                if extracted.is_null() {
                    return Err(format!(
                        "parameter {name}: path {path:?} in result of {from_task} is null"
                    ));
                }
                extracted
            }
        };
        args.insert(name.clone(), resolved);
    }

    Ok(args)
}

/// Walk a dotted path through objects and array indices.
///
/// An empty path yields the whole value.
fn resolve_path(value: &serde_json::Value, path: &str) -> Option<serde_json::Value> {
    if path.is_empty() {
        return Some(value.clone());
    }

    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Invoke a tool under the task's retry policy, then its fallback.
///
/// Retryable errors get `max_retries` additional attempts with a short
/// jittered backoff. When attempts exhaust and a fallback tool is set, the
/// fallback runs once with the same resolved arguments; its success
/// completes the task.
async fn invoke_with_policy(
    registry: &ToolRegistry,
    task_id: &str,
    tool: &str,
    fallback: Option<&str>,
    args: serde_json::Map<String, serde_json::Value>,
    max_retries: u32,
    token: &str,
) -> Result<serde_json::Value, String> {
    let attempts = max_retries.saturating_add(1);
    let mut last_error = String::new();

    for attempt in 0..attempts {
        if attempt > 0 {
            let jitter = rand::thread_rng().gen_range(0..=RETRY_JITTER_MS);
            let delay = RETRY_BACKOFF_BASE_MS
                .saturating_mul(u64::from(attempt))
                .saturating_add(jitter);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            info!(task = task_id, tool, attempt, "retrying task");
        }

        match registry.invoke(tool, args.clone(), token).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                last_error = e.to_string();
                if !e.is_retryable() {
                    break;
                }
            }
        }
    }

    if let Some(fallback_tool) = fallback {
        warn!(task = task_id, tool, fallback = fallback_tool, "primary exhausted, running fallback");
        match registry.invoke(fallback_tool, args, token).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                return Err(format!(
                    "{last_error}; fallback {fallback_tool} also failed: {e}"
                ));
            }
        }
    }

    Err(last_error)
}
