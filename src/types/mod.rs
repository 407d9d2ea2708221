//! Shared typed records used across the crate.
//!
//! The planner, executor, chain manager and stream hub all exchange these
//! types instead of loosely shaped JSON maps. Result references inside
//! task parameters are a tagged variant ([`ParamValue`]) resolved by the
//! executor at dispatch time.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a single task within a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Declared but dependencies not yet satisfied.
    Pending,
    /// All dependencies completed; eligible for dispatch.
    Ready,
    /// Dispatched to a tool; awaiting its result.
    InProgress,
    /// Tool returned success; `result` is populated.
    Completed,
    /// Tool failed after retries (and fallback, if any).
    Failed,
    /// Never executed: plan cancelled, or an upstream failed.
    Skipped,
}

impl TaskStatus {
    /// Whether this status is terminal (no further transitions).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// A task parameter value: either a literal, or a reference to a field of
/// an upstream task's result, resolved at dispatch time.
///
/// The reference form deserializes from `{"from_task": "...", "path": "..."}`;
/// anything else is a literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Reference to a field of an upstream task's committed result.
    FromTask {
        /// Id of the upstream task within the same plan.
        from_task: String,
        /// Dotted path into the upstream result (empty = whole result).
        path: String,
    },
    /// A plain JSON literal passed through unchanged.
    Literal(serde_json::Value),
}

/// Parameter map for a task. Ordered so serialized plans are stable.
pub type TaskParams = BTreeMap<String, ParamValue>;

/// One unit of work bound to a single tool invocation.
///
/// Immutable once scheduled except for `status`, `result` and `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Opaque unique id within the plan (e.g. `task_0`).
    pub id: String,
    /// Human-readable label shown in progress messages.
    pub description: String,
    /// Name of a registered tool.
    pub tool: String,
    /// Parameters; may contain result references.
    pub parameters: TaskParams,
    /// Ids of tasks that must complete before this one is eligible.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Lower runs earlier among ready tasks; ties break by declaration order.
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Current lifecycle state.
    #[serde(default = "default_status")]
    pub status: TaskStatus,
    /// Committed result, populated on completion.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Final error message, populated on failure.
    #[serde(default)]
    pub error: Option<String>,
    /// Additional attempts after the first failure.
    #[serde(default)]
    pub max_retries: u32,
    /// Tool to run with the same resolved arguments after retries exhaust.
    #[serde(default)]
    pub fallback_tool: Option<String>,
}

fn default_priority() -> i32 {
    1
}

fn default_status() -> TaskStatus {
    TaskStatus::Pending
}

impl Task {
    /// Construct a pending task with default policy fields.
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        tool: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            tool: tool.into(),
            parameters: TaskParams::new(),
            dependencies: Vec::new(),
            priority: default_priority(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            max_retries: 0,
            fallback_tool: None,
        }
    }

    /// Insert a literal parameter, returning `self` for chaining.
    #[must_use]
    pub fn with_param(mut self, name: &str, value: serde_json::Value) -> Self {
        self.parameters
            .insert(name.to_owned(), ParamValue::Literal(value));
        self
    }
}

/// The ordered task list produced for one user utterance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    /// Tasks in declaration order.
    pub tasks: Vec<Task>,
    /// Generation counter, bumped when a confirmation rewrites the chain.
    #[serde(default)]
    pub generation: u64,
}

impl Plan {
    /// A plan with no tasks (pure conversation).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether the plan carries no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// One record in the user's inventory snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryItem {
    /// Stable record id assigned by the inventory backend.
    pub id: String,
    /// Item name; the key the name-scoped tools operate on.
    pub item_name: String,
    /// Quantity in `unit`s.
    #[serde(default)]
    pub quantity: f64,
    /// Unit of measure.
    #[serde(default)]
    pub unit: String,
    /// Where the item is stored.
    #[serde(default)]
    pub storage_location: String,
    /// Optional expiry date, ISO 8601.
    #[serde(default)]
    pub expiry_date: Option<String>,
    /// Creation timestamp; the FIFO ordering key.
    pub created_at: DateTime<Utc>,
}

/// One choice offered to the user while a plan is paused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationOption {
    /// Canonical value (`oldest`, `latest`, `all`, `confirm`, `cancel`).
    pub value: String,
    /// Human-readable description of the choice.
    pub description: String,
}

/// State parked on the session while awaiting the user's confirmation.
///
/// Holds the ambiguous task, the matching inventory records, and the rest
/// of the plan so execution can resume (or be rewritten) after the reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationContext {
    /// The task whose ambiguity paused the plan.
    pub original_task: Task,
    /// The inventory name in question.
    pub item_name: String,
    /// Matching records from the snapshot at suspension time (may be empty).
    pub candidate_items: Vec<InventoryItem>,
    /// Tasks to resume after resolution. Dependency edges pointing at
    /// `original_task.id` are already removed.
    pub remaining_task_chain: Vec<Task>,
    /// The choice set offered to the user.
    pub options: Vec<ConfirmationOption>,
    /// When the confirmation was raised; drives the expiry timeout.
    pub issued_at: DateTime<Utc>,
}

/// Progress snapshot carried in every progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressInfo {
    /// Total tasks in the current chain.
    pub total_tasks: usize,
    /// Tasks that have reached a terminal state.
    pub completed_tasks: usize,
    /// `floor(100 * completed / total)`, 0 when the chain is empty.
    pub progress_percentage: u32,
    /// Description of the task currently in flight, or a waiting label.
    pub current_task: String,
    /// Tasks not yet terminal.
    pub remaining_tasks: usize,
    /// Whether every task is terminal.
    pub is_complete: bool,
}

/// Kind discriminator for [`ProgressEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventKind {
    /// Chain accepted; `total_tasks` known.
    Start,
    /// A task transitioned; snapshot updated.
    Progress,
    /// A task or the system failed.
    Error,
    /// The chain reached a terminal state.
    Complete,
}

/// Structured error payload attached to `error` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressError {
    /// Stable machine-readable code (e.g. `TASK_FAILED`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Free-form diagnostic detail.
    pub details: String,
}

/// One frame of the per-session progress stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Event kind.
    #[serde(rename = "type")]
    pub kind: ProgressEventKind,
    /// Stream session this event belongs to.
    pub session_id: String,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Human-readable narration of the transition.
    pub message: String,
    /// Progress snapshot at emission time.
    pub progress: ProgressInfo,
    /// Present only on `error` events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProgressError>,
}
