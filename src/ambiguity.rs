//! Ambiguity detection for name-scoped mutation tools.
//!
//! Name-scoped deletes and updates can target more than one inventory
//! record, and the oldest/latest variants silently pick an end of the
//! FIFO ordering. Both families therefore always require an explicit user
//! confirmation before dispatch; id-scoped tools never do.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{InventoryItem, ParamValue, Task};

/// Tools whose dispatch always pauses for confirmation.
const CONFIRMATION_REQUIRED_TOOLS: &[&str] = &[
    "inventory_delete_by_name",
    "inventory_update_by_name",
    "inventory_delete_by_name_oldest",
    "inventory_delete_by_name_latest",
    "inventory_update_by_name_oldest",
    "inventory_update_by_name_latest",
];

/// Why a task needs confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityKind {
    /// Plain name-scoped mutation: the user must pick a scope.
    MultiTarget,
    /// Oldest/latest variant: the user must acknowledge the ordering end.
    FifoSensitive,
}

/// A detected ambiguity and the records it concerns.
#[derive(Debug, Clone)]
pub struct AmbiguityInfo {
    /// Classification of the ambiguity.
    pub kind: AmbiguityKind,
    /// The inventory name the task targets.
    pub item_name: String,
    /// Records matching that name in the current snapshot (may be empty).
    pub items: Vec<InventoryItem>,
    /// The task that triggered detection.
    pub original_task: Task,
}

/// Stateless classifier over the confirmation-required tool set.
#[derive(Debug, Default)]
pub struct AmbiguityDetector;

impl AmbiguityDetector {
    /// Create a detector.
    pub fn new() -> Self {
        Self
    }

    /// Whether this task's tool belongs to the confirmation-required set.
    pub fn needs_confirmation(&self, task: &Task) -> bool {
        CONFIRMATION_REQUIRED_TOOLS.contains(&task.tool.as_str())
    }

    /// Inspect a ready task against the snapshot.
    ///
    /// Returns `None` when the task may proceed; otherwise the ambiguity
    /// with the matching records. A task without an `item_name` parameter
    /// cannot be classified and proceeds (the tool itself will reject it).
    pub fn detect(&self, task: &Task, inventory: &[InventoryItem]) -> Option<AmbiguityInfo> {
        if !self.needs_confirmation(task) {
            return None;
        }

        let item_name = literal_item_name(task)?;
        let items: Vec<InventoryItem> = inventory
            .iter()
            .filter(|i| i.item_name == item_name)
            .cloned()
            .collect();

        let kind = if task.tool.ends_with("_oldest") || task.tool.ends_with("_latest") {
            AmbiguityKind::FifoSensitive
        } else {
            AmbiguityKind::MultiTarget
        };

        debug!(
            task = %task.id,
            tool = %task.tool,
            item = %item_name,
            matches = items.len(),
            ?kind,
            "ambiguity detected"
        );

        Some(AmbiguityInfo {
            kind,
            item_name,
            items,
            original_task: task.clone(),
        })
    }
}

/// The task's literal `item_name` parameter, if present.
fn literal_item_name(task: &Task) -> Option<String> {
    match task.parameters.get("item_name") {
        Some(ParamValue::Literal(serde_json::Value::String(name))) => Some(name.clone()),
        _ => None,
    }
}
