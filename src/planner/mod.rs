//! Planner — turns a user utterance plus current inventory into a
//! dependency-ordered task list.
//!
//! The planner is language-model-backed: it composes a prompt enumerating
//! every available tool with its schema plus a per-name summary of the
//! inventory, parses the structured `{tasks: [...]}` reply (tolerating
//! markdown code fences), normalises parameter names, resolves dependencies
//! declared as sibling descriptions into ids, validates the graph is a DAG,
//! and applies sanity gates against planner hallucination. It never
//! executes anything.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::llm::{LlmClient, LlmError};
use crate::tools::ToolSpec;
use crate::types::{InventoryItem, ParamValue, Plan, Task};

/// Utterances shorter than this yielding more than two tasks are rejected.
const SHORT_UTTERANCE_CHARS: usize = 10;

/// Greeting / small-talk fragments that must never produce write tasks.
const CONVERSATIONAL_MARKERS: &[&str] = &[
    "hello",
    "hi there",
    "good morning",
    "good evening",
    "thanks",
    "thank you",
    "how are you",
    "nice weather",
];

/// Write-tool prefixes a conversational utterance must not trigger.
const WRITE_TOOL_PREFIXES: &[&str] = &[
    "inventory_add",
    "inventory_update",
    "inventory_delete",
];

/// Planner errors.
#[derive(Debug, Error)]
pub enum PlannerError {
    /// A declared dependency resolves to no sibling task.
    #[error("unresolved dependency: {0}")]
    UnresolvedDependency(String),
    /// The dependency graph contains a cycle.
    #[error("dependency cycle detected")]
    CycleDetected,
    /// The inference call failed.
    #[error("llm error: {0}")]
    Llm(#[from] LlmError),
}

/// Raw task shape as emitted by the model.
#[derive(Debug, Deserialize)]
struct RawTask {
    description: String,
    tool: String,
    #[serde(default)]
    parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default = "default_raw_priority")]
    priority: i32,
    #[serde(default)]
    max_retries: u32,
    #[serde(default)]
    fallback_tool: Option<String>,
}

fn default_raw_priority() -> i32 {
    1
}

/// Raw plan envelope as emitted by the model.
#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    tasks: Vec<RawTask>,
}

/// Language-model-backed planner.
pub struct Planner<'a> {
    llm: &'a dyn LlmClient,
    task_counter: u64,
}

impl<'a> Planner<'a> {
    /// Create a planner over the given LLM client.
    pub fn new(llm: &'a dyn LlmClient) -> Self {
        Self {
            llm,
            task_counter: 0,
        }
    }

    /// Produce a validated plan for one utterance.
    ///
    /// Returns an empty plan for pure conversation, for rejected plans
    /// (sanity gates), and for deletion requests whose model output could
    /// not be parsed. Parse failures on other requests fall back to a
    /// single heuristic task.
    pub async fn create_plan(
        &mut self,
        utterance: &str,
        catalogue: &[ToolSpec],
        inventory: &[InventoryItem],
    ) -> Result<Plan, PlannerError> {
        info!(utterance, "planning user request");

        let prompt = compose_planning_prompt(utterance, catalogue, inventory);
        let response = self.llm.plan(&prompt).await?;

        let raw = match parse_plan_response(&response) {
            Ok(raw) => raw,
            Err(reason) => {
                warn!(%reason, "plan parse failed, applying heuristic fallback");
                return Ok(self.fallback_plan(utterance));
            }
        };

        let mut tasks = Vec::with_capacity(raw.tasks.len());
        for raw_task in raw.tasks {
            tasks.push(self.materialise_task(raw_task));
        }

        if is_inappropriate(utterance, &tasks, inventory) {
            warn!(utterance, count = tasks.len(), "plan rejected by sanity gates");
            return Ok(Plan::empty());
        }

        resolve_dependencies(&mut tasks)?;
        validate_acyclic(&tasks)?;

        // Stable sort keeps declaration order among equal priorities.
        tasks.sort_by_key(|t| t.priority);

        info!(count = tasks.len(), "plan accepted");
        Ok(Plan {
            tasks,
            generation: 0,
        })
    }

    /// Assign an id and fold parameter synonyms to canonical names.
    fn materialise_task(&mut self, raw: RawTask) -> Task {
        let id = format!("task_{}", self.task_counter);
        self.task_counter = self.task_counter.saturating_add(1);

        let mut task = Task::new(id, raw.description, raw.tool);
        task.priority = raw.priority;
        task.dependencies = raw.dependencies;
        task.max_retries = raw.max_retries;
        task.fallback_tool = raw.fallback_tool;

        for (name, value) in raw.parameters {
            let canonical = canonical_param_name(&name);
            let param = match serde_json::from_value::<ParamValue>(value.clone()) {
                Ok(p) => p,
                Err(_) => ParamValue::Literal(value),
            };
            task.parameters.insert(canonical, param);
        }
        task
    }

    /// Heuristic single-task plan when model output cannot be parsed.
    ///
    /// Deletions must not guess a target, so they yield an empty plan.
    fn fallback_plan(&mut self, utterance: &str) -> Plan {
        let lowered = utterance.to_lowercase();

        if lowered.contains("delete") || lowered.contains("remove") {
            warn!("parse failure on a deletion request, refusing to guess");
            return Plan::empty();
        }

        let id = format!("task_{}", self.task_counter);
        self.task_counter = self.task_counter.saturating_add(1);

        let task = if lowered.contains("inventory") || lowered.contains("stock") {
            Task::new(id, "List current inventory", "inventory_list")
        } else {
            Task::new(id, format!("Answer: {utterance}"), "llm_chat")
                .with_param("message", serde_json::Value::String(utterance.to_owned()))
        };

        Plan {
            tasks: vec![task],
            generation: 0,
        }
    }
}

/// Compose the planning prompt: tool catalogue + inventory summary + rules.
fn compose_planning_prompt(
    utterance: &str,
    catalogue: &[ToolSpec],
    inventory: &[InventoryItem],
) -> String {
    let tools_json = serialize_catalogue(catalogue);
    let inventory_summary = summarise_inventory(inventory);

    format!(
        "Analyse the user's request and break it into executable tasks.\n\n\
         User request: \"{utterance}\"\n\n\
         Available tools:\n{tools_json}\n\n\
         Current inventory by item name:\n{inventory_summary}\n\n\
         Rules:\n\
         1. Greetings and small talk produce an empty task list.\n\
         2. Inventory requests pick the matching inventory tool; deletions \
         and updates must target records that exist in the inventory above.\n\
         3. Different items become separate tasks. A task that needs another \
         task's output declares it in \"dependencies\" (by sibling id or by \
         the sibling's exact description) and may reference its result with \
         {{\"from_task\": \"<id>\", \"path\": \"<dotted-path>\"}} parameters.\n\n\
         Answer with JSON only:\n\
         {{\"tasks\": [{{\"description\": \"...\", \"tool\": \"...\", \
         \"parameters\": {{}}, \"priority\": 1, \"dependencies\": []}}]}}"
    )
}

/// Serialize the catalogue for the prompt (name, description, schema).
fn serialize_catalogue(catalogue: &[ToolSpec]) -> String {
    serde_json::to_string_pretty(catalogue).unwrap_or_else(|_| "[]".to_owned())
}

/// Aggregate the snapshot per item name: record ids and quantities.
fn summarise_inventory(inventory: &[InventoryItem]) -> String {
    if inventory.is_empty() {
        return "(empty)".to_owned();
    }

    let mut by_name: BTreeMap<&str, Vec<serde_json::Value>> = BTreeMap::new();
    for item in inventory {
        by_name
            .entry(item.item_name.as_str())
            .or_default()
            .push(serde_json::json!({
                "id": item.id,
                "quantity": item.quantity,
            }));
    }

    serde_json::to_string_pretty(&by_name).unwrap_or_else(|_| "(empty)".to_owned())
}

/// Parse the model reply, tolerating surrounding markdown fences.
fn parse_plan_response(response: &str) -> Result<RawPlan, String> {
    let trimmed = response.trim();

    if let Ok(plan) = serde_json::from_str::<RawPlan>(trimmed) {
        return Ok(plan);
    }

    if let Some(block) = extract_json_block(trimmed) {
        if let Ok(plan) = serde_json::from_str::<RawPlan>(block) {
            return Ok(plan);
        }
    }

    Err(format!(
        "could not parse plan from response: {}",
        truncate_for_error(trimmed, 200)
    ))
}

/// Extract JSON content from a markdown code fence.
///
/// Supports both ````json ... ```` and ```` ``` ... ``` ```` blocks.
fn extract_json_block(text: &str) -> Option<&str> {
    let start_marker_json = "```json";
    let start_marker_plain = "```";
    let end_marker = "```";

    let content_start = if let Some(pos) = text.find(start_marker_json) {
        pos.checked_add(start_marker_json.len())?
    } else if let Some(pos) = text.find(start_marker_plain) {
        pos.checked_add(start_marker_plain.len())?
    } else {
        return None;
    };

    let rest = text.get(content_start..)?;
    let rest = rest.strip_prefix('\n').unwrap_or(rest);

    let end_pos = rest.find(end_marker)?;
    let content = rest.get(..end_pos)?;
    Some(content.trim())
}

/// Fold common parameter-name synonyms to canonical names.
fn canonical_param_name(name: &str) -> String {
    match name {
        "item" | "name" => "item_name".to_owned(),
        "id" => "item_id".to_owned(),
        "amount" => "quantity".to_owned(),
        "location" => "storage_location".to_owned(),
        other => other.to_owned(),
    }
}

/// Sanity gates: reject plans a careful human would never produce.
fn is_inappropriate(utterance: &str, tasks: &[Task], inventory: &[InventoryItem]) -> bool {
    let lowered = utterance.to_lowercase();

    // Gate 1: conversational utterance with write tasks.
    let conversational = CONVERSATIONAL_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker));
    if conversational {
        let has_write = tasks.iter().any(|t| {
            WRITE_TOOL_PREFIXES
                .iter()
                .any(|prefix| t.tool.starts_with(prefix))
        });
        if has_write {
            warn!(utterance, "conversational utterance produced write tasks");
            return true;
        }
    }

    // Gate 2: short utterance with many tasks.
    if utterance.chars().count() < SHORT_UTTERANCE_CHARS && tasks.len() > 2 {
        warn!(
            utterance,
            count = tasks.len(),
            "short utterance produced too many tasks"
        );
        return true;
    }

    // Gate 3: mutation tasks referencing records absent from the snapshot.
    let known_ids: HashSet<&str> = inventory.iter().map(|i| i.id.as_str()).collect();
    let known_names: HashSet<&str> = inventory.iter().map(|i| i.item_name.as_str()).collect();

    for task in tasks {
        let mutates = task.tool.starts_with("inventory_update")
            || task.tool.starts_with("inventory_delete");
        if !mutates {
            continue;
        }

        if let Some(ParamValue::Literal(serde_json::Value::String(id))) =
            task.parameters.get("item_id")
        {
            if !known_ids.contains(id.as_str()) {
                warn!(task = %task.id, item_id = %id, "plan references unknown record id");
                return true;
            }
        }
        if let Some(ParamValue::Literal(serde_json::Value::String(name))) =
            task.parameters.get("item_name")
        {
            if !known_names.contains(name.as_str()) {
                warn!(task = %task.id, item_name = %name, "plan references unknown item name");
                return true;
            }
        }
    }

    false
}

/// Rewrite description-form dependencies to sibling ids and check they all
/// resolve.
fn resolve_dependencies(tasks: &mut [Task]) -> Result<(), PlannerError> {
    let by_id: HashSet<String> = tasks.iter().map(|t| t.id.clone()).collect();
    let by_description: HashMap<String, String> = tasks
        .iter()
        .map(|t| (t.description.clone(), t.id.clone()))
        .collect();

    for task in tasks.iter_mut() {
        let mut resolved = Vec::with_capacity(task.dependencies.len());
        for dep in &task.dependencies {
            if by_id.contains(dep) {
                resolved.push(dep.clone());
            } else if let Some(id) = by_description.get(dep) {
                resolved.push(id.clone());
            } else {
                return Err(PlannerError::UnresolvedDependency(dep.clone()));
            }
        }
        task.dependencies = resolved;
    }
    Ok(())
}

/// Kahn's algorithm: a topological order shorter than the task list means
/// a cycle.
fn validate_acyclic(tasks: &[Task]) -> Result<(), PlannerError> {
    let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    let index_of: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let mut in_degree = vec![0usize; tasks.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); tasks.len()];

    for (i, task) in tasks.iter().enumerate() {
        for dep in &task.dependencies {
            if let Some(&dep_idx) = index_of.get(dep.as_str()) {
                in_degree[i] = in_degree[i].saturating_add(1);
                dependents[dep_idx].push(i);
            }
        }
    }

    let mut queue: VecDeque<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| i)
        .collect();

    let mut visited = 0usize;
    while let Some(i) = queue.pop_front() {
        visited = visited.saturating_add(1);
        for &dependent in &dependents[i] {
            in_degree[dependent] = in_degree[dependent].saturating_sub(1);
            if in_degree[dependent] == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if visited < tasks.len() {
        return Err(PlannerError::CycleDetected);
    }
    Ok(())
}

/// Truncate a string for inclusion in error messages.
fn truncate_for_error(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        s
    } else {
        let mut end = max_len;
        while end > 0 && !s.is_char_boundary(end) {
            end = end.saturating_sub(1);
        }
        s.get(..end).unwrap_or(s)
    }
}
