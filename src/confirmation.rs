//! Confirmation protocol: prompt generation and reply processing.
//!
//! When the executor suspends on an ambiguous task, this module renders
//! the user-facing question (action, matching records, remaining steps,
//! option set) and later parses the user's natural-language reply into a
//! concrete replacement task spliced onto the remaining chain.

use chrono::Utc;
use tracing::{info, warn};

use crate::ambiguity::{AmbiguityInfo, AmbiguityKind};
use crate::types::{ConfirmationContext, ConfirmationOption, ParamValue, Task};

/// Tool name of the clarification sentinel.
///
/// Produced when a reply is not understood; the turn pipeline intercepts
/// it and re-asks instead of routing it to the registry.
pub const CLARIFY_TOOL: &str = "clarify_confirmation";

/// How many matching records are listed individually in the prompt.
const DETAIL_LISTING_LIMIT: usize = 3;

/// The rewritten plan produced from a confirmation reply.
#[derive(Debug, Clone)]
pub struct TaskExecutionPlan {
    /// Rewritten head task followed by the remaining chain. Empty when
    /// cancelled.
    pub tasks: Vec<Task>,
    /// Whether the user cancelled the operation.
    pub cancel: bool,
}

/// Generates confirmation prompts and processes replies.
#[derive(Debug, Default)]
pub struct ConfirmationProcessor;

impl ConfirmationProcessor {
    /// Create a processor.
    pub fn new() -> Self {
        Self
    }

    /// Render the user-facing question and build the context to park on
    /// the session.
    ///
    /// `remaining` is the rest of the plan excluding the ambiguous task;
    /// dependency edges pointing at it are stripped here so the stored
    /// chain is ready to resume.
    pub fn build_confirmation(
        &self,
        ambiguity: &AmbiguityInfo,
        remaining: &[Task],
    ) -> (String, ConfirmationContext) {
        let action = describe_action(&ambiguity.original_task.tool);
        let options = options_for(ambiguity);

        let mut prompt = format!(
            "Before I {action} \"{}\", let me check with you.\n\
             There are currently {} matching record(s) for \"{}\".\n\n",
            ambiguity.item_name,
            ambiguity.items.len(),
            ambiguity.item_name,
        );

        if !remaining.is_empty() {
            prompt.push_str("After this, the following will also run:\n");
            for (i, task) in remaining.iter().enumerate() {
                let n = i.saturating_add(1);
                prompt.push_str(&format!("{n}. {}\n", task.description));
            }
            prompt.push('\n');
        }

        prompt.push_str(&format_items(&ambiguity.items));
        prompt.push_str("\nPlease answer with one of:\n");
        for option in &options {
            prompt.push_str(&format!("- {}\n", option.description));
        }

        let chain: Vec<Task> = remaining
            .iter()
            .filter(|t| t.id != ambiguity.original_task.id)
            .cloned()
            .map(|mut t| {
                t.dependencies
                    .retain(|dep| dep != &ambiguity.original_task.id);
                t
            })
            .collect();

        let context = ConfirmationContext {
            original_task: ambiguity.original_task.clone(),
            item_name: ambiguity.item_name.clone(),
            candidate_items: ambiguity.items.clone(),
            remaining_task_chain: chain,
            options,
            issued_at: Utc::now(),
        };

        (prompt, context)
    }

    /// Parse the user's reply and splice the choice back into the plan.
    pub fn process_reply(&self, user_input: &str, context: &ConfirmationContext) -> TaskExecutionPlan {
        let lowered = user_input.trim().to_lowercase();

        if matches_class(&lowered, &["cancel", "stop", "abort", "never mind"]) {
            info!("confirmation cancelled by user");
            return TaskExecutionPlan {
                tasks: Vec::new(),
                cancel: true,
            };
        }

        let head = self.task_from_choice(&lowered, context);

        let mut tasks = Vec::with_capacity(context.remaining_task_chain.len().saturating_add(1));
        tasks.push(head);
        // Defensive: the stored chain already excludes the original task,
        // but a stale context must not resurrect it.
        for task in &context.remaining_task_chain {
            if task.id == context.original_task.id {
                continue;
            }
            let mut task = task.clone();
            task.dependencies
                .retain(|dep| dep != &context.original_task.id);
            tasks.push(task);
        }

        TaskExecutionPlan {
            tasks,
            cancel: false,
        }
    }

    /// Build the replacement head task for a recognised choice, or the
    /// clarification sentinel for anything else.
    fn task_from_choice(&self, lowered: &str, context: &ConfirmationContext) -> Task {
        let original = &context.original_task;
        let action = describe_action(&original.tool);

        if matches_class(lowered, &["oldest", "old", "first"]) {
            return rewrite_fifo(original, &context.item_name, "oldest", action);
        }

        if matches_class(lowered, &["latest", "newest", "new", "recent"]) {
            return rewrite_fifo(original, &context.item_name, "latest", action);
        }

        if matches_class(lowered, &["all", "everything", "every one"]) {
            let mut task = original.clone();
            task.id = format!("{}_all", original.id);
            task.description = format!("{action} all records of {}", context.item_name);
            return task;
        }

        if matches_class(lowered, &["confirm", "yes", "go ahead", "ok"]) {
            let mut task = original.clone();
            task.id = format!("{}_confirm", original.id);
            return task;
        }

        warn!(reply = lowered, "confirmation reply not understood");
        clarification_task(lowered, context)
    }
}

/// Whether any keyword of the class occurs in the reply.
fn matches_class(lowered: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| lowered.contains(k))
}

/// Map a tool name to its user-facing action verb.
fn describe_action(tool: &str) -> &'static str {
    if tool.contains("delete") {
        "delete"
    } else if tool.contains("update") {
        "update"
    } else {
        "change"
    }
}

/// Rewrite the original name-scoped task to its oldest/latest variant.
fn rewrite_fifo(original: &Task, item_name: &str, end: &str, action: &str) -> Task {
    let tool = if original.tool.contains("delete") {
        format!("inventory_delete_by_name_{end}")
    } else {
        format!("inventory_update_by_name_{end}")
    };

    let mut task = Task::new(
        format!("{}_{end}", original.id),
        format!("{action} the {end} record of {item_name}"),
        tool,
    );

    if original.tool.contains("delete") {
        // A delete needs only the name; stray update fields would confuse
        // the tool.
        task.parameters.insert(
            "item_name".to_owned(),
            ParamValue::Literal(serde_json::Value::String(item_name.to_owned())),
        );
    } else {
        task.parameters = original.parameters.clone();
    }
    task
}

/// The sentinel task produced for an unrecognised reply.
fn clarification_task(user_input: &str, context: &ConfirmationContext) -> Task {
    let mut listing = String::new();
    for option in &context.options {
        listing.push_str(&format!("- {}\n", option.description));
    }

    Task::new(
        "clarify_choice",
        "Ask the user to pick a listed option",
        CLARIFY_TOOL,
    )
    .with_param(
        "message",
        serde_json::Value::String(format!(
            "I didn't understand \"{user_input}\".\n\nPlease answer with one of:\n{listing}"
        )),
    )
}

/// The option set for an ambiguity classification.
fn options_for(ambiguity: &AmbiguityInfo) -> Vec<ConfirmationOption> {
    let option = |value: &str, description: &str| ConfirmationOption {
        value: value.to_owned(),
        description: description.to_owned(),
    };

    match ambiguity.kind {
        AmbiguityKind::MultiTarget => vec![
            option("oldest", "operate on the oldest record"),
            option("latest", "operate on the latest record"),
            option("all", "operate on all records"),
            option("cancel", "cancel"),
        ],
        AmbiguityKind::FifoSensitive => {
            let end = if ambiguity.original_task.tool.ends_with("_latest") {
                "latest"
            } else {
                "oldest"
            };
            vec![
                option("confirm", &format!("operate on the {end} record")),
                option("cancel", "cancel"),
            ]
        }
    }
}

/// Compact listing of the matching records.
fn format_items(items: &[crate::types::InventoryItem]) -> String {
    if items.is_empty() {
        return String::new();
    }
    if items.len() > DETAIL_LISTING_LIMIT {
        return format!("Matching records: {}\n", items.len());
    }

    let mut out = "Record details:\n".to_owned();
    for (i, item) in items.iter().enumerate() {
        let n = i.saturating_add(1);
        let id_prefix: String = item.id.chars().take(8).collect();
        out.push_str(&format!(
            "{n}. id {id_prefix}... (added {})\n",
            item.created_at.format("%Y-%m-%d %H:%M")
        ));
    }
    out
}
