//! Response composition: turns a finished (or cancelled, or failed) plan
//! into a user-facing reply.
//!
//! Simple plans get a language-model-written confirmation grounded in the
//! collected task results. Plans that carried parallel menu proposals are
//! rendered deterministically so both proposals appear side by side with
//! their linked recipes; the model must not collapse them into one.
//! Failures become a friendly apology with a hint, never a raw error.

use serde_json::json;
use tracing::{info, warn};

use crate::llm::LlmClient;
use crate::types::{Task, TaskStatus};

/// Tool producing the model-authored menu proposal.
const LLM_MENU_TOOL: &str = "generate_menu_plan_with_history";

/// Tool producing the retrieval-based menu proposal.
const RAG_MENU_TOOL: &str = "search_menu_from_rag_with_history";

/// Tool producing recipe links for proposed titles.
const RECIPE_LOOKUP_TOOL: &str = "search_recipe_from_web";

/// Composes user-facing replies from plan outcomes.
pub struct ResponseComposer<'a> {
    llm: &'a dyn LlmClient,
}

impl<'a> ResponseComposer<'a> {
    /// Create a composer over the given LLM client.
    pub fn new(llm: &'a dyn LlmClient) -> Self {
        Self { llm }
    }

    /// Reply for a plan that reached a terminal state.
    pub async fn compose_completion(&self, utterance: &str, tasks: &[Task]) -> String {
        if let Some(reply) = render_parallel_proposals(tasks) {
            info!("rendering side-by-side menu proposals");
            return reply;
        }

        let results = collect_results(tasks);
        let prompt = format!(
            "The user asked: {utterance}\n\n\
             Executed steps and their results:\n{}\n\n\
             Write the reply to the user based on these results.\n\
             Rules:\n\
             - For inventory listings, aggregate quantities per item name \
             exactly; no estimates.\n\
             - Explain failures briefly and kindly; never show raw errors \
             or stack traces.\n\
             - Keep it natural and concise; no task statistics.",
            serde_json::to_string_pretty(&results).unwrap_or_else(|_| "[]".to_owned())
        );

        match self.llm.compose(&prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "composer llm call failed, using plain report");
                fallback_report(tasks)
            }
        }
    }

    /// Reply for an empty plan (greeting / small talk).
    pub async fn compose_simple(&self, utterance: &str) -> String {
        let prompt = format!(
            "You are a friendly smart-pantry assistant. The user said: \
             \"{utterance}\". This needs no pantry tools. Reply briefly and \
             warmly; mention you can manage their inventory and suggest \
             menus if they ask."
        );

        match self.llm.compose(&prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "simple reply llm call failed, using canned greeting");
                "Hello! Let me know if you want to check your pantry or plan a meal.".to_owned()
            }
        }
    }

    /// Reply acknowledging a user-initiated cancellation.
    pub fn compose_cancellation(&self, executed: &[Task]) -> String {
        let done = executed
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        if done > 0 {
            format!(
                "Understood, I've cancelled the rest. {done} step(s) had already \
                 finished and were left as they are."
            )
        } else {
            "Understood, I've cancelled that. Nothing was changed.".to_owned()
        }
    }

    /// Reply when a pending confirmation expired before an answer arrived.
    pub fn compose_confirmation_timeout(&self) -> String {
        "That confirmation timed out, so I set the request aside. \
         Just ask again whenever you're ready."
            .to_owned()
    }

    /// Apology for a plan-level failure, with a hint but no raw error.
    pub fn compose_failure(&self, hint: &str) -> String {
        format!(
            "Sorry, I couldn't finish that request. {hint} \
             Please try rephrasing or ask again in a moment."
        )
    }
}

/// Collected per-task summaries handed to the composing model.
fn collect_results(tasks: &[Task]) -> Vec<serde_json::Value> {
    tasks
        .iter()
        .filter(|t| t.status.is_terminal())
        .map(|t| match t.status {
            TaskStatus::Completed => json!({
                "tool": t.tool,
                "description": t.description,
                "status": "completed",
                "result": t.result.clone().unwrap_or(serde_json::Value::Null),
            }),
            TaskStatus::Failed => json!({
                "tool": t.tool,
                "description": t.description,
                "status": "failed",
                "error": t.error.clone().unwrap_or_else(|| "unknown error".to_owned()),
            }),
            _ => json!({
                "tool": t.tool,
                "description": t.description,
                "status": "skipped",
            }),
        })
        .collect()
}

/// Deterministic side-by-side rendering when both menu proposals ran.
///
/// Returns `None` unless both proposal tasks completed.
fn render_parallel_proposals(tasks: &[Task]) -> Option<String> {
    let llm_menu = completed_result(tasks, LLM_MENU_TOOL)?;
    let rag_menu = completed_result(tasks, RAG_MENU_TOOL)?;
    let recipes = completed_result(tasks, RECIPE_LOOKUP_TOOL);

    let mut reply = String::from("Here are two menu ideas from your stock:\n\n");
    reply.push_str("Chef's proposal:\n");
    reply.push_str(&render_menu(llm_menu));
    reply.push_str("\nFrom the recipe collection:\n");
    reply.push_str(&render_menu(rag_menu));

    if let Some(recipes) = recipes {
        let links = render_recipe_links(recipes);
        if !links.is_empty() {
            reply.push_str("\nLinked recipes:\n");
            reply.push_str(&links);
        }
    }

    Some(reply)
}

/// The committed result of the first completed task using `tool`.
fn completed_result<'t>(tasks: &'t [Task], tool: &str) -> Option<&'t serde_json::Value> {
    tasks
        .iter()
        .find(|t| t.tool == tool && t.status == TaskStatus::Completed)
        .and_then(|t| t.result.as_ref())
}

/// Render a menu result as indented lines.
fn render_menu(menu: &serde_json::Value) -> String {
    // Menus usually arrive as an object of course -> dish; unwrap a
    // `data` envelope if the tool kept one.
    let body = menu.get("data").unwrap_or(menu);

    match body {
        serde_json::Value::Object(map) => {
            let mut out = String::new();
            for (course, dish) in map {
                let dish_text = match dish {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                out.push_str(&format!("  - {course}: {dish_text}\n"));
            }
            out
        }
        other => format!("  {other}\n"),
    }
}

/// Render recipe links, tolerating both bare arrays and `{recipes: []}`.
fn render_recipe_links(recipes: &serde_json::Value) -> String {
    let body = recipes.get("data").unwrap_or(recipes);
    let list = body
        .get("recipes")
        .and_then(serde_json::Value::as_array)
        .or_else(|| body.as_array());

    let Some(list) = list else {
        return String::new();
    };

    let mut out = String::new();
    for entry in list {
        let title = entry
            .get("title")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("recipe");
        let url = entry.get("url").and_then(serde_json::Value::as_str);
        match url {
            Some(url) => out.push_str(&format!("  - {title}: {url}\n")),
            None => out.push_str(&format!("  - {title}\n")),
        }
    }
    out
}

/// Plain-text report used when the composing model is unavailable.
fn fallback_report(tasks: &[Task]) -> String {
    let completed = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .count();
    let failed = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Failed)
        .count();

    if failed > 0 {
        format!(
            "Done, with some trouble: {completed} step(s) finished and \
             {failed} failed. You may want to try the failed part again."
        )
    } else {
        format!("All done — {completed} step(s) finished successfully.")
    }
}
