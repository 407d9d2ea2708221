//! User-turn pipeline: plan, execute, pause on ambiguity, resume, compose.
//!
//! One [`AgentRuntime`] is built at startup and shared by every handler.
//! Each user turn refreshes the inventory snapshot, asks the planner for a
//! task list, runs it through the graph executor while streaming progress,
//! and renders the final reply. Suspensions park a confirmation context on
//! the session; the next `/chat/confirm` turn splices the user's choice
//! back in and re-enters the dispatch loop. Turns for the same user are
//! serialised by a per-user lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::chain::TaskChainManager;
use crate::compose::ResponseComposer;
use crate::confirmation::{ConfirmationProcessor, CLARIFY_TOOL};
use crate::executor::{DispatchOutcome, TaskGraphExecutor};
use crate::llm::LlmClient;
use crate::planner::Planner;
use crate::session::SessionStore;
use crate::stream::ProgressHub;
use crate::tools::ToolRegistry;
use crate::types::{ConfirmationContext, InventoryItem, ParamValue, Task, TaskStatus};

/// Tool-name prefixes that mutate inventory; completing one of these
/// triggers a post-turn snapshot refresh.
const WRITE_PREFIXES: &[&str] = &["inventory_add", "inventory_update", "inventory_delete"];

/// What a turn hands back to the HTTP layer.
#[derive(Debug)]
pub struct TurnReply {
    /// User-facing reply text.
    pub response: String,
    /// Whether the client must route the next message to `/chat/confirm`.
    pub confirmation_required: bool,
    /// The parked confirmation, echoed to the client when required.
    pub confirmation_context: Option<ConfirmationContext>,
}

impl TurnReply {
    fn plain(response: String) -> Self {
        Self {
            response,
            confirmation_required: false,
            confirmation_context: None,
        }
    }

    fn confirmation(response: String, context: ConfirmationContext) -> Self {
        Self {
            response,
            confirmation_required: true,
            confirmation_context: Some(context),
        }
    }
}

/// Per-user turn serialisation.
///
/// Concurrent requests for the same user queue on the user's mutex; other
/// users proceed independently.
#[derive(Default)]
struct TurnLocks {
    inner: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TurnLocks {
    fn lock_for(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut map = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(map.entry(user_id.to_owned()).or_default())
    }
}

/// Shared services driving every user turn.
pub struct AgentRuntime {
    registry: Arc<ToolRegistry>,
    llm: Arc<dyn LlmClient>,
    sessions: Arc<Mutex<SessionStore>>,
    hub: Arc<ProgressHub>,
    locks: TurnLocks,
    confirmation_timeout: Duration,
    max_concurrency: usize,
}

impl AgentRuntime {
    /// Assemble the runtime from its explicitly constructed services.
    pub fn new(
        registry: Arc<ToolRegistry>,
        llm: Arc<dyn LlmClient>,
        sessions: Arc<Mutex<SessionStore>>,
        hub: Arc<ProgressHub>,
        confirmation_timeout: Duration,
        max_concurrency: usize,
    ) -> Self {
        Self {
            registry,
            llm,
            sessions,
            hub,
            locks: TurnLocks::default(),
            confirmation_timeout,
            max_concurrency,
        }
    }

    /// Session store handle, for the operational endpoints.
    pub fn sessions(&self) -> Arc<Mutex<SessionStore>> {
        Arc::clone(&self.sessions)
    }

    /// Progress hub handle, for the SSE endpoint.
    pub fn hub(&self) -> Arc<ProgressHub> {
        Arc::clone(&self.hub)
    }

    /// Handle one `/chat` turn.
    pub async fn process_message(
        &self,
        user_id: &str,
        auth_token: &str,
        message: &str,
        stream_id: Option<String>,
    ) -> TurnReply {
        let turn_lock = self.locks.lock_for(user_id);
        let _turn = turn_lock.lock().await;

        info!(user = user_id, input = message, "processing chat turn");

        {
            let mut store = self.sessions.lock().await;
            let session = store.get_or_create(user_id, auth_token);
            // A stale pending confirmation is discarded rather than left to
            // resume against an inventory that has moved on.
            if let Some(ctx) = &session.pending_confirmation {
                if self.confirmation_expired(ctx) {
                    warn!(user = user_id, "dropping expired pending confirmation");
                    session.pending_confirmation = None;
                    session.suspended_executed.clear();
                }
            }
        }

        let inventory = self.fetch_inventory(auth_token).await;
        if let Some(session) = self.sessions.lock().await.get_mut(user_id) {
            session.update_inventory(inventory.clone());
        }

        let composer = ResponseComposer::new(self.llm.as_ref());

        let catalogue = self.registry.list_tools().await;
        let mut planner = Planner::new(self.llm.as_ref());
        let plan = match planner.create_plan(message, &catalogue, &inventory).await {
            Ok(plan) => plan,
            Err(e) => {
                warn!(user = user_id, error = %e, "planning failed");
                return TurnReply::plain(
                    composer.compose_failure("I couldn't turn that into a workable set of steps."),
                );
            }
        };

        if plan.is_empty() {
            // Pure conversation: no chain, no progress events, no history.
            return TurnReply::plain(composer.compose_simple(message).await);
        }

        let mut tasks = plan.tasks;
        let mut chain = TaskChainManager::new(Arc::clone(&self.hub), stream_id.clone());
        chain.set_task_chain(&tasks);

        self.execute_and_reply(
            user_id,
            auth_token,
            message,
            &mut tasks,
            &inventory,
            &mut chain,
            stream_id,
            &[],
        )
        .await
    }

    /// Handle one `/chat/confirm` turn against the parked confirmation.
    pub async fn process_confirmation(
        &self,
        user_id: &str,
        auth_token: &str,
        message: &str,
        stream_id: Option<String>,
    ) -> TurnReply {
        let turn_lock = self.locks.lock_for(user_id);
        let _turn = turn_lock.lock().await;

        info!(user = user_id, input = message, "processing confirmation turn");

        let composer = ResponseComposer::new(self.llm.as_ref());

        let (context, executed) = {
            let mut store = self.sessions.lock().await;
            let session = store.get_or_create(user_id, auth_token);
            (
                session.pending_confirmation.take(),
                std::mem::take(&mut session.suspended_executed),
            )
        };

        let Some(context) = context else {
            return TurnReply::plain(
                "There's nothing waiting for confirmation right now.".to_owned(),
            );
        };

        // Expiry: a stale confirmation discards the paused plan.
        if self.confirmation_expired(&context) {
            warn!(user = user_id, "pending confirmation expired");
            return TurnReply::plain(composer.compose_confirmation_timeout());
        }

        let processor = ConfirmationProcessor::new();
        let execution_plan = processor.process_reply(message, &context);

        if execution_plan.cancel {
            return self
                .cancel_suspended(user_id, message, &context, executed, stream_id)
                .await;
        }

        // An unrecognised reply re-asks and re-parks the same context.
        if let Some(head) = execution_plan.tasks.first() {
            if head.tool == CLARIFY_TOOL {
                let response = clarification_message(head);
                let mut store = self.sessions.lock().await;
                if let Some(session) = store.get_mut(user_id) {
                    session.pending_confirmation = Some(context.clone());
                    session.suspended_executed = executed;
                }
                return TurnReply::confirmation(response, context);
            }
        }

        let preconfirmed: Vec<String> = execution_plan
            .tasks
            .first()
            .map(|t| vec![t.id.clone()])
            .unwrap_or_default();

        // EXECUTED untouched, REMAINING replaced by the rewritten plan.
        let mut tasks = executed;
        tasks.extend(execution_plan.tasks);

        let inventory = self.fetch_inventory(auth_token).await;
        if let Some(session) = self.sessions.lock().await.get_mut(user_id) {
            session.update_inventory(inventory.clone());
        }

        let mut chain = TaskChainManager::new(Arc::clone(&self.hub), stream_id.clone());
        chain.set_task_chain(&tasks);

        self.execute_and_reply(
            user_id,
            auth_token,
            message,
            &mut tasks,
            &inventory,
            &mut chain,
            stream_id,
            &preconfirmed,
        )
        .await
    }

    /// Run the executor over `tasks` and turn the outcome into a reply.
    #[allow(clippy::too_many_arguments)]
    async fn execute_and_reply(
        &self,
        user_id: &str,
        auth_token: &str,
        message: &str,
        tasks: &mut Vec<Task>,
        inventory: &[InventoryItem],
        chain: &mut TaskChainManager,
        stream_id: Option<String>,
        preconfirmed: &[String],
    ) -> TurnReply {
        let composer = ResponseComposer::new(self.llm.as_ref());
        let executor = TaskGraphExecutor::new(Arc::clone(&self.registry), self.max_concurrency);

        let outcome = executor
            .run_with_preconfirmed(tasks, inventory, auth_token, chain, preconfirmed)
            .await;

        match outcome {
            Ok(DispatchOutcome::Completed) => {
                chain.mark_complete();
                let response = composer.compose_completion(message, tasks).await;
                self.finish_turn(user_id, auth_token, message, tasks).await;
                self.cleanup_stream(stream_id.as_deref());
                TurnReply::plain(response)
            }
            Ok(DispatchOutcome::Suspended {
                ambiguity,
                remaining,
            }) => {
                let processor = ConfirmationProcessor::new();
                let (prompt, context) = processor.build_confirmation(&ambiguity, &remaining);
                chain.pause_for_confirmation();

                let executed: Vec<Task> = tasks
                    .iter()
                    .filter(|t| t.status.is_terminal())
                    .cloned()
                    .collect();

                let mut store = self.sessions.lock().await;
                if let Some(session) = store.get_mut(user_id) {
                    session.pending_confirmation = Some(context.clone());
                    session.suspended_executed = executed;
                }

                TurnReply::confirmation(prompt, context)
            }
            Err(e) => {
                warn!(user = user_id, error = %e, "plan aborted");
                self.cleanup_stream(stream_id.as_deref());
                TurnReply::plain(composer.compose_failure(
                    "Some of the steps depended on each other in a way I couldn't resolve.",
                ))
            }
        }
    }

    /// Cancel path: skip everything not yet executed and acknowledge.
    async fn cancel_suspended(
        &self,
        user_id: &str,
        message: &str,
        context: &ConfirmationContext,
        executed: Vec<Task>,
        stream_id: Option<String>,
    ) -> TurnReply {
        let composer = ResponseComposer::new(self.llm.as_ref());

        let mut tasks = executed.clone();
        tasks.push(context.original_task.clone());
        tasks.extend(context.remaining_task_chain.iter().cloned());

        let mut chain = TaskChainManager::new(Arc::clone(&self.hub), stream_id.clone());
        chain.set_task_chain(&tasks);
        TaskGraphExecutor::skip_remaining(&mut tasks, &mut chain);
        chain.mark_complete();

        {
            let mut store = self.sessions.lock().await;
            if let Some(session) = store.get_mut(user_id) {
                session.record_operation(
                    "plan_cancelled",
                    serde_json::json!({"reply": message, "item": context.item_name}),
                );
            }
        }

        self.cleanup_stream(stream_id.as_deref());
        TurnReply::plain(composer.compose_cancellation(&executed))
    }

    /// Post-completion bookkeeping: history entry and snapshot refresh.
    async fn finish_turn(&self, user_id: &str, auth_token: &str, message: &str, tasks: &[Task]) {
        let tools: Vec<&str> = tasks.iter().map(|t| t.tool.as_str()).collect();
        {
            let mut store = self.sessions.lock().await;
            if let Some(session) = store.get_mut(user_id) {
                session.record_operation(
                    "plan_executed",
                    serde_json::json!({"request": message, "tools": tools}),
                );
            }
        }

        let wrote = tasks.iter().any(|t| {
            t.status == TaskStatus::Completed
                && WRITE_PREFIXES.iter().any(|p| t.tool.starts_with(p))
        });
        if wrote {
            let after = self.fetch_inventory(auth_token).await;
            let mut store = self.sessions.lock().await;
            if let Some(session) = store.get_mut(user_id) {
                session.update_inventory(after.clone());
                session.patch_last_after_state(after);
            }
        }
    }

    /// Whether a parked confirmation has outlived its timeout.
    fn confirmation_expired(&self, context: &ConfirmationContext) -> bool {
        let age = Utc::now().signed_duration_since(context.issued_at);
        let limit = chrono::TimeDelta::from_std(self.confirmation_timeout)
            .unwrap_or(chrono::TimeDelta::MAX);
        age > limit
    }

    /// Fetch the inventory snapshot; failures degrade to an empty list.
    async fn fetch_inventory(&self, auth_token: &str) -> Vec<InventoryItem> {
        match self
            .registry
            .invoke("inventory_list", serde_json::Map::new(), auth_token)
            .await
        {
            Ok(result) => parse_inventory(&result),
            Err(e) => {
                warn!(error = %e, "inventory snapshot fetch failed");
                Vec::new()
            }
        }
    }

    /// Drop the hub entry once the turn is over and nobody is listening.
    fn cleanup_stream(&self, stream_id: Option<&str>) {
        if let Some(id) = stream_id {
            self.hub.remove_if_idle(id);
        }
    }
}

/// Parse an inventory listing result, tolerating an `items` wrapper.
fn parse_inventory(result: &serde_json::Value) -> Vec<InventoryItem> {
    let listed = result
        .as_array()
        .or_else(|| result.get("items").and_then(serde_json::Value::as_array));

    let Some(listed) = listed else {
        warn!("inventory listing had an unexpected shape");
        return Vec::new();
    };

    listed
        .iter()
        .filter_map(|entry| match serde_json::from_value(entry.clone()) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!(error = %e, "skipping unparsable inventory record");
                None
            }
        })
        .collect()
}

/// The message carried by a clarification sentinel task.
fn clarification_message(head: &Task) -> String {
    match head.parameters.get("message") {
        Some(ParamValue::Literal(serde_json::Value::String(msg))) => msg.clone(),
        _ => "I didn't understand that choice; please pick one of the listed options.".to_owned(),
    }
}
