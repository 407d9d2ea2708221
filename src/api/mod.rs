//! HTTP surface: chat turns, the confirmation endpoint, the SSE progress
//! stream, and the operational session endpoints.
//!
//! - `POST /chat`            — run one user turn
//! - `POST /chat/confirm`    — answer a pending confirmation
//! - `GET  /chat/stream/:id` — server-sent progress events
//! - `GET/POST /session/*`   — operational session management
//!
//! Authentication is a boundary concern: the bearer token is extracted and
//! passed through to the tool layer untouched; its validation belongs to
//! the auth service behind the tools.

use std::convert::Infallible;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::agent::AgentRuntime;
use crate::types::ConfirmationContext;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// The turn pipeline and its services.
    pub agent: Arc<AgentRuntime>,
    /// Model name echoed in chat responses.
    pub model_name: String,
}

/// Body of `POST /chat` and `POST /chat/confirm`.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    /// The user's message.
    pub message: String,
    /// Explicit user id; defaults to a key derived from the bearer token.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Session id echoed from a previous response. Sessions are keyed by
    /// user, so this is informational.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Stream session to publish progress events under.
    #[serde(default)]
    pub sse_session_id: Option<String>,
}

/// Optional query parameters for the session endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    /// Address a session created with an explicit `user_id`; defaults to
    /// the key derived from the bearer token.
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/chat", post(chat))
        .route("/chat/confirm", post(chat_confirm))
        .route("/chat/stream/:session_id", get(chat_stream))
        .route("/session/status", get(session_status))
        .route("/session/clear", post(session_clear))
        .route("/session/clear-history", post(session_clear_history))
        .route("/session/all", get(session_all))
        .route("/session/clear-all", post(session_clear_all))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn root() -> impl IntoResponse {
    Json(serde_json::json!({"message": "larder is running"}))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "healthy", "service": "larder"}))
}

// ── Chat ──

async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatRequest>,
) -> impl IntoResponse {
    let Some(token) = bearer_token(&headers) else {
        return unauthorized();
    };
    let user_id = resolve_user_id(&body, &token);

    let reply = state
        .agent
        .process_message(&user_id, &token, &body.message, body.sse_session_id.clone())
        .await;

    chat_response(&state, &user_id, reply.response, reply.confirmation_required, reply.confirmation_context)
}

async fn chat_confirm(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatRequest>,
) -> impl IntoResponse {
    let Some(token) = bearer_token(&headers) else {
        return unauthorized();
    };
    let user_id = resolve_user_id(&body, &token);

    let reply = state
        .agent
        .process_confirmation(&user_id, &token, &body.message, body.sse_session_id.clone())
        .await;

    chat_response(&state, &user_id, reply.response, reply.confirmation_required, reply.confirmation_context)
}

fn chat_response(
    state: &AppState,
    user_id: &str,
    response: String,
    confirmation_required: bool,
    confirmation_context: Option<ConfirmationContext>,
) -> axum::response::Response {
    let mut body = serde_json::json!({
        "response": response,
        "success": true,
        "model_used": state.model_name,
        "user_id": user_id,
    });
    if confirmation_required {
        body["confirmation_required"] = serde_json::Value::Bool(true);
        if let Ok(context) = serde_json::to_value(&confirmation_context) {
            body["confirmation_context"] = context;
        }
    }
    Json(body).into_response()
}

// ── Progress stream ──

async fn chat_stream(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    info!(session = %session_id, "stream subscriber connecting");
    let rx = state.agent.hub().subscribe(&session_id);

    let stream = ReceiverStream::new(rx).map(|json| Ok(Event::default().data(json)));

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ── Session operations ──

async fn session_status(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let Some(token) = bearer_token(&headers) else {
        return unauthorized();
    };
    let user_id = query.user_id.unwrap_or_else(|| derive_user_id(&token));

    let sessions = state.agent.sessions();
    let store = sessions.lock().await;
    match store.get(&user_id) {
        Some(session) => Json(serde_json::json!({"session": session.summary()})).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "no session for this user"})),
        )
            .into_response(),
    }
}

async fn session_clear(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let Some(token) = bearer_token(&headers) else {
        return unauthorized();
    };
    let user_id = query.user_id.unwrap_or_else(|| derive_user_id(&token));

    let sessions = state.agent.sessions();
    let cleared = sessions.lock().await.clear(&user_id, "manual");
    Json(serde_json::json!({"cleared": cleared})).into_response()
}

async fn session_clear_history(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let Some(token) = bearer_token(&headers) else {
        return unauthorized();
    };
    let user_id = query.user_id.unwrap_or_else(|| derive_user_id(&token));

    let sessions = state.agent.sessions();
    let mut store = sessions.lock().await;
    match store.get_mut(&user_id) {
        Some(session) => {
            let dropped = session.operation_history.len();
            session.operation_history.clear();
            Json(serde_json::json!({"cleared_entries": dropped})).into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "no session for this user"})),
        )
            .into_response(),
    }
}

async fn session_all(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.agent.sessions();
    let store = sessions.lock().await;
    let summaries = store.all_summaries();
    Json(serde_json::json!({
        "total_sessions": summaries.len(),
        "sessions": summaries,
    }))
}

async fn session_clear_all(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.agent.sessions();
    let count = sessions.lock().await.clear_all();
    Json(serde_json::json!({"cleared_sessions": count}))
}

// ── Helpers ──

/// Extract the bearer token from the `Authorization` header.
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_owned())
}

/// User id for a turn: explicit body field, else derived from the token.
fn resolve_user_id(body: &ChatRequest, token: &str) -> String {
    body.user_id
        .clone()
        .unwrap_or_else(|| derive_user_id(token))
}

/// Stable per-token key for the in-memory session map.
///
/// Not a credential: just a lookup key that avoids echoing the token.
fn derive_user_id(token: &str) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    token.hash(&mut hasher);
    format!("user-{:016x}", hasher.finish())
}

fn unauthorized() -> axum::response::Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"error": "missing or malformed bearer token"})),
    )
        .into_response()
}
