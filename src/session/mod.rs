//! Per-user session state: inventory snapshot, bounded operation history,
//! pending confirmation, and the credential passed through to tools.
//!
//! Sessions live in memory only. Each user owns at most one session; it is
//! created on first request, expires after a configurable idle period
//! (default 30 minutes), and can be cleared explicitly. The operation
//! history is a hard ring buffer of 10 entries with FIFO eviction.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{ConfirmationContext, InventoryItem, Task};

/// Hard cap on operation-history entries per session.
const MAX_HISTORY: usize = 10;

/// One recorded operation with before/after inventory snapshots.
///
/// `after_state` is `None` until the turn completes and patches it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Unique id of this record.
    pub id: Uuid,
    /// When the operation was recorded.
    pub timestamp: DateTime<Utc>,
    /// Event kind (e.g. `plan_executed`, `plan_cancelled`).
    pub kind: String,
    /// Free-form details about the operation.
    pub details: serde_json::Value,
    /// Inventory snapshot before the operation.
    pub before_state: Vec<InventoryItem>,
    /// Inventory snapshot after the operation, patched on turn completion.
    pub after_state: Option<Vec<InventoryItem>>,
}

/// Per-user session state.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// The owning user's identifier.
    pub user_id: String,
    /// Generated id for this session instance.
    pub session_id: Uuid,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last access time; drives expiry.
    pub last_activity: DateTime<Utc>,
    /// Current inventory snapshot with stable record ids.
    pub inventory_snapshot: Vec<InventoryItem>,
    /// Bounded operation history, oldest first.
    pub operation_history: Vec<OperationRecord>,
    /// Confirmation parked while a plan is suspended.
    pub pending_confirmation: Option<ConfirmationContext>,
    /// Executed partition of the suspended plan, kept so resumption can
    /// rebuild the full chain with results intact.
    pub suspended_executed: Vec<Task>,
    /// Credential passed through to every tool call.
    pub auth_token: String,
}

impl SessionContext {
    fn new(user_id: &str, auth_token: &str) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.to_owned(),
            session_id: Uuid::new_v4(),
            created_at: now,
            last_activity: now,
            inventory_snapshot: Vec::new(),
            operation_history: Vec::new(),
            pending_confirmation: None,
            suspended_executed: Vec::new(),
            auth_token: auth_token.to_owned(),
        }
    }

    /// Replace the inventory snapshot and touch the session.
    pub fn update_inventory(&mut self, items: Vec<InventoryItem>) {
        debug!(user = %self.user_id, count = items.len(), "inventory snapshot updated");
        self.inventory_snapshot = items;
        self.last_activity = Utc::now();
    }

    /// Append an operation record, evicting the oldest past the cap.
    pub fn record_operation(&mut self, kind: &str, details: serde_json::Value) {
        let record = OperationRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind: kind.to_owned(),
            details,
            before_state: self.inventory_snapshot.clone(),
            after_state: None,
        };

        self.operation_history.push(record);
        if self.operation_history.len() > MAX_HISTORY {
            let dropped = self.operation_history.remove(0);
            debug!(user = %self.user_id, kind = %dropped.kind, "history cap reached, oldest entry dropped");
        }
        self.last_activity = Utc::now();
    }

    /// Patch the newest operation record's after-state.
    pub fn patch_last_after_state(&mut self, after: Vec<InventoryItem>) {
        if let Some(last) = self.operation_history.last_mut() {
            last.after_state = Some(after);
        }
    }

    /// The most recent `count` operations, oldest first.
    pub fn recent_operations(&self, count: usize) -> &[OperationRecord] {
        let start = self.operation_history.len().saturating_sub(count);
        &self.operation_history[start..]
    }

    /// Summary used by the operational endpoints.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id,
            user_id: self.user_id.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity,
            inventory_count: self.inventory_snapshot.len(),
            history_count: self.operation_history.len(),
            confirmation_pending: self.pending_confirmation.is_some(),
        }
    }
}

/// Operational snapshot of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session instance id.
    pub session_id: Uuid,
    /// Owning user.
    pub user_id: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last access time.
    pub last_activity: DateTime<Utc>,
    /// Records in the inventory snapshot.
    pub inventory_count: usize,
    /// Entries in the operation history.
    pub history_count: usize,
    /// Whether a confirmation is parked.
    pub confirmation_pending: bool,
}

/// In-process store mapping user ids to sessions.
///
/// Expired sessions are swept opportunistically on each access; the sweep
/// is idempotent. No cross-session locking is needed because each session
/// is accessed single-threaded within a user turn.
pub struct SessionStore {
    sessions: HashMap<String, SessionContext>,
    timeout: Duration,
}

impl SessionStore {
    /// Create a store with the given idle timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            timeout,
        }
    }

    /// Get the user's session, creating one if absent or expired.
    ///
    /// Updates the stored credential on every call so a refreshed token
    /// propagates to subsequent tool invocations.
    pub fn get_or_create(&mut self, user_id: &str, auth_token: &str) -> &mut SessionContext {
        self.sweep_expired();

        let entry = self
            .sessions
            .entry(user_id.to_owned())
            .or_insert_with(|| {
                info!(user = user_id, "new session created");
                SessionContext::new(user_id, auth_token)
            });
        entry.auth_token = auth_token.to_owned();
        entry.last_activity = Utc::now();
        entry
    }

    /// Read-only access to a session, if one exists.
    pub fn get(&self, user_id: &str) -> Option<&SessionContext> {
        self.sessions.get(user_id)
    }

    /// Mutable access to a session, if one exists.
    pub fn get_mut(&mut self, user_id: &str) -> Option<&mut SessionContext> {
        self.sessions.get_mut(user_id)
    }

    /// Remove a session. Returns whether one existed.
    pub fn clear(&mut self, user_id: &str, reason: &str) -> bool {
        match self.sessions.remove(user_id) {
            Some(session) => {
                info!(
                    user = user_id,
                    reason,
                    history = session.operation_history.len(),
                    "session cleared"
                );
                true
            }
            None => false,
        }
    }

    /// Drop every session whose idle time exceeds the timeout.
    ///
    /// Returns the number of sessions removed.
    pub fn sweep_expired(&mut self) -> usize {
        let now = Utc::now();
        let timeout = self.timeout;
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| is_expired(s, now, timeout))
            .map(|(k, _)| k.clone())
            .collect();

        for user_id in &expired {
            self.clear(user_id, "timeout");
        }
        expired.len()
    }

    /// Summaries of every live session, for the operational surface.
    pub fn all_summaries(&self) -> Vec<SessionSummary> {
        self.sessions.values().map(SessionContext::summary).collect()
    }

    /// Remove all sessions. Returns how many were dropped.
    pub fn clear_all(&mut self) -> usize {
        let count = self.sessions.len();
        self.sessions.clear();
        info!(count, "all sessions cleared");
        count
    }
}

/// Whether a session's idle time exceeds the store timeout.
fn is_expired(session: &SessionContext, now: DateTime<Utc>, timeout: Duration) -> bool {
    let idle = now.signed_duration_since(session.last_activity);
    let limit = chrono::TimeDelta::from_std(timeout).unwrap_or(chrono::TimeDelta::MAX);
    idle > limit
}
