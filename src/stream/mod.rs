//! Progress stream hub: per-session fan-out of progress events.
//!
//! The hub maps a stream session id to a set of subscriber channels. Each
//! subscriber gets a small bounded buffer; a subscriber whose buffer is
//! full or whose receiver is gone is dropped silently so publishers never
//! block. Events are serialized JSON objects; the HTTP layer wraps them in
//! `data: <json>` SSE frames.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::ProgressEvent;

/// Per-subscriber buffer size. Progress events are advisory; a subscriber
/// that falls this far behind is dropped rather than blocking publishers.
const SUBSCRIBER_BUFFER: usize = 64;

/// One registered listener.
struct Subscriber {
    id: Uuid,
    tx: mpsc::Sender<String>,
}

/// Process-wide fan-out of serialized progress events.
#[derive(Default)]
pub struct ProgressHub {
    sessions: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl ProgressHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new listener for a stream session.
    ///
    /// Returns the receiving end of the subscriber's buffered channel.
    pub fn subscribe(&self, session_id: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let subscriber = Subscriber {
            id: Uuid::new_v4(),
            tx,
        };

        let mut sessions = self.lock();
        let entry = sessions.entry(session_id.to_owned()).or_default();
        debug!(
            session = session_id,
            subscriber = %subscriber.id,
            total = entry.len().saturating_add(1),
            "stream subscriber added"
        );
        entry.push(subscriber);
        rx
    }

    /// Send an event to every subscriber of the session.
    ///
    /// Subscribers with a full or closed channel are removed; ordering is
    /// publication order for every subscriber that stays connected.
    pub fn publish(&self, session_id: &str, event: &ProgressEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                warn!(session = session_id, error = %e, "progress event unserializable");
                return;
            }
        };

        let mut sessions = self.lock();
        let Some(subscribers) = sessions.get_mut(session_id) else {
            return;
        };

        subscribers.retain(|s| match s.tx.try_send(payload.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(session = session_id, subscriber = %s.id, "slow subscriber dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(session = session_id, subscriber = %s.id, "disconnected subscriber dropped");
                false
            }
        });
    }

    /// Remove the session's entry when no subscribers remain.
    ///
    /// Called when a user turn completes; late subscribers attaching after
    /// that receive nothing.
    pub fn remove_if_idle(&self, session_id: &str) {
        let mut sessions = self.lock();
        if let Some(subscribers) = sessions.get(session_id) {
            if subscribers.is_empty() || subscribers.iter().all(|s| s.tx.is_closed()) {
                sessions.remove(session_id);
                debug!(session = session_id, "idle stream entry removed");
            }
        }
    }

    /// Number of live subscribers for a session.
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.lock().get(session_id).map_or(0, Vec::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Subscriber>>> {
        // A poisoned lock means a panic mid-publish; the map itself is
        // still structurally sound, so continue with it.
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
