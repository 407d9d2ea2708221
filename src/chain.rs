//! Task chain bookkeeping: executed/pending partitions and progress event
//! emission.
//!
//! The chain manager is a façade over the executor's state. It tracks how
//! far the chain has advanced, renders the progress snapshot the stream
//! invariants are asserted over, and publishes one event per transition to
//! the [`ProgressHub`]. The special pseudo task id `system` reports
//! failures that belong to no single task.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::stream::ProgressHub;
use crate::types::{
    ProgressError, ProgressEvent, ProgressEventKind, ProgressInfo, Task, TaskStatus,
};

/// Pseudo task id for failures outside any task.
pub const SYSTEM_TASK_ID: &str = "system";

/// One tracked task in the chain.
#[derive(Debug, Clone)]
struct ChainEntry {
    id: String,
    description: String,
    terminal: bool,
}

/// Progress bookkeeping for one user turn.
pub struct TaskChainManager {
    hub: Arc<ProgressHub>,
    /// Stream session events are published under; `None` disables emission.
    stream_id: Option<String>,
    entries: Vec<ChainEntry>,
    /// Monotone count of terminal tasks; never decreases across events.
    completed: usize,
    complete_emitted: bool,
}

impl TaskChainManager {
    /// Create a manager publishing to `stream_id` on the given hub.
    pub fn new(hub: Arc<ProgressHub>, stream_id: Option<String>) -> Self {
        Self {
            hub,
            stream_id,
            entries: Vec::new(),
            completed: 0,
            complete_emitted: false,
        }
    }

    /// Initialise counters for a chain and emit the `start` event.
    ///
    /// Tasks already terminal (the executed partition of a resumed plan)
    /// count as completed from the start, so `completed_tasks` stays
    /// monotone across a suspension.
    pub fn set_task_chain(&mut self, tasks: &[Task]) {
        self.entries = tasks.iter().map(entry_for).collect();
        self.completed = self.entries.iter().filter(|e| e.terminal).count();
        self.complete_emitted = false;

        debug!(total = self.entries.len(), "task chain set");
        self.emit(
            ProgressEventKind::Start,
            "Starting to work on your request...".to_owned(),
            None,
        );
    }

    /// Record a task transition and emit the matching event.
    ///
    /// `system` with [`TaskStatus::Failed`] reports a failure outside any
    /// task.
    pub fn update_task_progress(&mut self, task_id: &str, status: TaskStatus) {
        if task_id == SYSTEM_TASK_ID {
            if status == TaskStatus::Failed {
                warn!("system-level failure reported to chain");
                self.emit(
                    ProgressEventKind::Error,
                    "A system error occurred".to_owned(),
                    Some(ProgressError {
                        code: "SYSTEM_ERROR".to_owned(),
                        message: "A system error occurred".to_owned(),
                        details: "failure outside any single task".to_owned(),
                    }),
                );
            }
            return;
        }

        let Some(entry) = self.entries.iter_mut().find(|e| e.id == task_id) else {
            warn!(task = task_id, "progress update for unknown task");
            return;
        };

        match status {
            TaskStatus::InProgress => {
                let message = format!("Working on: {}", entry.description);
                self.emit(ProgressEventKind::Progress, message, None);
            }
            TaskStatus::Completed | TaskStatus::Skipped => {
                if !entry.terminal {
                    entry.terminal = true;
                    self.completed = self.completed.saturating_add(1);
                }
                let info = self.progress_info();
                let message = format!(
                    "Progress: {}/{} done ({}%)",
                    info.completed_tasks, info.total_tasks, info.progress_percentage
                );
                self.emit(ProgressEventKind::Progress, message, None);
            }
            TaskStatus::Failed => {
                let description = entry.description.clone();
                if !entry.terminal {
                    entry.terminal = true;
                    self.completed = self.completed.saturating_add(1);
                }
                self.emit(
                    ProgressEventKind::Error,
                    format!("Step failed: {description}"),
                    Some(ProgressError {
                        code: "TASK_FAILED".to_owned(),
                        message: format!("Step failed: {description}"),
                        details: format!("task id: {task_id}"),
                    }),
                );
            }
            TaskStatus::Pending | TaskStatus::Ready => {}
        }
    }

    /// Current progress snapshot.
    pub fn progress_info(&self) -> ProgressInfo {
        let total = self.entries.len();
        let completed = self.completed.min(total);
        let percentage = if total > 0 {
            let scaled = completed.saturating_mul(100).checked_div(total).unwrap_or(0);
            u32::try_from(scaled).unwrap_or(100)
        } else {
            0
        };
        let current_task = self
            .entries
            .iter()
            .find(|e| !e.terminal)
            .map_or_else(|| "waiting".to_owned(), |e| e.description.clone());

        ProgressInfo {
            total_tasks: total,
            completed_tasks: completed,
            progress_percentage: percentage,
            current_task,
            remaining_tasks: total.saturating_sub(completed),
            is_complete: total > 0 && completed == total,
        }
    }

    /// Tell subscribers the chain is waiting on the user's confirmation.
    ///
    /// The executed counts are unchanged; the resume turn continues the
    /// chain under a fresh manager seeded with the executed partition.
    pub fn pause_for_confirmation(&self) {
        debug!("task chain paused for confirmation");
        self.emit(
            ProgressEventKind::Progress,
            "Waiting for your confirmation before continuing.".to_owned(),
            None,
        );
    }

    /// Emit the `complete` event exactly once.
    pub fn mark_complete(&mut self) {
        if self.complete_emitted {
            return;
        }
        self.complete_emitted = true;

        let total = self.entries.len();
        self.emit_raw(ProgressEvent {
            kind: ProgressEventKind::Complete,
            session_id: self.stream_id.clone().unwrap_or_default(),
            timestamp: Utc::now(),
            message: "All done.".to_owned(),
            progress: ProgressInfo {
                total_tasks: total,
                completed_tasks: total,
                progress_percentage: if total > 0 { 100 } else { 0 },
                current_task: "done".to_owned(),
                remaining_tasks: 0,
                is_complete: true,
            },
            error: None,
        });
    }

    fn emit(&self, kind: ProgressEventKind, message: String, error: Option<ProgressError>) {
        let event = ProgressEvent {
            kind,
            session_id: self.stream_id.clone().unwrap_or_default(),
            timestamp: Utc::now(),
            message,
            progress: self.progress_info(),
            error,
        };
        self.emit_raw(event);
    }

    fn emit_raw(&self, event: ProgressEvent) {
        if let Some(stream_id) = &self.stream_id {
            self.hub.publish(stream_id, &event);
        }
    }
}

fn entry_for(task: &Task) -> ChainEntry {
    ChainEntry {
        id: task.id.clone(),
        description: task.description.clone(),
        terminal: task.status.is_terminal(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, description: &str) -> Task {
        Task::new(id, description, "inventory_list")
    }

    fn manager_with_stream() -> (TaskChainManager, tokio::sync::mpsc::Receiver<String>) {
        let hub = Arc::new(ProgressHub::new());
        let rx = hub.subscribe("sse-1");
        let manager = TaskChainManager::new(hub, Some("sse-1".to_owned()));
        (manager, rx)
    }

    fn drain(rx: &mut tokio::sync::mpsc::Receiver<String>) -> Vec<serde_json::Value> {
        let mut events = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            events.push(serde_json::from_str(&frame).expect("frame is JSON"));
        }
        events
    }

    #[tokio::test]
    async fn test_start_event_carries_total() {
        let (mut manager, mut rx) = manager_with_stream();
        manager.set_task_chain(&[task("t0", "first"), task("t1", "second")]);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "start");
        assert_eq!(events[0]["progress"]["total_tasks"], 2);
        assert_eq!(events[0]["progress"]["completed_tasks"], 0);
    }

    #[tokio::test]
    async fn test_progress_percentage_is_floor() {
        let (mut manager, _rx) = manager_with_stream();
        manager.set_task_chain(&[task("t0", "a"), task("t1", "b"), task("t2", "c")]);

        manager.update_task_progress("t0", TaskStatus::Completed);
        let info = manager.progress_info();
        assert_eq!(info.completed_tasks, 1);
        assert_eq!(info.progress_percentage, 33, "floor(100/3) = 33");
        assert!(!info.is_complete);
    }

    #[tokio::test]
    async fn test_completed_monotone_and_bounded() {
        let (mut manager, mut rx) = manager_with_stream();
        manager.set_task_chain(&[task("t0", "a"), task("t1", "b")]);

        manager.update_task_progress("t0", TaskStatus::InProgress);
        manager.update_task_progress("t0", TaskStatus::Completed);
        // A duplicate completion must not double count.
        manager.update_task_progress("t0", TaskStatus::Completed);
        manager.update_task_progress("t1", TaskStatus::Completed);
        manager.mark_complete();

        let events = drain(&mut rx);
        let mut last = 0u64;
        for event in &events {
            let completed = event["progress"]["completed_tasks"].as_u64().expect("count");
            let total = event["progress"]["total_tasks"].as_u64().expect("total");
            assert!(completed >= last, "completed_tasks must be non-decreasing");
            assert!(completed <= total, "completed_tasks must not exceed total");
            last = completed;
        }
        assert_eq!(last, 2);
    }

    #[tokio::test]
    async fn test_failed_task_emits_error_event() {
        let (mut manager, mut rx) = manager_with_stream();
        manager.set_task_chain(&[task("t0", "fragile step")]);
        manager.update_task_progress("t0", TaskStatus::Failed);

        let events = drain(&mut rx);
        let error_event = events
            .iter()
            .find(|e| e["type"] == "error")
            .expect("error event emitted");
        assert_eq!(error_event["error"]["code"], "TASK_FAILED");
        assert!(error_event["error"]["details"]
            .as_str()
            .expect("details")
            .contains("t0"));
    }

    #[tokio::test]
    async fn test_system_error_pseudo_task() {
        let (mut manager, mut rx) = manager_with_stream();
        manager.set_task_chain(&[task("t0", "a")]);
        manager.update_task_progress(SYSTEM_TASK_ID, TaskStatus::Failed);

        let events = drain(&mut rx);
        let error_event = events
            .iter()
            .find(|e| e["type"] == "error")
            .expect("system error event emitted");
        assert_eq!(error_event["error"]["code"], "SYSTEM_ERROR");
    }

    #[tokio::test]
    async fn test_complete_emitted_once() {
        let (mut manager, mut rx) = manager_with_stream();
        manager.set_task_chain(&[task("t0", "a")]);
        manager.update_task_progress("t0", TaskStatus::Completed);
        manager.mark_complete();
        manager.mark_complete();

        let events = drain(&mut rx);
        let completes = events.iter().filter(|e| e["type"] == "complete").count();
        assert_eq!(completes, 1, "complete must be emitted exactly once");
        let complete = events.last().expect("at least one event");
        assert_eq!(complete["progress"]["progress_percentage"], 100);
        assert_eq!(complete["progress"]["is_complete"], true);
    }

    #[tokio::test]
    async fn test_set_task_chain_seeds_executed_partition() {
        let (mut manager, _rx) = manager_with_stream();

        // The resume turn rebuilds the chain as executed ++ rewritten
        // remainder; terminal tasks count as completed from the start.
        let mut done = task("t0", "done already");
        done.status = TaskStatus::Completed;
        manager.set_task_chain(&[
            done,
            task("t1_oldest", "delete oldest"),
            task("t2", "menu"),
        ]);

        let info = manager.progress_info();
        assert_eq!(info.total_tasks, 3);
        assert_eq!(info.completed_tasks, 1, "executed partition pre-counted");

        manager.update_task_progress("t1_oldest", TaskStatus::Completed);
        manager.update_task_progress("t2", TaskStatus::Completed);
        assert!(manager.progress_info().is_complete);
    }

    #[tokio::test]
    async fn test_pause_notifies_subscribers_without_advancing() {
        let (mut manager, mut rx) = manager_with_stream();
        manager.set_task_chain(&[task("t0", "delete milk"), task("t1", "menu")]);

        manager.pause_for_confirmation();

        let events = drain(&mut rx);
        let pause = events.last().expect("pause event emitted");
        assert_eq!(pause["type"], "progress");
        assert!(pause["message"]
            .as_str()
            .expect("message")
            .contains("confirmation"));
        assert_eq!(
            pause["progress"]["completed_tasks"], 0,
            "pause does not advance the counters"
        );
    }

    #[tokio::test]
    async fn test_no_stream_id_is_silent() {
        let hub = Arc::new(ProgressHub::new());
        let mut rx = hub.subscribe("sse-1");
        let mut manager = TaskChainManager::new(hub, None);

        manager.set_task_chain(&[task("t0", "a")]);
        manager.update_task_progress("t0", TaskStatus::Completed);
        manager.mark_complete();

        assert!(rx.try_recv().is_err(), "no stream id means no emission");
    }

    #[tokio::test]
    async fn test_empty_chain_percentage_zero() {
        let (mut manager, _rx) = manager_with_stream();
        manager.set_task_chain(&[]);
        let info = manager.progress_info();
        assert_eq!(info.progress_percentage, 0);
        assert_eq!(info.total_tasks, 0);
        assert!(!info.is_complete, "an empty chain is not reported complete");
    }
}
