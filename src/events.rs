//! The event stream emitted by the parallel executor.
//!
//! The engine never renders anything itself — it reports what happened
//! through [`Event`] so the host (a TUI, a log sink, a test harness) can
//! decide how to present it. Every event carries an ISO-8601 timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::types::{MergeStatus, TaskId};

/// One occurrence reported by the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub kind: EventKind,
}

impl Event {
    #[must_use]
    pub fn new(session_id: impl Into<String>, kind: EventKind, now: DateTime<Utc>) -> Self {
        Self {
            timestamp: now,
            session_id: session_id.into(),
            kind,
        }
    }
}

/// The typed union of everything the engine can report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    WorkerCreated { task_id: TaskId, worker_id: String },
    WorkerStarted { task_id: TaskId, worker_id: String },
    WorkerProgress { task_id: TaskId, worker_id: String, iteration: u32 },
    WorkerOutput { task_id: TaskId, worker_id: String, chunk: String },
    WorkerCompleted { task_id: TaskId, worker_id: String, success: bool },
    WorkerFailed { task_id: TaskId, worker_id: String, reason: String },

    MergeQueued { operation_id: String, task_id: TaskId },
    MergeStarted { operation_id: String, task_id: TaskId },
    MergeCompleted { operation_id: String, task_id: TaskId },
    MergeFailed { operation_id: String, task_id: TaskId, reason: String },
    MergeRolledBack { operation_id: String, task_id: TaskId, backup_tag: String },

    ConflictDetected { operation_id: String, files: Vec<String> },
    ConflictAiResolving { operation_id: String, file_path: String },
    ConflictAiResolved { operation_id: String, file_path: String },
    ConflictAiFailed { operation_id: String, file_path: String, reason: String },
    ConflictResolved { operation_id: String, status: MergeStatus },

    ParallelStarted { task_count: usize },
    SessionBranchCreated { branch: String },
    GroupStarted { group_index: usize, task_ids: Vec<TaskId> },
    GroupCompleted { group_index: usize },
    ParallelCompleted { merged: usize, failed: usize },
    ParallelFailed { reason: String },
}
