//! The interfaces a host application implements to drive the engine.
//!
//! `ralph-core` never talks to a task backlog, a model provider, or a
//! terminal directly — it calls back into whatever the host supplies.
//! [`Tracker`] is the task backlog, [`AgentRunner`] is how one agent
//! iteration gets run, and [`ConflictAi`] is the optional automatic
//! conflict-resolution callback.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::RalphError;
use crate::model::types::{FileConflict, Task, TokenUsage};

/// The host's task backlog.
pub trait Tracker: Send + Sync {
    /// Return the tasks the engine should consider, optionally narrowed by
    /// `filter` (an opaque host-defined query string; pass `""` for all).
    fn get_tasks(&self, filter: &str) -> Result<Vec<Task>, RalphError>;

    /// Mark a task completed. Called at most once per task per session,
    /// after its merge succeeds.
    fn complete_task(&self, id: &str) -> Result<CompleteTaskOutcome, RalphError>;

    /// Whether the tracker considers a task's current state sufficient to
    /// close it out — consulted alongside the completion marker before a
    /// worker breaks its iteration loop.
    fn is_task_ready(&self, id: &str) -> bool;
}

/// The result of asking the tracker to close out a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompleteTaskOutcome {
    Completed,
    AlreadyCompleted,
}

/// One request to run an agent for a single worker iteration.
pub struct AgentRequest<'a> {
    pub prompt: &'a str,
    pub cwd: &'a Path,
    pub model: &'a str,
    pub timeout: Duration,
    pub env: &'a HashMap<String, String>,
}

/// What an agent invocation reported back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentResponse {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub token_usage: TokenUsage,
    /// True if the agent signalled a provider-side rate limit rather than a
    /// genuine failure. Triggers the worker's backoff/fallback path instead
    /// of the configured error strategy.
    pub rate_limited: bool,
}

/// How the worker actually runs an agent process. The host owns the
/// specifics of which CLI, which flags, which provider.
pub trait AgentRunner: Send + Sync {
    /// # Errors
    /// Returns [`RalphError::AgentSpawnFailed`] or [`RalphError::AgentTimeout`]
    /// if the agent process itself could not be run to completion; a
    /// non-zero exit that the agent reports cleanly belongs in
    /// [`AgentResponse::exit_code`], not here.
    fn run(&self, request: &AgentRequest<'_>) -> Result<AgentResponse, RalphError>;
}

/// The injected capability for resolving a three-way merge conflict in one
/// file. Returns `None` to signal "could not resolve" rather than erroring,
/// since an unresolved file is an expected, handled outcome (the merge
/// rolls back), not a crate-level failure.
pub trait ConflictAi: Send + Sync {
    fn resolve(&self, conflict: &FileConflict, task_id: &str, task_title: &str) -> Option<String>;
}
