//! Crate-wide error type.
//!
//! `RalphError` covers the operations the parallel execution engine performs
//! itself (git plumbing, worktree management, session persistence,
//! scheduling) and the failures its injected collaborators
//! (`AgentRunner`, `ConflictAi`, `Tracker`) can report back. Each variant's
//! `Display` includes a short "To fix:" line aimed at whoever is operating
//! the host application, not the end user of the agent.

use std::fmt;

use crate::model::types::TypeError;

/// Errors produced by the parallel execution engine.
#[derive(Debug)]
pub enum RalphError {
    /// A branch or tag name failed validation before being handed to git.
    InvalidRef { name: String, reason: String },
    /// A `git` subprocess exited non-zero.
    GitCommandFailed {
        args: Vec<String>,
        exit_code: Option<i32>,
        stderr: String,
    },
    /// `git worktree add` failed.
    WorktreeAddFailed { path: std::path::PathBuf, reason: String },
    /// Removing a worktree's directory or registration failed.
    WorktreeCleanupFailed { path: std::path::PathBuf, reason: String },
    /// The configured `AgentRunner` could not start the agent process.
    AgentSpawnFailed { task_id: String, reason: String },
    /// The agent ran longer than the configured timeout.
    AgentTimeout { task_id: String, timeout_ms: u64 },
    /// The agent exited non-zero without signalling a rate limit.
    AgentNonZeroExit { task_id: String, exit_code: i32 },
    /// The agent signalled a provider rate limit. Retryable by the worker's
    /// backoff strategy.
    RateLimited { task_id: String, provider: String },
    /// `git merge --no-commit` left conflict markers. Not a hard failure —
    /// routed to the conflict resolver.
    MergeConflict { operation_id: String, files: Vec<String> },
    /// The merge engine could not complete an operation after resolving (or
    /// attempting to resolve) conflicts.
    MergeFailed { operation_id: String, reason: String },
    /// `git reset --hard <backup_tag>` itself failed — the worst case, since
    /// the repo may now be left inconsistent.
    RollbackFailed { operation_id: String, backup_tag: String, reason: String },
    /// No `ConflictAi` was configured but a conflict needed resolution.
    AiResolverUnavailable { operation_id: String },
    /// The configured `ConflictAi` returned an error.
    AiResolverFailed { operation_id: String, reason: String },
    /// The configured `ConflictAi` exceeded its time budget.
    AiResolverTimeout { operation_id: String, timeout_ms: u64 },
    /// The task graph contains a dependency cycle.
    GraphCyclic { task_ids: Vec<String> },
    /// The host's `Tracker` returned an error or became unreachable.
    TrackerUnavailable { reason: String },
    /// Writing the session-state checkpoint failed.
    PersistenceFailed { path: std::path::PathBuf, reason: String },
    /// The commit lock could not be acquired within its retry budget.
    LockAcquireTimeout { path: std::path::PathBuf, waited_ms: u64 },
    /// The session was cancelled before this operation completed.
    Cancelled,
    /// A domain newtype rejected its input.
    InvalidValue(TypeError),
}

impl fmt::Display for RalphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRef { name, reason } => write!(
                f,
                "invalid ref name {name:?}: {reason}\n  To fix: use only the engine's generated branch/tag names, never task-supplied strings."
            ),
            Self::GitCommandFailed { args, exit_code, stderr } => write!(
                f,
                "git {} failed (exit {:?}): {}\n  To fix: run the command manually in the worktree to see the full git output.",
                args.join(" "),
                exit_code,
                stderr.trim()
            ),
            Self::WorktreeAddFailed { path, reason } => write!(
                f,
                "failed to create worktree at {}: {reason}\n  To fix: ensure no stale worktree or lock file already exists at that path.",
                path.display()
            ),
            Self::WorktreeCleanupFailed { path, reason } => write!(
                f,
                "failed to remove worktree at {}: {reason}\n  To fix: run `git worktree remove --force` manually, then `git worktree prune`.",
                path.display()
            ),
            Self::AgentSpawnFailed { task_id, reason } => write!(
                f,
                "failed to spawn agent for task {task_id}: {reason}\n  To fix: verify the AgentRunner's command is on PATH and executable."
            ),
            Self::AgentTimeout { task_id, timeout_ms } => write!(
                f,
                "agent for task {task_id} exceeded its {timeout_ms}ms timeout\n  To fix: raise the configured timeout or check the agent for a hang."
            ),
            Self::AgentNonZeroExit { task_id, exit_code } => write!(
                f,
                "agent for task {task_id} exited with code {exit_code}\n  To fix: inspect the worker's captured output for the agent's error."
            ),
            Self::RateLimited { task_id, provider } => write!(
                f,
                "agent for task {task_id} was rate-limited by {provider}\n  To fix: none needed — the worker will retry with backoff or fall back."
            ),
            Self::MergeConflict { operation_id, files } => write!(
                f,
                "merge {operation_id} conflicted in {} file(s): {}\n  To fix: none needed — routed to the conflict resolver.",
                files.len(),
                files.join(", ")
            ),
            Self::MergeFailed { operation_id, reason } => write!(
                f,
                "merge {operation_id} failed: {reason}\n  To fix: inspect the session branch; the backup tag can be used to roll back manually."
            ),
            Self::RollbackFailed { operation_id, backup_tag, reason } => write!(
                f,
                "rollback of merge {operation_id} to {backup_tag} failed: {reason}\n  To fix: manually run `git reset --hard {backup_tag}` on the session branch."
            ),
            Self::AiResolverUnavailable { operation_id } => write!(
                f,
                "merge {operation_id} conflicted but no conflict resolver was configured\n  To fix: supply a ConflictAi implementation, or resolve the conflict manually and re-run."
            ),
            Self::AiResolverFailed { operation_id, reason } => write!(
                f,
                "conflict resolver failed for merge {operation_id}: {reason}\n  To fix: inspect the resolver's logs; the merge was rolled back to its backup tag."
            ),
            Self::AiResolverTimeout { operation_id, timeout_ms } => write!(
                f,
                "conflict resolver for merge {operation_id} exceeded its {timeout_ms}ms budget\n  To fix: raise the configured resolver timeout."
            ),
            Self::GraphCyclic { task_ids } => write!(
                f,
                "task graph contains a dependency cycle through: {}\n  To fix: break the cycle in the tracker's dependsOn data, or sequentialize those tasks manually.",
                task_ids.join(", ")
            ),
            Self::TrackerUnavailable { reason } => write!(
                f,
                "tracker unavailable: {reason}\n  To fix: check the host application's task-tracker connection."
            ),
            Self::PersistenceFailed { path, reason } => write!(
                f,
                "failed to persist session state to {}: {reason}\n  To fix: check disk space and permissions on the .ralph-tui directory.",
                path.display()
            ),
            Self::LockAcquireTimeout { path, waited_ms } => write!(
                f,
                "could not acquire commit lock at {} after {waited_ms}ms\n  To fix: check for a stale lock directory left by a crashed process.",
                path.display()
            ),
            Self::Cancelled => write!(f, "operation cancelled\n  To fix: none needed — this is expected during shutdown."),
            Self::InvalidValue(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RalphError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidValue(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TypeError> for RalphError {
    fn from(value: TypeError) -> Self {
        Self::InvalidValue(value)
    }
}

impl RalphError {
    /// True for errors a worker's retry strategy should treat as transient.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::AgentTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn invalid_ref_display_mentions_name() {
        let err = RalphError::InvalidRef {
            name: "bad ref".to_owned(),
            reason: "contains space".to_owned(),
        };
        let msg = err.to_string();
        assert!(msg.contains("bad ref"));
        assert!(msg.contains("To fix:"));
    }

    #[test]
    fn git_command_failed_includes_args_and_stderr() {
        let err = RalphError::GitCommandFailed {
            args: vec!["status".to_owned()],
            exit_code: Some(128),
            stderr: "fatal: not a git repository".to_owned(),
        };
        let msg = err.to_string();
        assert!(msg.contains("git status"));
        assert!(msg.contains("128"));
        assert!(msg.contains("not a git repository"));
    }

    #[test]
    fn rate_limited_is_retryable() {
        let err = RalphError::RateLimited {
            task_id: "t1".to_owned(),
            provider: "anthropic".to_owned(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn merge_failed_is_not_retryable() {
        let err = RalphError::MergeFailed {
            operation_id: "op1".to_owned(),
            reason: "boom".to_owned(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn graph_cyclic_lists_all_task_ids() {
        let err = RalphError::GraphCyclic {
            task_ids: vec!["a".to_owned(), "b".to_owned(), "c".to_owned()],
        };
        let msg = err.to_string();
        assert!(msg.contains("a, b, c"));
    }

    #[test]
    fn from_type_error_preserves_source() {
        let type_err = TypeError::InvalidTaskId("X".to_owned());
        let err: RalphError = type_err.clone().into();
        assert!(matches!(err, RalphError::InvalidValue(_)));
        assert_eq!(err.source().unwrap().to_string(), type_err.to_string());
    }

    #[test]
    fn cancelled_display_is_stable() {
        assert!(RalphError::Cancelled.to_string().contains("cancelled"));
    }
}
