//! Worktree pool: one git worktree per live worker.
//!
//! Each worker gets its own checkout under `<cwd>/.ralph-tui/worktrees/`,
//! created with `git worktree add` on a fresh branch
//! (`ralph-parallel/<task_id>`) cut from the session branch. Acquiring and
//! releasing are idempotent, so a crashed run can be resumed without manual
//! cleanup: [`WorktreePool::sweep_orphans`] finds worktrees left behind by a
//! prior process and removes the ones no longer referenced by a live
//! worker, without touching ones the caller asks to keep.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::RalphError;
use crate::model::types::{RefName, TaskId, Worktree};
use crate::refs::worker_branch_name;

/// Manages the lifecycle of per-worker git worktrees under one repository.
pub struct WorktreePool {
    /// The root of the main checkout (where `.git` lives).
    root: PathBuf,
}

impl WorktreePool {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn worktrees_dir(&self) -> PathBuf {
        self.root.join(".ralph-tui").join("worktrees")
    }

    fn worktree_path(&self, worker_id: &str) -> PathBuf {
        self.worktrees_dir().join(worker_id)
    }

    fn git_stdout(&self, args: &[&str]) -> Result<String, RalphError> {
        git_stdout_in(&self.root, args)
    }

    /// Create a worktree for `worker_id` working on `task_id`, branching
    /// from `base_branch` (normally the session branch).
    ///
    /// Idempotent: if a worktree already exists at the expected path and
    /// git still recognizes it, it is reused as-is.
    ///
    /// # Errors
    /// Returns [`RalphError::WorktreeAddFailed`] if `git worktree add` fails
    /// after removing any stale state at the target path.
    pub fn acquire(
        &self,
        worker_id: &str,
        task_id: &TaskId,
        base_branch: &RefName,
    ) -> Result<Worktree, RalphError> {
        let path = self.worktree_path(worker_id);
        let branch = RefName::new(worker_branch_name(task_id))?;

        if path.exists() && self.is_known_worktree(&path) {
            return Ok(Worktree {
                id: worker_id.to_owned(),
                path,
                branch,
                task_id: task_id.clone(),
                created_at: chrono::Utc::now(),
            });
        }

        if path.exists() {
            std::fs::remove_dir_all(&path).map_err(|e| RalphError::WorktreeAddFailed {
                path: path.clone(),
                reason: format!("could not clear stale directory: {e}"),
            })?;
        }
        let _ = self.git_stdout(&["worktree", "prune"]);

        std::fs::create_dir_all(self.worktrees_dir()).map_err(|e| RalphError::WorktreeAddFailed {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let path_str = path.to_string_lossy().into_owned();
        // `-B` creates the branch if absent, or resets it if present — this
        // makes retrying a failed acquire safe.
        let output = Command::new("git")
            .args(["worktree", "add", "-B", branch.as_str(), &path_str, base_branch.as_str()])
            .current_dir(&self.root)
            .output()
            .map_err(|e| RalphError::WorktreeAddFailed {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            if path.exists() {
                let _ = std::fs::remove_dir_all(&path);
            }
            return Err(RalphError::WorktreeAddFailed {
                path,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        Ok(Worktree {
            id: worker_id.to_owned(),
            path,
            branch,
            task_id: task_id.clone(),
            created_at: chrono::Utc::now(),
        })
    }

    /// Release a worker's worktree.
    ///
    /// When `preserve_on_error` is true and the worktree's branch has
    /// commits beyond `base_branch`, the directory is left in place (so a
    /// human can inspect a failed worker's output) but still deregistered
    /// from git via `worktree remove --force` is skipped in favor of
    /// `worktree prune` once the directory is later cleaned up manually.
    ///
    /// # Errors
    /// Returns [`RalphError::WorktreeCleanupFailed`] if git cannot remove
    /// the worktree registration.
    pub fn release(&self, worktree: &Worktree, preserve_on_error: bool) -> Result<(), RalphError> {
        if preserve_on_error {
            tracing::warn!(path = %worktree.path.display(), "preserving worktree for inspection");
            return Ok(());
        }

        if worktree.path.exists() {
            let path_str = worktree.path.to_string_lossy().into_owned();
            let output = Command::new("git")
                .args(["worktree", "remove", "--force", &path_str])
                .current_dir(&self.root)
                .output()
                .map_err(|e| RalphError::WorktreeCleanupFailed {
                    path: worktree.path.clone(),
                    reason: e.to_string(),
                })?;

            if !output.status.success() {
                // Fall back to manual removal; `worktree prune` catches up the
                // registry on the next call.
                std::fs::remove_dir_all(&worktree.path).map_err(|e| RalphError::WorktreeCleanupFailed {
                    path: worktree.path.clone(),
                    reason: format!(
                        "git worktree remove failed ({}) and manual removal also failed: {e}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                })?;
            }
        }

        let _ = self.git_stdout(&["worktree", "prune"]);
        Ok(())
    }

    /// Release every worktree under the pool's directory, ignoring
    /// individual failures so one stuck worktree doesn't block the rest.
    pub fn cleanup_all(&self) {
        let dir = self.worktrees_dir();
        let Ok(entries) = std::fs::read_dir(&dir) else { return };
        for entry in entries.flatten() {
            let path = entry.path();
            let path_str = path.to_string_lossy().into_owned();
            let _ = Command::new("git")
                .args(["worktree", "remove", "--force", &path_str])
                .current_dir(&self.root)
                .output();
        }
        let _ = self.git_stdout(&["worktree", "prune"]);
    }

    /// Find worktrees registered with git under this pool's directory that
    /// are not in `live_worker_ids`, and remove them. Called at session
    /// startup to recover from a crash.
    pub fn sweep_orphans(&self, live_worker_ids: &[String]) -> Vec<PathBuf> {
        let mut removed = Vec::new();
        let Ok(listing) = self.git_stdout(&["worktree", "list", "--porcelain"]) else {
            return removed;
        };
        let our_dir = self.worktrees_dir();
        for path in parse_worktree_paths(&listing) {
            if !path.starts_with(&our_dir) {
                continue;
            }
            let worker_id = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if live_worker_ids.iter().any(|id| id == worker_id) {
                continue;
            }
            let path_str = path.to_string_lossy().into_owned();
            let _ = Command::new("git")
                .args(["worktree", "remove", "--force", &path_str])
                .current_dir(&self.root)
                .output();
            removed.push(path);
        }
        let _ = self.git_stdout(&["worktree", "prune"]);
        removed
    }

    fn is_known_worktree(&self, path: &Path) -> bool {
        self.git_stdout(&["worktree", "list", "--porcelain"])
            .map(|listing| parse_worktree_paths(&listing).iter().any(|p| p == path))
            .unwrap_or(false)
    }
}

fn git_stdout_in(dir: &Path, args: &[&str]) -> Result<String, RalphError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| RalphError::GitCommandFailed {
            args: args.iter().map(|s| (*s).to_owned()).collect(),
            exit_code: None,
            stderr: e.to_string(),
        })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(RalphError::GitCommandFailed {
            args: args.iter().map(|s| (*s).to_owned()).collect(),
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        })
    }
}

fn parse_worktree_paths(porcelain: &str) -> Vec<PathBuf> {
    porcelain
        .lines()
        .filter_map(|line| line.strip_prefix("worktree "))
        .map(PathBuf::from)
        .collect()
}
