//! Serialized merge engine.
//!
//! Exactly one merge runs against the repository's shared checkout at a
//! time — workers commit inside their own worktrees, which is lock-free,
//! but integrating those branches into the session branch touches the
//! single checked-out working tree under `repo_root`, so it has to be
//! strictly serialized. Workers call [`MergeEngine::enqueue`] as they
//! finish; a single drain loop (owned by the executor, see
//! [`MergeEngine::try_recv`]) calls [`MergeEngine::process`] one operation
//! at a time.
//!
//! Every attempt is preceded by an annotated backup tag at the session
//! branch's current tip, so a failed merge can always be rolled back with
//! `git reset --hard <backup_tag>` rather than leaving the branch in a
//! half-merged state.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};

use crate::error::RalphError;
use crate::git;
use crate::model::types::{MergeOperation, MergeStatus, RefName, WorkerResult};
use crate::refs;

/// Build the conventional commit message for a task's merge, matching the
/// grammar workers use for their own in-worktree commits.
#[must_use]
pub fn commit_message(task_id: &str, task_title: &str) -> String {
    format!("feat(ralph): {task_id} - {task_title}")
}

/// The FIFO queue of pending merges plus the git sequence that drains it.
pub struct MergeEngine {
    repo_root: PathBuf,
    sender: Sender<MergeOperation>,
    receiver: Receiver<MergeOperation>,
}

impl MergeEngine {
    #[must_use]
    pub fn new(repo_root: PathBuf) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self { repo_root, sender, receiver }
    }

    /// Build a [`MergeOperation`] for a finished worker and push it onto the
    /// queue.
    ///
    /// # Errors
    /// Returns [`RalphError::InvalidRef`] if `operation_id` does not form a
    /// valid backup tag name (it is embedded verbatim into a git ref).
    pub fn enqueue(
        &self,
        result: &WorkerResult,
        task_title: &str,
        target_branch: RefName,
        operation_id: String,
        now: DateTime<Utc>,
    ) -> Result<MergeOperation, RalphError> {
        let backup_tag =
            RefName::new(refs::backup_tag_name(&operation_id)).map_err(|_| RalphError::InvalidRef {
                name: operation_id.clone(),
                reason: "operation id is not a valid ref-name component".to_owned(),
            })?;

        let op = MergeOperation {
            id: operation_id,
            task_id: result.task_id.clone(),
            source_branch: result.branch.clone(),
            target_branch,
            commit_message: commit_message(result.task_id.as_str(), task_title),
            backup_tag,
            status: MergeStatus::Queued,
            conflicted_files: Vec::new(),
            queued_at: now,
            completed_at: None,
        };

        // An unbounded channel's send only fails if the receiver has been
        // dropped, which never happens while `self` is alive.
        let _ = self.sender.send(op.clone());
        Ok(op)
    }

    /// Pull the next queued operation without blocking.
    #[must_use]
    pub fn try_recv(&self) -> Option<MergeOperation> {
        self.receiver.try_recv().ok()
    }

    /// Run the merge sequence for one queued operation to completion:
    /// tag the current tip as a backup, check out the target branch, attempt
    /// `git merge --no-commit`, and either commit (clean), leave the
    /// operation `Conflicted` for the resolver (merge aborted, files
    /// recorded), or roll back entirely on any other failure.
    ///
    /// # Errors
    /// Returns [`RalphError`] if a git command this sequence depends on
    /// cannot be run at all (not for an ordinary merge conflict, which is
    /// reported through the returned operation's status).
    pub fn process(&self, mut op: MergeOperation, now: DateTime<Utc>) -> Result<MergeOperation, RalphError> {
        op.status = MergeStatus::InProgress;

        let backup_oid = git::rev_parse(&self.repo_root, op.target_branch.as_str())?;
        refs::create_tag(
            &self.repo_root,
            op.backup_tag.as_str(),
            &backup_oid,
            &format!("pre-merge backup for {}", op.id),
        )
        .map_err(|e| RalphError::MergeFailed {
            operation_id: op.id.clone(),
            reason: e.to_string(),
        })?;

        git::checkout(&self.repo_root, op.target_branch.as_str(), false)?;

        match git::merge_no_commit(&self.repo_root, op.source_branch.as_str())? {
            git::MergeOutcome::Clean => {
                git::commit(&self.repo_root, &op.commit_message)?;
                op.status = MergeStatus::Completed;
                op.completed_at = Some(now);
            }
            git::MergeOutcome::Conflicted { files } => {
                git::merge_abort(&self.repo_root)?;
                op.status = MergeStatus::Conflicted;
                op.conflicted_files = files;
            }
            git::MergeOutcome::Failed { reason } => {
                let _ = git::merge_abort(&self.repo_root);
                self.rollback(&mut op, now);
                op.status = MergeStatus::Failed;
                op.completed_at = Some(now);
                return Err(RalphError::MergeFailed { operation_id: op.id, reason });
            }
        }

        Ok(op)
    }

    /// Roll a merge operation back to its pre-merge backup tag. Used both by
    /// `process` on an outright failure and by the conflict resolver when a
    /// conflicted merge cannot be fully resolved.
    ///
    /// # Errors
    /// Returns [`RalphError::RollbackFailed`] if `git reset --hard` itself
    /// fails (a corrupt repository state, not an ordinary merge outcome).
    pub fn rollback(&self, op: &mut MergeOperation, now: DateTime<Utc>) {
        if let Err(e) = git::reset_hard(&self.repo_root, op.backup_tag.as_str()) {
            tracing::error!(operation_id = %op.id, error = %e, "rollback to backup tag failed");
        }
        op.status = MergeStatus::RolledBack;
        op.completed_at = Some(now);
    }

    /// Delete the backup tag once an operation's outcome (success or
    /// deliberate rollback) is durable. Idempotent.
    ///
    /// # Errors
    /// Returns [`RalphError::GitCommandFailed`] if git fails for a reason
    /// other than the tag already being gone.
    pub fn cleanup_tag(&self, op: &MergeOperation) -> Result<(), RalphError> {
        refs::delete_tag(&self.repo_root, op.backup_tag.as_str()).map_err(|e| RalphError::GitCommandFailed {
            args: vec!["tag".to_owned(), "-d".to_owned(), op.backup_tag.as_str().to_owned()],
            exit_code: None,
            stderr: e.to_string(),
        })
    }

    /// Check out `branch`, typically the repository's original branch, once
    /// a session has finished.
    ///
    /// # Errors
    /// Returns [`RalphError::GitCommandFailed`] if the checkout fails.
    pub fn return_to_branch(&self, branch: &RefName) -> Result<(), RalphError> {
        git::checkout(&self.repo_root, branch.as_str(), false)
    }

    #[must_use]
    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::{TaskId, TokenUsage};
    use std::fs;
    use std::process::Command;

    fn setup_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.name", "Test"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "commit.gpgsign", "false"],
        ] {
            Command::new("git").args(args).current_dir(root).output().unwrap();
        }
        fs::write(root.join("a.txt"), "one\n").unwrap();
        git::add_all(root).unwrap();
        git::commit(root, "init").unwrap();
        dir
    }

    fn worker_result(task_id: &str, branch: &str) -> WorkerResult {
        WorkerResult {
            task_id: TaskId::new(task_id).unwrap(),
            success: true,
            task_completed: true,
            worktree_path: PathBuf::new(),
            branch: RefName::new(branch).unwrap(),
            iterations_run: 1,
            duration_ms: 10,
            commit_count: 1,
            token_usage: TokenUsage::default(),
            error: None,
        }
    }

    #[test]
    fn enqueue_then_process_merges_cleanly() {
        let dir = setup_repo();
        let root = dir.path();
        git::checkout(root, "feature", true).unwrap();
        fs::write(root.join("b.txt"), "two\n").unwrap();
        git::add_all(root).unwrap();
        git::commit(root, "add b").unwrap();
        git::checkout(root, "main", false).unwrap();

        let engine = MergeEngine::new(root.to_path_buf());
        let result = worker_result("t1", "feature");
        let op = engine
            .enqueue(&result, "Add b", RefName::new("main").unwrap(), "op-1".to_owned(), Utc::now())
            .unwrap();

        let queued = engine.try_recv().unwrap();
        assert_eq!(queued.id, op.id);

        let finished = engine.process(queued, Utc::now()).unwrap();
        assert_eq!(finished.status, MergeStatus::Completed);
        assert!(root.join("b.txt").exists());
    }

    #[test]
    fn process_reports_conflicted_and_aborts_merge() {
        let dir = setup_repo();
        let root = dir.path();
        git::checkout(root, "feature", true).unwrap();
        fs::write(root.join("a.txt"), "from feature\n").unwrap();
        git::add_all(root).unwrap();
        git::commit(root, "change a on feature").unwrap();
        git::checkout(root, "main", false).unwrap();
        fs::write(root.join("a.txt"), "from main\n").unwrap();
        git::add_all(root).unwrap();
        git::commit(root, "change a on main").unwrap();

        let engine = MergeEngine::new(root.to_path_buf());
        let result = worker_result("t1", "feature");
        let op = engine
            .enqueue(&result, "Change a", RefName::new("main").unwrap(), "op-2".to_owned(), Utc::now())
            .unwrap();

        let finished = engine.process(op, Utc::now()).unwrap();
        assert_eq!(finished.status, MergeStatus::Conflicted);
        assert_eq!(finished.conflicted_files, vec!["a.txt".to_owned()]);
        assert!(git::status(root).unwrap().is_empty());
    }

    #[test]
    fn rollback_restores_backup_tag_tip() {
        let dir = setup_repo();
        let root = dir.path();
        let engine = MergeEngine::new(root.to_path_buf());
        let before = git::rev_parse(root, "HEAD").unwrap();

        let mut op = MergeOperation {
            id: "op-3".to_owned(),
            task_id: TaskId::new("t1").unwrap(),
            source_branch: RefName::new("main").unwrap(),
            target_branch: RefName::new("main").unwrap(),
            commit_message: "noop".to_owned(),
            backup_tag: RefName::new("ralph-backup/op-3").unwrap(),
            status: MergeStatus::InProgress,
            conflicted_files: Vec::new(),
            queued_at: Utc::now(),
            completed_at: None,
        };
        refs::create_tag(root, op.backup_tag.as_str(), &before, "backup").unwrap();

        fs::write(root.join("a.txt"), "mutated\n").unwrap();
        git::add_all(root).unwrap();
        git::commit(root, "mutate").unwrap();

        engine.rollback(&mut op, Utc::now());
        assert_eq!(op.status, MergeStatus::RolledBack);
        assert_eq!(git::rev_parse(root, "HEAD").unwrap(), before);
    }
}
