//! AI-assisted conflict resolution.
//!
//! Runs once per [`MergeOperation`](crate::model::types::MergeOperation) left
//! `Conflicted` by the merge engine. For each conflicted file it rebuilds the
//! three-way merge, extracts the base/ours/theirs blobs and the
//! marker-annotated working-tree content, and hands them to the host's
//! [`ConflictAi`]. A file that cannot be resolved — the callback declines,
//! times out, or writes something that still won't stage — aborts the whole
//! operation and rolls it back; conflicts are resolved file-by-file but
//! committed all-or-nothing.

use std::fs;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::RalphError;
use crate::git;
use crate::merge::MergeEngine;
use crate::model::types::{ConflictResolutionResult, FileConflict, MergeOperation, MergeStatus, ResolutionMethod};
use crate::traits::ConflictAi;

/// Resolve every conflicted file in `op` using `resolver`, committing if all
/// of them succeed and rolling back to the operation's backup tag otherwise.
///
/// # Errors
/// Returns [`RalphError`] if a git command this sequence depends on cannot
/// be run at all. An unresolved conflict is reported through the returned
/// operation's status, not as an `Err`.
pub fn resolve(
    engine: &MergeEngine,
    mut op: MergeOperation,
    resolver: &dyn ConflictAi,
    task_title: &str,
    timeout: Duration,
    now: DateTime<Utc>,
) -> Result<(MergeOperation, Vec<ConflictResolutionResult>), RalphError> {
    debug_assert_eq!(op.status, MergeStatus::Conflicted);

    let root = engine.repo_root();
    git::checkout(root, op.target_branch.as_str(), false)?;
    // Re-enter the merge to rebuild the unmerged index stages the earlier
    // `git merge --abort` discarded.
    let reentered = git::merge_no_commit(root, op.source_branch.as_str())?;
    let conflicted_files = match reentered {
        git::MergeOutcome::Conflicted { files } => files,
        _ => op.conflicted_files.clone(),
    };

    let mut results = Vec::with_capacity(conflicted_files.len());
    let mut all_resolved = true;

    for file_path in &conflicted_files {
        let conflict = extract_conflict(root, file_path)?;
        let resolved = resolve_with_timeout(resolver, &conflict, op.task_id.as_str(), task_title, timeout);

        match resolved {
            Some(content) => {
                let path = root.join(file_path);
                if fs::write(&path, &content).is_ok() && git::add_all(root).is_ok() {
                    results.push(ConflictResolutionResult {
                        file_path: file_path.clone(),
                        success: true,
                        method: ResolutionMethod::Ai,
                        resolved_content: Some(content),
                        error: None,
                    });
                } else {
                    all_resolved = false;
                    results.push(ConflictResolutionResult {
                        file_path: file_path.clone(),
                        success: false,
                        method: ResolutionMethod::Ai,
                        resolved_content: None,
                        error: Some("failed to write resolved content".to_owned()),
                    });
                    break;
                }
            }
            None => {
                all_resolved = false;
                results.push(ConflictResolutionResult {
                    file_path: file_path.clone(),
                    success: false,
                    method: ResolutionMethod::Ai,
                    resolved_content: None,
                    error: Some("conflict resolver declined or timed out".to_owned()),
                });
                break;
            }
        }
    }

    if all_resolved && !conflicted_files.is_empty() {
        git::commit_no_edit(root)?;
        op.status = MergeStatus::Completed;
        op.completed_at = Some(now);
    } else {
        let _ = git::merge_abort(root);
        engine.rollback(&mut op, now);
    }

    Ok((op, results))
}

/// Extract the base/ours/theirs blobs and raw marker text for one
/// conflicted path from the currently in-progress merge.
///
/// # Errors
/// Returns [`RalphError`] if `git show` cannot be run, or the working-tree
/// file cannot be read.
fn extract_conflict(root: &std::path::Path, file_path: &str) -> Result<FileConflict, RalphError> {
    let base = git::show(root, &format!(":1:{file_path}"))?;
    let ours = git::show(root, &format!(":2:{file_path}"))?;
    let theirs = git::show(root, &format!(":3:{file_path}"))?;
    let markers_blob = fs::read_to_string(root.join(file_path)).unwrap_or_default();

    Ok(FileConflict {
        file_path: file_path.to_owned(),
        base,
        ours,
        theirs,
        markers_blob,
    })
}

/// Run `resolver.resolve` on a scoped thread so a misbehaving callback can't
/// block the merge drain loop past `timeout`.
fn resolve_with_timeout(
    resolver: &dyn ConflictAi,
    conflict: &FileConflict,
    task_id: &str,
    task_title: &str,
    timeout: Duration,
) -> Option<String> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    std::thread::scope(|scope| {
        scope.spawn(|| {
            let result = resolver.resolve(conflict, task_id, task_title);
            let _ = tx.send(result);
        });
        rx.recv_timeout(timeout).ok().flatten()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::{RefName, TaskId, TokenUsage, WorkerResult};
    use std::process::Command;

    fn setup_conflicted_repo() -> (tempfile::TempDir, MergeEngine, MergeOperation) {
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
        fs::write(root.join("a.txt"), "base\n").unwrap();
        git::add_all(root).unwrap();
        git::commit(root, "init").unwrap();

        git::checkout(root, "feature", true).unwrap();
        fs::write(root.join("a.txt"), "from feature\n").unwrap();
        git::add_all(root).unwrap();
        git::commit(root, "change on feature").unwrap();
        git::checkout(root, "main", false).unwrap();
        fs::write(root.join("a.txt"), "from main\n").unwrap();
        git::add_all(root).unwrap();
        git::commit(root, "change on main").unwrap();

        let engine = MergeEngine::new(root.to_path_buf());
        let result = WorkerResult {
            task_id: TaskId::new("t1").unwrap(),
            success: true,
            task_completed: true,
            worktree_path: std::path::PathBuf::new(),
            branch: RefName::new("feature").unwrap(),
            iterations_run: 1,
            duration_ms: 10,
            commit_count: 1,
            token_usage: TokenUsage::default(),
            error: None,
        };
        let queued = engine
            .enqueue(&result, "Change a", RefName::new("main").unwrap(), "op-1".to_owned(), Utc::now())
            .unwrap();
        let op = engine.process(queued, Utc::now()).unwrap();
        assert_eq!(op.status, MergeStatus::Conflicted);
        (dir, engine, op)
    }

    struct AlwaysResolves(String);
    impl ConflictAi for AlwaysResolves {
        fn resolve(&self, _conflict: &FileConflict, _task_id: &str, _task_title: &str) -> Option<String> {
            Some(self.0.clone())
        }
    }

    struct NeverResolves;
    impl ConflictAi for NeverResolves {
        fn resolve(&self, _conflict: &FileConflict, _task_id: &str, _task_title: &str) -> Option<String> {
            None
        }
    }

    #[test]
    fn resolver_that_succeeds_commits_the_merge() {
        let (dir, engine, op) = setup_conflicted_repo();
        let resolver = AlwaysResolves("resolved\n".to_owned());
        let (finished, results) =
            resolve(&engine, op, &resolver, "Change a", Duration::from_secs(1), Utc::now()).unwrap();
        assert_eq!(finished.status, MergeStatus::Completed);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "resolved\n");
    }

    #[test]
    fn resolver_that_declines_rolls_back() {
        let (_dir, engine, op) = setup_conflicted_repo();
        let resolver = NeverResolves;
        let (finished, results) =
            resolve(&engine, op, &resolver, "Change a", Duration::from_secs(1), Utc::now()).unwrap();
        assert_eq!(finished.status, MergeStatus::RolledBack);
        assert!(results.iter().all(|r| !r.success));
    }
}
