//! Thin, injection-safe wrapper over the `git` binary for the plumbing
//! operations the merge engine and conflict resolver need.
//!
//! Every function here runs `git -C <dir> <args...>` with argv arguments —
//! nothing is ever interpolated into a shell string. Ref arguments that
//! originate outside this crate (never the case today, since callers only
//! ever pass engine-generated branch/tag names) would still need validation
//! at the call site the way `refs.rs` validates before writing.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::RalphError;
use crate::model::types::GitOid;
use crate::process::{self, ProcessOutput, ProcessRequest};

/// Default timeout for a single git invocation through this module.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Bytes of combined stdout/stderr retained per git invocation. Git
/// plumbing output is small and never needs the generous ceiling an agent
/// process gets.
const OUTPUT_LIMIT: usize = 1 << 16;

fn run(dir: &Path, args: &[&str]) -> Result<ProcessOutput, RalphError> {
    let owned_args: Vec<String> = args.iter().map(|s| (*s).to_owned()).collect();
    let env = HashMap::new();
    let request = ProcessRequest {
        program: "git",
        args: &owned_args,
        cwd: dir,
        env: &env,
        stdin: None,
        timeout: DEFAULT_TIMEOUT,
        buffer_limit: OUTPUT_LIMIT,
    };
    process::run(&request).map_err(|e| RalphError::GitCommandFailed {
        args: owned_args.clone(),
        exit_code: None,
        stderr: e.to_string(),
    })
}

fn stdout(dir: &Path, args: &[&str]) -> Result<String, RalphError> {
    let output = run(dir, args)?;
    if output.success() {
        Ok(output.stdout.trim().to_owned())
    } else {
        Err(RalphError::GitCommandFailed {
            args: args.iter().map(|s| (*s).to_owned()).collect(),
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_owned(),
        })
    }
}

/// `git status --porcelain`.
///
/// # Errors
/// Returns [`RalphError::GitCommandFailed`] if git cannot be run.
pub fn status(dir: &Path) -> Result<String, RalphError> {
    stdout(dir, &["status", "--porcelain"])
}

/// `git add -A`.
///
/// # Errors
/// Returns [`RalphError::GitCommandFailed`] if git cannot be run.
pub fn add_all(dir: &Path) -> Result<(), RalphError> {
    stdout(dir, &["add", "-A"]).map(|_| ())
}

/// `git commit -m <message>`.
///
/// # Errors
/// Returns [`RalphError::GitCommandFailed`] if git cannot be run (including
/// "nothing to commit").
pub fn commit(dir: &Path, message: &str) -> Result<(), RalphError> {
    stdout(dir, &["commit", "-m", message]).map(|_| ())
}

/// `git commit --no-edit`, used to finalize a clean `--no-commit` merge or a
/// conflict resolution that has already staged every file.
///
/// # Errors
/// Returns [`RalphError::GitCommandFailed`] if git cannot be run.
pub fn commit_no_edit(dir: &Path) -> Result<(), RalphError> {
    stdout(dir, &["commit", "--no-edit"]).map(|_| ())
}

/// `git rev-parse <reference>`, parsed as a [`GitOid`].
///
/// # Errors
/// Returns [`RalphError::GitCommandFailed`] if git fails or the output is
/// not a well-formed object id.
pub fn rev_parse(dir: &Path, reference: &str) -> Result<GitOid, RalphError> {
    let raw = stdout(dir, &["rev-parse", reference])?;
    GitOid::new(&raw).map_err(|_| RalphError::GitCommandFailed {
        args: vec!["rev-parse".to_owned(), reference.to_owned()],
        exit_code: None,
        stderr: format!("unexpected rev-parse output: {raw:?}"),
    })
}

/// `git show <object>`, e.g. `:1:path/to/file` for a conflict stage.
/// Returns `None` if the object does not exist at that stage (the file was
/// added on only one side of the merge).
///
/// # Errors
/// Returns [`RalphError::GitCommandFailed`] for failures other than "no
/// such object".
pub fn show(dir: &Path, object: &str) -> Result<Option<String>, RalphError> {
    let output = run(dir, &["show", object])?;
    if output.success() {
        return Ok(Some(output.stdout));
    }
    let stderr = &output.stderr;
    if stderr.contains("does not exist") || stderr.contains("bad revision") || stderr.contains("fatal: path") {
        return Ok(None);
    }
    Err(RalphError::GitCommandFailed {
        args: vec!["show".to_owned(), object.to_owned()],
        exit_code: output.exit_code,
        stderr: stderr.trim().to_owned(),
    })
}

/// The result of attempting `git merge --no-commit <branch>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Clean,
    Conflicted { files: Vec<String> },
    Failed { reason: String },
}

/// `git merge --no-commit --no-ff <branch>`.
///
/// # Errors
/// Returns [`RalphError::GitCommandFailed`] only if git itself cannot be
/// spawned; a conflicting or otherwise failed merge is reported through
/// [`MergeOutcome`], not as an `Err`.
pub fn merge_no_commit(dir: &Path, branch: &str) -> Result<MergeOutcome, RalphError> {
    let output = run(dir, &["merge", "--no-commit", "--no-ff", branch])?;
    if output.success() {
        return Ok(MergeOutcome::Clean);
    }
    let files = conflicted_files(dir)?;
    if !files.is_empty() {
        return Ok(MergeOutcome::Conflicted { files });
    }
    Ok(MergeOutcome::Failed { reason: output.stderr.trim().to_owned() })
}

/// `git diff --name-only --diff-filter=U` — files left with unmerged stages.
///
/// # Errors
/// Returns [`RalphError::GitCommandFailed`] if git cannot be run.
pub fn conflicted_files(dir: &Path) -> Result<Vec<String>, RalphError> {
    let raw = stdout(dir, &["diff", "--name-only", "--diff-filter=U"])?;
    Ok(raw.lines().map(str::to_owned).filter(|l| !l.is_empty()).collect())
}

/// `git merge --abort`. Best-effort: callers typically call this while
/// already handling a failure and only care whether the working tree ends
/// up clean.
///
/// # Errors
/// Returns [`RalphError::GitCommandFailed`] if git fails for a reason other
/// than "no merge in progress".
pub fn merge_abort(dir: &Path) -> Result<(), RalphError> {
    let output = run(dir, &["merge", "--abort"])?;
    if output.success() {
        return Ok(());
    }
    if output.stderr.contains("no merge to abort") {
        return Ok(());
    }
    Err(RalphError::GitCommandFailed {
        args: vec!["merge".to_owned(), "--abort".to_owned()],
        exit_code: output.exit_code,
        stderr: output.stderr.trim().to_owned(),
    })
}

/// `git reset --hard <reference>`.
///
/// # Errors
/// Returns [`RalphError::GitCommandFailed`] if git fails.
pub fn reset_hard(dir: &Path, reference: &str) -> Result<(), RalphError> {
    stdout(dir, &["reset", "--hard", reference]).map(|_| ())
}

/// `git checkout <branch>`, or `git checkout -b <branch>` when `create` is
/// true.
///
/// # Errors
/// Returns [`RalphError::GitCommandFailed`] if git fails.
pub fn checkout(dir: &Path, branch: &str, create: bool) -> Result<(), RalphError> {
    if create {
        stdout(dir, &["checkout", "-b", branch]).map(|_| ())
    } else {
        stdout(dir, &["checkout", branch]).map(|_| ())
    }
}

/// `git symbolic-ref --short HEAD`, or `None` in detached-HEAD state.
///
/// # Errors
/// Returns [`RalphError::GitCommandFailed`] for failures other than being
/// detached.
pub fn current_branch(dir: &Path) -> Result<Option<String>, RalphError> {
    let output = run(dir, &["symbolic-ref", "--short", "HEAD"])?;
    if output.success() {
        return Ok(Some(output.stdout.trim().to_owned()));
    }
    if output.stderr.contains("not a symbolic ref") {
        return Ok(None);
    }
    Err(RalphError::GitCommandFailed {
        args: vec!["symbolic-ref".to_owned(), "--short".to_owned(), "HEAD".to_owned()],
        exit_code: output.exit_code,
        stderr: output.stderr.trim().to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
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
        add_all(root).unwrap();
        commit(root, "init").unwrap();
        dir
    }

    #[test]
    fn commit_and_rev_parse_roundtrip() {
        let dir = setup_repo();
        let oid = rev_parse(dir.path(), "HEAD").unwrap();
        assert_eq!(oid.as_str().len(), 40);
    }

    #[test]
    fn merge_no_commit_reports_clean_for_fast_forward_branch() {
        let dir = setup_repo();
        checkout(dir.path(), "feature", true).unwrap();
        fs::write(dir.path().join("b.txt"), "two\n").unwrap();
        add_all(dir.path()).unwrap();
        commit(dir.path(), "add b").unwrap();
        checkout(dir.path(), "main", false).unwrap();

        let outcome = merge_no_commit(dir.path(), "feature").unwrap();
        assert_eq!(outcome, MergeOutcome::Clean);
    }

    #[test]
    fn merge_no_commit_reports_conflicted_files() {
        let dir = setup_repo();
        checkout(dir.path(), "feature", true).unwrap();
        fs::write(dir.path().join("a.txt"), "two\n").unwrap();
        add_all(dir.path()).unwrap();
        commit(dir.path(), "change a on feature").unwrap();
        checkout(dir.path(), "main", false).unwrap();
        fs::write(dir.path().join("a.txt"), "three\n").unwrap();
        add_all(dir.path()).unwrap();
        commit(dir.path(), "change a on main").unwrap();

        let outcome = merge_no_commit(dir.path(), "feature").unwrap();
        assert_eq!(outcome, MergeOutcome::Conflicted { files: vec!["a.txt".to_owned()] });
        merge_abort(dir.path()).unwrap();
    }

    #[test]
    fn reset_hard_restores_previous_commit() {
        let dir = setup_repo();
        let before = rev_parse(dir.path(), "HEAD").unwrap();
        fs::write(dir.path().join("a.txt"), "changed\n").unwrap();
        add_all(dir.path()).unwrap();
        commit(dir.path(), "change").unwrap();
        reset_hard(dir.path(), before.as_str()).unwrap();
        assert_eq!(rev_parse(dir.path(), "HEAD").unwrap(), before);
    }

    #[test]
    fn current_branch_returns_checked_out_branch() {
        let dir = setup_repo();
        assert_eq!(current_branch(dir.path()).unwrap().as_deref(), Some("main"));
    }

    #[test]
    fn show_missing_path_returns_none() {
        let dir = setup_repo();
        let result = show(dir.path(), "HEAD:does-not-exist.txt").unwrap();
        assert!(result.is_none());
    }
}
