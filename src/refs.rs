//! Git ref and branch-name helpers for the parallel execution engine.
//!
//! Provides low-level helpers to read, write, and delete git refs, plus the
//! naming scheme for the branches and tags this crate generates.
//!
//! # Branch and tag namespace
//!
//! ```text
//! ralph-parallel/<task_id>          worker branch for one task
//! ralph-session/<session_id[:8]>    the session's integration branch
//! ralph-backup/<merge_op_id>        tag taken before each merge attempt
//! ralph/session-start/<session_id>  tag marking where the session began
//! ```
//!
//! # Concurrency
//!
//! [`write_ref_cas`] implements optimistic concurrency control. Git's
//! internal ref locking makes the CAS atomic: if the ref's current value
//! does not match the expected old OID, git rejects the update and the
//! function returns [`RefError::CasMismatch`]. Callers should retry on
//! mismatch.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use crate::git::DEFAULT_TIMEOUT;
use crate::model::types::{validate_ref_name, GitOid, TaskId};
use crate::process::{self, ProcessOutput, ProcessRequest};

// ---------------------------------------------------------------------------
// Well-known ref prefixes
// ---------------------------------------------------------------------------

/// Prefix for per-task worker branches.
pub const WORKER_BRANCH_PREFIX: &str = "ralph-parallel/";

/// Prefix for per-session integration branches.
pub const SESSION_BRANCH_PREFIX: &str = "ralph-session/";

/// Prefix for pre-merge backup tags.
pub const BACKUP_TAG_PREFIX: &str = "ralph-backup/";

/// Prefix for session-start marker tags.
pub const SESSION_START_TAG_PREFIX: &str = "ralph/session-start/";

/// Build the worker branch name for a task: `ralph-parallel/<task_id>`.
#[must_use]
pub fn worker_branch_name(task_id: &TaskId) -> String {
    format!("{WORKER_BRANCH_PREFIX}{task_id}")
}

/// Build the session integration branch name from a session id, truncated to
/// its first 8 characters: `ralph-session/<short_id>`.
#[must_use]
pub fn session_branch_name(session_id: &str) -> String {
    let short = &session_id[..session_id.len().min(8)];
    format!("{SESSION_BRANCH_PREFIX}{short}")
}

/// Build the backup tag name for a merge operation: `ralph-backup/<op_id>`.
#[must_use]
pub fn backup_tag_name(operation_id: &str) -> String {
    format!("{BACKUP_TAG_PREFIX}{operation_id}")
}

/// Build the session-start marker tag name: `ralph/session-start/<session_id>`.
#[must_use]
pub fn session_start_tag_name(session_id: &str) -> String {
    format!("{SESSION_START_TAG_PREFIX}{session_id}")
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during ref operations.
#[derive(Debug)]
pub enum RefError {
    /// A git command failed to run, or ran and exited non-zero.
    GitCommand {
        command: String,
        stderr: String,
        exit_code: Option<i32>,
    },
    /// Git returned an OID that failed validation.
    InvalidOid { ref_name: String, raw_value: String },
    /// The requested ref name failed client-side validation.
    InvalidRefName(String),
    /// CAS failed because the ref's current value differs from `old_oid`.
    CasMismatch { ref_name: String },
}

impl fmt::Display for RefError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GitCommand {
                command,
                stderr,
                exit_code,
            } => {
                write!(f, "`{command}` failed")?;
                if let Some(code) = exit_code {
                    write!(f, " (exit code {code})")?;
                }
                if !stderr.is_empty() {
                    write!(f, ": {stderr}")?;
                }
                Ok(())
            }
            Self::InvalidOid { ref_name, raw_value } => {
                write!(
                    f,
                    "invalid OID from `{ref_name}`: {raw_value:?} \
                     (expected 40 lowercase hex characters)"
                )
            }
            Self::InvalidRefName(name) => {
                write!(f, "invalid ref name: {name:?}")
            }
            Self::CasMismatch { ref_name } => {
                write!(
                    f,
                    "CAS failed for `{ref_name}`: ref was modified concurrently — \
                     read the current value and retry"
                )
            }
        }
    }
}

impl std::error::Error for RefError {}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

fn ensure_valid_name(name: &str) -> Result<(), RefError> {
    if validate_ref_name(name) {
        Ok(())
    } else {
        Err(RefError::InvalidRefName(name.to_owned()))
    }
}

/// Bytes of combined stdout/stderr retained per ref operation. Git's own
/// output for these plumbing commands is a single line at most.
const OUTPUT_LIMIT: usize = 1 << 14;

/// Run `git <args...>` in `root` with the same timeout enforcement
/// `git.rs` applies to its own plumbing calls.
fn run_git(root: &Path, args: &[&str]) -> Result<ProcessOutput, RefError> {
    let owned_args: Vec<String> = args.iter().map(|s| (*s).to_owned()).collect();
    let env = HashMap::new();
    let request = ProcessRequest {
        program: "git",
        args: &owned_args,
        cwd: root,
        env: &env,
        stdin: None,
        timeout: DEFAULT_TIMEOUT,
        buffer_limit: OUTPUT_LIMIT,
    };
    process::run(&request).map_err(|e| RefError::GitCommand {
        command: format!("git {}", args.join(" ")),
        stderr: e.to_string(),
        exit_code: None,
    })
}

/// Read a git ref and return its OID, or `None` if it does not exist.
///
/// Runs `git rev-parse <name>` in `root`. Returns `None` if the ref is
/// missing (git exits non-zero with "unknown revision or path").
///
/// # Errors
/// Returns an error if git cannot be spawned, if git fails for a reason
/// other than a missing ref, or if the returned OID is malformed.
pub fn read_ref(root: &Path, name: &str) -> Result<Option<GitOid>, RefError> {
    ensure_valid_name(name)?;
    let output = run_git(root, &["rev-parse", name])?;

    if output.success() {
        let oid_str = output.stdout.trim();
        let oid = GitOid::new(oid_str).map_err(|_| RefError::InvalidOid {
            ref_name: name.to_owned(),
            raw_value: oid_str.to_owned(),
        })?;
        return Ok(Some(oid));
    }

    let stderr_trimmed = output.stderr.trim();

    if stderr_trimmed.contains("unknown revision")
        || stderr_trimmed.contains("ambiguous argument")
        || stderr_trimmed.contains("not a valid object")
    {
        return Ok(None);
    }

    Err(RefError::GitCommand {
        command: format!("git rev-parse {name}"),
        stderr: stderr_trimmed.to_owned(),
        exit_code: output.exit_code,
    })
}

/// Write (create or overwrite) a git ref unconditionally.
///
/// Runs `git update-ref <name> <oid>`. For safe concurrent updates, use
/// [`write_ref_cas`] instead.
///
/// # Errors
/// Returns an error if `name` fails validation, git cannot be spawned, or
/// git exits non-zero.
pub fn write_ref(root: &Path, name: &str, oid: &GitOid) -> Result<(), RefError> {
    ensure_valid_name(name)?;
    let output = run_git(root, &["update-ref", name, oid.as_str()])?;

    if output.success() {
        return Ok(());
    }

    Err(RefError::GitCommand {
        command: format!("git update-ref {name} {}", oid.as_str()),
        stderr: output.stderr.trim().to_owned(),
        exit_code: output.exit_code,
    })
}

/// Atomically update a git ref using compare-and-swap (CAS).
///
/// Runs `git update-ref <name> <new_oid> <old_oid>`. Git internally holds a
/// lock on the ref file during the update; the update succeeds only if the
/// ref's current value matches `old_oid`.
///
/// # Errors
/// - [`RefError::CasMismatch`] — ref was modified concurrently.
/// - [`RefError::GitCommand`] — other git failure, including being unable
///   to spawn git at all.
pub fn write_ref_cas(
    root: &Path,
    name: &str,
    old_oid: &GitOid,
    new_oid: &GitOid,
) -> Result<(), RefError> {
    ensure_valid_name(name)?;
    let output = run_git(root, &["update-ref", name, new_oid.as_str(), old_oid.as_str()])?;

    if output.success() {
        return Ok(());
    }

    let stderr_trimmed = output.stderr.trim();

    if stderr_trimmed.contains("cannot lock ref")
        || stderr_trimmed.contains("is at")
        || stderr_trimmed.contains("but expected")
    {
        return Err(RefError::CasMismatch {
            ref_name: name.to_owned(),
        });
    }

    Err(RefError::GitCommand {
        command: format!(
            "git update-ref {name} {} {}",
            new_oid.as_str(),
            old_oid.as_str()
        ),
        stderr: stderr_trimmed.to_owned(),
        exit_code: output.exit_code,
    })
}

/// Delete a git ref. Idempotent: a missing ref is not an error.
///
/// # Errors
/// Returns an error if git cannot be spawned or exits non-zero.
pub fn delete_ref(root: &Path, name: &str) -> Result<(), RefError> {
    ensure_valid_name(name)?;
    let output = run_git(root, &["update-ref", "-d", name])?;

    if output.success() {
        return Ok(());
    }

    Err(RefError::GitCommand {
        command: format!("git update-ref -d {name}"),
        stderr: output.stderr.trim().to_owned(),
        exit_code: output.exit_code,
    })
}

/// Create an annotated tag `name` pointing at `oid`. Fails if it already
/// exists.
///
/// # Errors
/// Returns an error if `name` fails validation, git cannot be spawned, or
/// git exits non-zero (including because the tag already exists).
pub fn create_tag(root: &Path, name: &str, oid: &GitOid, message: &str) -> Result<(), RefError> {
    ensure_valid_name(name)?;
    let output = run_git(root, &["tag", "-a", name, oid.as_str(), "-m", message])?;

    if output.success() {
        return Ok(());
    }

    Err(RefError::GitCommand {
        command: format!("git tag -a {name} {}", oid.as_str()),
        stderr: output.stderr.trim().to_owned(),
        exit_code: output.exit_code,
    })
}

/// Delete a tag. Idempotent: a missing tag is not an error.
///
/// # Errors
/// Returns an error if git cannot be spawned, or exits non-zero for a
/// reason other than the tag not existing.
pub fn delete_tag(root: &Path, name: &str) -> Result<(), RefError> {
    ensure_valid_name(name)?;
    let output = run_git(root, &["tag", "-d", name])?;

    if output.success() {
        return Ok(());
    }

    if output.stderr.contains("not found") {
        return Ok(());
    }

    Err(RefError::GitCommand {
        command: format!("git tag -d {name}"),
        stderr: output.stderr.trim().to_owned(),
        exit_code: output.exit_code,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
