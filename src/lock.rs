//! Commit lock: serializes writes to the repository's main checkout.
//!
//! Workers commit inside their own worktrees, which is lock-free, but any
//! operation that touches the shared `.git` directory's checked-out state
//! (the merge engine's `git merge`/`git reset --hard` sequence) must not run
//! concurrently with another such operation. [`CommitLock`] is a simple
//! mutex implemented with `mkdir`, which is atomic on every filesystem git
//! itself supports.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::error::RalphError;

/// A held commit lock. Released automatically when dropped.
#[derive(Debug)]
pub struct CommitLockGuard {
    path: PathBuf,
}

impl Drop for CommitLockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release commit lock");
        }
    }
}

/// Acquire the commit lock at `<git_dir>/commit.lock`, retrying with a fixed
/// interval up to `max_retries` times.
///
/// # Errors
/// Returns [`RalphError::LockAcquireTimeout`] if the lock directory still
/// exists after the retry budget is exhausted, or an I/O error wrapped as
/// [`RalphError::PersistenceFailed`] if directory creation fails for a
/// reason other than already existing.
pub fn acquire(git_dir: &Path, retry_interval: Duration, max_retries: u32) -> Result<CommitLockGuard, RalphError> {
    let path = git_dir.join("commit.lock");
    for attempt in 0..=max_retries {
        match fs::create_dir(&path) {
            Ok(()) => return Ok(CommitLockGuard { path }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if attempt == max_retries {
                    break;
                }
                thread::sleep(retry_interval);
            }
            Err(e) => {
                return Err(RalphError::PersistenceFailed {
                    path: path.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }
    Err(RalphError::LockAcquireTimeout {
        path,
        waited_ms: u64::from(max_retries) * u64::try_from(retry_interval.as_millis()).unwrap_or(u64::MAX),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _guard = acquire(dir.path(), Duration::from_millis(1), 3).unwrap();
            assert!(dir.path().join("commit.lock").exists());
        }
        assert!(!dir.path().join("commit.lock").exists());
    }

    #[test]
    fn second_acquire_waits_then_times_out_if_held() {
        let dir = tempfile::tempdir().unwrap();
        let _guard = acquire(dir.path(), Duration::from_millis(1), 1).unwrap();
        let err = acquire(dir.path(), Duration::from_millis(1), 2).unwrap_err();
        assert!(matches!(err, RalphError::LockAcquireTimeout { .. }));
    }

    #[test]
    fn lock_is_released_for_next_acquirer() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _guard = acquire(dir.path(), Duration::from_millis(1), 1).unwrap();
        }
        let _guard2 = acquire(dir.path(), Duration::from_millis(1), 1).unwrap();
    }
}
