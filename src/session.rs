//! Durable session checkpoint store.
//!
//! A parallel-execution run persists a [`SessionState`] to
//! `.ralph-tui/parallel-session.json` after every group completes, so a
//! crashed or interrupted run can resume from `last_completed_group_index +
//! 1` instead of starting over. Writes use the temp-file + fsync + rename
//! sequence so a crash mid-write never leaves a corrupt checkpoint behind.
//!
//! The update helpers (`update_after_group`, `mark_task_requeued`) are pure:
//! they return a modified copy. Only [`save`] performs I/O.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::model::types::{SessionState, TaskId};

/// Errors from reading or writing the session checkpoint.
#[derive(Debug)]
pub enum SessionError {
    Io(String),
    Serialize(String),
    Deserialize(String),
    NotFound(PathBuf),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "session store I/O error: {msg}"),
            Self::Serialize(msg) => write!(f, "failed to serialize session state: {msg}"),
            Self::Deserialize(msg) => write!(f, "failed to parse session state: {msg}"),
            Self::NotFound(path) => write!(f, "no session checkpoint at {}", path.display()),
        }
    }
}

impl std::error::Error for SessionError {}

/// The default session checkpoint path under a project's `.ralph-tui/`
/// directory.
#[must_use]
pub fn default_path(ralph_dir: &Path) -> PathBuf {
    ralph_dir.join("parallel-session.json")
}

/// Serialize `state` as pretty JSON.
///
/// # Errors
/// Returns [`SessionError::Serialize`] if serialization fails (it should
/// not, for a well-formed `SessionState`).
pub fn to_json(state: &SessionState) -> Result<String, SessionError> {
    serde_json::to_string_pretty(state).map_err(|e| SessionError::Serialize(e.to_string()))
}

/// Parse a session checkpoint from JSON.
///
/// # Errors
/// Returns [`SessionError::Deserialize`] if `json` does not match the
/// [`SessionState`] schema.
pub fn from_json(json: &str) -> Result<SessionState, SessionError> {
    serde_json::from_str(json).map_err(|e| SessionError::Deserialize(e.to_string()))
}

/// Write `state` to `path` atomically: serialize, write to a temp file in
/// the same directory, fsync, then rename over the target.
///
/// # Errors
/// Returns [`SessionError`] on any I/O or serialization failure.
pub fn save(state: &SessionState, path: &Path) -> Result<(), SessionError> {
    let json = to_json(state)?;

    let dir = path
        .parent()
        .ok_or_else(|| SessionError::Io(format!("no parent directory for {}", path.display())))?;
    fs::create_dir_all(dir).map_err(|e| SessionError::Io(format!("create {}: {e}", dir.display())))?;

    let tmp_path = dir.join(".parallel-session.tmp");
    let mut file =
        fs::File::create(&tmp_path).map_err(|e| SessionError::Io(format!("create {}: {e}", tmp_path.display())))?;
    file.write_all(json.as_bytes())
        .map_err(|e| SessionError::Io(format!("write {}: {e}", tmp_path.display())))?;
    file.sync_all()
        .map_err(|e| SessionError::Io(format!("fsync {}: {e}", tmp_path.display())))?;
    drop(file);

    fs::rename(&tmp_path, path)
        .map_err(|e| SessionError::Io(format!("rename {} -> {}: {e}", tmp_path.display(), path.display())))
}

/// Load the session checkpoint at `path`, or `None` if it does not exist.
///
/// # Errors
/// Returns [`SessionError::Deserialize`] if the file exists but is
/// corrupt, or [`SessionError::Io`] for any other read failure.
pub fn load(path: &Path) -> Result<Option<SessionState>, SessionError> {
    match fs::read_to_string(path) {
        Ok(contents) => from_json(&contents).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SessionError::Io(format!("read {}: {e}", path.display()))),
    }
}

/// Whether a checkpoint exists at `path`.
#[must_use]
pub fn exists(path: &Path) -> bool {
    path.is_file()
}

/// Delete the checkpoint at `path`. Idempotent: a missing file is not an
/// error.
///
/// # Errors
/// Returns [`SessionError::Io`] if removal fails for a reason other than
/// the file not existing.
pub fn delete(path: &Path) -> Result<(), SessionError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(_) if !path.exists() => Ok(()),
        Err(e) => Err(SessionError::Io(format!("remove {}: {e}", path.display()))),
    }
}

/// Return a copy of `state` with a group's outcome recorded: the checkpoint
/// index bumped, and merged/failed task ids appended.
#[must_use]
pub fn update_after_group(
    state: &SessionState,
    group_index: usize,
    merged: &[TaskId],
    failed: &[TaskId],
    now: DateTime<Utc>,
) -> SessionState {
    let mut next = state.clone();
    for id in merged {
        next.record_merged(id.clone(), now);
    }
    for id in failed {
        next.record_failed(id.clone(), now);
    }
    next.mark_group_completed(group_index, now);
    next
}

/// Return a copy of `state` with `task_id` recorded as requeued (e.g. after
/// a rolled-back conflict the executor chooses to retry in a later group).
#[must_use]
pub fn mark_task_requeued(state: &SessionState, task_id: TaskId, now: DateTime<Utc>) -> SessionState {
    let mut next = state.clone();
    next.record_requeued(task_id, now);
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::{RefName, TaskGraphSnapshot};
    use std::collections::BTreeMap;

    fn sample_state(now: DateTime<Utc>) -> SessionState {
        SessionState::new(
            "session-1".to_owned(),
            TaskGraphSnapshot {
                nodes: BTreeMap::new(),
                groups: Vec::new(),
                cyclic_task_ids: Vec::new(),
                actionable_task_count: 0,
                max_parallelism: 0,
                recommend_parallel: false,
            },
            RefName::new("ralph/session-start/session-1").unwrap(),
            RefName::new("main").unwrap(),
            RefName::new("ralph-session/session-1").unwrap(),
            now,
        )
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = default_path(dir.path());
        let now = Utc::now();
        let state = sample_state(now);

        save(&state, &path).unwrap();
        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn load_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = default_path(dir.path());
        assert!(load(&path).unwrap().is_none());
    }

    #[test]
    fn load_corrupt_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = default_path(dir.path());
        fs::create_dir_all(dir.path()).unwrap();
        fs::write(&path, "not json").unwrap();
        let err = load(&path).unwrap_err();
        assert!(matches!(err, SessionError::Deserialize(_)));
    }

    #[test]
    fn temp_file_is_cleaned_up_after_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = default_path(dir.path());
        save(&sample_state(Utc::now()), &path).unwrap();
        assert!(!dir.path().join(".parallel-session.tmp").exists());
    }

    #[test]
    fn update_after_group_appends_and_bumps_index() {
        let now = Utc::now();
        let state = sample_state(now);
        let merged = vec![TaskId::new("a").unwrap()];
        let failed = vec![TaskId::new("b").unwrap()];
        let next = update_after_group(&state, 0, &merged, &failed, now);
        assert_eq!(next.last_completed_group_index, 0);
        assert_eq!(next.merged_task_ids, merged);
        assert_eq!(next.failed_task_ids, failed);
        // original is untouched (pure update)
        assert_eq!(state.last_completed_group_index, -1);
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = default_path(dir.path());
        save(&sample_state(Utc::now()), &path).unwrap();
        delete(&path).unwrap();
        assert!(!exists(&path));
        delete(&path).unwrap();
    }
}
