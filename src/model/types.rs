//! Core data model for the parallel execution engine.
//!
//! These types are the vocabulary the rest of the crate speaks: tasks as
//! supplied by the host's tracker, the derived task graph, worktrees,
//! worker results, merge operations, conflicts, and the persisted session
//! state. Validated string newtypes (`GitOid`, `TaskId`, `RefName`) reject
//! malformed values at the boundary so the rest of the code can assume
//! well-formed data.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// GitOid
// ---------------------------------------------------------------------------

/// A validated 40-character lowercase hex git object id.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GitOid(String);

impl GitOid {
    /// Validate and construct a `GitOid` from a hex string.
    ///
    /// # Errors
    /// Returns [`TypeError::InvalidOid`] if `value` is not exactly 40
    /// lowercase hex characters.
    pub fn new(value: &str) -> Result<Self, TypeError> {
        if value.len() != 40 || !value.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            return Err(TypeError::InvalidOid(value.to_owned()));
        }
        Ok(Self(value.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The first 8 characters, the conventional short form.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Display for GitOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for GitOid {
    type Err = TypeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for GitOid {
    type Error = TypeError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<GitOid> for String {
    fn from(value: GitOid) -> Self {
        value.0
    }
}

// ---------------------------------------------------------------------------
// TaskId
// ---------------------------------------------------------------------------

/// A validated task identifier: lowercase alphanumeric, `-` and `_`, 1-128
/// chars. Task ids come from the host's tracker and are embedded directly
/// into git branch names, so they must already be ref-name-safe.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(String);

impl TaskId {
    /// # Errors
    /// Returns [`TypeError::InvalidTaskId`] if `value` is empty, longer than
    /// 128 bytes, or contains characters outside `[a-z0-9_-]`.
    pub fn new(value: impl Into<String>) -> Result<Self, TypeError> {
        let value = value.into();
        let valid = !value.is_empty()
            && value.len() <= 128
            && value
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_');
        if !valid {
            return Err(TypeError::InvalidTaskId(value));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TaskId {
    type Err = TypeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TaskId {
    type Error = TypeError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TaskId> for String {
    fn from(value: TaskId) -> Self {
        value.0
    }
}

// ---------------------------------------------------------------------------
// RefName
// ---------------------------------------------------------------------------

/// A validated git ref name (branch or tag short name), checked against the
/// subset of `git-check-ref-format` rules relevant to machine-generated
/// names: non-empty, no spaces or control characters, no `..`, no `//`, no
/// `@{`, no `~^:?*[\`, no leading or trailing `.`, no trailing `.lock`, and
/// no path component starting with `.`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RefName(String);

impl RefName {
    /// # Errors
    /// Returns [`TypeError::InvalidRefName`] if `value` violates any of the
    /// ref-name-format rules documented on the type.
    pub fn new(value: impl Into<String>) -> Result<Self, TypeError> {
        let value = value.into();
        if validate_ref_name(&value) {
            Ok(Self(value))
        } else {
            Err(TypeError::InvalidRefName(value))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Check a short ref name (no `refs/...` prefix) against the subset of
/// `git-check-ref-format` rules needed for machine-generated names.
#[must_use]
pub fn validate_ref_name(name: &str) -> bool {
    if name.is_empty() || name.starts_with('/') || name.ends_with('/') {
        return false;
    }
    if name.contains("..") || name.contains("//") || name.contains("@{") {
        return false;
    }
    if name.bytes().any(|b| b.is_ascii_control() || b == b' ') {
        return false;
    }
    if name
        .bytes()
        .any(|b| matches!(b, b'~' | b'^' | b':' | b'?' | b'*' | b'[' | b'\\'))
    {
        return false;
    }
    if name.ends_with(".lock") {
        return false;
    }
    for segment in name.split('/') {
        if segment.is_empty() || segment.starts_with('.') || segment.ends_with('.') {
            return false;
        }
    }
    true
}

impl fmt::Display for RefName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RefName {
    type Err = TypeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RefName {
    type Error = TypeError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RefName> for String {
    fn from(value: RefName) -> Self {
        value.0
    }
}

// ---------------------------------------------------------------------------
// Task / TaskStatus / TaskNode / ParallelGroup
// ---------------------------------------------------------------------------

/// The host-tracker's view of a task's lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Completed,
    Cancelled,
}

impl TaskStatus {
    /// True for statuses the scheduler may still pick up: not yet finished
    /// and not withdrawn by the tracker.
    #[must_use]
    pub const fn is_actionable(self) -> bool {
        matches!(self, Self::Open | Self::InProgress)
    }
}

/// A single unit of work as reported by the host's `Tracker`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    /// Higher runs first within a group. Ties break by ascending `id`.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub epic: Option<String>,
}

/// A task annotated with graph-derived facts computed by the scheduler.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskNode {
    pub task: Task,
    pub dependencies: Vec<TaskId>,
    pub dependents: Vec<TaskId>,
    /// Longest dependency chain ending at this task; roots are depth 0.
    pub depth: usize,
    /// True if this task participates in a dependency cycle.
    pub in_cycle: bool,
}

/// A set of tasks at the same graph depth, eligible to run concurrently.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelGroup {
    pub index: usize,
    pub tasks: Vec<TaskId>,
    pub depth: usize,
    pub max_priority: i32,
}

// ---------------------------------------------------------------------------
// Worktree
// ---------------------------------------------------------------------------

/// A leased git worktree assigned to one worker for the duration of one task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worktree {
    pub id: String,
    pub path: std::path::PathBuf,
    pub branch: RefName,
    pub task_id: TaskId,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

// ---------------------------------------------------------------------------
// TokenUsage
// ---------------------------------------------------------------------------

/// Accumulated token counts for a single agent invocation or worker run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    /// Cost in integer milli-cents, if a pricing table was configured.
    #[serde(default)]
    pub cost_milli_cents: Option<u64>,
}

impl TokenUsage {
    #[must_use]
    pub fn add(self, other: Self) -> Self {
        Self {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
            total_tokens: self.total_tokens + other.total_tokens,
            cost_milli_cents: match (self.cost_milli_cents, other.cost_milli_cents) {
                (Some(a), Some(b)) => Some(a + b),
                (Some(a), None) | (None, Some(a)) => Some(a),
                (None, None) => None,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// WorkerResult
// ---------------------------------------------------------------------------

/// The outcome of one worker's attempt at one task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub task_id: TaskId,
    pub success: bool,
    pub task_completed: bool,
    pub worktree_path: std::path::PathBuf,
    pub branch: RefName,
    pub iterations_run: u32,
    pub duration_ms: u64,
    pub commit_count: u32,
    pub token_usage: TokenUsage,
    #[serde(default)]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// MergeOperation
// ---------------------------------------------------------------------------

/// Lifecycle state of a queued merge. Transitions are enforced by
/// [`MergeStatus::can_transition_to`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Queued,
    InProgress,
    Completed,
    Conflicted,
    Failed,
    RolledBack,
}

impl MergeStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::RolledBack
        )
    }

    #[must_use]
    pub const fn valid_transitions(self) -> &'static [Self] {
        match self {
            Self::Queued => &[Self::InProgress],
            Self::InProgress => &[Self::Completed, Self::Conflicted, Self::Failed],
            Self::Conflicted => &[Self::Completed, Self::RolledBack, Self::Failed],
            Self::Completed | Self::Failed | Self::RolledBack => &[],
        }
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Conflicted => "conflicted",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

/// One unit of work for the merge engine: integrate a worker's branch into
/// the session branch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOperation {
    pub id: String,
    pub task_id: TaskId,
    pub source_branch: RefName,
    pub target_branch: RefName,
    pub commit_message: String,
    pub backup_tag: RefName,
    pub status: MergeStatus,
    #[serde(default)]
    pub conflicted_files: Vec<String>,
    pub queued_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

/// One file left in conflicted state by `git merge --no-commit`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConflict {
    pub file_path: String,
    pub base: Option<String>,
    pub ours: Option<String>,
    pub theirs: Option<String>,
    pub markers_blob: String,
}

/// The outcome of attempting to resolve one file's conflict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictResolutionResult {
    pub file_path: String,
    pub success: bool,
    pub method: ResolutionMethod,
    #[serde(default)]
    pub resolved_content: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// How a conflict was resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    Ai,
    Manual,
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// The persisted snapshot of a session's task graph analysis, embedded in
/// [`SessionState`]. Mirrors `graph::TaskGraph` plus the scheduling metadata
/// `graph::schedule::plan` derives from it, so a resumed session can report
/// the same `actionable_task_count`/`max_parallelism`/`recommend_parallel`
/// figures it started with without re-querying the tracker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGraphSnapshot {
    #[serde(with = "pair_vec")]
    pub nodes: BTreeMap<TaskId, TaskNode>,
    pub groups: Vec<ParallelGroup>,
    pub cyclic_task_ids: Vec<TaskId>,
    pub actionable_task_count: usize,
    pub max_parallelism: usize,
    pub recommend_parallel: bool,
}

/// The durable checkpoint for one parallel-execution session.
///
/// Persisted as JSON with map fields encoded as arrays of `[key, value]`
/// pairs (not JSON objects) so task ids containing characters unfriendly to
/// object keys round-trip without ambiguity, and so field order is stable
/// across writes for easier diffing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub task_graph: TaskGraphSnapshot,
    pub last_completed_group_index: i64,
    pub merged_task_ids: Vec<TaskId>,
    pub failed_task_ids: Vec<TaskId>,
    pub requeued_task_ids: Vec<TaskId>,
    pub session_start_tag: RefName,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub last_updated_at: chrono::DateTime<chrono::Utc>,
    pub original_branch: RefName,
    pub session_branch: RefName,
}

impl SessionState {
    #[must_use]
    pub fn new(
        session_id: String,
        task_graph: TaskGraphSnapshot,
        session_start_tag: RefName,
        original_branch: RefName,
        session_branch: RefName,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Self {
            session_id,
            task_graph,
            last_completed_group_index: -1,
            merged_task_ids: Vec::new(),
            failed_task_ids: Vec::new(),
            requeued_task_ids: Vec::new(),
            session_start_tag,
            started_at: now,
            last_updated_at: now,
            original_branch,
            session_branch,
        }
    }

    /// Record a group's completion, bumping the checkpoint forward.
    ///
    /// `last_completed_group_index` only ever moves forward: calling this
    /// with a non-increasing `group_index` is a no-op for that field.
    pub fn mark_group_completed(&mut self, group_index: usize, now: chrono::DateTime<chrono::Utc>) {
        let idx = i64::try_from(group_index).unwrap_or(i64::MAX);
        if idx > self.last_completed_group_index {
            self.last_completed_group_index = idx;
        }
        self.last_updated_at = now;
    }

    pub fn record_merged(&mut self, task_id: TaskId, now: chrono::DateTime<chrono::Utc>) {
        if !self.merged_task_ids.contains(&task_id) {
            self.merged_task_ids.push(task_id);
        }
        self.last_updated_at = now;
    }

    pub fn record_failed(&mut self, task_id: TaskId, now: chrono::DateTime<chrono::Utc>) {
        if !self.failed_task_ids.contains(&task_id) {
            self.failed_task_ids.push(task_id);
        }
        self.last_updated_at = now;
    }

    pub fn record_requeued(&mut self, task_id: TaskId, now: chrono::DateTime<chrono::Utc>) {
        if !self.requeued_task_ids.contains(&task_id) {
            self.requeued_task_ids.push(task_id);
        }
        self.last_updated_at = now;
    }
}

mod pair_vec {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S, K, V>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        K: Serialize + Ord,
        V: Serialize,
    {
        let pairs: Vec<(&K, &V)> = map.iter().collect();
        pairs.serialize(serializer)
    }

    pub fn deserialize<'de, D, K, V>(deserializer: D) -> Result<BTreeMap<K, V>, D::Error>
    where
        D: Deserializer<'de>,
        K: Deserialize<'de> + Ord,
        V: Deserialize<'de>,
    {
        let pairs: Vec<(K, V)> = Vec::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// TypeError
// ---------------------------------------------------------------------------

/// Validation errors for the newtypes in this module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeError {
    InvalidOid(String),
    InvalidTaskId(String),
    InvalidRefName(String),
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidOid(v) => write!(f, "invalid git object id: {v:?} (expected 40 lowercase hex chars)"),
            Self::InvalidTaskId(v) => write!(f, "invalid task id: {v:?} (expected 1-128 chars of [a-z0-9_-])"),
            Self::InvalidRefName(v) => write!(f, "invalid ref name: {v:?}"),
        }
    }
}

impl std::error::Error for TypeError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
