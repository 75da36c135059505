//! The parallel executor: top-level orchestration tying the graph analyzer,
//! worktree pool, workers, merge engine, and conflict resolver together into
//! one session.
//!
//! One call to [`Executor::execute`] drives a whole run: analyze the task
//! graph, resume or start a session, then for each depth-ordered group fan
//! workers out up to `max_workers`, drain their merges one at a time (in
//! submission order, since the merge engine is strictly serialized),
//! resolve any conflicts, persist a checkpoint, and move to the next group.
//! A fatal error — a cyclic graph, a merge the resolver can't save, a
//! checkpoint write that fails — stops the run cleanly rather than leaving
//! half the workers running.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use chrono::Utc;

use crate::config::Config;
use crate::conflict;
use crate::error::RalphError;
use crate::events::{Event, EventKind};
use crate::git;
use crate::graph::{self, TaskGraph};
use crate::merge::MergeEngine;
use crate::model::types::{MergeStatus, RefName, SessionState, Task, TaskGraphSnapshot, TaskId, WorkerResult};
use crate::refs;
use crate::session;
use crate::traits::{AgentRunner, ConflictAi, Tracker};
use crate::worker::{self, WorkerContext};
use crate::worktree::WorktreePool;

/// Everything one run of the parallel executor needs. Borrowed capabilities
/// are the host's — the engine never constructs an `AgentRunner`,
/// `Tracker`, or `ConflictAi` itself.
pub struct Executor<'a> {
    pub repo_root: PathBuf,
    pub tracker: &'a dyn Tracker,
    pub primary: &'a dyn AgentRunner,
    pub fallback: Option<&'a dyn AgentRunner>,
    pub conflict_ai: Option<&'a dyn ConflictAi>,
    pub model: &'a str,
    pub config: Config,
    pub render_prompt: &'a (dyn Fn(&Task, u32) -> String + Send + Sync),
    pub on_event: &'a (dyn Fn(&Event) + Send + Sync),
}

/// What one session accomplished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub session_id: String,
    pub merged_task_ids: Vec<TaskId>,
    pub failed_task_ids: Vec<TaskId>,
}

impl Executor<'_> {
    fn ralph_dir(&self) -> PathBuf {
        self.repo_root.join(".ralph-tui")
    }

    fn emit(&self, session_id: &str, kind: EventKind) {
        (self.on_event)(&Event::new(session_id, kind, Utc::now()));
    }

    /// Run a full parallel-execution session against `filter` (passed
    /// through to `Tracker::get_tasks` unmodified).
    ///
    /// # Errors
    /// Returns [`RalphError::GraphCyclic`] if the task graph contains a
    /// cycle, or propagates the first fatal error encountered persisting
    /// state or driving git. Individual task failures are recorded in the
    /// returned [`ExecutionSummary`], not as an `Err`.
    pub fn execute(&self, filter: &str) -> Result<ExecutionSummary, RalphError> {
        self.config
            .validate()
            .map_err(|e| RalphError::PersistenceFailed { path: self.ralph_dir(), reason: e.to_string() })?;

        let tasks = self.tracker.get_tasks(filter)?;
        let actionable = graph::actionable_tasks(&tasks);
        let graph = graph::analyze(&actionable);
        if !graph.is_acyclic() {
            self.emit("startup", EventKind::ParallelFailed { reason: "task graph is cyclic".to_owned() });
            let task_ids = graph.cyclic_task_ids.iter().map(ToString::to_string).collect();
            return Err(RalphError::GraphCyclic { task_ids });
        }

        let checkpoint_path = session::default_path(&self.ralph_dir());
        let original_branch = git::current_branch(&self.repo_root)?.unwrap_or_else(|| "main".to_owned());
        let original_branch = RefName::new(original_branch)?;

        let (session_id, mut state) = self.load_or_start_session(&checkpoint_path, &graph, &original_branch)?;

        self.emit(&session_id, EventKind::ParallelStarted { task_count: actionable.len() });
        self.emit(&session_id, EventKind::SessionBranchCreated { branch: state.session_branch.as_str().to_owned() });

        let pool = WorktreePool::new(self.repo_root.clone());
        let merge_engine = MergeEngine::new(self.repo_root.clone());
        let git_common_dir = self.repo_root.join(".git");

        let tasks_by_id: BTreeMap<TaskId, Task> = actionable.iter().map(|t| (t.id.clone(), t.clone())).collect();

        let start_group = usize::try_from(state.last_completed_group_index + 1).unwrap_or(0);

        for group in graph.groups.iter().filter(|g| g.index >= start_group) {
            self.emit(&session_id, EventKind::GroupStarted { group_index: group.index, task_ids: group.tasks.clone() });

            let mut merged_this_group = Vec::new();
            let mut failed_this_group = Vec::new();

            for batch in graph::worker_batches(group, &graph.nodes, self.config.max_workers) {
                let results = self.run_batch(&batch, &tasks_by_id, &pool, &git_common_dir, &state.session_branch, &session_id);

                for result in results {
                    let outcome = self.drain_merge(&merge_engine, &result, &tasks_by_id, &state.session_branch, &session_id);
                    match outcome {
                        Ok(true) => merged_this_group.push(result.task_id.clone()),
                        Ok(false) | Err(_) => failed_this_group.push(result.task_id.clone()),
                    }
                }
            }

            state = session::update_after_group(&state, group.index, &merged_this_group, &failed_this_group, Utc::now());
            session::save(&state, &checkpoint_path)
                .map_err(|e| RalphError::PersistenceFailed { path: checkpoint_path.clone(), reason: e.to_string() })?;
            self.emit(&session_id, EventKind::GroupCompleted { group_index: group.index });
        }

        let _ = merge_engine.return_to_branch(&original_branch);
        self.emit(
            &session_id,
            EventKind::ParallelCompleted { merged: state.merged_task_ids.len(), failed: state.failed_task_ids.len() },
        );

        Ok(ExecutionSummary {
            session_id,
            merged_task_ids: state.merged_task_ids,
            failed_task_ids: state.failed_task_ids,
        })
    }

    fn load_or_start_session(
        &self,
        checkpoint_path: &std::path::Path,
        graph: &TaskGraph,
        original_branch: &RefName,
    ) -> Result<(String, SessionState), RalphError> {
        if let Some(existing) =
            session::load(checkpoint_path).map_err(|e| RalphError::PersistenceFailed { path: checkpoint_path.to_path_buf(), reason: e.to_string() })?
        {
            return Ok((existing.session_id.clone(), existing));
        }

        let session_id = format!("{:x}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
        let session_branch = RefName::new(refs::session_branch_name(&session_id))?;
        let start_tag_name = RefName::new(refs::session_start_tag_name(&session_id))?;

        let head = git::rev_parse(&self.repo_root, "HEAD")?;
        refs::create_tag(&self.repo_root, start_tag_name.as_str(), &head, "ralph session start")
            .map_err(|e| RalphError::PersistenceFailed { path: checkpoint_path.to_path_buf(), reason: e.to_string() })?;
        git::checkout(&self.repo_root, session_branch.as_str(), true)?;

        let plan = graph::schedule::plan(graph, self.config.max_workers, self.config.sequentialize_check.as_ref());
        let task_graph = TaskGraphSnapshot {
            nodes: graph.nodes.clone(),
            groups: graph.groups.clone(),
            cyclic_task_ids: graph.cyclic_task_ids.clone(),
            actionable_task_count: plan.actionable_task_count,
            max_parallelism: plan.max_parallelism,
            recommend_parallel: plan.recommend_parallel,
        };

        let state = SessionState::new(
            session_id.clone(),
            task_graph,
            start_tag_name,
            original_branch.clone(),
            session_branch,
            Utc::now(),
        );
        Ok((session_id, state))
    }

    fn run_batch(
        &self,
        batch: &[&TaskId],
        tasks_by_id: &BTreeMap<TaskId, Task>,
        pool: &WorktreePool,
        git_common_dir: &std::path::Path,
        session_branch: &RefName,
        session_id: &str,
    ) -> Vec<WorkerResult> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = batch
                .iter()
                .filter_map(|&task_id| {
                    let task = tasks_by_id.get(task_id)?;
                    let worker_id = format!("worker-{task_id}");
                    let worktree = match pool.acquire(&worker_id, task_id, session_branch) {
                        Ok(wt) => wt,
                        Err(e) => {
                            tracing::error!(task_id = %task_id, error = %e, "failed to acquire worktree");
                            return None;
                        }
                    };
                    self.emit(session_id, EventKind::WorkerCreated { task_id: task_id.clone(), worker_id: worker_id.clone() });

                    Some(scope.spawn(move || {
                        self.emit(session_id, EventKind::WorkerStarted { task_id: task.id.clone(), worker_id: worker_id.clone() });
                        let cancel = AtomicBool::new(false);
                        let ctx = WorkerContext {
                            task,
                            worktree: &worktree,
                            git_common_dir,
                            tracker: self.tracker,
                            primary: self.primary,
                            fallback: self.fallback,
                            model: self.model,
                            config: &self.config,
                            render_prompt: self.render_prompt,
                            cancel: &cancel,
                        };
                        let result = worker::run(&ctx);
                        self.emit(
                            session_id,
                            EventKind::WorkerCompleted { task_id: task.id.clone(), worker_id: worker_id.clone(), success: result.success },
                        );
                        let _ = pool.release(&worktree, !result.success);
                        result
                    }))
                })
                .collect();

            handles.into_iter().filter_map(|h| h.join().ok()).collect()
        })
    }

    /// Enqueue and drive one worker result's merge to completion, invoking
    /// the conflict resolver if necessary. Returns `Ok(true)` if the task
    /// ended up merged, `Ok(false)` if it was cleanly recorded as failed.
    fn drain_merge(
        &self,
        engine: &MergeEngine,
        result: &WorkerResult,
        tasks_by_id: &BTreeMap<TaskId, Task>,
        session_branch: &RefName,
        session_id: &str,
    ) -> Result<bool, RalphError> {
        if !result.success {
            self.emit(session_id, EventKind::WorkerFailed {
                task_id: result.task_id.clone(),
                worker_id: format!("worker-{}", result.task_id),
                reason: result.error.clone().unwrap_or_default(),
            });
            return Ok(false);
        }

        let title = tasks_by_id.get(&result.task_id).map_or_else(String::new, |t| t.title.clone());
        let operation_id = format!("{}-{}", result.task_id, Utc::now().timestamp_millis());

        let op = engine.enqueue(result, &title, session_branch.clone(), operation_id, Utc::now())?;
        self.emit(session_id, EventKind::MergeQueued { operation_id: op.id.clone(), task_id: op.task_id.clone() });
        self.emit(session_id, EventKind::MergeStarted { operation_id: op.id.clone(), task_id: op.task_id.clone() });

        let op = match engine.process(op, Utc::now()) {
            Ok(op) => op,
            Err(e) => {
                self.emit(session_id, EventKind::MergeFailed {
                    operation_id: format!("{}-merge", result.task_id),
                    task_id: result.task_id.clone(),
                    reason: e.to_string(),
                });
                return Ok(false);
            }
        };

        let op = match op.status {
            MergeStatus::Completed => {
                self.emit(session_id, EventKind::MergeCompleted { operation_id: op.id.clone(), task_id: op.task_id.clone() });
                op
            }
            MergeStatus::Conflicted => {
                self.emit(session_id, EventKind::ConflictDetected { operation_id: op.id.clone(), files: op.conflicted_files.clone() });
                if let Some(ai) = self.conflict_ai {
                    let (resolved, _results) = conflict::resolve(engine, op, ai, &title, self.config.conflict_resolver_timeout, Utc::now())?;
                    match resolved.status {
                        MergeStatus::Completed => {
                            self.emit(session_id, EventKind::ConflictResolved { operation_id: resolved.id.clone(), status: resolved.status });
                            self.emit(session_id, EventKind::MergeCompleted { operation_id: resolved.id.clone(), task_id: resolved.task_id.clone() });
                        }
                        MergeStatus::RolledBack => {
                            self.emit(
                                session_id,
                                EventKind::MergeRolledBack { operation_id: resolved.id.clone(), task_id: resolved.task_id.clone(), backup_tag: resolved.backup_tag.as_str().to_owned() },
                            );
                        }
                        _ => {}
                    }
                    resolved
                } else {
                    let mut op = op;
                    engine.rollback(&mut op, Utc::now());
                    self.emit(
                        session_id,
                        EventKind::MergeRolledBack { operation_id: op.id.clone(), task_id: op.task_id.clone(), backup_tag: op.backup_tag.as_str().to_owned() },
                    );
                    op
                }
            }
            MergeStatus::Failed | MergeStatus::RolledBack => {
                self.emit(session_id, EventKind::MergeFailed { operation_id: op.id.clone(), task_id: op.task_id.clone(), reason: "merge failed".to_owned() });
                op
            }
            MergeStatus::Queued | MergeStatus::InProgress => op,
        };

        let _ = engine.cleanup_tag(&op);
        Ok(matches!(op.status, MergeStatus::Completed))
    }
}
