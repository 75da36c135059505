//! One worker's lifecycle: `Created` -> `Initializing` -> `Running` ->
//! `Committing` -> `{done, failed, cancelled}`.
//!
//! A worker owns exactly one task and one leased [`Worktree`]. It loops,
//! rendering a fresh prompt each iteration and running it through the
//! host's [`AgentRunner`], until the agent signals completion with the
//! `<promise>COMPLETE</promise>` marker and the tracker agrees the task is
//! ready to close, until it runs out of iterations, or until an
//! unrecoverable error or cancellation stops it early. On success it commits
//! the worktree under the shared commit lock and asks the tracker to close
//! the task; it never merges — that is the merge engine's job.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rand::Rng as _;

use crate::config::{Config, ErrorStrategy};
use crate::error::RalphError;
use crate::git;
use crate::lock;
use crate::model::types::{Task, TokenUsage, WorkerResult, Worktree};
use crate::traits::{AgentRequest, AgentRunner, Tracker};

/// The marker an agent writes to stdout to signal it considers the task
/// finished. The worker still defers to `Tracker::is_task_ready` before
/// trusting it.
pub const COMPLETION_MARKER: &str = "<promise>COMPLETE</promise>";

/// Everything one call to [`run`] needs, borrowed for the duration of the
/// task. None of it outlives the call.
pub struct WorkerContext<'a> {
    pub task: &'a Task,
    pub worktree: &'a Worktree,
    /// The repository's shared `.git` directory (not the worktree's private
    /// `.git` file), used for the commit lock.
    pub git_common_dir: &'a Path,
    pub tracker: &'a dyn Tracker,
    pub primary: &'a dyn AgentRunner,
    pub fallback: Option<&'a dyn AgentRunner>,
    pub model: &'a str,
    pub config: &'a Config,
    /// Renders the prompt for one iteration from the task and the iteration
    /// number; the host owns prompt templating entirely.
    pub render_prompt: &'a dyn Fn(&Task, u32) -> String,
    /// Checked at the top of every iteration and before blocking sleeps;
    /// set from outside to cancel a running worker.
    pub cancel: &'a AtomicBool,
}

/// What to do after one iteration comes back as an error.
enum ErrorAction {
    Retry(Duration),
    SkipIteration,
    Abort(String),
}

fn apply_error_strategy(config: &Config, retry_count: &mut u32, reason: String) -> ErrorAction {
    match config.error_strategy {
        ErrorStrategy::Skip => ErrorAction::SkipIteration,
        ErrorStrategy::Abort => ErrorAction::Abort(reason),
        ErrorStrategy::RetryUpToNWithDelay { max_retries, delay } => {
            if *retry_count < max_retries {
                *retry_count += 1;
                ErrorAction::Retry(delay)
            } else {
                ErrorAction::Abort(reason)
            }
        }
    }
}

/// Exponential backoff with jitter for rate-limit retries:
/// `base * factor^attempt`, jittered by `+/- jitter` fraction.
fn backoff_delay(config: &Config, attempt: u32) -> Duration {
    let scaled = config.backoff_base.as_secs_f64() * config.backoff_factor.powi(i32::try_from(attempt).unwrap_or(i32::MAX));
    let jitter_span = scaled * config.backoff_jitter;
    let offset = rand::rng().random_range(-jitter_span..=jitter_span);
    Duration::from_secs_f64((scaled + offset).max(0.0))
}

fn commit_message(task_id: &str, task_title: &str, iteration: u32) -> String {
    format!("feat(ralph): {task_id} - {task_title}\n\nIteration: {iteration}\nAgent: ralph-core")
}

fn commit_worktree(ctx: &WorkerContext<'_>, iteration: u32) -> Result<(), RalphError> {
    let _guard = lock::acquire(ctx.git_common_dir, ctx.config.lock_retry_interval, ctx.config.lock_max_retries)?;
    git::add_all(&ctx.worktree.path)?;
    let message = commit_message(ctx.task.id.as_str(), &ctx.task.title, iteration);
    git::commit(&ctx.worktree.path, &message)
}

/// Run a worker's full iteration loop for one task and return its outcome.
/// Never returns an `Err` — every failure mode, including cancellation, is
/// reported through [`WorkerResult::success`] and [`WorkerResult::error`] so
/// the executor can continue processing the rest of a group.
#[must_use]
pub fn run(ctx: &WorkerContext<'_>) -> WorkerResult {
    let start = Instant::now();
    let empty_env: HashMap<String, String> = HashMap::new();

    let mut iterations_run = 0_u32;
    let mut commit_count = 0_u32;
    let mut token_usage = TokenUsage::default();
    let mut using_fallback = false;
    let mut retry_count = 0_u32;
    let mut rate_limit_attempt = 0_u32;
    let mut success = false;
    let mut task_completed = false;
    let mut error: Option<String> = None;

    // Set when a worker switches to its fallback runner after a rate limit,
    // alongside the backoff delay the primary needs to cool down. Cleared
    // when the worker switches back.
    let mut limited_at: Option<(Instant, Duration)> = None;

    tracing::info!(task_id = %ctx.task.id, worktree = %ctx.worktree.path.display(), "worker starting");

    for iteration in 1..=ctx.config.max_iterations_per_task {
        if ctx.cancel.load(Ordering::Relaxed) {
            error = Some("cancelled".to_owned());
            break;
        }
        iterations_run = iteration;

        if using_fallback
            && ctx.config.recover_primary_between_iterations
            && let Some((since, cooldown)) = limited_at
            && since.elapsed() >= cooldown
        {
            tracing::info!(task_id = %ctx.task.id, iteration, "primary cooldown elapsed, switching back from fallback");
            using_fallback = false;
            limited_at = None;
            rate_limit_attempt = 0;
        }

        let prompt = (ctx.render_prompt)(ctx.task, iteration);
        let runner: &dyn AgentRunner = if using_fallback {
            ctx.fallback.unwrap_or(ctx.primary)
        } else {
            ctx.primary
        };

        let request = AgentRequest {
            prompt: &prompt,
            cwd: &ctx.worktree.path,
            model: ctx.model,
            timeout: ctx.config.agent_timeout,
            env: &empty_env,
        };

        let response = match runner.run(&request) {
            Ok(response) => response,
            Err(e) => {
                if e.is_retryable() {
                    tracing::warn!(task_id = %ctx.task.id, iteration, error = %e, "retryable agent error");
                    std::thread::sleep(backoff_delay(ctx.config, rate_limit_attempt));
                    rate_limit_attempt += 1;
                    continue;
                }
                match apply_error_strategy(ctx.config, &mut retry_count, e.to_string()) {
                    ErrorAction::Retry(delay) => {
                        std::thread::sleep(delay);
                        continue;
                    }
                    ErrorAction::SkipIteration => continue,
                    ErrorAction::Abort(reason) => {
                        error = Some(reason);
                        break;
                    }
                }
            }
        };

        token_usage = token_usage.add(response.token_usage);

        if response.rate_limited {
            tracing::warn!(task_id = %ctx.task.id, iteration, "agent reported a rate limit");
            let cooldown = backoff_delay(ctx.config, rate_limit_attempt);
            rate_limit_attempt += 1;
            if !using_fallback && ctx.fallback.is_some() {
                using_fallback = true;
                limited_at = Some((Instant::now(), cooldown));
                continue;
            }
            std::thread::sleep(cooldown);
            continue;
        }
        rate_limit_attempt = 0;

        if response.exit_code != 0 {
            let reason = format!("agent exited with code {}", response.exit_code);
            match apply_error_strategy(ctx.config, &mut retry_count, reason.clone()) {
                ErrorAction::Retry(delay) => {
                    std::thread::sleep(delay);
                    continue;
                }
                ErrorAction::SkipIteration => continue,
                ErrorAction::Abort(_) => {
                    error = Some(reason);
                    break;
                }
            }
        }
        retry_count = 0;
        commit_count += 1;

        if response.stdout.contains(COMPLETION_MARKER) && ctx.tracker.is_task_ready(ctx.task.id.as_str()) {
            task_completed = true;
            success = true;
            break;
        }
    }

    if success {
        if let Err(e) = commit_worktree(ctx, iterations_run) {
            tracing::error!(task_id = %ctx.task.id, error = %e, "failed to commit worktree");
            success = false;
            error = Some(e.to_string());
        } else if let Err(e) = ctx.tracker.complete_task(ctx.task.id.as_str()) {
            tracing::warn!(task_id = %ctx.task.id, error = %e, "tracker failed to record task completion");
        }
    }

    WorkerResult {
        task_id: ctx.task.id.clone(),
        success,
        task_completed,
        worktree_path: ctx.worktree.path.clone(),
        branch: ctx.worktree.branch.clone(),
        iterations_run,
        duration_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
        commit_count,
        token_usage,
        error,
    }
}
