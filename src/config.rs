//! Engine configuration.
//!
//! The host application builds a [`Config`] programmatically — parsing a
//! config file or CLI flags into it is the host's job, not this crate's.
//! [`Config::validate`] is the only gate: it rejects combinations that would
//! make the engine behave unpredictably (zero workers, a lock timeout
//! shorter than one retry interval, and so on).

use std::fmt;
use std::time::Duration;

/// Tunables for the parallel execution engine.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Maximum number of workers running concurrently within one group.
    pub max_workers: usize,
    /// Maximum iterations a single worker will run against one task before
    /// giving up.
    pub max_iterations_per_task: u32,
    /// What a worker does when an iteration errors out.
    pub error_strategy: ErrorStrategy,
    /// Base delay before a worker's first retry after a rate-limit signal.
    pub backoff_base: Duration,
    /// Multiplier applied to the backoff delay after each retry.
    pub backoff_factor: f64,
    /// Fractional jitter applied to each backoff delay, e.g. `0.25` for ±25%.
    pub backoff_jitter: f64,
    /// Wall-clock timeout for a single agent invocation.
    pub agent_timeout: Duration,
    /// Wall-clock timeout budget for one conflict-resolution call.
    pub conflict_resolver_timeout: Duration,
    /// How long to wait between commit-lock acquisition attempts.
    pub lock_retry_interval: Duration,
    /// Maximum number of commit-lock acquisition attempts before giving up.
    pub lock_max_retries: u32,
    /// Maximum bytes of combined stdout/stderr retained per worker.
    pub stream_buffer_limit: usize,
    /// Optional override for deciding whether a group of tasks should be
    /// forced to run sequentially despite having no declared dependency
    /// (e.g. because they are known to touch overlapping files). Defaults
    /// to a heuristic that never forces sequentialization.
    pub sequentialize_check: Option<SequentializeCheck>,
    /// When a worker has switched to its fallback runner after a rate limit,
    /// switch back to the primary at the start of the next iteration once
    /// the primary's cooldown has elapsed. If `false`, a worker that has
    /// fallen back stays on the fallback for the rest of the task.
    pub recover_primary_between_iterations: bool,
}

/// A pluggable heuristic: given the tasks in a candidate parallel group,
/// returns `true` if they should instead run one at a time.
#[derive(Clone)]
pub struct SequentializeCheck(
    pub std::sync::Arc<dyn Fn(&[crate::model::types::Task]) -> bool + Send + Sync>,
);

impl fmt::Debug for SequentializeCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SequentializeCheck(<fn>)")
    }
}

impl PartialEq for SequentializeCheck {
    fn eq(&self, other: &Self) -> bool {
        std::sync::Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_iterations_per_task: 25,
            error_strategy: ErrorStrategy::default(),
            backoff_base: Duration::from_secs(5),
            backoff_factor: 2.0,
            backoff_jitter: 0.25,
            agent_timeout: Duration::from_secs(600),
            conflict_resolver_timeout: Duration::from_secs(120),
            lock_retry_interval: Duration::from_millis(500),
            lock_max_retries: 60,
            stream_buffer_limit: 1 << 20,
            sequentialize_check: None,
            recover_primary_between_iterations: true,
        }
    }
}

impl Config {
    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns [`ConfigError`] describing the first invalid field found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError("max_workers must be at least 1".to_owned()));
        }
        if self.max_iterations_per_task == 0 {
            return Err(ConfigError(
                "max_iterations_per_task must be at least 1".to_owned(),
            ));
        }
        if self.backoff_factor < 1.0 {
            return Err(ConfigError("backoff_factor must be >= 1.0".to_owned()));
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(ConfigError("backoff_jitter must be in [0.0, 1.0]".to_owned()));
        }
        if self.lock_max_retries == 0 {
            return Err(ConfigError("lock_max_retries must be at least 1".to_owned()));
        }
        if let ErrorStrategy::RetryUpToNWithDelay { max_retries, .. } = self.error_strategy
            && max_retries == 0
        {
            return Err(ConfigError(
                "RetryUpToNWithDelay requires max_retries >= 1".to_owned(),
            ));
        }
        Ok(())
    }

    /// Total wall-clock ceiling the commit lock will wait before giving up.
    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        self.lock_retry_interval * self.lock_max_retries
    }
}

/// What a worker does when one iteration of its agent loop errors out.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum ErrorStrategy {
    /// Abandon the current iteration and move to the next one.
    Skip,
    /// Retry the same iteration up to `max_retries` times, waiting
    /// `delay` between attempts.
    RetryUpToNWithDelay { max_retries: u32, delay: Duration },
    /// Stop the worker and report failure immediately.
    #[default]
    Abort,
}

/// An invalid [`Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}
