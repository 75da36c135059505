//! Tracing conventions for the parallel execution engine.
//!
//! This is a library, so it never installs a global subscriber itself —
//! that decision belongs to the host binary. Every module instruments its
//! operations with `tracing` spans and structured fields (`task_id`,
//! `worker_id`, `operation_id`) using the `ralph_core::<module>` target
//! convention, and the host is expected to wire up `tracing_subscriber`
//! the way it wires up anything else: an `EnvFilter` driven by `RUST_LOG`,
//! and either the plain or JSON formatter depending on whether output goes
//! to a terminal or a log aggregator.
//!
//! [`capturing_subscriber`] builds a subscriber over an in-memory buffer,
//! for tests that want to assert on emitted log lines without touching
//! global state.

use std::sync::{Arc, Mutex};

use tracing_subscriber::EnvFilter;

/// A minimal subscriber configuration matching what a host application
/// would typically install for interactive use: `RUST_LOG`-driven
/// filtering, compact human-readable output.
#[must_use]
pub fn subscriber() -> impl tracing::Subscriber + Send + Sync {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).finish()
}

/// The same, but formatted as JSON lines — suited to a log aggregator
/// rather than a terminal.
#[must_use]
pub fn json_subscriber() -> impl tracing::Subscriber + Send + Sync {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).json().finish()
}

/// An in-memory sink for tests that want to assert on log output.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)).into_owned()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Build a subscriber that writes JSON lines into `sink`, for tests that
/// want to assert particular fields were logged.
#[must_use]
pub fn capturing_subscriber(sink: CapturedLogs) -> impl tracing::Subscriber + Send + Sync {
    tracing_subscriber::fmt()
        .json()
        .with_writer(move || sink.clone())
        .with_env_filter(EnvFilter::new("trace"))
        .finish()
}
