//! Runs an external command with bounded output capture and a timeout.
//!
//! Every agent invocation and every git plumbing call in this crate goes
//! through here (or through `refs`'s narrower git-specific wrapper) rather
//! than `std::process::Command` directly, so that timeouts and bounded
//! capture are applied uniformly. Arguments are always passed as argv —
//! nothing here ever builds a shell command line.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::error::RalphError;
use crate::stream::BoundedBuffer;

/// A grace period between `SIGTERM` and `SIGKILL` when a timed-out process
/// doesn't exit on its own.
const TERM_GRACE: Duration = Duration::from_millis(500);

/// How often the wait loop polls the child for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One command to run.
pub struct ProcessRequest<'a> {
    pub program: &'a str,
    pub args: &'a [String],
    pub cwd: &'a Path,
    pub env: &'a HashMap<String, String>,
    pub stdin: Option<&'a [u8]>,
    pub timeout: Duration,
    pub buffer_limit: usize,
}

/// The result of running a command to completion or to a timeout.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    /// The signal that terminated the process, if any (Unix only).
    pub signal: Option<i32>,
    pub stdout: String,
    pub stdout_truncated: bool,
    pub stderr: String,
    pub stderr_truncated: bool,
}

impl ProcessOutput {
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.exit_code, Some(0)) && self.signal.is_none()
    }
}

/// Spawn `request.program` with `request.args`, capture bounded
/// stdout/stderr, and enforce `request.timeout` by escalating `SIGTERM` then
/// `SIGKILL`.
///
/// # Errors
/// Returns [`RalphError::AgentSpawnFailed`] if the process cannot be
/// spawned at all (missing binary, permission denied).
pub fn run(request: &ProcessRequest<'_>) -> Result<ProcessOutput, RalphError> {
    let mut command = Command::new(request.program);
    command
        .args(request.args)
        .current_dir(request.cwd)
        .envs(request.env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if request.stdin.is_some() { Stdio::piped() } else { Stdio::null() });

    let mut child = command.spawn().map_err(|e| RalphError::AgentSpawnFailed {
        task_id: String::new(),
        reason: format!("{}: {e}", request.program),
    })?;

    if let Some(input) = request.stdin {
        if let Some(mut stdin) = child.stdin.take() {
            use std::io::Write as _;
            let _ = stdin.write_all(input);
        }
    }

    let stdout_buf = BoundedBuffer::new(request.buffer_limit);
    let stderr_buf = BoundedBuffer::new(request.buffer_limit);

    let stdout_handle = child.stdout.take().map(|pipe| spawn_reader(pipe, stdout_buf.clone()));
    let stderr_handle = child.stderr.take().map(|pipe| spawn_reader(pipe, stderr_buf.clone()));

    let start = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait().map_err(|e| RalphError::AgentSpawnFailed {
            task_id: String::new(),
            reason: e.to_string(),
        })? {
            break Some(status);
        }
        if start.elapsed() >= request.timeout {
            terminate_with_escalation(&mut child);
            break child.wait().ok();
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    if let Some(handle) = stdout_handle {
        let _ = handle.join();
    }
    if let Some(handle) = stderr_handle {
        let _ = handle.join();
    }

    let (exit_code, signal) = status.map_or((None, None), |s| (s.code(), unix_signal(&s)));

    Ok(ProcessOutput {
        exit_code,
        signal,
        stdout: stdout_buf.to_string_lossy(),
        stdout_truncated: stdout_buf.is_truncated(),
        stderr: stderr_buf.to_string_lossy(),
        stderr_truncated: stderr_buf.is_truncated(),
    })
}

fn spawn_reader<R>(mut pipe: R, buf: BoundedBuffer) -> std::thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    std::thread::spawn(move || {
        let mut chunk = [0_u8; 8192];
        loop {
            match pipe.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => buf.write(&chunk[..n]),
            }
        }
    })
}

#[cfg(unix)]
fn unix_signal(status: &std::process::ExitStatus) -> Option<i32> {
    std::os::unix::process::ExitStatusExt::signal(status)
}

#[cfg(not(unix))]
fn unix_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
fn terminate_with_escalation(child: &mut std::process::Child) {
    let pid = nix::unistd::Pid::from_raw(i32::try_from(child.id()).unwrap_or(i32::MAX));
    let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM);
    std::thread::sleep(TERM_GRACE);
    if child.try_wait().ok().flatten().is_none() {
        let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn terminate_with_escalation(child: &mut std::process::Child) {
    let _ = child.kill();
}
