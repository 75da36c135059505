//! Shared fixtures for the end-to-end scenario tests: a disposable git
//! repository, a fake `Tracker`, and scripted `AgentRunner`s.

use std::collections::HashMap;
use std::fs;
use std::process::Command;
use std::sync::Mutex;

use ralph_core::error::RalphError;
use ralph_core::model::types::{Task, TaskId, TaskStatus, TokenUsage};
use ralph_core::traits::{AgentRequest, AgentResponse, CompleteTaskOutcome, Tracker};

pub fn setup_repo() -> tempfile::TempDir {
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
    fs::write(root.join("README.md"), "# repo\n").unwrap();
    Command::new("git").args(["add", "-A"]).current_dir(root).output().unwrap();
    Command::new("git").args(["commit", "-m", "init"]).current_dir(root).output().unwrap();
    dir
}

pub fn task(id: &str, deps: &[&str]) -> Task {
    Task {
        id: TaskId::new(id).unwrap(),
        title: format!("Task {id}"),
        description: String::new(),
        status: TaskStatus::Open,
        priority: 0,
        depends_on: deps.iter().map(|d| TaskId::new(*d).unwrap()).collect(),
        labels: Vec::new(),
        task_type: None,
        epic: None,
    }
}

pub struct FakeTracker {
    pub tasks: Vec<Task>,
    pub completed: Mutex<Vec<String>>,
}

impl FakeTracker {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks, completed: Mutex::new(Vec::new()) }
    }
}

impl Tracker for FakeTracker {
    fn get_tasks(&self, _filter: &str) -> Result<Vec<Task>, RalphError> {
        Ok(self.tasks.clone())
    }
    fn complete_task(&self, id: &str) -> Result<CompleteTaskOutcome, RalphError> {
        self.completed.lock().unwrap().push(id.to_owned());
        Ok(CompleteTaskOutcome::Completed)
    }
    fn is_task_ready(&self, _id: &str) -> bool {
        true
    }
}

fn done_response() -> AgentResponse {
    AgentResponse {
        exit_code: 0,
        stdout: "all done. <promise>COMPLETE</promise>".to_owned(),
        stderr: String::new(),
        token_usage: TokenUsage::default(),
        rate_limited: false,
    }
}

/// Completes immediately, writing `content` to `file_name` in the worker's
/// worktree so independent tasks can be distinguished by what they changed.
pub struct WritesFile {
    pub file_name: &'static str,
    pub content: &'static str,
}

impl ralph_core::traits::AgentRunner for WritesFile {
    fn run(&self, request: &AgentRequest<'_>) -> Result<AgentResponse, RalphError> {
        fs::write(request.cwd.join(self.file_name), self.content).unwrap();
        Ok(done_response())
    }
}

/// Completes immediately, writing to a file named after the worker's own
/// directory so unrelated tasks never collide on the same path.
pub struct UniqueFileRunner;

impl ralph_core::traits::AgentRunner for UniqueFileRunner {
    fn run(&self, request: &AgentRequest<'_>) -> Result<AgentResponse, RalphError> {
        let name = request.cwd.file_name().and_then(|n| n.to_str()).unwrap_or("out");
        fs::write(request.cwd.join(format!("{name}.txt")), "work\n").unwrap();
        Ok(done_response())
    }
}

/// Looks up per-task content by the worker directory's basename (workers are
/// named `worker-<task_id>`) so two tasks editing the same file can be
/// scripted to collide deterministically.
pub struct PerTaskFileRunner {
    pub file_name: &'static str,
    pub content_by_worker_id: HashMap<String, String>,
}

impl ralph_core::traits::AgentRunner for PerTaskFileRunner {
    fn run(&self, request: &AgentRequest<'_>) -> Result<AgentResponse, RalphError> {
        let worker_id = request.cwd.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let content = self.content_by_worker_id.get(worker_id).cloned().unwrap_or_default();
        fs::write(request.cwd.join(self.file_name), content).unwrap();
        Ok(done_response())
    }
}

/// Reports a rate limit on every call; never actually completes a task.
/// Paired with a fallback runner to test the rate-limit-then-fallback path.
pub struct AlwaysRateLimited;

impl ralph_core::traits::AgentRunner for AlwaysRateLimited {
    fn run(&self, _request: &AgentRequest<'_>) -> Result<AgentResponse, RalphError> {
        Ok(AgentResponse {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            token_usage: TokenUsage::default(),
            rate_limited: true,
        })
    }
}
