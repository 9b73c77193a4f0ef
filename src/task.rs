//! Submit-then-poll execution of scripts on managed targets.

use crate::clock::SharedClock;
use crate::domain::DomainRouter;
use crate::errors::{GatewayError, GatewayResult};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default polling budget for `RemoteTaskRunner::await_task`
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Delays between polls: the listed steps first, then `tail` for every later poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    pub steps: Vec<Duration>,
    pub tail: Duration,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            steps: vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
                Duration::from_secs(5),
            ],
            tail: Duration::from_secs(5),
        }
    }
}

impl BackoffSchedule {
    /// No waiting at all
    pub fn immediate() -> Self {
        Self {
            steps: Vec::new(),
            tail: Duration::ZERO,
        }
    }

    /// Delay before poll number `attempt + 1` (zero-based)
    pub fn delay(&self, attempt: usize) -> Duration {
        self.steps.get(attempt).copied().unwrap_or(self.tail)
    }
}

/// Backend task state as reported by `show-task`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    /// Unknown statuses are treated as still running
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "succeeded" => TaskStatus::Succeeded,
            "failed" | "partially succeeded" => TaskStatus::Failed,
            _ => TaskStatus::Running,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

/// Result of waiting on a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed { success: bool, output: String },
    /// Polling budget exhausted; the job may still finish on the backend
    NotCompleted { task_id: String, attempts: u32 },
}

impl TaskOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskOutcome::Completed { .. })
    }

    /// `(success, output)` for completed tasks
    pub fn completed(&self) -> Option<(bool, &str)> {
        match self {
            TaskOutcome::Completed { success, output } => Some((*success, output.as_str())),
            TaskOutcome::NotCompleted { .. } => None,
        }
    }
}

/// One submitted script run
#[derive(Debug, Clone, Serialize)]
pub struct RemoteTask {
    pub task_id: String,
    pub target: String,
    pub submitted_at: DateTime<Utc>,
    result: Option<TaskOutcome>,
}

impl RemoteTask {
    pub fn new(task_id: impl Into<String>, target: impl Into<String>, submitted_at: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.into(),
            target: target.into(),
            submitted_at,
            result: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.result.is_some()
    }

    pub fn result(&self) -> Option<&TaskOutcome> {
        self.result.as_ref()
    }
}

pub struct RemoteTaskRunner {
    router: Arc<DomainRouter>,
    schedule: BackoffSchedule,
    clock: SharedClock,
}

impl RemoteTaskRunner {
    pub fn new(router: Arc<DomainRouter>, clock: SharedClock) -> Self {
        Self {
            router,
            schedule: BackoffSchedule::default(),
            clock,
        }
    }

    pub fn with_schedule(mut self, schedule: BackoffSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Submit `script` under `name` to run on `target`. A response without a
    /// task id is a hard failure.
    pub async fn submit_and_run(&self, target: &str, name: &str, script: &str) -> GatewayResult<RemoteTask> {
        let payload = json!({
            "script-name": name,
            "script": script,
            "targets": [target],
        });

        let response = self.router.call("run-script", &payload, Some(target)).await?;

        let task_id = response
            .pointer("/tasks/0/task-id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| GatewayError::TaskSubmission {
                target: target.to_string(),
                reason: "response did not contain a task id".to_string(),
            })?;

        info!("[RemoteTaskRunner] '{}' submitted to {} as task {}", name, target, task_id);
        Ok(RemoteTask::new(task_id, target, self.clock.utc()))
    }

    /// Track a task submitted earlier, e.g. one reported back as still processing
    pub fn resume(&self, task_id: impl Into<String>, target: impl Into<String>) -> RemoteTask {
        RemoteTask::new(task_id, target, self.clock.utc())
    }

    /// Poll `task` until it finishes or `max_retries` polls have been made.
    /// A task that already finished is returned without polling again.
    pub async fn await_task(&self, task: &mut RemoteTask, max_retries: u32) -> GatewayResult<TaskOutcome> {
        if let Some(outcome) = &task.result {
            return Ok(outcome.clone());
        }

        let outcome = self.poll(&task.target, &task.task_id, max_retries).await?;
        if outcome.is_terminal() {
            task.result = Some(outcome.clone());
        }
        Ok(outcome)
    }

    /// Poll a task known only by id
    pub async fn poll(&self, target: &str, task_id: &str, max_retries: u32) -> GatewayResult<TaskOutcome> {
        let payload = json!({ "task-id": task_id, "details-level": "full" });

        for attempt in 0..max_retries as usize {
            let response = self.router.call("show-task", &payload, Some(target)).await?;
            let task = response.pointer("/tasks/0").ok_or_else(|| GatewayError::MalformedResponse {
                command: "show-task".to_string(),
                reason: format!("no task entry for '{task_id}'"),
            })?;

            let status = task
                .get("status")
                .and_then(Value::as_str)
                .map(TaskStatus::parse)
                .unwrap_or(TaskStatus::Running);

            if status.is_terminal() {
                let output = decode_task_output(task)?;
                debug!("[RemoteTaskRunner] Task {} finished: {:?}", task_id, status);
                return Ok(TaskOutcome::Completed {
                    success: status == TaskStatus::Succeeded,
                    output,
                });
            }

            if attempt + 1 < max_retries as usize {
                tokio::time::sleep(self.schedule.delay(attempt)).await;
            }
        }

        warn!(
            "[RemoteTaskRunner] Task {} on {} still running after {} polls",
            task_id, target, max_retries
        );
        Ok(TaskOutcome::NotCompleted {
            task_id: task_id.to_string(),
            attempts: max_retries,
        })
    }
}

/// Decode every `task-details[].responseMessage` (base64) and join them with newlines
pub fn decode_task_output(task: &Value) -> GatewayResult<String> {
    let Some(details) = task.get("task-details").and_then(Value::as_array) else {
        return Ok(String::new());
    };

    let mut messages = Vec::with_capacity(details.len());
    for detail in details {
        let Some(encoded) = detail.get("responseMessage").and_then(Value::as_str) else {
            continue;
        };
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| GatewayError::MalformedResponse {
                command: "show-task".to_string(),
                reason: format!("responseMessage is not base64: {e}"),
            })?;
        messages.push(String::from_utf8_lossy(&bytes).into_owned());
    }

    Ok(messages.join("\n"))
}
