//! Durable `Task` model (§3 Task, §6 persistence schema).

use chrono::{DateTime, Utc};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMode {
    Tool,
    Agent,
}

impl TaskMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskMode::Tool => "tool",
            TaskMode::Agent => "agent",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "agent" => TaskMode::Agent,
            _ => TaskMode::Tool,
        }
    }
}

/// `loading → pending → {complete, failed}`. A cancelled or panicked
/// execution is recorded as `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Loading,
    Pending,
    Complete,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Loading => "loading",
            TaskStatus::Pending => "pending",
            TaskStatus::Complete => "complete",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "pending" => TaskStatus::Pending,
            "complete" => TaskStatus::Complete,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Loading,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, TaskStatus::Loading | TaskStatus::Pending)
    }
}

/// One row of `tool_task_progress`, and the in-memory representation
/// attached to `Task::progress`.
#[derive(Debug, Clone)]
pub struct ProgressEntry {
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub text: Option<String>,
    pub metadata: Option<Value>,
    pub status: Option<String>,
}

/// Inputs accepted by `TaskQueueManager::submit`.
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub mode: Option<TaskMode>,
    pub tool_name: String,
    pub args: Value,
    pub working_dir: Option<String>,
    pub agent_name: Option<String>,
    pub command_name: Option<String>,
    pub command_args: Option<Value>,
    pub session_id: Option<String>,
    pub call_id: Option<String>,
    pub origin: Option<String>,
    pub client_id: Option<String>,
}

/// A durable unit of work: one `tool_tasks` row plus zero or more
/// `tool_task_progress` rows, mirrored in memory by the task queue manager.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub mode: TaskMode,
    pub tool_name: String,
    pub args: Value,
    pub working_dir: Option<String>,
    pub agent_name: Option<String>,
    pub command_name: Option<String>,
    pub command_args: Option<Value>,
    pub session_id: Option<String>,
    pub call_id: Option<String>,
    pub origin: Option<String>,
    pub client_id: Option<String>,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub metadata: Value,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: Vec<ProgressEntry>,
}

impl Task {
    pub fn from_request(id: String, req: SubmitRequest) -> Self {
        let now = Utc::now();
        Task {
            id,
            mode: req.mode.unwrap_or(TaskMode::Tool),
            tool_name: req.tool_name,
            args: req.args,
            working_dir: req.working_dir,
            agent_name: req.agent_name,
            command_name: req.command_name,
            command_args: req.command_args,
            session_id: req.session_id,
            call_id: req.call_id,
            origin: req.origin,
            client_id: req.client_id,
            status: TaskStatus::Loading,
            result: None,
            metadata: Value::Object(serde_json::Map::new()),
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            progress: Vec::new(),
        }
    }

    /// Normalizes an empty session id to a single global admission bucket.
    pub fn session_key(&self) -> &str {
        match &self.session_id {
            Some(s) if !s.is_empty() => s.as_str(),
            _ => "__global__",
        }
    }
}

/// Observable task lifecycle events, delivered to per-task watchers and the
/// global event sink (§4.5.5).
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Snapshot(Task),
    Progress(Task),
    Completed(Task),
    Failed(Task),
    Deleted(String),
}

impl TaskEvent {
    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::Snapshot(t) | TaskEvent::Progress(t) | TaskEvent::Completed(t) | TaskEvent::Failed(t) => {
                &t.id
            }
            TaskEvent::Deleted(id) => id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskEvent::Completed(_) | TaskEvent::Failed(_) | TaskEvent::Deleted(_))
    }
}
