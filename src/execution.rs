//! Tool-execution state store (§4.4): the in-memory source of truth for a
//! single tool call's lifecycle, from first sighting to terminal state.
//!
//! All mutators return `(Execution, bool)` — a deep-copied snapshot plus
//! whether anything observable changed — so callers can diff without
//! holding a reference into the live map (mirrors the `ToolRegistry`'s
//! snapshot-on-read style).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::metadata::merge_metadata;

pub const MAX_PROGRESS_ENTRIES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Unknown,
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Deleted,
}

impl Lifecycle {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Lifecycle::Completed | Lifecycle::Failed | Lifecycle::Cancelled | Lifecycle::Deleted
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    None,
    Requested,
    Granted,
    Denied,
}

#[derive(Debug, Clone, Default)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: String,
    pub finished: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ToolCallResult {
    pub tool_call_id: String,
    pub name: String,
    pub content: String,
    pub metadata: Value,
    pub is_error: bool,
    pub pending: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionFlags {
    pub is_async: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Display {
    pub label: Option<String>,
    pub summary: Option<String>,
    pub body: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ProgressRecord {
    pub text: String,
    pub metadata: Value,
    pub status: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// In-memory record for a single tool invocation observed through the
/// process protocol.
#[derive(Debug, Clone)]
pub struct Execution {
    pub call: ToolCall,
    pub result: Option<ToolCallResult>,
    pub lifecycle: Lifecycle,
    pub permission: Permission,
    pub flags: ExecutionFlags,
    pub display: Display,
    pub progress: Vec<ProgressRecord>,
    pub tool: String,
}

impl Execution {
    fn new(call: ToolCall) -> Self {
        let lifecycle = if call.finished {
            Lifecycle::Completed
        } else {
            Lifecycle::Unknown
        };
        let tool = call.name.clone();
        Execution {
            call,
            result: None,
            lifecycle,
            permission: Permission::None,
            flags: ExecutionFlags::default(),
            display: Display::default(),
            progress: Vec::new(),
            tool,
        }
    }

    pub fn finished(&self) -> bool {
        self.lifecycle.is_terminal()
    }
}

/// A concurrent map from `call.id` to `Execution`.
#[derive(Clone)]
pub struct ToolStateStore {
    executions: Arc<RwLock<HashMap<String, Execution>>>,
}

impl Default for ToolStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolStateStore {
    pub fn new() -> Self {
        ToolStateStore {
            executions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Creates the execution on first sighting, or merges a repeated call
    /// announcement into the existing one. Non-empty fields of `call`
    /// overwrite; a false→true `finished` transition marks the execution
    /// completed (unless it is already terminal) and clears any pending
    /// result flag.
    pub async fn ensure_call(&self, call: ToolCall) -> (Execution, bool, bool) {
        let mut guard = self.executions.write().await;
        match guard.get_mut(&call.id) {
            None => {
                let execution = Execution::new(call.clone());
                guard.insert(call.id.clone(), execution.clone());
                (execution, true, true)
            }
            Some(existing) => {
                let before = existing.clone();
                let was_finished = existing.call.finished;

                if !call.name.is_empty() {
                    existing.call.name = call.name.clone();
                    existing.tool = call.name;
                }
                if !call.input.is_empty() {
                    existing.call.input = call.input;
                }
                if call.reason.is_some() {
                    existing.call.reason = call.reason;
                }
                if call.finished {
                    existing.call.finished = true;
                }

                if !was_finished && existing.call.finished && !existing.lifecycle.is_terminal() {
                    existing.lifecycle = Lifecycle::Completed;
                    if let Some(result) = existing.result.as_mut() {
                        result.pending = false;
                    }
                }

                let after = existing.clone();
                let changed = !executions_equal(&before, &after);
                (after, changed, false)
            }
        }
    }

    /// Concatenates `delta` to `call.input`, only while non-terminal.
    pub async fn append_input(&self, id: &str, delta: &str) -> Option<(Execution, bool)> {
        let mut guard = self.executions.write().await;
        let execution = guard.get_mut(id)?;
        if execution.finished() || delta.is_empty() {
            return Some((execution.clone(), false));
        }
        execution.call.input.push_str(delta);
        Some((execution.clone(), true))
    }

    pub async fn set_pending_result(
        &self,
        id: &str,
        mut result: ToolCallResult,
    ) -> Option<(Execution, bool)> {
        let mut guard = self.executions.write().await;
        let execution = guard.get_mut(id)?;
        if execution.finished() {
            return Some((execution.clone(), false));
        }
        result.pending = true;
        execution.result = Some(result);
        Some((execution.clone(), true))
    }

    /// Sets lifecycle to `completed` (or `failed` if `result.is_error`),
    /// clears `pending`, and merges the progress summary into metadata.
    pub async fn complete(&self, id: &str, mut result: ToolCallResult) -> Option<(Execution, bool)> {
        let mut guard = self.executions.write().await;
        let execution = guard.get_mut(id)?;

        result.pending = false;
        execution.lifecycle = if result.is_error {
            Lifecycle::Failed
        } else {
            Lifecycle::Completed
        };
        let progress_summary = progress_summary_metadata(&execution.progress);
        result.metadata = merge_metadata(&result.metadata, &progress_summary);
        execution.result = Some(result);
        Some((execution.clone(), true))
    }

    pub async fn request_permission(&self, id: &str) -> Option<(Execution, bool)> {
        self.set_permission(id, Permission::Requested).await
    }

    pub async fn grant_permission(&self, id: &str) -> Option<(Execution, bool)> {
        self.set_permission(id, Permission::Granted).await
    }

    /// Denying permission also transitions lifecycle to `cancelled` and
    /// sets the result content to `denial_content`. A denied execution can
    /// never subsequently reach `running` or `completed`.
    pub async fn deny_permission(&self, id: &str, denial_content: &str) -> Option<(Execution, bool)> {
        let mut guard = self.executions.write().await;
        let execution = guard.get_mut(id)?;
        execution.permission = Permission::Denied;
        execution.lifecycle = Lifecycle::Cancelled;
        execution.result = Some(ToolCallResult {
            tool_call_id: execution.call.id.clone(),
            name: execution.tool.clone(),
            content: denial_content.to_string(),
            metadata: Value::Null,
            is_error: true,
            pending: false,
        });
        Some((execution.clone(), true))
    }

    async fn set_permission(&self, id: &str, permission: Permission) -> Option<(Execution, bool)> {
        let mut guard = self.executions.write().await;
        let execution = guard.get_mut(id)?;
        if execution.permission == Permission::Denied {
            return Some((execution.clone(), false));
        }
        let changed = execution.permission != permission;
        execution.permission = permission;
        Some((execution.clone(), changed))
    }

    pub async fn set_lifecycle(&self, id: &str, lifecycle: Lifecycle) -> Option<(Execution, bool)> {
        let mut guard = self.executions.write().await;
        let execution = guard.get_mut(id)?;
        if execution.permission == Permission::Denied
            && matches!(lifecycle, Lifecycle::Running | Lifecycle::Completed)
        {
            return Some((execution.clone(), false));
        }
        let changed = execution.lifecycle != lifecycle;
        execution.lifecycle = lifecycle;
        Some((execution.clone(), changed))
    }

    pub async fn set_flags(&self, id: &str, flags: ExecutionFlags) -> Option<(Execution, bool)> {
        let mut guard = self.executions.write().await;
        let execution = guard.get_mut(id)?;
        let changed = execution.flags.is_async != flags.is_async;
        execution.flags = flags;
        Some((execution.clone(), changed))
    }

    pub async fn set_display(&self, id: &str, display: Display) -> Option<(Execution, bool)> {
        let mut guard = self.executions.write().await;
        let execution = guard.get_mut(id)?;
        execution.display = display;
        Some((execution.clone(), true))
    }

    pub async fn set_reason(&self, id: &str, reason: impl Into<String>) -> Option<(Execution, bool)> {
        let mut guard = self.executions.write().await;
        let execution = guard.get_mut(id)?;
        execution.call.reason = Some(reason.into());
        Some((execution.clone(), true))
    }

    pub async fn set_progress(&self, id: &str, progress: Vec<ProgressRecord>) -> Option<(Execution, bool)> {
        let mut guard = self.executions.write().await;
        let execution = guard.get_mut(id)?;
        execution.progress = cap_progress(progress);
        Some((execution.clone(), true))
    }

    /// Appends a progress record, dropping the oldest once the buffer
    /// exceeds `MAX_PROGRESS_ENTRIES` (§3 Progress invariants).
    pub async fn append_progress(&self, id: &str, record: ProgressRecord) -> Option<(Execution, bool)> {
        let mut guard = self.executions.write().await;
        let execution = guard.get_mut(id)?;
        execution.progress.push(record);
        if execution.progress.len() > MAX_PROGRESS_ENTRIES {
            let overflow = execution.progress.len() - MAX_PROGRESS_ENTRIES;
            execution.progress.drain(0..overflow);
        }
        Some((execution.clone(), true))
    }

    /// Parses the current metadata, applies `f`, and re-encodes. `f`
    /// receives the previous metadata (or `Value::Null` if the execution
    /// has no result yet) and returns the replacement.
    pub async fn update_metadata<F>(&self, id: &str, f: F) -> Option<(Execution, bool)>
    where
        F: FnOnce(Value) -> Value,
    {
        let mut guard = self.executions.write().await;
        let execution = guard.get_mut(id)?;
        let current = execution
            .result
            .as_ref()
            .map(|r| r.metadata.clone())
            .unwrap_or(Value::Null);
        let updated = f(current);
        match execution.result.as_mut() {
            Some(result) => result.metadata = updated,
            None => {
                execution.result = Some(ToolCallResult {
                    tool_call_id: execution.call.id.clone(),
                    name: execution.tool.clone(),
                    content: String::new(),
                    metadata: updated,
                    is_error: false,
                    pending: true,
                })
            }
        }
        Some((execution.clone(), true))
    }

    pub async fn get(&self, id: &str) -> Option<Execution> {
        self.executions.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.executions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn cap_progress(mut progress: Vec<ProgressRecord>) -> Vec<ProgressRecord> {
    if progress.len() > MAX_PROGRESS_ENTRIES {
        let overflow = progress.len() - MAX_PROGRESS_ENTRIES;
        progress.drain(0..overflow);
    }
    progress
}

fn progress_summary_metadata(progress: &[ProgressRecord]) -> Value {
    let mut summary = serde_json::Map::new();
    summary.insert("progress_count".to_string(), Value::from(progress.len()));
    if let Some(last) = progress.last() {
        summary.insert("last_progress_ts".to_string(), Value::String(last.timestamp.to_rfc3339()));
        summary.insert("last_progress_text".to_string(), Value::String(last.text.clone()));
        if let Some(status) = &last.status {
            summary.insert("last_progress_status".to_string(), Value::String(status.clone()));
        }
        summary.insert("last_progress_metadata".to_string(), last.metadata.clone());
    }
    Value::Object(summary)
}

fn executions_equal(a: &Execution, b: &Execution) -> bool {
    a.call.name == b.call.name
        && a.call.input == b.call.input
        && a.call.finished == b.call.finished
        && a.call.reason == b.call.reason
        && a.lifecycle == b.lifecycle
        && a.permission == b.permission
        && a.result.as_ref().map(|r| &r.pending) == b.result.as_ref().map(|r| &r.pending)
}
