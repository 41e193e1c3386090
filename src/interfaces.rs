//! External collaborator interfaces (§4.6): the contracts the core invokes
//! through, never the concrete tool or agent implementations themselves
//! (those are explicitly out of scope — see `tools` for worked examples
//! used only by this crate's own tests).

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use crate::cancel::CancellationToken;

#[derive(Debug, Clone)]
pub struct RunnerError(pub String);

impl fmt::Display for RunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for RunnerError {}

impl From<String> for RunnerError {
    fn from(s: String) -> Self {
        RunnerError(s)
    }
}

impl From<&str> for RunnerError {
    fn from(s: &str) -> Self {
        RunnerError(s.to_string())
    }
}

/// Output of a successful tool or agent execution.
#[derive(Debug, Clone, Default)]
pub struct RunnerOutput {
    pub content: String,
    pub metadata: Value,
}

/// Must honor `ctx` cancellation: a worker derives a per-task token and
/// cancels it on deletion or shutdown (§4.5.3, §4.5.7).
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn execute(
        &self,
        ctx: CancellationToken,
        name: &str,
        args: &HashMap<String, Value>,
        working_dir: Option<&str>,
    ) -> Result<RunnerOutput, RunnerError>;
}

/// A callback an `AgentRunner` invokes zero or more times while executing,
/// to stream progress back through the task queue's progress pipeline
/// (§4.5.4). Implementations must not block.
pub type ProgressCallback = std::sync::Arc<dyn Fn(ProgressEvent) + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct ProgressEvent {
    pub text: Option<String>,
    pub metadata: Option<Value>,
    pub status: Option<String>,
}

#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn execute(
        &self,
        ctx: CancellationToken,
        agent: &str,
        command: &str,
        args: &HashMap<String, Value>,
        working_dir: Option<&str>,
        progress: ProgressCallback,
    ) -> Result<RunnerOutput, RunnerError>;
}
