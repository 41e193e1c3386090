// src/lib.rs

pub mod broker;
pub mod cancel;
pub mod codec;
pub mod execution;
pub mod interfaces;
pub mod message;
pub mod metadata;
pub mod metrics;
pub mod protocol;
pub mod tasks;
pub mod tools;

// Re-exporting key items for easier external access.
pub use broker::Broker;
pub use cancel::CancellationToken;
pub use execution::{Execution, ToolStateStore};
pub use interfaces::{AgentRunner, RunnerError, RunnerOutput, ToolRunner};
pub use message::{Command, CommandDescriptor, Message, MessageType};
pub use protocol::ProcessProtocol;
pub use tasks::model::{Task, TaskEvent, TaskMode, TaskStatus};
pub use tasks::{TaskQueueConfig, TaskQueueError, TaskQueueManager};
