//! Process protocol (§4.3): the bidirectional, line-framed transport
//! layered over a child's stdin/stdout/stderr. Generic over the actual
//! byte streams so tests can drive it with in-memory pipes instead of a
//! real subprocess.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex, Notify, RwLock};

use crate::cancel::CancellationToken;
use crate::codec::{decode_line, encode_line, is_blank};
use crate::message::{normalize_descriptor, Command, CommandDescriptor, Message, MessageType};

#[derive(Debug)]
pub enum ProtocolError {
    NoStdin,
    Io(String),
    Cancelled,
    Closed,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::NoStdin => write!(f, "process protocol has no stdin writer installed"),
            ProtocolError::Io(e) => write!(f, "process protocol I/O error: {e}"),
            ProtocolError::Cancelled => write!(f, "command cancelled before a response arrived"),
            ProtocolError::Closed => write!(f, "process protocol is shut down"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[derive(Debug, Clone)]
pub struct Response {
    pub command_id: String,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Progress {
    pub text: Option<String>,
    pub metadata: Option<Value>,
    pub status: Option<String>,
    pub progress: Option<Value>,
}

pub type Handler = Arc<dyn Fn(Message) -> Result<(), String> + Send + Sync>;
pub type RawHandler = Arc<dyn Fn(&str) + Send + Sync>;
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

struct PendingListener {
    tx: Option<oneshot::Sender<Response>>,
    progress_cb: Option<ProgressCallback>,
}

/// Owns the handler registry, the pending-response map, and the announced
/// command registry. `start`/`stop` are idempotent.
pub struct ProcessProtocol {
    stdin: Arc<Mutex<Option<Box<dyn AsyncWrite + Unpin + Send>>>>,
    handlers: Arc<RwLock<HashMap<String, Vec<Handler>>>>,
    pending: Arc<Mutex<HashMap<String, PendingListener>>>,
    registry: Arc<RwLock<Vec<CommandDescriptor>>>,
    raw_handler: Arc<RwLock<Option<RawHandler>>>,
    started: Arc<AtomicBool>,
    shutdown: CancellationToken,
    readers_exited: Arc<Notify>,
    remaining_readers: Arc<std::sync::atomic::AtomicU8>,
}

impl Default for ProcessProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProtocol {
    pub fn new() -> Self {
        ProcessProtocol {
            stdin: Arc::new(Mutex::new(None)),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
            registry: Arc::new(RwLock::new(Vec::new())),
            raw_handler: Arc::new(RwLock::new(None)),
            started: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            readers_exited: Arc::new(Notify::new()),
            remaining_readers: Arc::new(std::sync::atomic::AtomicU8::new(0)),
        }
    }

    pub async fn register_handler(&self, message_type: MessageType, handler: Handler) {
        self.handlers
            .write()
            .await
            .entry(message_type.as_str().to_string())
            .or_default()
            .push(handler);
    }

    pub async fn set_raw_handler(&self, handler: RawHandler) {
        *self.raw_handler.write().await = Some(handler);
    }

    pub async fn command_registry(&self) -> Vec<CommandDescriptor> {
        self.registry.read().await.clone()
    }

    /// Idempotent: spawns a stdout reader and a stderr reader as
    /// independent tasks and installs the stdin writer.
    pub fn start<Out, Err, In>(&self, stdout: Out, stderr: Err, stdin: In)
    where
        Out: AsyncRead + Unpin + Send + 'static,
        Err: AsyncRead + Unpin + Send + 'static,
        In: AsyncWrite + Unpin + Send + 'static,
    {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        self.remaining_readers.store(2, Ordering::SeqCst);

        {
            let stdin_slot = self.stdin.clone();
            tokio::spawn(async move {
                *stdin_slot.lock().await = Some(Box::new(stdin));
            });
        }

        self.spawn_stdout_reader(stdout);
        self.spawn_stderr_reader(stderr);
    }

    fn spawn_stdout_reader<Out>(&self, stdout: Out)
    where
        Out: AsyncRead + Unpin + Send + 'static,
    {
        let ctx = self.shutdown.clone();
        let handlers = self.handlers.clone();
        let pending = self.pending.clone();
        let registry = self.registry.clone();
        let raw_handler = self.raw_handler.clone();
        let readers_exited = self.readers_exited.clone();
        let remaining = self.remaining_readers.clone();

        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            loop {
                line.clear();
                let read = tokio::select! {
                    _ = ctx.cancelled() => break,
                    result = reader.read_line(&mut line) => result,
                };
                match read {
                    Ok(0) => break, // EOF
                    Ok(_) => {
                        let raw = line.trim_end_matches(['\n', '\r']).to_string();
                        if is_blank(&raw) {
                            continue;
                        }
                        handle_stdout_line(&raw, &handlers, &pending, &registry, &raw_handler).await;
                    }
                    Err(_) => break,
                }
            }
            if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                readers_exited.notify_waiters();
            }
        });
    }

    fn spawn_stderr_reader<Err>(&self, stderr: Err)
    where
        Err: AsyncRead + Unpin + Send + 'static,
    {
        let ctx = self.shutdown.clone();
        let raw_handler = self.raw_handler.clone();
        let readers_exited = self.readers_exited.clone();
        let remaining = self.remaining_readers.clone();

        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();
            loop {
                line.clear();
                let read = tokio::select! {
                    _ = ctx.cancelled() => break,
                    result = reader.read_line(&mut line) => result,
                };
                match read {
                    Ok(0) => break,
                    Ok(_) => {
                        let raw = line.trim_end_matches(['\n', '\r']).to_string();
                        if let Some(cb) = raw_handler.read().await.as_ref() {
                            cb(&raw);
                        }
                    }
                    Err(_) => break,
                }
            }
            if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                readers_exited.notify_waiters();
            }
        });
    }

    /// Idempotent. Signals the readers to stop and waits up to 2s for both
    /// to exit; timing out is not an error.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), self.readers_exited.notified()).await;
        self.stdin.lock().await.take();
    }

    pub async fn send_command(
        &self,
        command: &str,
        args: HashMap<String, Value>,
        working_dir: Option<String>,
        cancel: CancellationToken,
    ) -> Result<Response, ProtocolError> {
        self.send_command_inner(command, args, working_dir, None, cancel).await
    }

    pub async fn send_command_with_progress(
        &self,
        command: &str,
        args: HashMap<String, Value>,
        working_dir: Option<String>,
        progress_cb: ProgressCallback,
        cancel: CancellationToken,
    ) -> Result<Response, ProtocolError> {
        self.send_command_inner(command, args, working_dir, Some(progress_cb), cancel)
            .await
    }

    async fn send_command_inner(
        &self,
        command: &str,
        args: HashMap<String, Value>,
        working_dir: Option<String>,
        progress_cb: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> Result<Response, ProtocolError> {
        let mut envelope = Command::new(command, args);
        if let Some(dir) = working_dir {
            envelope = envelope.with_working_dir(dir);
        }
        let id = envelope.id.clone();

        {
            let stdin_guard = self.stdin.lock().await;
            if stdin_guard.is_none() {
                return Err(ProtocolError::NoStdin);
            }
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(
            id.clone(),
            PendingListener {
                tx: Some(tx),
                progress_cb,
            },
        );

        let data = serde_json::to_value(&envelope).map_err(|e| ProtocolError::Io(e.to_string()))?;
        let message = Message::new(MessageType::Command, data);
        let line = encode_line(&message).map_err(|e| ProtocolError::Io(e.to_string()))?;

        {
            let mut stdin_guard = self.stdin.lock().await;
            if let Some(writer) = stdin_guard.as_mut() {
                writer
                    .write_all(line.as_bytes())
                    .await
                    .map_err(|e| ProtocolError::Io(e.to_string()))?;
            } else {
                self.pending.lock().await.remove(&id);
                return Err(ProtocolError::NoStdin);
            }
        }

        tokio::select! {
            result = rx => {
                result.map_err(|_| ProtocolError::Cancelled)
            }
            _ = cancel.cancelled() => {
                self.pending.lock().await.remove(&id);
                Err(ProtocolError::Cancelled)
            }
            _ = self.shutdown.cancelled() => {
                self.pending.lock().await.remove(&id);
                Err(ProtocolError::Closed)
            }
        }
    }
}

async fn handle_stdout_line(
    raw: &str,
    handlers: &Arc<RwLock<HashMap<String, Vec<Handler>>>>,
    pending: &Arc<Mutex<HashMap<String, PendingListener>>>,
    registry: &Arc<RwLock<Vec<CommandDescriptor>>>,
    raw_handler: &Arc<RwLock<Option<RawHandler>>>,
) {
    let message = match decode_line(raw) {
        Ok(m) => m,
        Err(_) => {
            if let Some(cb) = raw_handler.read().await.as_ref() {
                cb(raw);
            }
            return;
        }
    };

    match &message.message_type {
        MessageType::Response => {
            if let Ok(body) = serde_json::from_value::<ResponseBody>(message.data.clone()) {
                let mut guard = pending.lock().await;
                if let Some(listener) = guard.remove(&body.command_id) {
                    if let Some(tx) = listener.tx {
                        let _ = tx.send(Response {
                            command_id: body.command_id,
                            success: body.success,
                            result: body.result,
                            error: body.error,
                        });
                    }
                }
                // Duplicate response for an already-delivered/cancelled id
                // is silently dropped (no entry found).
            }
        }
        MessageType::CommandProgress => {
            if let Ok(body) = serde_json::from_value::<ProgressBody>(message.data.clone()) {
                let guard = pending.lock().await;
                if let Some(listener) = guard.get(&body.command_id) {
                    if let Some(cb) = &listener.progress_cb {
                        cb(Progress {
                            text: body.text,
                            metadata: body.metadata,
                            status: body.status,
                            progress: body.progress,
                        });
                    }
                }
            }
        }
        MessageType::CommandRegistry => {
            if let Ok(body) = serde_json::from_value::<RegistryBody>(message.data.clone()) {
                let normalized: Vec<CommandDescriptor> =
                    body.commands.into_iter().map(normalize_descriptor).collect();
                *registry.write().await = normalized;
            }
        }
        _ => {}
    }

    let key = message.message_type.as_str().to_string();
    if let Some(handler_list) = handlers.read().await.get(&key) {
        for handler in handler_list {
            if let Err(e) = handler(message.clone()) {
                log::error!("handler for message type {key} failed: {e}");
            }
        }
    }
}

#[derive(serde::Deserialize)]
struct ResponseBody {
    command_id: String,
    success: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(serde::Deserialize)]
struct ProgressBody {
    command_id: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    progress: Option<Value>,
}

#[derive(serde::Deserialize)]
struct RegistryBody {
    commands: Vec<CommandDescriptor>,
}
