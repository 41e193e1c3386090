//! Task queue manager (§4.5): a durable, bounded, worker-pooled scheduler
//! of tool- and agent-command executions.

pub mod model;
pub mod store;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;

use crate::cancel::CancellationToken;
use crate::interfaces::{AgentRunner, ProgressCallback, ProgressEvent, ToolRunner};
use crate::metadata::merge_metadata;
use crate::metrics::{Metrics, MetricsSnapshot};

pub use model::{ProgressEntry, SubmitRequest, Task, TaskEvent, TaskMode, TaskStatus};
pub use store::{Store, StoreError};

const DEFAULT_QUEUE_SIZE: usize = 32;
const DEFAULT_MAX_PENDING_PER_SESSION: usize = 20;
const WATCHER_BUFFER: usize = 32;
const PROGRESS_CHANNEL_CAPACITY: usize = 64;
const PROGRESS_ACK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum TaskQueueError {
    Closed,
    BadRequest(String),
    AdmissionDenied(String),
    Io(String),
}

impl fmt::Display for TaskQueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskQueueError::Closed => write!(f, "task queue manager is shut down"),
            TaskQueueError::BadRequest(m) => write!(f, "bad request: {m}"),
            TaskQueueError::AdmissionDenied(m) => write!(f, "{m}"),
            TaskQueueError::Io(m) => write!(f, "persistence error: {m}"),
        }
    }
}

impl std::error::Error for TaskQueueError {}

/// Construction parameters (§4.5). `worker_count` defaults to the host CPU
/// count (minimum 1); `queue_size` defaults to 32; `max_pending_per_session`
/// defaults to 20 (0 disables the limit).
#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    pub worker_count: usize,
    pub queue_size: usize,
    pub max_pending_per_session: usize,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        TaskQueueConfig {
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .max(1),
            queue_size: DEFAULT_QUEUE_SIZE,
            max_pending_per_session: DEFAULT_MAX_PENDING_PER_SESSION,
        }
    }
}

struct Watcher {
    id: u64,
    tx: mpsc::Sender<TaskEvent>,
}

type EventSink = Arc<dyn Fn(TaskEvent) + Send + Sync>;

struct ProgressInsertRequest {
    entry: ProgressEntry,
    ack: oneshot::Sender<()>,
}

/// The durable scheduler. Cheaply cloneable; every clone shares the same
/// in-memory state and persistence handle.
#[derive(Clone)]
pub struct TaskQueueManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<Store>,
    config: TaskQueueConfig,
    tasks: RwLock<HashMap<String, Task>>,
    discarded: RwLock<HashSet<String>>,
    cancels: AsyncMutex<HashMap<String, CancellationToken>>,
    watchers: RwLock<HashMap<String, Vec<Watcher>>>,
    next_watcher_id: AtomicU64,
    event_sink: RwLock<Option<EventSink>>,
    tool_runner: RwLock<Option<Arc<dyn ToolRunner>>>,
    agent_runner: RwLock<Option<Arc<dyn AgentRunner>>>,
    sender: mpsc::Sender<String>,
    receiver: AsyncMutex<mpsc::Receiver<String>>,
    progress_tx: mpsc::Sender<ProgressInsertRequest>,
    root_ctx: CancellationToken,
    closed: std::sync::atomic::AtomicBool,
    metrics: Metrics,
    worker_handles: AsyncMutex<Vec<JoinHandle<()>>>,
    progress_writer_handle: AsyncMutex<Option<JoinHandle<()>>>,
}

impl TaskQueueManager {
    /// Opens the persistence handle, loads every row, re-enqueues anything
    /// left `loading`/`pending` from a previous run, then spawns the worker
    /// pool and the single progress writer (§4.5.1).
    pub async fn start(
        store: Arc<Store>,
        config: TaskQueueConfig,
        tool_runner: Option<Arc<dyn ToolRunner>>,
        agent_runner: Option<Arc<dyn AgentRunner>>,
    ) -> Result<Self, TaskQueueError> {
        let worker_count = config.worker_count.max(1);
        let queue_size = config.queue_size.max(1);

        let loaded = store.load_all().map_err(|e| TaskQueueError::Io(e.to_string()))?;
        let mut tasks = HashMap::new();
        let mut to_enqueue = Vec::new();
        for task in loaded {
            if task.status.is_in_flight() {
                to_enqueue.push(task.id.clone());
            }
            tasks.insert(task.id.clone(), task);
        }

        let (sender, receiver) = mpsc::channel(queue_size);
        let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);

        let manager = TaskQueueManager {
            inner: Arc::new(Inner {
                store,
                config: TaskQueueConfig {
                    worker_count,
                    queue_size,
                    max_pending_per_session: config.max_pending_per_session,
                },
                tasks: RwLock::new(tasks),
                discarded: RwLock::new(HashSet::new()),
                cancels: AsyncMutex::new(HashMap::new()),
                watchers: RwLock::new(HashMap::new()),
                next_watcher_id: AtomicU64::new(1),
                event_sink: RwLock::new(None),
                tool_runner: RwLock::new(tool_runner),
                agent_runner: RwLock::new(agent_runner),
                sender,
                receiver: AsyncMutex::new(receiver),
                progress_tx,
                root_ctx: CancellationToken::new(),
                closed: std::sync::atomic::AtomicBool::new(false),
                metrics: Metrics::default(),
                worker_handles: AsyncMutex::new(Vec::new()),
                progress_writer_handle: AsyncMutex::new(None),
            }),
        };

        {
            let writer_handle = manager.clone().spawn_progress_writer(progress_rx);
            *manager.inner.progress_writer_handle.lock().await = Some(writer_handle);
        }

        for _ in 0..worker_count {
            let handle = manager.clone().spawn_worker();
            manager.inner.worker_handles.lock().await.push(handle);
        }

        for id in to_enqueue {
            manager.enqueue_id(id).await;
        }

        Ok(manager)
    }

    pub async fn set_event_sink(&self, sink: Option<EventSink>) {
        *self.inner.event_sink.write().await = sink;
    }

    pub async fn set_tool_runner(&self, runner: Arc<dyn ToolRunner>) {
        *self.inner.tool_runner.write().await = Some(runner);
    }

    pub async fn set_agent_runner(&self, runner: Arc<dyn AgentRunner>) {
        *self.inner.agent_runner.write().await = Some(runner);
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let depth = self.inner.sender.max_capacity() - self.inner.sender.capacity();
        self.inner
            .metrics
            .snapshot(depth as u64, self.inner.config.worker_count as u64)
    }

    /// Validates, admission-controls, persists, and enqueues a new task
    /// (§4.5.2). Returns a clone of the stored task.
    pub async fn submit(&self, req: SubmitRequest) -> Result<Task, TaskQueueError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TaskQueueError::Closed);
        }
        if req.tool_name.trim().is_empty() {
            return Err(TaskQueueError::BadRequest("tool_name must not be empty".to_string()));
        }
        let mode = req.mode.unwrap_or(TaskMode::Tool);
        if mode == TaskMode::Agent && self.inner.agent_runner.read().await.is_none() {
            return Err(TaskQueueError::BadRequest(
                "mode=agent requires a configured agent runner".to_string(),
            ));
        }

        let session_key = req
            .session_id
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "__global__".to_string());
        let limit = self.inner.config.max_pending_per_session;
        if limit > 0 {
            let tasks = self.inner.tasks.read().await;
            let count = tasks
                .values()
                .filter(|t| t.session_key() == session_key && t.status.is_in_flight())
                .count();
            if count >= limit {
                return Err(TaskQueueError::AdmissionDenied(format!(
                    "limit reached for session {session_key} (limit {limit})"
                )));
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        let task = Task::from_request(id.clone(), req);

        {
            let mut tasks = self.inner.tasks.write().await;
            tasks.insert(id.clone(), task.clone());
        }
        self.inner
            .store
            .upsert_task(&task)
            .map_err(|e| TaskQueueError::Io(e.to_string()))?;

        self.broadcast(TaskEvent::Snapshot(task.clone())).await;
        self.inner.metrics.submitted.fetch_add(1, Ordering::SeqCst);

        self.enqueue_id(id).await;

        Ok(task)
    }

    async fn enqueue_id(&self, id: String) {
        let sender = self.inner.sender.clone();
        let root = self.inner.root_ctx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = root.cancelled() => {}
                _ = sender.send(id) => {}
            }
        });
    }

    /// A bounded, cancellable per-task watcher (§4.5.5). The first event is
    /// always a `Snapshot` of the task's current state.
    pub async fn subscribe_task(&self, id: &str) -> Option<mpsc::Receiver<TaskEvent>> {
        let snapshot = self.inner.tasks.read().await.get(id).cloned()?;
        let (tx, rx) = mpsc::channel(WATCHER_BUFFER);
        let watcher_id = self.inner.next_watcher_id.fetch_add(1, Ordering::SeqCst);
        let _ = tx.try_send(TaskEvent::Snapshot(snapshot));
        self.inner
            .watchers
            .write()
            .await
            .entry(id.to_string())
            .or_default()
            .push(Watcher { id: watcher_id, tx });
        Some(rx)
    }

    pub async fn unsubscribe_task(&self, id: &str, watcher_id: u64) {
        if let Some(list) = self.inner.watchers.write().await.get_mut(id) {
            list.retain(|w| w.id != watcher_id);
        }
    }

    async fn broadcast(&self, event: TaskEvent) {
        let task_id = event.task_id().to_string();
        let terminal = event.is_terminal();

        {
            let mut watchers = self.inner.watchers.write().await;
            if terminal {
                // Detach all watchers: attempt delivery, then drop the
                // sender so the channel closes on the subscriber side.
                if let Some(list) = watchers.remove(&task_id) {
                    for watcher in list {
                        let _ = watcher.tx.try_send(event.clone());
                    }
                }
            } else if let Some(list) = watchers.get(&task_id) {
                // Non-blocking, best-effort: a full buffer silently drops
                // the event but the watcher stays subscribed.
                for watcher in list {
                    let _ = watcher.tx.try_send(event.clone());
                }
            }
        }

        if let Some(sink) = self.inner.event_sink.read().await.clone() {
            let event_for_sink = event.clone();
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                sink(event_for_sink);
            }));
            if let Err(_panic) = result {
                log::error!("event sink panicked while handling event for task {task_id}");
            }
        }
    }

    /// Four deletion entry points share this implementation (§4.5.6): mark
    /// discarded, cancel in-flight contexts, delete durably, emit `Deleted`.
    async fn delete_ids(&self, ids: Vec<String>) -> Result<usize, TaskQueueError> {
        if ids.is_empty() {
            return Ok(0);
        }
        {
            let mut tasks = self.inner.tasks.write().await;
            let mut discarded = self.inner.discarded.write().await;
            for id in &ids {
                tasks.remove(id);
                discarded.insert(id.clone());
            }
        }
        {
            let cancels = self.inner.cancels.lock().await;
            for id in &ids {
                if let Some(token) = cancels.get(id) {
                    token.cancel();
                }
            }
        }

        self.inner
            .store
            .delete_tasks(&ids)
            .map_err(|e| TaskQueueError::Io(e.to_string()))?;

        for id in &ids {
            self.broadcast(TaskEvent::Deleted(id.clone())).await;
        }

        Ok(ids.len())
    }

    pub async fn delete_task(&self, id: &str) -> Result<usize, TaskQueueError> {
        self.delete_ids(vec![id.to_string()]).await
    }

    pub async fn delete_by_session(&self, session_id: &str) -> Result<usize, TaskQueueError> {
        let ids: Vec<String> = {
            let tasks = self.inner.tasks.read().await;
            tasks
                .values()
                .filter(|t| t.session_id.as_deref() == Some(session_id))
                .map(|t| t.id.clone())
                .collect()
        };
        self.delete_ids(ids).await
    }

    pub async fn delete_by_call(&self, call_id: &str) -> Result<usize, TaskQueueError> {
        let ids: Vec<String> = {
            let tasks = self.inner.tasks.read().await;
            tasks
                .values()
                .filter(|t| t.call_id.as_deref() == Some(call_id))
                .map(|t| t.id.clone())
                .collect()
        };
        self.delete_ids(ids).await
    }

    pub async fn delete_by_agent(&self, agent_name: &str) -> Result<usize, TaskQueueError> {
        let ids: Vec<String> = {
            let tasks = self.inner.tasks.read().await;
            tasks
                .values()
                .filter(|t| t.agent_name.as_deref() == Some(agent_name))
                .map(|t| t.id.clone())
                .collect()
        };
        self.delete_ids(ids).await
    }

    pub async fn get_task(&self, id: &str) -> Option<Task> {
        self.inner.tasks.read().await.get(id).cloned()
    }

    /// Cancels the root context and waits for every worker and the
    /// progress writer to exit. In-flight tasks observe cancellation
    /// through their derived per-task contexts.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.root_ctx.cancel();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.worker_handles.lock().await);
        for handle in handles {
            let _ = handle.await;
        }
        if let Some(handle) = self.inner.progress_writer_handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    fn spawn_worker(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let id = {
                    let mut rx = self.inner.receiver.lock().await;
                    tokio::select! {
                        _ = self.inner.root_ctx.cancelled() => return,
                        maybe_id = rx.recv() => match maybe_id {
                            Some(id) => id,
                            None => return,
                        },
                    }
                };
                self.inner.metrics.in_flight.fetch_add(1, Ordering::SeqCst);
                self.run_one(id).await;
                self.inner.metrics.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        })
    }

    async fn run_one(&self, id: String) {
        if self.inner.discarded.write().await.remove(&id) {
            return;
        }
        let mut task = match self.inner.tasks.read().await.get(&id).cloned() {
            Some(t) => t,
            None => return,
        };

        task.status = TaskStatus::Pending;
        task.result = None;
        task.metadata = Value::Object(serde_json::Map::new());
        task.error = None;
        task.completed_at = None;
        task.updated_at = Utc::now();
        self.save_task(&task).await;
        self.broadcast(TaskEvent::Snapshot(task.clone())).await;
        log::info!(
            "event=started task_id={} tool={} mode={} session_id={:?}",
            task.id,
            task.tool_name,
            task.mode.as_str(),
            task.session_id
        );

        let per_task_ctx = self.inner.root_ctx.child_token();
        self.inner.cancels.lock().await.insert(id.clone(), per_task_ctx.clone());

        let outcome = self.invoke_runner(&task, per_task_ctx).await;

        self.inner.cancels.lock().await.remove(&id);

        // Re-read the live task: `apply_progress` mutates the map entry
        // directly while the runner is in flight, so the local snapshot
        // taken above is stale and would otherwise clobber every progress
        // record accumulated during this run.
        if let Some(live) = self.inner.tasks.read().await.get(&id).cloned() {
            task = live;
        }

        task.updated_at = Utc::now();
        task.completed_at = Some(Utc::now());

        let terminal_event = match outcome {
            Ok(output) => {
                task.metadata = merge_metadata(&output.metadata, &progress_summary(&task.progress));
                task.result = Some(output.content);
                task.status = TaskStatus::Complete;
                self.inner.metrics.completed.fetch_add(1, Ordering::SeqCst);
                TaskEvent::Completed(task.clone())
            }
            Err(message) => {
                task.error = Some(message.trim().to_string());
                task.result = None;
                task.status = TaskStatus::Failed;
                self.inner.metrics.failed.fetch_add(1, Ordering::SeqCst);
                TaskEvent::Failed(task.clone())
            }
        };

        if self.inner.discarded.write().await.remove(&id) {
            // Deleted while in flight: the save below must not resurrect
            // the row. Still emit the terminal event to any listener that
            // raced the deletion.
            self.broadcast(terminal_event).await;
            log::info!("event=finished-but-discarded task_id={id}");
            return;
        }

        self.save_task(&task).await;
        self.broadcast(terminal_event).await;
        log::info!(
            "event={} task_id={} tool={} mode={} status={}",
            if task.status == TaskStatus::Complete { "completed" } else { "failed" },
            task.id,
            task.tool_name,
            task.mode.as_str(),
            task.status.as_str()
        );
    }

    async fn invoke_runner(&self, task: &Task, ctx: CancellationToken) -> Result<crate::interfaces::RunnerOutput, String> {
        let handle: JoinHandle<Result<crate::interfaces::RunnerOutput, String>> = match task.mode {
            TaskMode::Tool => {
                let runner = self.inner.tool_runner.read().await.clone();
                let name = task.tool_name.clone();
                let args = value_to_args(&task.args);
                let working_dir = task.working_dir.clone();
                tokio::spawn(async move {
                    match runner {
                        Some(runner) => runner
                            .execute(ctx, &name, &args, working_dir.as_deref())
                            .await
                            .map_err(|e| e.to_string()),
                        None => Err("no ToolRunner configured".to_string()),
                    }
                })
            }
            TaskMode::Agent => {
                let runner = self.inner.agent_runner.read().await.clone();
                let agent = task.agent_name.clone().unwrap_or_default();
                let command = task.command_name.clone().unwrap_or_default();
                let args = task
                    .command_args
                    .as_ref()
                    .map(value_to_args)
                    .unwrap_or_default();
                let working_dir = task.working_dir.clone();
                let progress_cb = self.make_progress_callback(task.id.clone());
                tokio::spawn(async move {
                    match runner {
                        Some(runner) => runner
                            .execute(ctx, &agent, &command, &args, working_dir.as_deref(), progress_cb)
                            .await
                            .map_err(|e| e.to_string()),
                        None => Err("no AgentRunner configured".to_string()),
                    }
                })
            }
        };

        match handle.await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => {
                let payload = join_err.into_panic();
                let recovered = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_string());
                let prior = task.error.clone();
                let base = format!("panic: {recovered}");
                Err(match prior {
                    Some(p) if !p.is_empty() => format!("{base} (previous error: {p})"),
                    _ => base,
                })
            }
            Err(_) => Err("task execution was cancelled".to_string()),
        }
    }

    fn make_progress_callback(&self, task_id: String) -> ProgressCallback {
        let manager = self.clone();
        Arc::new(move |event: ProgressEvent| {
            let manager = manager.clone();
            let task_id = task_id.clone();
            tokio::spawn(async move {
                manager.apply_progress(task_id, event).await;
            });
        })
    }

    /// Progress pipeline (§4.5.4): append to the in-memory buffer, refresh
    /// the metadata summary, persist the task row, broadcast a `Progress`
    /// event, and hand the row off to the single progress writer.
    async fn apply_progress(&self, task_id: String, event: ProgressEvent) {
        let text = event.text.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
        let status = event.status.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        let metadata = event.metadata;

        if text.is_none() && status.is_none() && metadata.is_none() {
            return;
        }

        if self.inner.discarded.read().await.contains(&task_id) {
            return;
        }

        let entry = ProgressEntry {
            task_id: task_id.clone(),
            timestamp: Utc::now(),
            text,
            metadata,
            status,
        };

        let snapshot = {
            let mut tasks = self.inner.tasks.write().await;
            match tasks.get_mut(&task_id) {
                Some(task) => {
                    task.progress.push(entry.clone());
                    if task.progress.len() > crate::execution::MAX_PROGRESS_ENTRIES {
                        let overflow = task.progress.len() - crate::execution::MAX_PROGRESS_ENTRIES;
                        task.progress.drain(0..overflow);
                    }
                    task.metadata = merge_metadata(&task.metadata, &progress_summary(&task.progress));
                    task.updated_at = Utc::now();
                    task.clone()
                }
                None => return,
            }
        };

        self.save_task(&snapshot).await;
        self.broadcast(TaskEvent::Progress(snapshot)).await;

        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .inner
            .progress_tx
            .send(ProgressInsertRequest { entry, ack: ack_tx })
            .await
            .is_ok()
            && tokio::time::timeout(PROGRESS_ACK_TIMEOUT, ack_rx).await.is_err()
        {
            log::warn!("progress insert ack timed out for task {task_id}");
        }
    }

    fn spawn_progress_writer(self, mut rx: mpsc::Receiver<ProgressInsertRequest>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.inner.root_ctx.cancelled() => return,
                    maybe_req = rx.recv() => {
                        match maybe_req {
                            Some(req) => {
                                if let Err(e) = self.inner.store.insert_progress(&req.entry) {
                                    log::error!("failed to persist progress row: {e}");
                                }
                                let _ = req.ack.send(());
                            }
                            None => return,
                        }
                    }
                }
            }
        })
    }

    async fn save_task(&self, task: &Task) {
        {
            let mut tasks = self.inner.tasks.write().await;
            tasks.insert(task.id.clone(), task.clone());
        }
        if let Err(e) = self.inner.store.upsert_task(task) {
            log::error!("failed to persist task {}: {e}", task.id);
        }
    }
}

fn value_to_args(value: &Value) -> HashMap<String, Value> {
    value
        .as_object()
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

fn progress_summary(progress: &[ProgressEntry]) -> Value {
    let mut summary = serde_json::Map::new();
    summary.insert("progress_count".to_string(), Value::from(progress.len()));
    if let Some(last) = progress.last() {
        summary.insert("last_progress_ts".to_string(), Value::String(last.timestamp.to_rfc3339()));
        if let Some(text) = &last.text {
            summary.insert("last_progress_text".to_string(), Value::String(text.clone()));
        }
        if let Some(status) = &last.status {
            summary.insert("last_progress_status".to_string(), Value::String(status.clone()));
        }
        if let Some(metadata) = &last.metadata {
            summary.insert("last_progress_metadata".to_string(), metadata.clone());
        }
    }
    Value::Object(summary)
}
