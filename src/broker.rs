//! Generic non-blocking pub/sub fan-out.
//!
//! `Broker<T>` is parametric in a payload type and used internally by the
//! permission subsystem and the task queue manager (see `tasks`) to expose
//! process-wide event streams. Publishers never block on a slow
//! subscriber: delivery is best-effort, and a full subscriber buffer simply
//! drops the event for that subscriber.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::cancel::CancellationToken;

/// Lifecycle tag carried alongside every published payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Created,
    Updated,
    Deleted,
}

/// An event as delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct Event<T> {
    pub lifecycle: Lifecycle,
    pub payload: T,
}

const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;

struct Subscriber<T> {
    id: u64,
    tx: mpsc::Sender<Event<T>>,
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Subscriber {
            id: self.id,
            tx: self.tx.clone(),
        }
    }
}

/// A generic typed broker. Construct one per payload type you want to fan
/// out (e.g. permission events, task events).
pub struct Broker<T> {
    subscribers: Arc<RwLock<Vec<Subscriber<T>>>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl<T> Default for Broker<T> {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl<T> Broker<T> {
    pub fn new(buffer: usize) -> Self {
        Broker {
            subscribers: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    /// Registers a subscriber with a bounded buffer. The returned channel
    /// closes when `ctx` is cancelled or the broker is shut down.
    pub async fn subscribe(&self, ctx: CancellationToken) -> mpsc::Receiver<Event<T>>
    where
        T: Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers.write().await.push(Subscriber { id, tx });

        let subscribers = self.subscribers.clone();
        tokio::spawn(async move {
            ctx.cancelled().await;
            let mut subs = subscribers.write().await;
            subs.retain(|s| s.id != id);
        });

        rx
    }

    /// Fans a payload out to every current subscriber. Snapshots the
    /// subscriber set under a read lock, then sends non-blockingly; a full
    /// subscriber buffer is a silent drop for that subscriber only.
    pub async fn publish(&self, lifecycle: Lifecycle, payload: T)
    where
        T: Clone,
    {
        let snapshot: Vec<Subscriber<T>> = self.subscribers.read().await.clone();
        for sub in &snapshot {
            let _ = sub.tx.try_send(Event {
                lifecycle,
                payload: payload.clone(),
            });
        }
    }

    /// Idempotent. Closes every subscriber channel and clears the set.
    pub async fn shutdown(&self) {
        let mut subs = self.subscribers.write().await;
        subs.clear();
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}
