//! In-process typed pub/sub for progress events.
//!
//! Publishers never block: each subscriber owns a bounded queue (default 256
//! entries) and a slow consumer only hurts itself — on overflow the oldest
//! message is dropped and a per-subscriber counter incremented. Delivery
//! order per subscriber follows publish order; there is no cross-subscriber
//! ordering guarantee. Subscribers register with a predicate over the
//! message kind and either poll ([`Subscription::try_recv`]) or block
//! ([`Subscription::recv`]).
//!
//! The HTTP streaming endpoints are plain subscribers that forward matching
//! events downstream.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;

/// Default per-subscriber queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Every message kind the engine publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    TaskStarted,
    TaskFinished,
    SubtaskAssigned,
    SubtaskStarted,
    SubtaskCompleted,
    SubtaskFailed,
    KnowledgeReloaded,
    PersonaCreated,
}

impl EventKind {
    /// Dotted wire name, e.g. `subtask.completed`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TaskStarted => "task.started",
            EventKind::TaskFinished => "task.finished",
            EventKind::SubtaskAssigned => "subtask.assigned",
            EventKind::SubtaskStarted => "subtask.started",
            EventKind::SubtaskCompleted => "subtask.completed",
            EventKind::SubtaskFailed => "subtask.failed",
            EventKind::KnowledgeReloaded => "knowledge.reloaded",
            EventKind::PersonaCreated => "persona.created",
        }
    }
}

/// One published message.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub kind: EventKind,
    pub task_id: Option<String>,
    pub subtask_id: Option<String>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl BusMessage {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            task_id: None,
            subtask_id: None,
            detail: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_subtask(mut self, subtask_id: impl Into<String>) -> Self {
        self.subtask_id = Some(subtask_id.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

struct SubscriberQueue {
    queue: Mutex<VecDeque<BusMessage>>,
    notify: Notify,
    dropped: AtomicU64,
    capacity: usize,
    predicate: Box<dyn Fn(&EventKind) -> bool + Send + Sync>,
}

/// Receiving end handed to a subscriber. Dropping it detaches the
/// subscription; the bus cleans up on the next publish.
pub struct Subscription {
    inner: Arc<SubscriberQueue>,
}

impl Subscription {
    /// Pop the next queued message without waiting.
    pub fn try_recv(&self) -> Option<BusMessage> {
        self.inner.queue.lock().expect("bus queue poisoned").pop_front()
    }

    /// Wait for the next message matching this subscription's predicate.
    pub async fn recv(&self) -> BusMessage {
        loop {
            if let Some(msg) = self.try_recv() {
                return msg;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Number of messages dropped because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

/// The engine's message bus.
pub struct MessageBus {
    subscribers: RwLock<Vec<Arc<SubscriberQueue>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Register a subscriber with the default queue capacity.
    pub fn subscribe<P>(&self, predicate: P) -> Subscription
    where
        P: Fn(&EventKind) -> bool + Send + Sync + 'static,
    {
        self.subscribe_with_capacity(predicate, DEFAULT_QUEUE_CAPACITY)
    }

    /// Register a subscriber with an explicit queue capacity.
    pub fn subscribe_with_capacity<P>(&self, predicate: P, capacity: usize) -> Subscription
    where
        P: Fn(&EventKind) -> bool + Send + Sync + 'static,
    {
        let queue = Arc::new(SubscriberQueue {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            capacity: capacity.max(1),
            predicate: Box::new(predicate),
        });
        self.subscribers
            .write()
            .expect("bus subscriber list poisoned")
            .push(Arc::clone(&queue));
        Subscription { inner: queue }
    }

    /// Deliver a message to every matching subscriber. Never blocks; a full
    /// queue drops its oldest entry.
    pub fn publish(&self, message: BusMessage) {
        let mut gone = false;
        {
            let subscribers = self.subscribers.read().expect("bus subscriber list poisoned");
            for sub in subscribers.iter() {
                // A strong count of 1 means the Subscription was dropped.
                if Arc::strong_count(sub) == 1 {
                    gone = true;
                    continue;
                }
                if !(sub.predicate)(&message.kind) {
                    continue;
                }
                {
                    let mut queue = sub.queue.lock().expect("bus queue poisoned");
                    if queue.len() >= sub.capacity {
                        queue.pop_front();
                        sub.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    queue.push_back(message.clone());
                }
                sub.notify.notify_one();
            }
        }
        if gone {
            self.subscribers
                .write()
                .expect("bus subscriber list poisoned")
                .retain(|sub| Arc::strong_count(sub) > 1);
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .expect("bus subscriber list poisoned")
            .iter()
            .filter(|sub| Arc::strong_count(sub) > 1)
            .count()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
