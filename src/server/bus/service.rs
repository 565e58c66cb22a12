//! Process-wide publish/subscribe of scan events, keyed by task.
//!
//! Every subscription owns a bounded FIFO queue. Publishing never waits on
//! a consumer: when a queue is full the oldest event is dropped and the
//! subscription's drop counter incremented, so a slow stream client can
//! observe exactly how much it missed (sequence gaps equal the counter).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, RwLock};
use uuid::Uuid;

use crate::server::scanner::events::ScanEvent;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

struct SubscriptionShared {
    queue: Mutex<VecDeque<ScanEvent>>,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

impl SubscriptionShared {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    async fn push(&self, event: ScanEvent) {
        {
            let mut queue = self.queue.lock().await;
            if queue.len() == self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

/// A single client's queued view onto a topic (or onto every topic).
/// Dropping it tears the subscription down.
pub struct Subscription {
    pub subscription_id: Uuid,
    pub created_at: DateTime<Utc>,
    shared: Arc<SubscriptionShared>,
}

impl Subscription {
    /// Next event in publish order; `None` once the topic is closed and
    /// the queue has drained
    pub async fn next(&self) -> Option<ScanEvent> {
        loop {
            {
                let mut queue = self.shared.queue.lock().await;
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
            }
            if self.shared.closed.load(Ordering::Acquire) {
                // Closed may race a final push; drain once more
                let mut queue = self.shared.queue.lock().await;
                return queue.pop_front();
            }
            self.shared.notify.notified().await;
        }
    }

    /// Events lost to the queue bound so far
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

struct Topic {
    subscribers: Mutex<Vec<Weak<SubscriptionShared>>>,
    closed: AtomicBool,
}

impl Topic {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }
}

pub struct EventBus {
    topics: RwLock<HashMap<Uuid, Arc<Topic>>>,
    watchers: Mutex<Vec<Weak<SubscriptionShared>>>,
    queue_capacity: usize,
}

impl EventBus {
    pub fn new(queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            topics: RwLock::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
            queue_capacity,
        })
    }

    /// Enqueue to every live subscription on the event's task topic and to
    /// every all-tasks watcher. Never waits on a slow consumer.
    pub async fn publish(&self, event: ScanEvent) {
        let topic = {
            let topics = self.topics.read().await;
            topics.get(&event.task_id).cloned()
        };

        if let Some(topic) = topic {
            let mut subscribers = topic.subscribers.lock().await;
            subscribers.retain(|weak| weak.upgrade().is_some());
            for weak in subscribers.iter() {
                if let Some(shared) = weak.upgrade() {
                    shared.push(event.clone()).await;
                }
            }
        }

        let mut watchers = self.watchers.lock().await;
        watchers.retain(|weak| weak.upgrade().is_some());
        for weak in watchers.iter() {
            if let Some(shared) = weak.upgrade() {
                shared.push(event.clone()).await;
            }
        }
    }

    /// Subscribe to a single task's topic. Subscribing to a topic that was
    /// already closed yields an immediately-terminal subscription.
    pub async fn subscribe(&self, task_id: Uuid) -> Subscription {
        let topic = {
            let mut topics = self.topics.write().await;
            topics.entry(task_id).or_insert_with(Topic::new).clone()
        };

        let shared = SubscriptionShared::new(self.queue_capacity);
        if topic.closed.load(Ordering::Acquire) {
            shared.close();
        } else {
            topic.subscribers.lock().await.push(Arc::downgrade(&shared));
        }

        Subscription {
            subscription_id: Uuid::new_v4(),
            created_at: Utc::now(),
            shared,
        }
    }

    /// Subscribe to every task, current and future. Only bus shutdown
    /// terminates such a subscription.
    pub async fn subscribe_all(&self) -> Subscription {
        let shared = SubscriptionShared::new(self.queue_capacity);
        self.watchers.lock().await.push(Arc::downgrade(&shared));
        Subscription {
            subscription_id: Uuid::new_v4(),
            created_at: Utc::now(),
            shared,
        }
    }

    /// Idempotent teardown; dropping the handle has the same effect
    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    /// Mark a topic complete: subscribers drain their queues and then see
    /// end-of-stream
    pub async fn close(&self, task_id: Uuid) {
        let topic = {
            let topics = self.topics.read().await;
            topics.get(&task_id).cloned()
        };
        let Some(topic) = topic else { return };

        topic.closed.store(true, Ordering::Release);
        let subscribers = topic.subscribers.lock().await;
        for weak in subscribers.iter() {
            if let Some(shared) = weak.upgrade() {
                shared.close();
            }
        }
    }

    /// Drop closed topics that no longer have live subscribers; run
    /// periodically
    pub async fn purge_closed(&self) {
        let mut topics = self.topics.write().await;
        let mut to_remove = Vec::new();
        for (task_id, topic) in topics.iter() {
            if !topic.closed.load(Ordering::Acquire) {
                continue;
            }
            let mut subscribers = topic.subscribers.lock().await;
            subscribers.retain(|weak| weak.upgrade().is_some());
            if subscribers.is_empty() {
                to_remove.push(*task_id);
            }
        }
        for task_id in to_remove {
            topics.remove(&task_id);
        }
    }

    /// Close every topic and watcher; used on server shutdown
    pub async fn shutdown(&self) {
        let topics: Vec<Uuid> = self.topics.read().await.keys().copied().collect();
        for task_id in topics {
            self.close(task_id).await;
        }
        let watchers = self.watchers.lock().await;
        for weak in watchers.iter() {
            if let Some(shared) = weak.upgrade() {
                shared.close();
            }
        }
    }
}
