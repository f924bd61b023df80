//! Per-job event fan-out with history replay
//!
//! Every job has its own channel: a history buffer and a subscriber set,
//! each behind its own lock. `publish` appends to history and then offers
//! the event to every subscriber queue with `try_send`, so a slow viewer
//! loses events instead of stalling the job. `subscribe` takes the same two
//! locks in the same order, which makes the history snapshot and the
//! registration one atomic step: no event is both replayed and delivered,
//! and none falls between the two.

use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::EventsConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::events::ProgressEvent;

/// How much history each job keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryRetention {
    /// Everything for the job's lifetime
    Unbounded,
    /// The most recent `n` events; older ones are counted as truncated
    Capped(usize),
}

impl HistoryRetention {
    pub fn from_limit(limit: Option<usize>) -> Self {
        match limit {
            Some(n) => Self::Capped(n.max(1)),
            None => Self::Unbounded,
        }
    }
}

#[derive(Default)]
struct History {
    events: VecDeque<ProgressEvent>,
    truncated: u64,
    finished: bool,
}

struct SubscriberSlot {
    sender: mpsc::Sender<ProgressEvent>,
    dropped: Arc<AtomicU64>,
}

struct JobChannel {
    job_id: String,
    history: Mutex<History>,
    subscribers: Mutex<HashMap<Uuid, SubscriberSlot>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl JobChannel {
    fn new(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            history: Mutex::new(History::default()),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    fn publish(&self, event: ProgressEvent, retention: HistoryRetention) {
        let terminal = event.is_terminal();
        let mut history = lock(&self.history);
        if history.finished {
            debug!(job_id = %self.job_id, kind = ?event.kind, "Ignoring event after finished");
            return;
        }

        history.events.push_back(event.clone());
        if let HistoryRetention::Capped(cap) = retention {
            while history.events.len() > cap {
                history.events.pop_front();
                history.truncated += 1;
            }
        }

        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|id, slot| match slot.sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                if slot.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                    warn!(job_id = %self.job_id, subscriber = %id, "Subscriber queue full, dropping events");
                }
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(job_id = %self.job_id, subscriber = %id, "Subscriber went away");
                false
            }
        });

        if terminal {
            // Nothing follows the terminal event; dropping the senders lets
            // receivers drain and then observe end of stream.
            history.finished = true;
            subscribers.clear();
        }
    }

    fn subscribe(self: &Arc<Self>, capacity: usize) -> Subscription {
        let history = lock(&self.history);
        let (sender, receiver) = mpsc::channel(capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        let id = Uuid::new_v4();

        if !history.finished {
            lock(&self.subscribers).insert(
                id,
                SubscriberSlot {
                    sender,
                    dropped: dropped.clone(),
                },
            );
        }

        Subscription {
            id,
            job_id: self.job_id.clone(),
            history: history.events.iter().cloned().collect(),
            truncated: history.truncated,
            receiver,
            dropped,
            channel: Arc::downgrade(self),
        }
    }

    fn unsubscribe(&self, id: &Uuid) -> bool {
        lock(&self.subscribers).remove(id).is_some()
    }
}

/// Per-job publish/subscribe hub
pub struct EventBroadcaster {
    channels: RwLock<HashMap<String, Arc<JobChannel>>>,
    capacity: usize,
    retention: HistoryRetention,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(&EventsConfig::default())
    }
}

impl EventBroadcaster {
    pub fn new(config: &EventsConfig) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: config.subscriber_capacity.max(1),
            retention: HistoryRetention::from_limit(config.history_limit),
        }
    }

    pub fn retention(&self) -> HistoryRetention {
        self.retention
    }

    fn channel(&self, job_id: &str) -> Option<Arc<JobChannel>> {
        self.channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(job_id)
            .cloned()
    }

    fn channel_or_create(&self, job_id: &str) -> Arc<JobChannel> {
        if let Some(channel) = self.channel(job_id) {
            return channel;
        }
        self.channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(JobChannel::new(job_id)))
            .clone()
    }

    /// Create the job's channel ahead of its first event
    pub fn open(&self, job_id: &str) {
        self.channel_or_create(job_id);
    }

    /// Append to the job's history and offer the event to every subscriber.
    /// Events for a job that was never opened, or already removed, are discarded.
    pub fn publish(&self, job_id: &str, event: ProgressEvent) {
        match self.channel(job_id) {
            Some(channel) => channel.publish(event, self.retention),
            None => debug!(job_id, kind = ?event.kind, "No channel for job, event discarded"),
        }
    }

    /// Register a subscriber, returning the history snapshot taken
    /// atomically with the registration
    pub fn subscribe(&self, job_id: &str) -> CoordinatorResult<Subscription> {
        let channel = self
            .channel(job_id)
            .ok_or_else(|| CoordinatorError::JobNotFound(job_id.to_string()))?;
        Ok(channel.subscribe(self.capacity))
    }

    /// Copy of the job's retained history
    pub fn history(&self, job_id: &str) -> Vec<ProgressEvent> {
        self.channel(job_id)
            .map(|c| lock(&c.history).events.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, job_id: &str) -> usize {
        self.channel(job_id)
            .map(|c| lock(&c.subscribers).len())
            .unwrap_or(0)
    }

    /// Forget a job's channel; existing subscriptions keep what they hold
    pub fn remove(&self, job_id: &str) {
        self.channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(job_id);
    }
}

/// A live view of one job's events
///
/// Holds the replayed history and a bounded queue of events published after
/// registration. Dropping it unsubscribes.
pub struct Subscription {
    id: Uuid,
    job_id: String,
    history: Vec<ProgressEvent>,
    truncated: u64,
    receiver: mpsc::Receiver<ProgressEvent>,
    dropped: Arc<AtomicU64>,
    channel: Weak<JobChannel>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("job_id", &self.job_id)
            .field("history", &self.history.len())
            .field("truncated", &self.truncated)
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl Subscription {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Events published before registration
    pub fn history(&self) -> &[ProgressEvent] {
        &self.history
    }

    /// Events that fell out of a capped history before this subscription
    pub fn truncated(&self) -> u64 {
        self.truncated
    }

    /// Live events lost because this subscriber's queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Next live event; `None` once the job has finished and the queue is
    /// drained, or after [`unsubscribe`](Self::unsubscribe)
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.receiver.recv().await
    }

    /// Stop receiving. Safe to call repeatedly and concurrently with publish.
    pub fn unsubscribe(&self) {
        if let Some(channel) = self.channel.upgrade() {
            if channel.unsubscribe(&self.id) {
                debug!(job_id = %self.job_id, subscriber = %self.id, "Unsubscribed");
            }
        }
    }

    /// History followed by live events, ending after the terminal event
    pub fn into_events(mut self) -> BoxStream<'static, ProgressEvent> {
        let replay: VecDeque<ProgressEvent> = std::mem::take(&mut self.history).into();
        stream::unfold((replay, self, false), |(mut replay, mut sub, done)| async move {
            if done {
                return None;
            }
            let event = match replay.pop_front() {
                Some(event) => event,
                None => sub.recv().await?,
            };
            let done = event.is_terminal();
            Some((event, (replay, sub, done)))
        })
        .boxed()
    }

    /// [`into_events`](Self::into_events) encoded as NDJSON lines
    pub fn into_ndjson(self) -> BoxStream<'static, String> {
        self.into_events().filter_map(|event| {
            let line = match event.to_ndjson() {
                Ok(line) => Some(line),
                Err(e) => {
                    warn!(error = %e, "Failed to encode event");
                    None
                }
            };
            futures::future::ready(line)
        })
        .boxed()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
