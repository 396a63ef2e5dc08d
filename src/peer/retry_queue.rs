use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::message::Message;

/// Fired exactly once when a queued message expires undelivered.
pub type OnTimeoutFn =
    Box<dyn (FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync>;

pub(crate) struct RetryQueueEntry {
    pub message: Message,
    pub on_timeout: Option<OnTimeoutFn>,
    pub timeout: Option<Duration>,
    pub enqueued_at: Instant,
}

impl RetryQueueEntry {
    pub fn new(message: Message, timeout: Option<Duration>, on_timeout: Option<OnTimeoutFn>) -> Self {
        RetryQueueEntry {
            message,
            on_timeout,
            timeout,
            enqueued_at: Instant::now(),
        }
    }

    pub fn expired(&self, now: Instant) -> bool {
        match self.timeout {
            Some(timeout) => now.duration_since(self.enqueued_at) > timeout,
            None => false,
        }
    }
}

/// Messages that could not be delivered yet, waiting for their destination
/// to connect. An entry leaves the queue exactly two ways: delivered once
/// the connection opens, or expired past its own timeout.
#[derive(Default)]
pub(crate) struct RetryQueue {
    entries: Mutex<Vec<RetryQueueEntry>>,
}

impl RetryQueue {
    pub fn new() -> Self {
        RetryQueue::default()
    }

    pub async fn push(&self, entry: RetryQueueEntry) {
        self.entries.lock().await.push(entry);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Removes and returns the entries addressed to `remote`, preserving
    /// enqueue order. Used when a connection to `remote` opens.
    pub async fn take_for(&self, remote: &str) -> Vec<RetryQueueEntry> {
        let mut entries = self.entries.lock().await;
        let mut taken = vec![];
        let mut kept = vec![];
        for entry in entries.drain(..) {
            if entry.message.to == remote {
                taken.push(entry);
            } else {
                kept.push(entry);
            }
        }
        *entries = kept;
        taken
    }

    /// Empties the queue for one tick pass.
    pub async fn drain_all(&self) -> Vec<RetryQueueEntry> {
        let mut entries = self.entries.lock().await;
        entries.drain(..).collect()
    }

    /// Returns surviving entries to the front, ahead of anything enqueued
    /// while the tick was processing.
    pub async fn requeue_front(&self, mut kept: Vec<RetryQueueEntry>) {
        let mut entries = self.entries.lock().await;
        kept.append(&mut entries);
        *entries = kept;
    }
}
