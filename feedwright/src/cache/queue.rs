//! Bounded, best-effort queue of article ids awaiting a background fetch.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tracing::{debug, warn};

use crate::metrics::{Counter, Metrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Already waiting or being fetched.
    AlreadyQueued,
    /// Queue at capacity (or worker gone); the request was discarded.
    Dropped,
}

/// Producer side, shared by every feed render.
pub struct FetchQueue {
    tx: Sender<u64>,
    pending: Mutex<HashSet<u64>>,
    metrics: Arc<Metrics>,
}

impl FetchQueue {
    /// Create the queue and the receiver the background fetcher drains.
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> (Self, Receiver<u64>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let queue = Self {
            tx,
            pending: Mutex::new(HashSet::new()),
            metrics,
        };
        (queue, rx)
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashSet<u64>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Never blocks. Callers must not rely on eventual delivery.
    pub fn enqueue(&self, id: u64) -> EnqueueOutcome {
        let mut pending = self.pending();
        if pending.contains(&id) {
            return EnqueueOutcome::AlreadyQueued;
        }

        match self.tx.try_send(id) {
            Ok(()) => {
                pending.insert(id);
                debug!(id, "article queued for background fetch");
                EnqueueOutcome::Queued
            }
            Err(TrySendError::Full(_)) => {
                self.metrics.increment(Counter::QueueFull);
                warn!(id, "fetch queue full; dropping request");
                EnqueueOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.increment(Counter::QueueFull);
                warn!(id, "fetch queue closed; dropping request");
                EnqueueOutcome::Dropped
            }
        }
    }

    /// Mark `id` as no longer in flight, whether or not the fetch succeeded,
    /// so a later render may queue it again.
    pub fn finish(&self, id: u64) {
        self.pending().remove(&id);
    }

    /// Ids queued or being fetched.
    pub fn in_flight(&self) -> usize {
        self.pending().len()
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_drops_and_counts_each_attempt() {
        let metrics = Arc::new(Metrics::new());
        let (queue, _rx) = FetchQueue::new(2, metrics.clone());

        assert_eq!(queue.enqueue(1), EnqueueOutcome::Queued);
        assert_eq!(queue.enqueue(2), EnqueueOutcome::Queued);
        assert_eq!(queue.enqueue(3), EnqueueOutcome::Dropped);
        assert_eq!(metrics.get(Counter::QueueFull), 1);
        assert_eq!(queue.enqueue(4), EnqueueOutcome::Dropped);
        assert_eq!(metrics.get(Counter::QueueFull), 2);
        assert_eq!(queue.in_flight(), 2);
    }

    #[test]
    fn duplicate_ids_are_not_queued_twice() {
        let metrics = Arc::new(Metrics::new());
        let (queue, _rx) = FetchQueue::new(2, metrics.clone());

        assert_eq!(queue.enqueue(7), EnqueueOutcome::Queued);
        assert_eq!(queue.enqueue(7), EnqueueOutcome::AlreadyQueued);
        assert_eq!(metrics.get(Counter::QueueFull), 0);
    }

    #[tokio::test]
    async fn finished_ids_can_be_requeued() {
        let metrics = Arc::new(Metrics::new());
        let (queue, mut rx) = FetchQueue::new(1, metrics);

        assert_eq!(queue.enqueue(11), EnqueueOutcome::Queued);
        assert_eq!(rx.recv().await, Some(11));
        queue.finish(11);
        assert_eq!(queue.enqueue(11), EnqueueOutcome::Queued);
    }

    #[test]
    fn closed_queue_drops() {
        let metrics = Arc::new(Metrics::new());
        let (queue, rx) = FetchQueue::new(4, metrics.clone());
        drop(rx);
        assert_eq!(queue.enqueue(1), EnqueueOutcome::Dropped);
        assert_eq!(metrics.get(Counter::QueueFull), 1);
    }
}
