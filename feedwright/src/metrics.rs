use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process-wide counters, owned by the application context.
#[derive(Debug, Default)]
pub struct Metrics {
    cache_hit: AtomicU64,
    cache_miss: AtomicU64,
    queue_full: AtomicU64,
    worker_failure: AtomicU64,
    articles_cached: AtomicU64,
}

/// Counter names accepted by [`Metrics::increment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    CacheHit,
    CacheMiss,
    QueueFull,
    WorkerFailure,
    ArticlesCached,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub cache_hit: u64,
    pub cache_miss: u64,
    pub queue_full: u64,
    pub worker_failure: u64,
    pub articles_cached: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, c: Counter) -> &AtomicU64 {
        match c {
            Counter::CacheHit => &self.cache_hit,
            Counter::CacheMiss => &self.cache_miss,
            Counter::QueueFull => &self.queue_full,
            Counter::WorkerFailure => &self.worker_failure,
            Counter::ArticlesCached => &self.articles_cached,
        }
    }

    pub fn increment(&self, c: Counter) {
        self.counter(c).fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, c: Counter) -> u64 {
        self.counter(c).load(Ordering::Relaxed)
    }

    /// Timings are only logged; there is no aggregation in-process.
    pub fn timing(&self, name: &str, ms: u128) {
        tracing::debug!(metric = name, ms, "timing");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_hit: self.get(Counter::CacheHit),
            cache_miss: self.get(Counter::CacheMiss),
            queue_full: self.get(Counter::QueueFull),
            worker_failure: self.get(Counter::WorkerFailure),
            articles_cached: self.get(Counter::ArticlesCached),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_independent() {
        let m = Metrics::new();
        m.increment(Counter::CacheHit);
        m.increment(Counter::CacheHit);
        m.increment(Counter::QueueFull);

        let snap = m.snapshot();
        assert_eq!(snap.cache_hit, 2);
        assert_eq!(snap.queue_full, 1);
        assert_eq!(snap.cache_miss, 0);
    }
}
