//! Background fetcher that drains the fetch queue into the article cache,
//! and the supervisor that keeps it running.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio::sync::mpsc::Receiver;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use super::queue::FetchQueue;
use super::{ArticleCache, CachedArticle};
use crate::metrics::{Counter, Metrics};

/// Randomized pause between retries.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    min: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn from_config(cfg: &common::WorkerConfig) -> Self {
        Self::new(
            Duration::from_secs(cfg.backoff_min_seconds),
            Duration::from_secs(cfg.backoff_max_seconds),
        )
    }

    pub fn next_delay(&self) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

/// Fetches the full text of one article for the cache.
#[async_trait::async_trait]
pub trait ArticleSource: Send + Sync {
    async fn fetch_article(&self, id: u64) -> Result<CachedArticle>;
}

/// Releases an id from the queue's in-flight set when dropped, so a fetch
/// that panics or is aborted does not keep the id pending forever.
struct InFlight<'a> {
    queue: &'a FetchQueue,
    id: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.queue.finish(self.id);
    }
}

pub struct BackgroundFetcher {
    source: Arc<dyn ArticleSource>,
    cache: Arc<ArticleCache>,
    queue: Arc<FetchQueue>,
    rx: Arc<Mutex<Receiver<u64>>>,
    metrics: Arc<Metrics>,
    backoff: Backoff,
}

impl BackgroundFetcher {
    pub fn new(
        source: Arc<dyn ArticleSource>,
        cache: Arc<ArticleCache>,
        queue: Arc<FetchQueue>,
        rx: Receiver<u64>,
        metrics: Arc<Metrics>,
        backoff: Backoff,
    ) -> Self {
        Self {
            source,
            cache,
            queue,
            rx: Arc::new(Mutex::new(rx)),
            metrics,
            backoff,
        }
    }

    /// Pull ids one at a time until shutdown or until every producer is gone.
    pub async fn run(&self, shutdown: Arc<Notify>) -> Result<()> {
        let stop = shutdown.notified();
        tokio::pin!(stop);
        let mut rx = self.rx.lock().await;
        info!("background fetcher: waiting for work");

        loop {
            tokio::select! {
                next = rx.recv() => match next {
                    Some(id) => self.process(id).await,
                    None => {
                        info!("background fetcher: queue closed");
                        return Ok(());
                    }
                },
                _ = &mut stop => {
                    info!("background fetcher: shutdown requested, exiting loop");
                    return Ok(());
                }
            }
        }
    }

    /// Fetch and cache one article. Failures are logged, counted and backed
    /// off; they never end the loop.
    pub async fn process(&self, id: u64) {
        debug!(id, "background fetcher: fetching article");
        let in_flight = InFlight { queue: &self.queue, id };
        let result = self.fetch_and_store(id).await;
        drop(in_flight);

        match result {
            Ok(()) => self.metrics.increment(Counter::ArticlesCached),
            Err(e) => {
                self.metrics.increment(Counter::WorkerFailure);
                error!(id, "background fetcher: failed to cache article: {:#}", e);
                tokio::time::sleep(self.backoff.next_delay()).await;
            }
        }
    }

    async fn fetch_and_store(&self, id: u64) -> Result<()> {
        let article = self.source.fetch_article(id).await?;
        self.cache.store(&article).await?;
        info!(id, version = article.version, "background fetcher: article cached");
        Ok(())
    }
}

/// Run `task` until it returns `Ok`, restarting it after an error or a panic
/// with a randomized pause. Returns the number of restarts.
pub async fn supervise<F, Fut>(name: &str, mut task: F, backoff: Backoff, shutdown: Arc<Notify>) -> u32
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let stop = shutdown.notified();
    tokio::pin!(stop);
    let mut restarts = 0;

    loop {
        let mut handle = tokio::spawn(task());
        tokio::select! {
            joined = &mut handle => match joined {
                Ok(Ok(())) => {
                    info!("{} exited cleanly", name);
                    return restarts;
                }
                Ok(Err(e)) => error!("{} failed: {:#}", name, e),
                Err(join_err) => error!("{} panicked: {}", name, join_err),
            },
            _ = &mut stop => {
                info!("{}: shutdown requested", name);
                handle.abort();
                return restarts;
            }
        }

        restarts += 1;
        let delay = backoff.next_delay();
        warn!(restarts, "restarting {} in {:?}", name, delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = &mut stop => {
                info!("{}: shutdown requested", name);
                return restarts;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::queue::EnqueueOutcome;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_stays_in_bounds() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        for _ in 0..200 {
            let d = backoff.next_delay();
            assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(5), "{:?}", d);
        }
    }

    #[test]
    fn backoff_bounds_are_ordered() {
        let backoff = Backoff::new(Duration::from_millis(30), Duration::from_millis(10));
        let d = backoff.next_delay();
        assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn supervisor_restarts_after_errors_and_panics() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let restarts = supervise(
            "flaky",
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    match n {
                        0 => anyhow::bail!("transient"),
                        1 => panic!("boom"),
                        _ => Ok(()),
                    }
                }
            },
            Backoff::new(Duration::ZERO, Duration::ZERO),
            Arc::new(Notify::new()),
        )
        .await;

        assert_eq!(restarts, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn supervisor_stops_on_shutdown() {
        let shutdown = Arc::new(Notify::new());
        let sup = tokio::spawn(supervise(
            "forever",
            || async {
                std::future::pending::<()>().await;
                Ok(())
            },
            Backoff::new(Duration::ZERO, Duration::ZERO),
            shutdown.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.notify_waiters();
        let restarts = tokio::time::timeout(Duration::from_secs(2), sup)
            .await
            .expect("supervisor stopped")
            .expect("join");
        assert_eq!(restarts, 0);
    }

    struct FlakySource;

    #[async_trait::async_trait]
    impl ArticleSource for FlakySource {
        async fn fetch_article(&self, id: u64) -> Result<CachedArticle> {
            if id == 3 {
                panic!("parser blew up on {}", id);
            }
            if id % 2 == 1 {
                anyhow::bail!("upstream refused {}", id);
            }
            Ok(CachedArticle {
                id,
                version: 10,
                title: "t".into(),
                author: "a".into(),
                content: "<p>full</p>".into(),
            })
        }
    }

    fn fetcher(dir: &std::path::Path) -> (BackgroundFetcher, Arc<FetchQueue>, Arc<ArticleCache>, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let (queue, rx) = FetchQueue::new(8, metrics.clone());
        let queue = Arc::new(queue);
        let cache = Arc::new(ArticleCache::new(dir, 3000));
        let fetcher = BackgroundFetcher::new(
            Arc::new(FlakySource),
            cache.clone(),
            queue.clone(),
            rx,
            metrics.clone(),
            Backoff::new(Duration::ZERO, Duration::ZERO),
        );
        (fetcher, queue, cache, metrics)
    }

    #[tokio::test]
    async fn a_failed_article_does_not_stop_the_loop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (fetcher, queue, cache, metrics) = fetcher(dir.path());
        let fetcher = Arc::new(fetcher);
        let shutdown = Arc::new(Notify::new());

        queue.enqueue(1);
        queue.enqueue(2);

        let worker = {
            let fetcher = fetcher.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { fetcher.run(shutdown).await })
        };

        for _ in 0..100 {
            if metrics.get(Counter::ArticlesCached) == 1 && metrics.get(Counter::WorkerFailure) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.notify_waiters();
        worker.await.expect("join").expect("run");

        assert_eq!(metrics.get(Counter::WorkerFailure), 1);
        assert_eq!(metrics.get(Counter::ArticlesCached), 1);
        assert!(cache.lookup(2, 10).await.expect("lookup").is_some());
        assert!(cache.lookup(1, 0).await.expect("lookup").is_none());
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn a_panicking_fetch_releases_its_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (fetcher, queue, _cache, _metrics) = fetcher(dir.path());
        let fetcher = Arc::new(fetcher);

        assert_eq!(queue.enqueue(3), EnqueueOutcome::Queued);
        assert_eq!(queue.in_flight(), 1);

        let task = {
            let fetcher = fetcher.clone();
            tokio::spawn(async move { fetcher.process(3).await })
        };
        assert!(task.await.expect_err("fetch panicked").is_panic());

        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.enqueue(3), EnqueueOutcome::Queued);
    }
}
