//! Rotating pool of forward-proxy egress points with adaptive scoring.
//!
//! Scores are read when an endpoint is checked out and written back after
//! the request finishes. Concurrent requests scoring the same endpoint may
//! overwrite each other's update; removal of an endpoint that is already
//! gone is a no-op.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub address: String,
    pub score: u32,
}

/// How a proxied attempt went, from the pool's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxySignal {
    /// Connect timeout or a 403 from upstream.
    HardFailure,
    /// Upstream redirected to its bot challenge: evict immediately.
    BotChallenge,
    Success,
}

pub fn next_score(score: u32, signal: ProxySignal) -> u32 {
    match signal {
        ProxySignal::HardFailure => score / 2,
        ProxySignal::BotChallenge => 0,
        ProxySignal::Success => score.saturating_add(1),
    }
}

/// Where fresh proxy addresses come from.
#[async_trait::async_trait]
pub trait ProxySource: Send + Sync {
    async fn fetch_proxies(&self) -> Result<Vec<String>>;
}

/// Plain-text list served over HTTP, one `host:port` per line.
pub struct HttpProxyList {
    url: String,
    client: reqwest::Client,
}

impl HttpProxyList {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait::async_trait]
impl ProxySource for HttpProxyList {
    async fn fetch_proxies(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .context("failed to fetch proxy list")?;
        if !response.status().is_success() {
            anyhow::bail!("proxy list fetch failed with status: {}", response.status());
        }
        let body = response.text().await.context("failed to read proxy list")?;
        Ok(parse_proxy_list(&body))
    }
}

/// Keep well-formed `host:port` lines the HTTP client accepts as a proxy;
/// skip blanks, comments and junk.
pub fn parse_proxy_list(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter(|l| match l.rsplit_once(':') {
            Some((host, port))
                if !host.is_empty()
                    && port.parse::<u16>().is_ok()
                    && reqwest::Proxy::all(format!("http://{}", l)).is_ok() =>
            {
                true
            }
            _ => {
                debug!("skipping malformed proxy entry: {:?}", l);
                false
            }
        })
        .map(str::to_string)
        .collect()
}

pub struct ProxyPool {
    endpoints: Mutex<Vec<ProxyEndpoint>>,
    source: Box<dyn ProxySource>,
    low_water: usize,
    initial_score: u32,
}

impl ProxyPool {
    pub fn new(source: Box<dyn ProxySource>, low_water: usize, initial_score: u32) -> Self {
        Self {
            endpoints: Mutex::new(Vec::new()),
            source,
            low_water,
            initial_score: initial_score.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ProxyEndpoint>> {
        // A poisoned pool only means a panic mid-update; the data is still usable.
        self.endpoints.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn score_of(&self, address: &str) -> Option<u32> {
        self.lock()
            .iter()
            .find(|e| e.address == address)
            .map(|e| e.score)
    }

    /// Pick a uniformly random endpoint, refilling first when running low.
    pub async fn checkout(&self) -> Option<ProxyEndpoint> {
        if self.len() < self.low_water {
            self.refill().await;
        }
        let endpoints = self.lock();
        endpoints.choose(&mut rand::thread_rng()).cloned()
    }

    pub async fn refill(&self) {
        match self.source.fetch_proxies().await {
            Ok(addresses) => {
                let mut endpoints = self.lock();
                let before = endpoints.len();
                for address in addresses {
                    if !endpoints.iter().any(|e| e.address == address) {
                        endpoints.push(ProxyEndpoint {
                            address,
                            score: self.initial_score,
                        });
                    }
                }
                info!("proxy pool refilled: {} -> {} endpoints", before, endpoints.len());
            }
            Err(e) => warn!("failed to refill proxy pool: {:#}", e),
        }
    }

    /// Apply the outcome of a request made through `endpoint`.
    pub fn report(&self, endpoint: &ProxyEndpoint, signal: ProxySignal) {
        let score = next_score(endpoint.score, signal);
        let mut endpoints = self.lock();
        let pos = endpoints.iter().position(|e| e.address == endpoint.address);
        match (pos, score) {
            (Some(pos), 0) => {
                endpoints.remove(pos);
                info!("proxy {} evicted", endpoint.address);
            }
            (Some(pos), score) => endpoints[pos].score = score,
            (None, _) => debug!("proxy {} already removed", endpoint.address),
        }
    }

    /// Drop `endpoint` regardless of its score.
    pub fn evict(&self, endpoint: &ProxyEndpoint) {
        let mut endpoints = self.lock();
        let before = endpoints.len();
        endpoints.retain(|e| e.address != endpoint.address);
        if endpoints.len() < before {
            info!("proxy {} evicted", endpoint.address);
        }
    }
}
