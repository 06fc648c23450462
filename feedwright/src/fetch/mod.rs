//! Outbound requests against hostile upstreams.
//!
//! Redirects are never followed by the transport; [`UpstreamClient::fetch`]
//! inspects every answer and folds the soft-block signals (bot challenge,
//! login wall, suspension, throttling) into [`FeedError`] kinds.

pub mod proxy;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, LOCATION, USER_AGENT};
use reqwest::redirect::Policy;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use crate::error::FeedError;
use proxy::{ProxyPool, ProxySignal};

/// Per-request knobs.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Substring the upstream puts in a redirect target or error body when it
    /// suspects automation.
    pub bot_marker: Option<&'static str>,
    /// Route through the rotating proxy pool when one is configured.
    pub use_proxy: bool,
}

/// A fully buffered upstream answer.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub url: String,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl UpstreamResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FeedError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn location(&self) -> Option<&str> {
        self.headers.get(LOCATION).and_then(|v| v.to_str().ok())
    }

    fn body_contains(&self, needle: &str) -> bool {
        !needle.is_empty()
            && self
                .body
                .windows(needle.len())
                .any(|w| w == needle.as_bytes())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Accept,
    Follow(String),
}

/// Map an upstream answer onto the feed error taxonomy.
fn classify(res: &UpstreamResponse, bot_marker: Option<&str>, may_follow: bool) -> Result<Verdict, FeedError> {
    let is_bot_marked = |s: &str| bot_marker.map_or(false, |m| s.contains(m));

    match res.status.as_u16() {
        404 => Err(FeedError::NotFound),
        429 => Err(FeedError::RateLimited(format!("upstream answered {}", res.status))),
        // 410: only logged-in users may see it; 401: suspended account.
        410 | 401 => Err(FeedError::Forbidden(format!("upstream answered {}", res.status))),
        302 if res.location().map_or(false, is_bot_marked) => {
            Err(FeedError::RateLimited("likely-bot redirect from upstream".to_string()))
        }
        302 => Ok(Verdict::Accept),
        403 if bot_marker.map_or(false, |m| res.body_contains(m)) => {
            Err(FeedError::RateLimited("likely-bot challenge from upstream".to_string()))
        }
        301 if may_follow => match res.location() {
            Some(loc) => Ok(Verdict::Follow(loc.to_string())),
            None => Err(FeedError::UpstreamStatus(res.status)),
        },
        301 => Ok(Verdict::Accept),
        _ if res.status.is_success() => Ok(Verdict::Accept),
        _ => {
            error!("error fetching url: {} ({})", res.url, res.status);
            Err(FeedError::UpstreamStatus(res.status))
        }
    }
}

pub struct UpstreamClient {
    client: Client,
    user_agent: HeaderValue,
    proxies: Option<Arc<ProxyPool>>,
    proxy_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(cfg: &common::UpstreamConfig, proxy_cfg: &common::ProxyConfig, proxies: Option<Arc<ProxyPool>>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .redirect(Policy::none())
            .gzip(true)
            .build()
            .context("failed to build reqwest client")?;

        Ok(Self {
            client,
            user_agent: HeaderValue::from_str(&cfg.user_agent).context("invalid user agent")?,
            proxies,
            proxy_timeout: Duration::from_secs(proxy_cfg.request_timeout_seconds),
        })
    }

    /// GET `url`, classifying the answer. A 301 is followed exactly once.
    pub async fn fetch(&self, url: &str, headers: HeaderMap, opts: &FetchOptions) -> Result<UpstreamResponse, FeedError> {
        let started = Instant::now();
        let res = self.send(url, &headers, None, opts).await?;
        debug!(url, status = %res.status, ms = started.elapsed().as_millis() as u64, "upstream answered");

        match classify(&res, opts.bot_marker, true)? {
            Verdict::Accept => Ok(res),
            Verdict::Follow(location) => {
                let next = resolve_location(url, &location);
                debug!(from = url, to = %next, "following permanent redirect once");
                let res = self.send(&next, &headers, None, opts).await?;
                classify(&res, opts.bot_marker, false)?;
                Ok(res)
            }
        }
    }

    /// GET and decode a JSON body.
    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str, headers: HeaderMap, opts: &FetchOptions) -> Result<T, FeedError> {
        self.fetch(url, headers, opts).await?.json()
    }

    /// POST a JSON document and decode the JSON answer. Redirects are not
    /// followed.
    pub async fn post_json<T: DeserializeOwned>(
        &self,
        url: &str,
        body: &serde_json::Value,
        opts: &FetchOptions,
    ) -> Result<T, FeedError> {
        let res = self.send(url, &HeaderMap::new(), Some(body), opts).await?;
        debug!(url, status = %res.status, "upstream answered POST");
        classify(&res, opts.bot_marker, false)?;
        res.json()
    }

    /// GET and decode the body as (lossy) UTF-8.
    pub async fn fetch_text(&self, url: &str, opts: &FetchOptions) -> Result<String, FeedError> {
        Ok(self.fetch(url, HeaderMap::new(), opts).await?.text())
    }

    async fn send(
        &self,
        url: &str,
        headers: &HeaderMap,
        body: Option<&serde_json::Value>,
        opts: &FetchOptions,
    ) -> Result<UpstreamResponse, FeedError> {
        match (&self.proxies, opts.use_proxy) {
            (Some(pool), true) => self.send_via_proxy(pool, url, headers, body, opts).await,
            _ => Ok(self.send_with(&self.client, url, headers, body).await?),
        }
    }

    async fn send_via_proxy(
        &self,
        pool: &ProxyPool,
        url: &str,
        headers: &HeaderMap,
        body: Option<&serde_json::Value>,
        opts: &FetchOptions,
    ) -> Result<UpstreamResponse, FeedError> {
        let Some(endpoint) = pool.checkout().await else {
            warn!("proxy pool exhausted; fetching {} directly", url);
            return Ok(self.send_with(&self.client, url, headers, body).await?);
        };

        let client = match self.proxied_client(&endpoint.address) {
            Ok(client) => client,
            Err(e) => {
                warn!("unusable proxy {:?}, fetching {} directly: {:#}", endpoint.address, url, e);
                pool.evict(&endpoint);
                return Ok(self.send_with(&self.client, url, headers, body).await?);
            }
        };

        let result = self.send_with(&client, url, headers, body).await;
        let signal = match &result {
            Err(e) if e.is_timeout() || e.is_connect() => ProxySignal::HardFailure,
            Ok(res) if res.status == StatusCode::FORBIDDEN => ProxySignal::HardFailure,
            Ok(res)
                if res.status == StatusCode::FOUND
                    && matches!((res.location(), opts.bot_marker), (Some(l), Some(m)) if l.contains(m)) =>
            {
                warn!("proxy {} is flagged as a bot by upstream", endpoint.address);
                ProxySignal::BotChallenge
            }
            _ => ProxySignal::Success,
        };
        pool.report(&endpoint, signal);

        Ok(result?)
    }

    fn proxied_client(&self, address: &str) -> anyhow::Result<Client> {
        Client::builder()
            .proxy(reqwest::Proxy::all(format!("http://{}", address)).context("invalid proxy address")?)
            .timeout(self.proxy_timeout)
            .danger_accept_invalid_certs(true)
            .redirect(Policy::none())
            .gzip(true)
            .build()
            .context("failed to build proxied reqwest client")
    }

    /// GET, or POST when a JSON body is given.
    async fn send_with(
        &self,
        client: &Client,
        url: &str,
        headers: &HeaderMap,
        body: Option<&serde_json::Value>,
    ) -> Result<UpstreamResponse, reqwest::Error> {
        let mut headers = headers.clone();
        if !headers.contains_key(USER_AGENT) {
            headers.insert(USER_AGENT, self.user_agent.clone());
        }

        let request = match body {
            Some(body) => client.post(url).json(body),
            None => client.get(url),
        };
        let response = request.headers(headers).send().await?;
        let status = response.status();
        let resp_headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        Ok(UpstreamResponse {
            url: url.to_string(),
            status,
            headers: resp_headers,
            body,
        })
    }
}

fn resolve_location(base: &str, location: &str) -> String {
    url::Url::parse(base)
        .and_then(|b| b.join(location))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| location.to_string())
}
