/*!
common/src/lib.rs

Shared configuration types for Feedwright.

This file provides:
- Config data structures (deserialized from TOML), every section defaulted
- An async loader that layers an override file on top of a defaults file
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// HTTP server configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    /// Emit plain-text error chains instead of the HTML status page
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 8000,
            debug: false,
        }
    }
}

/// Upstream sites and outbound request defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub timeout_seconds: u64,
    /// Browser identity sent when a caller does not set its own User-Agent
    pub user_agent: String,
    pub zhihu_api: String,
    pub zhihu_www: String,
    pub zhihu_zhuanlan: String,
    pub v2ex: String,
    pub telegram: String,
    pub jike: String,
    /// Matters GraphQL endpoint
    pub matters_api: String,
    pub matters_www: String,
    /// Scheme used to reach the self-hosted Gogs instance named in the route
    pub gogs_scheme: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 20,
            user_agent: "Mozilla/5.0 (X11; Linux x86_64; rv:126.0) Gecko/20100101 Firefox/126.0"
                .to_string(),
            zhihu_api: "https://www.zhihu.com/api/v4".to_string(),
            zhihu_www: "https://www.zhihu.com".to_string(),
            zhihu_zhuanlan: "https://zhuanlan.zhihu.com".to_string(),
            v2ex: "https://www.v2ex.com".to_string(),
            telegram: "https://t.me".to_string(),
            jike: "https://m.okjike.com".to_string(),
            matters_api: "https://server.matters.news/graphql".to_string(),
            matters_www: "https://matters.news".to_string(),
            gogs_scheme: "https".to_string(),
        }
    }
}

/// Rotating forward-proxy pool (used for Zhihu only)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub enabled: bool,
    /// Plain-text list of `host:port` lines
    pub list_url: Option<String>,
    /// Refill the pool from `list_url` when it holds fewer endpoints than this
    pub low_water: usize,
    pub initial_score: u32,
    pub request_timeout_seconds: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            list_url: None,
            low_water: 10,
            initial_score: 10,
            request_timeout_seconds: 10,
        }
    }
}

/// On-disk article cache and fill queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub root: String,
    pub shard_size: u64,
    pub queue_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: "data/articles".to_string(),
            shard_size: 3000,
            queue_capacity: 50,
        }
    }
}

/// Background fetcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub backoff_min_seconds: u64,
    pub backoff_max_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backoff_min_seconds: 1,
            backoff_max_seconds: 5,
        }
    }
}

/// Pagination limits shared by the feed assemblers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub target_items: usize,
    pub max_pages: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            target_items: 20,
            max_pages: 3,
        }
    }
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub proxy: ProxyConfig,
    pub cache: CacheConfig,
    pub worker: WorkerConfig,
    pub feed: FeedConfig,
}

impl Config {
    /// Load configuration from a TOML file asynchronously.
    ///
    /// Example:
    ///   let cfg = Config::from_file("config.toml").await?;
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(default_path: Option<&Path>, override_path: Option<&Path>) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        for (path, label) in [(default_path, "default"), (override_path, "override")] {
            let Some(path) = path else { continue };
            if !path.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(path).await
                .with_context(|| format!("Failed to read {} config: {}", label, path.display()))?;
            let val: toml::Value = toml::from_str(&data)
                .with_context(|| format!("Failed to parse {} configuration", label))?;
            merge_toml(&mut config_value, val);
        }

        let cfg: Config = config_value.try_into().context("Failed to parse merged configuration")?;
        Ok(cfg)
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg: Config = toml::from_str("").expect("parse config");
        assert_eq!(cfg.server.port, 8000);
        assert_eq!(cfg.cache.shard_size, 3000);
        assert_eq!(cfg.cache.queue_capacity, 50);
        assert_eq!(cfg.proxy.low_water, 10);
        assert_eq!(cfg.feed.target_items, 20);
        assert_eq!(cfg.feed.max_pages, 3);
        assert!(!cfg.proxy.enabled);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let toml = r#"
            [server]
            port = 9090

            [proxy]
            enabled = true
            list_url = "http://127.0.0.1:1/proxies.txt"
        "#;

        let cfg: Config = toml::from_str(toml).expect("parse config");
        assert_eq!(cfg.server.port, 9090);
        assert_eq!(cfg.server.address, "127.0.0.1");
        assert!(cfg.proxy.enabled);
        assert_eq!(cfg.proxy.initial_score, 10);
    }

    #[tokio::test]
    async fn override_file_wins_key_by_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let default_path = dir.path().join("config.default.toml");
        let override_path = dir.path().join("config.toml");

        std::fs::write(
            &default_path,
            "[server]\nport = 8100\ndebug = true\n\n[cache]\nroot = \"/var/cache/fw\"\n",
        )
        .expect("write default");
        std::fs::write(&override_path, "[server]\nport = 8200\n").expect("write override");

        let cfg = Config::load_with_defaults(Some(&default_path), Some(&override_path))
            .await
            .expect("load config");

        assert_eq!(cfg.server.port, 8200);
        assert!(cfg.server.debug);
        assert_eq!(cfg.cache.root, "/var/cache/fw");
    }

    #[tokio::test]
    async fn missing_files_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope.toml");
        let cfg = Config::load_with_defaults(Some(&missing), None)
            .await
            .expect("load config");
        assert_eq!(cfg.upstream.timeout_seconds, 20);
    }
}
