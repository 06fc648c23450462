//! Sharded, gzip-compressed on-disk article cache.
//!
//! Layout: `{root}/{id / shard_size}/{id % shard_size}/{version}.json.gz`.
//! Versions are never overwritten or deleted; a newer upstream revision
//! simply lands next to the older ones.

pub mod queue;
pub mod worker;

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const SUFFIX: &str = ".json.gz";

/// Full text of one article as fetched by the background worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedArticle {
    pub id: u64,
    /// Upstream "last updated" stamp.
    pub version: i64,
    pub title: String,
    pub author: String,
    /// Normalized HTML body.
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ArticleCache {
    root: PathBuf,
    shard_size: u64,
}

impl ArticleCache {
    pub fn new(root: impl Into<PathBuf>, shard_size: u64) -> Self {
        Self {
            root: root.into(),
            shard_size: shard_size.max(1),
        }
    }

    pub fn from_config(cfg: &common::CacheConfig) -> Self {
        Self::new(&cfg.root, cfg.shard_size)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_for(&self, id: u64) -> PathBuf {
        self.root
            .join((id / self.shard_size).to_string())
            .join((id % self.shard_size).to_string())
    }

    pub fn path_for(&self, id: u64, version: i64) -> PathBuf {
        self.dir_for(id).join(format!("{}{}", version, SUFFIX))
    }

    /// Versions present on disk for `id`, unordered. Stray files are ignored.
    async fn versions(&self, id: u64) -> Result<Vec<i64>> {
        let dir = self.dir_for(id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to list cache dir {}", dir.display()))
            }
        };

        let mut versions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let parsed = name
                .to_str()
                .and_then(|n| n.strip_suffix(SUFFIX))
                .and_then(|v| v.parse::<i64>().ok());
            if let Some(v) = parsed {
                versions.push(v);
            }
        }
        Ok(versions)
    }

    /// Newest cached version of `id`, provided it is at least `min_version`.
    /// A stale newest version is a miss, not an error.
    pub async fn lookup(&self, id: u64, min_version: i64) -> Result<Option<CachedArticle>> {
        let Some(newest) = self.versions(id).await?.into_iter().max() else {
            return Ok(None);
        };
        if newest < min_version {
            debug!(id, newest, min_version, "cached article is stale");
            return Ok(None);
        }

        let path = self.path_for(id, newest);
        let compressed = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut json = Vec::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_end(&mut json)
            .with_context(|| format!("corrupt cache file {}", path.display()))?;
        let article = serde_json::from_slice(&json)
            .with_context(|| format!("invalid cached article {}", path.display()))?;
        Ok(Some(article))
    }

    /// Persist one version. Readers never observe a partially written file:
    /// the blob goes to a unique temporary name first and is renamed into place.
    pub async fn store(&self, article: &CachedArticle) -> Result<PathBuf> {
        let dir = self.dir_for(article.id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create cache dir {}", dir.display()))?;

        let json = serde_json::to_vec(article).context("failed to serialize article")?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        let compressed = encoder.finish().context("failed to compress article")?;

        let path = self.path_for(article.id, article.version);
        let tmp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &compressed)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
                warn!("failed to remove temp file {}: {}", tmp.display(), cleanup);
            }
            return Err(e).with_context(|| format!("failed to move article into {}", path.display()));
        }
        debug!(id = article.id, version = article.version, "article cached");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn article(id: u64, version: i64) -> CachedArticle {
        CachedArticle {
            id,
            version,
            title: format!("title {}", version),
            author: "someone".into(),
            content: format!("<p>body v{}</p>", version),
        }
    }

    #[test]
    fn paths_are_sharded() {
        let cache = ArticleCache::new("/var/cache", 3000);
        assert_eq!(
            cache.path_for(6001, 1700000000),
            PathBuf::from("/var/cache/2/1/1700000000.json.gz")
        );
        assert_eq!(cache.path_for(42, 7), PathBuf::from("/var/cache/0/42/7.json.gz"));
    }

    #[tokio::test]
    async fn lookup_missing_id_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ArticleCache::new(dir.path(), 3000);
        assert!(cache.lookup(1, 0).await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn lookup_returns_newest_version_at_or_above_floor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ArticleCache::new(dir.path(), 3000);
        cache.store(&article(9, 100)).await.expect("store");
        cache.store(&article(9, 300)).await.expect("store");
        cache.store(&article(9, 200)).await.expect("store");

        let hit = cache.lookup(9, 150).await.expect("lookup").expect("hit");
        assert_eq!(hit.version, 300);
        assert_eq!(hit.content, "<p>body v300</p>");

        let exact = cache.lookup(9, 300).await.expect("lookup");
        assert_eq!(exact.map(|a| a.version), Some(300));

        assert!(cache.lookup(9, 301).await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn stray_files_are_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ArticleCache::new(dir.path(), 3000);
        let stored = cache.store(&article(5, 10)).await.expect("store");
        let shard = stored.parent().expect("shard dir");
        std::fs::write(shard.join(".abc.tmp"), b"partial").expect("write");
        std::fs::write(shard.join("notes.txt"), b"x").expect("write");

        let hit = cache.lookup(5, 0).await.expect("lookup").expect("hit");
        assert_eq!(hit.version, 10);
    }

    #[tokio::test]
    async fn files_are_gzip_compressed_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ArticleCache::new(dir.path(), 3000);
        let path = cache.store(&article(3, 1)).await.expect("store");
        let raw = std::fs::read(path).expect("read");
        assert_eq!(&raw[..2], &[0x1f, 0x8b]);
    }
}
