//! Column feed backed by the article cache.
//!
//! The listing API only carries excerpts. Full bodies come from the cache;
//! a miss queues the article for the background fetcher and renders a
//! placeholder (or drops the item in full-only mode).

use serde::Deserialize;
use tracing::{debug, warn};

use super::{from_unix, relay_pics, render_body, ZhihuApi};
use crate::cache::queue::FetchQueue;
use crate::cache::ArticleCache;
use crate::error::FeedError;
use crate::feed::{build_feed, ChannelMeta, FeedItem, PageLimits, RenderOptions};
use crate::metrics::{Counter, Metrics};

/// Shown in place of a body that has not been cached yet.
pub const PLACEHOLDER_NOTICE: &str = "全文尚未缓存，请稍后刷新。";

#[derive(Debug, Deserialize)]
struct ColumnInfo {
    title: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct Paging {
    #[serde(default)]
    is_end: bool,
}

#[derive(Debug, Deserialize)]
struct ItemPage {
    paging: Paging,
    data: Vec<ColumnItem>,
}

#[derive(Debug, Deserialize)]
struct ItemAuthor {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct ColumnItem {
    #[serde(rename = "type")]
    kind: String,
    id: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    excerpt: String,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    updated: i64,
    #[serde(default)]
    image_url: String,
    author: Option<ItemAuthor>,
}

/// Everything a column render touches.
pub struct ColumnSource<'a> {
    pub api: &'a ZhihuApi,
    pub cache: &'a ArticleCache,
    pub queue: &'a FetchQueue,
    pub metrics: &'a Metrics,
    pub limits: PageLimits,
}

impl ColumnSource<'_> {
    pub async fn feed(&self, name: &str, opts: RenderOptions) -> Result<String, FeedError> {
        let info: ColumnInfo = self.api.get_json(&self.api.api_url(&format!("columns/{}", name))).await?;
        let items = self.collect_items(name).await?;

        let mut feed_items = Vec::with_capacity(items.len());
        for item in items {
            if let Some(rendered) = self.render_item(item, opts).await {
                feed_items.push(rendered);
            }
        }

        let meta = ChannelMeta {
            title: format!("{} - 知乎专栏", info.title),
            link: self.api.zhuanlan_url(name),
            description: info.description,
        };
        Ok(build_feed(&meta, feed_items)?)
    }

    async fn collect_items(&self, name: &str) -> Result<Vec<ColumnItem>, FeedError> {
        let mut items = Vec::new();
        let mut pages = 0;
        let mut is_end = false;
        let mut offset = 0;

        while self.limits.wants_more(items.len(), pages, is_end) {
            let url = self.api.api_url(&format!(
                "columns/{}/items?limit={}&offset={}",
                name, self.limits.target_items, offset
            ));
            let page: ItemPage = self.api.get_json(&url).await?;
            pages += 1;
            offset += page.data.len();
            is_end = page.paging.is_end || page.data.is_empty();

            for item in page.data {
                if item.kind == "article" {
                    items.push(item);
                } else {
                    warn!(column = name, kind = %item.kind, id = item.id, "skipping unsupported column item");
                }
            }
        }

        items.truncate(self.limits.target_items);
        Ok(items)
    }

    async fn render_item(&self, item: ColumnItem, opts: RenderOptions) -> Option<FeedItem> {
        let link = self.api.zhuanlan_url(&format!("p/{}", item.id));

        let body = if opts.digest {
            render_body(&item.excerpt, opts.pic)
        } else {
            match self.lookup(item.id, item.updated).await {
                Some(cached) => relay_pics(&cached, opts.pic),
                None if opts.fullonly => {
                    debug!(id = item.id, "omitting uncached article");
                    return None;
                }
                None => placeholder(&item.excerpt, &link, opts),
            }
        };

        let body = match (item.image_url.is_empty(), opts.digest) {
            (false, false) => format!(
                "{}{}",
                render_body(&format!(r#"<p><img src="{}"></p>"#, item.image_url), opts.pic),
                body
            ),
            _ => body,
        };

        let author = item.author.map(|a| a.name).unwrap_or_default();
        let published = from_unix(if item.created > 0 { item.created } else { item.updated });
        Some(
            FeedItem::new(item.title.replace('\u{8}', ""), link, body)
                .author(author)
                .published(published),
        )
    }

    /// Cached body at `version` or newer; on a miss, ask for a background fill.
    async fn lookup(&self, id: u64, version: i64) -> Option<String> {
        match self.cache.lookup(id, version).await {
            Ok(Some(article)) => {
                self.metrics.increment(Counter::CacheHit);
                debug!(id, version = article.version, "article cache hit");
                return Some(article.content);
            }
            Ok(None) => debug!(id, version, "article cache miss"),
            Err(e) => warn!(id, "article cache unreadable, treating as miss: {:#}", e),
        }
        self.metrics.increment(Counter::CacheMiss);
        self.queue.enqueue(id);
        None
    }
}

fn placeholder(excerpt: &str, link: &str, opts: RenderOptions) -> String {
    let excerpt = render_body(excerpt, opts.pic);
    format!(
        r#"{}<p><em>{}</em> <a href="{}">阅读原文</a></p>"#,
        excerpt, PLACEHOLDER_NOTICE, link
    )
}
