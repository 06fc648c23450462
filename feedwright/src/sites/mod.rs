//! Per-site feed assemblers.
//!
//! Scraped pages are parsed synchronously into owned records before the
//! next await point; `scraper::Html` never lives across a suspension.

pub mod gogs;
pub mod jike;
pub mod matters;
pub mod telegram;
pub mod v2ex;
pub mod zhihu;

use scraper::{Html, Selector};

use crate::error::FeedError;
use crate::fetch::{FetchOptions, UpstreamClient};

/// Plain GET for sites without bot detection or proxying.
pub async fn fetch_page(client: &UpstreamClient, url: &str) -> Result<String, FeedError> {
    client.fetch_text(url, &FetchOptions::default()).await
}

/// `content` of `<meta property="...">`, or empty.
pub fn meta_property(doc: &Html, property: &str) -> String {
    Selector::parse(&format!(r#"meta[property="{}"]"#, property))
        .ok()
        .and_then(|sel| doc.select(&sel).next())
        .and_then(|m| m.value().attr("content"))
        .unwrap_or_default()
        .to_string()
}

pub(crate) fn base_url(url: &str) -> Result<url::Url, FeedError> {
    url::Url::parse(url).map_err(|e| FeedError::Internal(anyhow::anyhow!("invalid url {}: {}", url, e)))
}
