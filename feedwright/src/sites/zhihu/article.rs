//! A single column article, read from the page's embedded initial state.
//!
//! Used both by the standalone page route and by the background fetcher
//! that fills the article cache.

use std::sync::{Arc, LazyLock};

use anyhow::{anyhow, Context};
use scraper::{Html, Selector};
use serde::Deserialize;
use tracing::{debug, error};

use super::{render_body, ZhihuApi};
use crate::cache::worker::ArticleSource;
use crate::cache::CachedArticle;
use crate::error::FeedError;
use crate::html::pic::PicProxy;

static INITIAL_DATA: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("script#js-initialData")
        .expect("BUG: hardcoded CSS selector 'script#js-initialData' is invalid")
});

#[derive(Debug, Clone, Deserialize)]
pub struct Author {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArticleData {
    pub title: String,
    /// Raw upstream HTML.
    pub content: String,
    #[serde(default)]
    pub updated: i64,
    pub author: Author,
}

/// Pull `initialState.entities.articles[id]` out of an article page.
pub fn extract_article(page: &str, id: u64) -> anyhow::Result<ArticleData> {
    let doc = Html::parse_document(page);
    let Some(script) = doc.select(&INITIAL_DATA).next() else {
        error!(id, "no initial data in article page ({} bytes)", page.len());
        return Err(anyhow!("article page for {} has no initial data", id));
    };

    let json: String = script.text().collect();
    let state: serde_json::Value =
        serde_json::from_str(&json).context("initial data is not valid JSON")?;
    let article = state
        .pointer(&format!("/initialState/entities/articles/{}", id))
        .cloned()
        .ok_or_else(|| anyhow!("article {} missing from initial data", id))?;
    serde_json::from_value(article).context("unexpected article shape")
}

pub async fn fetch_article(api: &ZhihuApi, id: u64) -> Result<ArticleData, FeedError> {
    let page = api.get_page(&api.zhuanlan_url(&format!("p/{}", id))).await?;
    Ok(extract_article(&page, id)?)
}

/// Standalone HTML rendering of one article.
pub fn render_page(api: &ZhihuApi, id: u64, article: &ArticleData, pic: Option<PicProxy>) -> String {
    let title = escape(&article.title);
    let author = escape(&article.author.name);
    format!(
        r#"<!DOCTYPE html>
<meta charset="utf-8" />
<meta name="referrer" content="no-referrer" />
<title>{title} - {author}</title>
<style type="text/css">
body {{ max-width: 700px; margin: auto; }}
</style>
<h2>{title}</h2>
<h3>作者: {author}</h3>
{body}
<hr/>
<footer><a href="{link}">原文链接</a></footer>
"#,
        body = render_body(&article.content, pic),
        link = api.zhuanlan_url(&format!("p/{}", id)),
    )
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Feeds the article cache.
pub struct ZhihuArticleSource {
    api: Arc<ZhihuApi>,
}

impl ZhihuArticleSource {
    pub fn new(api: Arc<ZhihuApi>) -> Self {
        Self { api }
    }
}

#[async_trait::async_trait]
impl ArticleSource for ZhihuArticleSource {
    async fn fetch_article(&self, id: u64) -> anyhow::Result<CachedArticle> {
        let article = fetch_article(&self.api, id).await?;
        debug!(id, updated = article.updated, "fetched article for cache");
        Ok(CachedArticle {
            id,
            version: article.updated,
            content: render_body(&article.content, None),
            title: article.title,
            author: article.author.name,
        })
    }
}
