//! Canonical feed items and the RSS serialization boundary.

use std::io::Cursor;
use std::sync::LazyLock;

use anyhow::Context;
use chrono::{DateTime, Utc};
use regex::Regex;
use rocket::http::Status;
use rocket::request::Request;
use rocket::response::{self, Responder, Response};

use crate::error::FeedError;
use crate::html::pic::PicProxy;

/// Cache directive for successfully rendered feeds.
pub const FEED_CACHE_CONTROL: &str = "public, max-age=14400";

const GENERATOR: &str = concat!("feedwright ", env!("CARGO_PKG_VERSION"));

static SENTENCE_BREAK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[,，.。;；!！?？~\n]").expect("hardcoded regex is valid")
});

/// One normalized syndication entry. Built at render time, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    pub guid: String,
    /// Sanitized HTML.
    pub description: String,
    pub author: Option<String>,
    pub published: Option<DateTime<Utc>>,
}

impl FeedItem {
    /// An item whose guid is its link.
    pub fn new(title: impl Into<String>, link: impl Into<String>, description: impl Into<String>) -> Self {
        let link = link.into();
        Self {
            title: title.into(),
            guid: link.clone(),
            link,
            description: description.into(),
            author: None,
            published: None,
        }
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        let author = author.into();
        self.author = (!author.is_empty()).then_some(author);
        self
    }

    pub fn published(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.published = at;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMeta {
    pub title: String,
    pub link: String,
    pub description: String,
}

/// Serialize a channel and its items as an RSS 2.0 document.
pub fn build_feed(meta: &ChannelMeta, items: Vec<FeedItem>) -> anyhow::Result<String> {
    let items = items
        .into_iter()
        .map(|item| rss::Item {
            title: Some(item.title),
            link: Some(item.link),
            guid: Some(rss::Guid {
                value: item.guid,
                permalink: true,
            }),
            description: Some(item.description),
            author: item.author,
            pub_date: item.published.map(|d| d.to_rfc2822()),
            ..Default::default()
        })
        .collect();

    let channel = rss::Channel {
        title: meta.title.clone(),
        link: meta.link.clone(),
        description: meta.description.clone(),
        generator: Some(GENERATOR.to_string()),
        last_build_date: Some(Utc::now().to_rfc2822()),
        items,
        ..Default::default()
    };

    let xml = channel
        .write_to(Vec::new())
        .context("failed to serialize feed")?;
    String::from_utf8(xml).context("feed is not valid UTF-8")
}

/// `"{first n chars}……"` when longer than `n` characters, the text otherwise.
pub fn ellipsize(text: &str, n: usize) -> String {
    let text = text.trim();
    if text.chars().count() > n {
        let head: String = text.chars().take(n).collect();
        format!("{}……", head)
    } else {
        text.to_string()
    }
}

/// Plain text up to the first sentence or line break, for short-form titles.
pub fn first_sentence(text: &str) -> &str {
    SENTENCE_BREAK.split(text).next().unwrap_or_default().trim()
}

/// Body rendering switches shared by the Zhihu assemblers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderOptions {
    pub pic: Option<PicProxy>,
    /// Render the excerpt instead of the full body.
    pub digest: bool,
    /// Omit items whose full text is not cached yet.
    pub fullonly: bool,
}

impl RenderOptions {
    /// Validate query arguments. Flags are on only when literally `"true"`.
    pub fn from_query(pic: Option<&str>, digest: Option<&str>, fullonly: Option<&str>) -> Result<Self, FeedError> {
        let digest = digest == Some("true");
        let fullonly = fullonly == Some("true");
        if digest && fullonly {
            return Err(FeedError::BadRequest(
                "digest and fullonly cannot be used together".to_string(),
            ));
        }
        Ok(Self {
            pic: PicProxy::from_arg(pic)?,
            digest,
            fullonly,
        })
    }
}

/// When to stop walking a paginated upstream listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub target_items: usize,
    pub max_pages: usize,
}

impl PageLimits {
    pub fn from_config(cfg: &common::FeedConfig) -> Self {
        Self {
            target_items: cfg.target_items,
            max_pages: cfg.max_pages,
        }
    }

    pub fn wants_more(&self, collected: usize, pages_fetched: usize, is_end: bool) -> bool {
        !is_end && collected < self.target_items && pages_fetched < self.max_pages
    }
}

/// A rendered feed document.
#[derive(Debug)]
pub struct RssFeed(pub String);

impl<'r> Responder<'r, 'static> for RssFeed {
    fn respond_to(self, _req: &'r Request<'_>) -> response::Result<'static> {
        Response::build()
            .status(Status::Ok)
            .raw_header("Content-Type", "application/rss+xml; charset=utf-8")
            .raw_header("Cache-Control", FEED_CACHE_CONTROL)
            .sized_body(self.0.len(), Cursor::new(self.0))
            .ok()
    }
}
