//! Newest replies of a V2EX topic.

use std::sync::LazyLock;

use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use super::{base_url, fetch_page, meta_property};
use crate::error::FeedError;
use crate::feed::{build_feed, ellipsize, ChannelMeta, FeedItem};
use crate::fetch::UpstreamClient;
use crate::html::tidy::{absolutize_links, tidy_content};
use crate::html::Fragment;

/// Replies shown per feed.
pub const MAX_COMMENTS: usize = 40;

/// Page title V2EX serves instead of the topic when login is required.
const LOGIN_TITLE: &str = "V2EX › 登录";

static TITLE: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("title").expect("BUG: hardcoded CSS selector 'title' is invalid")
});

static REPLY: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("div#Main > div.box > div[id]")
        .expect("BUG: hardcoded CSS selector for replies is invalid")
});

static REPLY_CONTENT: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("div.reply_content").expect("BUG: hardcoded CSS selector 'div.reply_content' is invalid")
});

static REPLY_AUTHOR: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("strong > a").expect("BUG: hardcoded CSS selector 'strong > a' is invalid")
});

static PREV_LINK: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"link[rel="prev"]"#).expect("BUG: hardcoded CSS selector for prev link is invalid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub id: String,
    pub author: String,
    pub text: String,
    /// Normalized HTML of the reply body.
    pub html: String,
}

#[derive(Debug, Clone)]
pub struct ThreadPage {
    pub subject: String,
    pub description: String,
    /// Newest first.
    pub comments: Vec<Comment>,
    pub prev: Option<String>,
}

pub fn parse_thread(body: &str, base: &Url) -> Result<ThreadPage, FeedError> {
    let doc = Html::parse_document(body);
    let subject = doc
        .select(&TITLE)
        .next()
        .map(|t| t.text().collect::<String>())
        .unwrap_or_default();
    if subject.trim() == LOGIN_TITLE {
        return Err(FeedError::Forbidden("login required".to_string()));
    }

    let replies: Vec<_> = doc.select(&REPLY).collect();
    let skip = replies.len().saturating_sub(MAX_COMMENTS);
    let mut comments: Vec<Comment> = replies
        .into_iter()
        .skip(skip)
        .filter_map(|reply| {
            let id = reply.value().attr("id")?.to_string();
            let content = reply.select(&REPLY_CONTENT).next()?;
            let author = reply
                .select(&REPLY_AUTHOR)
                .next()
                .map(|a| a.text().collect::<String>())
                .unwrap_or_default();

            let mut frag = Fragment::from_element(content);
            absolutize_links(&mut frag, base);
            tidy_content(&mut frag);
            Some(Comment {
                id,
                author,
                text: frag.text(),
                html: frag.to_html().trim().replace('\r', ""),
            })
        })
        .collect();
    comments.reverse();

    let prev = doc
        .select(&PREV_LINK)
        .next()
        .and_then(|l| l.value().attr("href"))
        .and_then(|href| base.join(href).ok())
        .map(|u| u.to_string());

    Ok(ThreadPage {
        subject,
        description: meta_property(&doc, "og:description"),
        comments,
        prev,
    })
}

fn comment_to_item(url: &str, comment: Comment) -> FeedItem {
    let link = format!("{}#{}", url, comment.id);
    let title = format!("{} 说: {}", comment.author, ellipsize(&comment.text, 30));
    FeedItem::new(title, link, comment.html).author(comment.author)
}

pub async fn comments_feed(client: &UpstreamClient, base: &str, tid: &str) -> Result<String, FeedError> {
    let url = format!("{}/t/{}", base.trim_end_matches('/'), tid);
    let page = parse_thread(&fetch_page(client, &url).await?, &base_url(&url)?)?;

    let mut comments = page.comments;
    if comments.len() < MAX_COMMENTS {
        if let Some(prev) = &page.prev {
            debug!(topic = tid, prev = %prev, "topping up replies from previous page");
            let older = parse_thread(&fetch_page(client, prev).await?, &base_url(prev)?)?;
            comments.extend(older.comments);
            comments.truncate(MAX_COMMENTS);
        }
    }

    let meta = ChannelMeta {
        title: format!("[评论] {}", page.subject),
        link: url.clone(),
        description: page.description,
    };
    let items = comments.into_iter().map(|c| comment_to_item(&url, c)).collect();
    Ok(build_feed(&meta, items)?)
}
