//! A user's activity stream: answers, articles and pins they created.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{from_unix, render_body, ZhihuApi};
use crate::error::FeedError;
use crate::feed::{build_feed, ellipsize, ChannelMeta, FeedItem, PageLimits, RenderOptions};

/// Activities that mean "this user published something".
pub const ACCEPT_VERBS: &[&str] = &["MEMBER_CREATE_ARTICLE", "ANSWER_CREATE", "MEMBER_CREATE_PIN"];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Author {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Question {
    pub id: u64,
    pub title: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Answer {
    pub id: u64,
    pub question: Question,
    pub created_time: i64,
    #[serde(default)]
    pub excerpt: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub author: Author,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Article {
    pub id: u64,
    pub title: String,
    pub created: i64,
    #[serde(default)]
    pub excerpt: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub author: Author,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PinBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pin {
    pub id: String,
    pub created: i64,
    #[serde(default)]
    pub content: Vec<PinBlock>,
    #[serde(default)]
    pub author: Author,
}

/// One activity target, by its `type` discriminator.
#[derive(Debug, Clone)]
pub enum Record {
    Answer(Answer),
    Article(Article),
    Pin(Pin),
    /// Known kinds that never become feed items (roundtables, lives, columns).
    Ignored(String),
    Unrecognized(String),
}

impl Record {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        fn parse<T: DeserializeOwned>(v: Value) -> Result<T, serde_json::Error> {
            serde_json::from_value(v)
        }

        Ok(match kind.as_str() {
            "answer" => Record::Answer(parse(value)?),
            "article" => Record::Article(parse(value)?),
            "pin" => Record::Pin(parse(value)?),
            "roundtable" | "live" | "column" => Record::Ignored(kind),
            _ => Record::Unrecognized(kind),
        })
    }
}

#[derive(Debug, Deserialize)]
struct Activity {
    verb: String,
    #[serde(default)]
    created_time: i64,
    target: Value,
}

#[derive(Debug, Deserialize)]
struct Paging {
    #[serde(default)]
    is_end: bool,
}

#[derive(Debug, Deserialize)]
struct ActivityPage {
    paging: Paging,
    data: Vec<Activity>,
}

#[derive(Debug, Deserialize)]
struct Member {
    name: String,
    #[serde(default)]
    headline: String,
}

/// Map one record to a feed item. `None` for kinds that are not rendered.
pub fn record_to_item(api: &ZhihuApi, record: Record, opts: RenderOptions) -> Option<(FeedItem, i64)> {
    let pick = |excerpt: String, content: String| if opts.digest { excerpt } else { content };

    let (title, link, body, author, created) = match record {
        Record::Answer(a) => (
            format!("[回答] {}", a.question.title),
            api.www_url(&format!("question/{}/answer/{}", a.question.id, a.id)),
            pick(a.excerpt, a.content),
            a.author.name,
            a.created_time,
        ),
        Record::Article(a) => (
            format!("[文章] {}", a.title),
            api.zhuanlan_url(&format!("p/{}", a.id)),
            pick(a.excerpt, a.content),
            a.author.name,
            a.created,
        ),
        Record::Pin(p) => {
            let text: String = p
                .content
                .iter()
                .filter(|b| b.kind == "text")
                .map(|b| b.content.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            let summary = ellipsize(&crate::html::Fragment::parse(&text).text(), 30);
            (
                format!("[想法] {}", summary),
                api.www_url(&format!("pin/{}", p.id)),
                pin_body(&p.content),
                p.author.name,
                p.created,
            )
        }
        Record::Ignored(kind) => {
            debug!(kind = %kind, "ignoring activity");
            return None;
        }
        Record::Unrecognized(kind) => {
            warn!(kind = %kind, "unknown activity type, skipping");
            return None;
        }
    };

    let item = FeedItem::new(title.replace('\u{8}', ""), link, render_body(&body, opts.pic))
        .author(author)
        .published(from_unix(created));
    Some((item, created))
}

fn pin_body(blocks: &[PinBlock]) -> String {
    blocks
        .iter()
        .filter_map(|b| match b.kind.as_str() {
            "text" => Some(format!("<p>{}</p>", b.content)),
            "image" if !b.url.is_empty() => Some(format!(r#"<p><img src="{}"></p>"#, b.url)),
            "link" if !b.url.is_empty() => Some(format!(r#"<p><a href="{0}">{0}</a></p>"#, b.url)),
            _ => None,
        })
        .collect()
}

pub async fn activities_feed(api: &ZhihuApi, name: &str, opts: RenderOptions, limits: PageLimits) -> Result<String, FeedError> {
    let member: Member = api.get_json(&api.api_url(&format!("members/{}", name))).await?;

    let mut items: Vec<(FeedItem, i64)> = Vec::new();
    let mut pages = 0;
    let mut is_end = false;
    let mut after: Option<i64> = None;

    while limits.wants_more(items.len(), pages, is_end) {
        let mut url = api.api_url(&format!("members/{}/activities?limit={}&desktop=true", name, limits.target_items));
        if let Some(after) = after {
            url.push_str(&format!("&after_id={}", after));
        }
        let page: ActivityPage = api.get_json(&url).await?;
        pages += 1;
        is_end = page.paging.is_end || page.data.is_empty();
        after = page.data.last().map(|a| a.created_time);

        for activity in page.data {
            if !ACCEPT_VERBS.contains(&activity.verb.as_str()) {
                continue;
            }
            match Record::from_value(activity.target) {
                Ok(record) => items.extend(record_to_item(api, record, opts)),
                Err(e) => warn!(verb = %activity.verb, "malformed activity target, skipping: {}", e),
            }
        }
    }

    // Heterogeneous kinds are merged newest first.
    items.sort_by(|a, b| b.1.cmp(&a.1));
    items.truncate(limits.target_items);

    let meta = ChannelMeta {
        title: format!("{} - 知乎动态", member.name),
        link: api.www_url(&format!("people/{}", name)),
        description: member.headline,
    };
    Ok(build_feed(&meta, items.into_iter().map(|(item, _)| item).collect())?)
}
