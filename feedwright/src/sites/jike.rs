//! Jike user and topic pages, read from the page's embedded JSON.

use std::str::FromStr;
use std::sync::LazyLock;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use serde::Deserialize;

use super::fetch_page;
use crate::error::FeedError;
use crate::feed::{build_feed, first_sentence, ChannelMeta, FeedItem};
use crate::fetch::UpstreamClient;
use crate::html::tidy::tidy_content;
use crate::html::{escape_text as escape, Fragment};

static PAGE_DATA: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"script[type="application/json"]"#)
        .expect("BUG: hardcoded CSS selector for page data is invalid")
});

/// Which image size to embed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DataPlan {
    /// Thumbnails only.
    #[default]
    Limited,
    /// Full-size pictures.
    Unlimited,
}

impl FromStr for DataPlan {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "unlimited" => DataPlan::Unlimited,
            _ => DataPlan::Limited,
        })
    }
}

impl DataPlan {
    pub fn from_arg(arg: Option<&str>) -> Self {
        arg.and_then(|a| a.parse().ok()).unwrap_or_default()
    }

    fn pick<'a>(self, image: &'a Image) -> &'a str {
        match self {
            DataPlan::Limited => &image.thumbnail_url,
            DataPlan::Unlimited => &image.pic_url,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Image {
    pub pic_url: String,
    pub thumbnail_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub screen_name: String,
    #[serde(default)]
    pub brief_intro: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub brief_intro: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Audio {
    #[serde(default)]
    pub subtype: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkInfo {
    pub link_url: String,
    #[serde(default)]
    pub title: String,
    pub audio: Option<Audio>,
    pub video: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Video {
    pub image: Image,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub user: User,
    #[serde(default)]
    pub content: String,
    pub link_info: Option<LinkInfo>,
    pub video: Option<Video>,
    #[serde(default)]
    pub pictures: Vec<Image>,
    pub topic: Option<Topic>,
}

#[derive(Debug, Deserialize)]
struct PageProps {
    user: Option<User>,
    topic: Option<Topic>,
    #[serde(default)]
    posts: Vec<Post>,
}

/// What a Jike page is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JikeTarget {
    User,
    Topic,
}

fn page_props(body: &str) -> anyhow::Result<PageProps> {
    let doc = Html::parse_document(body);
    let script = doc
        .select(&PAGE_DATA)
        .next()
        .ok_or_else(|| anyhow!("no embedded page data"))?;
    let json: String = script.text().collect();
    let value: serde_json::Value = serde_json::from_str(&json).context("page data is not valid JSON")?;
    let props = value
        .pointer("/props/pageProps")
        .cloned()
        .ok_or_else(|| anyhow!("page data has no pageProps"))?;
    serde_json::from_value(props).context("unexpected pageProps shape")
}

pub fn post_to_item(base: &str, post: &Post, plan: DataPlan) -> FeedItem {
    let link = format!("{}/originalPosts/{}", base, post.id);
    let content = escape(&post.content).replace('\n', "<br/>");
    let mut description = format!("{}<br/><br/>", content);

    if let Some(info) = &post.link_info {
        let kind = match (&info.audio, &info.video) {
            (_, Some(_)) => "视频分享：",
            (Some(audio), None) if audio.subtype == "MUSIC" => "音乐分享：",
            (Some(_), None) => "未知分享：",
            (None, None) => "链接分享：",
        };
        description.push_str(&format!(
            r#"{}<a href="{}" target="_blank">{}</a><br/><br/>"#,
            kind,
            escape(&info.link_url),
            escape(&info.title)
        ));
    }

    // Only a preview frame is available for videos.
    if let Some(video) = &post.video {
        description.push_str(&format!(r#"<img src="{}"/><br/><br/>"#, escape(plan.pick(&video.image))));
    }

    let total = post.pictures.len();
    for (i, picture) in post.pictures.iter().enumerate() {
        description.push_str(&format!(
            r#"<div style="align:left; text-align:center;"><img src="{}" /><div>图 {}/{}</div></div><br/>"#,
            escape(plan.pick(picture)),
            i + 1,
            total
        ));
    }

    if let Some(topic) = &post.topic {
        description.push_str(&format!(
            r#"来自圈子：<a href="{}/topics/{}" target="_blank">{}</a>"#,
            base,
            escape(&topic.id),
            escape(&topic.content)
        ));
    }

    let mut frag = Fragment::parse(&description);
    tidy_content(&mut frag);

    let title = first_sentence(&post.content).to_string();
    FeedItem::new(title, link, frag.to_html())
        .author(post.user.screen_name.clone())
        .published(Some(post.created_at))
}

pub async fn jike_feed(
    client: &UpstreamClient,
    base: &str,
    target: JikeTarget,
    id: &str,
    plan: DataPlan,
) -> Result<String, FeedError> {
    let base = base.trim_end_matches('/');
    let url = match target {
        JikeTarget::User => format!("{}/users/{}", base, id),
        JikeTarget::Topic => format!("{}/topics/{}", base, id),
    };
    let props = page_props(&fetch_page(client, &url).await?)?;

    let (title, description) = match (target, &props.user, &props.topic) {
        (JikeTarget::User, Some(user), _) => (format!("{} - 即刻用户", user.screen_name), user.brief_intro.clone()),
        (JikeTarget::Topic, _, Some(topic)) => (format!("{} - 即刻圈子", topic.content), topic.brief_intro.clone()),
        _ => return Err(FeedError::NotFound),
    };

    let meta = ChannelMeta {
        title,
        link: url,
        description,
    };
    let items = props.posts.iter().map(|p| post_to_item(base, p, plan)).collect();
    Ok(build_feed(&meta, items)?)
}
