//! Public Telegram channel, from its `t.me/s/<channel>` web preview.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

use super::{base_url, fetch_page, meta_property};
use crate::error::FeedError;
use crate::feed::{build_feed, ellipsize, ChannelMeta, FeedItem};
use crate::fetch::UpstreamClient;
use crate::html::tidy::{absolutize_links, tidy_content};
use crate::html::{Element, Fragment, Node};

static MESSAGE: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("div[data-post]").expect("BUG: hardcoded CSS selector 'div[data-post]' is invalid")
});

static AUTHOR: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("span.tgme_widget_message_from_author")
        .expect("BUG: hardcoded CSS selector for message author is invalid")
});

static DATE: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("a.tgme_widget_message_date > time")
        .expect("BUG: hardcoded CSS selector for message date is invalid")
});

static TEXT: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("div.tgme_widget_message_text.js-message_text")
        .expect("BUG: hardcoded CSS selector for message text is invalid")
});

static REPLY: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("a.tgme_widget_message_reply").expect("BUG: hardcoded CSS selector for replies is invalid")
});

static LINK_PREVIEW: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("a.tgme_widget_message_link_preview")
        .expect("BUG: hardcoded CSS selector for link previews is invalid")
});

#[derive(Debug, Clone)]
pub struct ChannelPage {
    pub title: String,
    pub description: String,
    pub items: Vec<FeedItem>,
}

/// Parse the channel preview. `base` is the Telegram origin, e.g. `https://t.me`.
pub fn parse_channel(body: &str, page_url: &Url, base: &str) -> ChannelPage {
    let doc = Html::parse_document(body);
    let mut items: Vec<FeedItem> = doc
        .select(&MESSAGE)
        .filter_map(|m| message_to_item(m, page_url, base))
        .collect();
    items.reverse();

    ChannelPage {
        title: meta_property(&doc, "og:title"),
        description: meta_property(&doc, "og:description"),
        items,
    }
}

fn message_to_item(message: ElementRef<'_>, page_url: &Url, base: &str) -> Option<FeedItem> {
    let post = message.value().attr("data-post")?;
    let link = format!("{}/s/{}", base, post);

    let author = message
        .select(&AUTHOR)
        .next()
        .map(|a| a.text().collect::<String>())
        .unwrap_or_default();

    let published = message
        .select(&DATE)
        .next()
        .and_then(|t| t.value().attr("datetime"))
        .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
        .map(|d| d.with_timezone(&Utc));

    let (text, mut content) = match message.select(&TEXT).next() {
        Some(el) => {
            let mut frag = Fragment::from_element(el);
            for node in frag.nodes.iter_mut().filter_map(Node::as_element_mut) {
                node.remove_attr("class");
            }
            (frag.text(), frag.to_html())
        }
        None => {
            debug!(post, "message without text");
            (String::new(), String::new())
        }
    };

    if let Some(reply) = message.select(&REPLY).next() {
        content = format!("<blockquote>{}</blockquote>{}", render_reply(reply, base), content);
    }
    if let Some(preview) = message.select(&LINK_PREVIEW).next() {
        content.push_str(&format!("<blockquote>{}</blockquote>", render_link_preview(preview)));
    }

    let mut frag = Fragment::parse(content.trim());
    absolutize_links(&mut frag, page_url);
    tidy_content(&mut frag);

    Some(
        FeedItem::new(ellipsize(&text, 30), link, frag.to_html().replace('\r', ""))
            .author(author)
            .published(published),
    )
}

/// The quoted message becomes a `<div>` whose first child links to the
/// quoted post's web preview.
fn render_reply(reply: ElementRef<'_>, base: &str) -> String {
    let mut frag = Fragment::from_element(reply);
    if let Some(root) = frag.nodes.iter_mut().find_map(Node::as_element_mut) {
        root.name = "div".to_string();
        root.remove_attr("class");
        let href = root.remove_attr("href").unwrap_or_default();
        let href = href.replacen(&format!("{}/", base), &format!("{}/s/", base), 1);
        if let Some(first) = root.first_child_element_mut() {
            first.name = "a".to_string();
            first.set_attr("href", href);
        }
    }
    frag.to_html()
}

fn render_link_preview(preview: ElementRef<'_>) -> String {
    let mut frag = Fragment::from_element(preview);
    let Some(root) = frag.nodes.iter_mut().find_map(Node::as_element_mut) else {
        return String::new();
    };
    root.name = "div".to_string();
    root.remove_attr("class");
    let href = root.remove_attr("href").unwrap_or_default();

    frag.for_each_element_mut(&mut |el| {
        if el.has_class("link_preview_site_name") {
            let site = el.text();
            *el = Element::new("div").with_child(Element::new("strong").with_child(Node::text(site)).into());
        } else if el.has_class("link_preview_title") {
            el.name = "a".to_string();
            el.set_attr("href", href.clone());
        } else if el.is("i") && el.has_class("link_preview_right_image") {
            let src = el
                .remove_attr("style")
                .and_then(|style| style.split('\'').nth(1).map(str::to_string));
            el.name = "img".to_string();
            el.children.clear();
            if let Some(src) = src {
                el.set_attr("src", src);
            }
            el.set_attr("style", "max-height: 5em;");
        }
    });
    frag.to_html()
}

pub async fn channel_feed(client: &UpstreamClient, base: &str, channel: &str) -> Result<String, FeedError> {
    let base = base.trim_end_matches('/');
    let url = format!("{}/s/{}", base, channel);
    let body = fetch_page(client, &url).await?;
    let page = parse_channel(&body, &base_url(&url)?, base);

    let meta = ChannelMeta {
        title: page.title,
        link: url,
        description: page.description,
    };
    Ok(build_feed(&meta, page.items)?)
}
