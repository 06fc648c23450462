//! Comments on an issue of a self-hosted Gogs instance.

use std::sync::LazyLock;

use anyhow::anyhow;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

use super::{base_url, fetch_page};
use crate::error::FeedError;
use crate::feed::{build_feed, ellipsize, ChannelMeta, FeedItem};
use crate::fetch::UpstreamClient;
use crate::html::tidy::{absolutize_links, tidy_content};
use crate::html::Fragment;

/// Longest comment excerpt used in an item title.
const TITLE_CHARS: usize = 150;

/// Format of the `title` tooltip on comment timestamps.
const TIMESTAMP_FORMAT: &str = "%a, %d %b %Y %H:%M:%S %Z";

static ISSUE_TITLE: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("#issue-title").expect("BUG: hardcoded CSS selector '#issue-title' is invalid")
});

static DESCRIPTION: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"meta[name="description"]"#)
        .expect("BUG: hardcoded CSS selector for description is invalid")
});

static COMMENT: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("ui > div.comment").expect("BUG: hardcoded CSS selector for comments is invalid")
});

static HEADER_LINK: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("div > div > span > a").expect("BUG: hardcoded CSS selector for comment header is invalid")
});

static BODY: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"div[class^="render-content"]"#)
        .expect("BUG: hardcoded CSS selector for comment body is invalid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueComment {
    pub author: String,
    pub link: String,
    pub published: Option<DateTime<Utc>>,
    /// First line of the comment text.
    pub summary: String,
    pub html: String,
}

#[derive(Debug, Clone)]
pub struct IssuePage {
    pub title: String,
    pub description: String,
    pub comments: Vec<IssueComment>,
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s.trim(), TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn parse_comment(comment: ElementRef<'_>, page_url: &Url) -> Option<IssueComment> {
    let mut links = comment.select(&HEADER_LINK);
    let author = links.next()?.text().collect::<String>().trim().to_string();
    let anchor = links.next()?;

    let link = anchor
        .value()
        .attr("href")
        .and_then(|href| page_url.join(href).ok())?
        .to_string();
    let published = anchor
        .children()
        .find_map(ElementRef::wrap)
        .and_then(|stamp| stamp.value().attr("title"))
        .and_then(parse_timestamp);

    let body = comment.select(&BODY).next()?;
    let mut frag = Fragment::from_element(body);
    absolutize_links(&mut frag, page_url);
    tidy_content(&mut frag);

    let text = frag.text();
    let summary = text.trim().lines().next().unwrap_or_default().to_string();

    Some(IssueComment {
        author,
        link,
        published,
        summary,
        html: frag.to_html(),
    })
}

pub fn parse_issue(body: &str, page_url: &Url) -> Result<IssuePage, FeedError> {
    let doc = Html::parse_document(body);
    let title = doc
        .select(&ISSUE_TITLE)
        .next()
        .map(|t| t.text().collect::<String>().trim().to_string())
        .ok_or_else(|| FeedError::Internal(anyhow!("{} is not an issue page", page_url)))?;
    let description = doc
        .select(&DESCRIPTION)
        .next()
        .and_then(|m| m.value().attr("content"))
        .unwrap_or_default()
        .to_string();

    let comments = doc
        .select(&COMMENT)
        .filter_map(|c| {
            let parsed = parse_comment(c, page_url);
            if parsed.is_none() {
                debug!("skipping comment without header or body");
            }
            parsed
        })
        .collect();

    Ok(IssuePage {
        title,
        description,
        comments,
    })
}

fn comment_to_item(comment: IssueComment) -> FeedItem {
    let title = format!("{}: {}", comment.author, ellipsize(&comment.summary, TITLE_CHARS));
    FeedItem::new(title, comment.link, comment.html)
        .author(comment.author)
        .published(comment.published)
}

pub async fn issue_feed(
    client: &UpstreamClient,
    scheme: &str,
    host: &str,
    user: &str,
    repo: &str,
    number: u64,
) -> Result<String, FeedError> {
    let url = format!("{}://{}/{}/{}/issues/{}", scheme, host, user, repo, number);
    let page = parse_issue(&fetch_page(client, &url).await?, &base_url(&url)?)?;

    let meta = ChannelMeta {
        title: format!("{} - {}/{} - {}", page.title, user, repo, host),
        link: url,
        description: page.description,
    };
    let items = page.comments.into_iter().map(comment_to_item).collect();
    Ok(build_feed(&meta, items)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r##"<html><head><meta name="description" content="Crashes on start"></head><body>
<h1><span id="issue-title">Crash on start</span></h1>
<ui class="ui comments">
  <div class="comment">
    <a class="avatar" href="/alice"><img src="/avatars/1"></a>
    <div class="content">
      <div class="ui top attached header">
        <span class="text grey"><a href="/alice">alice</a> commented <a href="#issue-1"><span class="time-since" title="Mon, 06 May 2024 10:00:00 UTC">1 day ago</span></a></span>
      </div>
      <div class="ui attached segment">
        <div class="render-content markdown has-emoji"><p>It crashes.</p>
<p>See <a href="/alice/app/issues/2">#2</a><script>x()</script></p></div>
      </div>
    </div>
  </div>
  <div class="comment">
    <div class="content">
      <div class="ui top attached header">
        <span class="text grey"><a href="/bob">bob</a> commented <a href="#issuecomment-9"><span class="time-since" title="Tue, 07 May 2024 11:30:00 UTC">now</span></a></span>
      </div>
      <div class="ui attached segment"><div class="render-content markdown"><p>Fixed in master</p></div></div>
    </div>
  </div>
</ui>
</body></html>"##;

    #[test]
    fn issue_comments_are_extracted() {
        let url = Url::parse("https://try.gogs.io/alice/app/issues/1").expect("url");
        let page = parse_issue(PAGE, &url).expect("issue page");

        assert_eq!(page.title, "Crash on start");
        assert_eq!(page.description, "Crashes on start");
        assert_eq!(page.comments.len(), 2);

        let first = &page.comments[0];
        assert_eq!(first.author, "alice");
        assert_eq!(first.link, "https://try.gogs.io/alice/app/issues/1#issue-1");
        assert_eq!(first.summary, "It crashes.");
        assert_eq!(
            first.published.map(|d| d.to_rfc3339()).as_deref(),
            Some("2024-05-06T10:00:00+00:00")
        );
        assert!(first.html.contains(r#"href="https://try.gogs.io/alice/app/issues/2""#));
        assert!(!first.html.contains("script"));

        assert_eq!(page.comments[1].link, "https://try.gogs.io/alice/app/issues/1#issuecomment-9");
    }

    #[test]
    fn long_comment_titles_are_shortened() {
        let item = comment_to_item(IssueComment {
            author: "carol".into(),
            link: "https://x/1#c".into(),
            published: None,
            summary: "a".repeat(200),
            html: String::new(),
        });
        assert_eq!(item.title, format!("carol: {}……", "a".repeat(150)));
    }

    #[test]
    fn a_page_without_issue_title_is_rejected() {
        let url = Url::parse("https://try.gogs.io/alice/app/issues/1").expect("url");
        assert!(parse_issue("<html><body>sign in</body></html>", &url).is_err());
    }
}
