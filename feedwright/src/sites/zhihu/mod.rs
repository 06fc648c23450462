//! Zhihu: columns, user activity streams and single column articles.

pub mod article;
pub mod column;
pub mod stream;

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;

use crate::error::FeedError;
use crate::fetch::{FetchOptions, UpstreamClient};
use crate::html::pic::{proxify_pics, PicProxy, ZHIHU_IMG};
use crate::html::tidy::{strip_control_chars, tidy_content, wrap_code_blocks};
use crate::html::Fragment;

/// Zhihu redirects suspected bots to `/account/unhuman` and embeds the same
/// word in its challenge pages.
pub const BOT_MARKER: &str = "unhuman";

/// Zhihu endpoints plus the shared fetch client.
pub struct ZhihuApi {
    client: Arc<UpstreamClient>,
    api: String,
    www: String,
    zhuanlan: String,
    use_proxy: bool,
}

impl ZhihuApi {
    pub fn new(client: Arc<UpstreamClient>, cfg: &common::UpstreamConfig, use_proxy: bool) -> Self {
        Self {
            client,
            api: cfg.zhihu_api.trim_end_matches('/').to_string(),
            www: cfg.zhihu_www.trim_end_matches('/').to_string(),
            zhuanlan: cfg.zhihu_zhuanlan.trim_end_matches('/').to_string(),
            use_proxy,
        }
    }

    fn options(&self) -> FetchOptions {
        FetchOptions {
            bot_marker: Some(BOT_MARKER),
            use_proxy: self.use_proxy,
        }
    }

    pub fn api_url(&self, path: &str) -> String {
        format!("{}/{}", self.api, path.trim_start_matches('/'))
    }

    pub fn www_url(&self, path: &str) -> String {
        format!("{}/{}", self.www, path.trim_start_matches('/'))
    }

    pub fn zhuanlan_url(&self, path: &str) -> String {
        format!("{}/{}", self.zhuanlan, path.trim_start_matches('/'))
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FeedError> {
        self.client.fetch_json(url, HeaderMap::new(), &self.options()).await
    }

    pub async fn get_page(&self, url: &str) -> Result<String, FeedError> {
        self.client.fetch_text(url, &self.options()).await
    }
}

/// Normalize an upstream body and point its images at the relay, if any.
pub fn render_body(html: &str, pic: Option<PicProxy>) -> String {
    let mut frag = Fragment::parse(&strip_control_chars(html));
    wrap_code_blocks(&mut frag);
    tidy_content(&mut frag);
    if let Some(pic) = pic {
        proxify_pics(&mut frag, &ZHIHU_IMG, pic);
    }
    frag.to_html()
}

/// Relay already-normalized HTML, e.g. a cached body.
pub fn relay_pics(html: &str, pic: Option<PicProxy>) -> String {
    match pic {
        Some(pic) => {
            let mut frag = Fragment::parse(html);
            proxify_pics(&mut frag, &ZHIHU_IMG, pic);
            frag.to_html()
        }
        None => html.to_string(),
    }
}

pub(crate) fn from_unix(ts: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(ts, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_is_cleaned_and_relayed() {
        let out = render_body(
            "<p>a\u{8}b</p><br><img src=\"https://pic1.zhimg.com/x.jpg\" class=\"z\"><code class=\"lang-rs\">x</code>",
            Some(PicProxy::Cf),
        );
        assert_eq!(
            out,
            concat!(
                "<p>ab</p>",
                r#"<img src="https://images.weserv.nl/?url=ssl:pic1.zhimg.com/x.jpg" referrerpolicy="no-referrer">"#,
                r#"<pre><code class="lang-rs">x</code></pre>"#
            )
        );
    }

    #[test]
    fn relay_is_noop_without_pic() {
        assert_eq!(relay_pics("<p>x</p>", None), "<p>x</p>");
    }
}
