use std::str::FromStr;
use std::sync::LazyLock;

use anyhow::anyhow;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::Regex;

use super::Fragment;

/// Images served from Zhihu's CDN.
pub static ZHIHU_IMG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://\w+\.zhimg\.com/.+").expect("hardcoded regex is valid")
});

/// RFC 3986 unreserved characters stay literal; everything else is escaped.
const URL_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Third-party relays that fetch and re-serve images for the feed reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PicProxy {
    /// images.weserv.nl resize/fetch relay
    Cf,
    /// Legacy Google content proxy
    Google,
}

impl FromStr for PicProxy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cf" => Ok(PicProxy::Cf),
            "google" => Ok(PicProxy::Google),
            other => Err(anyhow!("unknown image proxy: {:?}", other)),
        }
    }
}

impl PicProxy {
    /// Parse the optional `pic` query argument.
    pub fn from_arg(arg: Option<&str>) -> anyhow::Result<Option<Self>> {
        arg.map(str::parse).transpose()
    }

    pub fn proxify(self, url: &str) -> String {
        match self {
            PicProxy::Cf => proxify_cf(url),
            PicProxy::Google => proxify_google(url),
        }
    }
}

fn proxify_cf(url: &str) -> String {
    let bare = if let Some(rest) = url.strip_prefix("http://") {
        rest.to_string()
    } else if let Some(rest) = url.strip_prefix("https://") {
        format!("ssl:{}", rest)
    } else {
        tracing::error!("bad image url: {}", url);
        url.to_string()
    };
    format!("https://images.weserv.nl/?url={}", bare)
}

fn proxify_google(url: &str) -> String {
    format!(
        "https://images1-focus-opensocial.googleusercontent.com/gadgets/proxy?url={}&container=focus",
        utf8_percent_encode(url, URL_COMPONENT)
    )
}

/// Point every matching `<img src>` at the relay.
pub fn proxify_pics(frag: &mut Fragment, pattern: &Regex, proxy: PicProxy) {
    frag.for_each_element_mut(&mut |el| {
        if !el.is("img") {
            return;
        }
        let replacement = el
            .attr("src")
            .filter(|src| pattern.is_match(src))
            .map(|src| proxy.proxify(src));
        if let Some(src) = replacement {
            el.set_attr("src", src);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cf_strips_scheme_and_marks_ssl() {
        assert_eq!(
            PicProxy::Cf.proxify("https://pic1.zhimg.com/v2-abc_r.jpg"),
            "https://images.weserv.nl/?url=ssl:pic1.zhimg.com/v2-abc_r.jpg"
        );
        assert_eq!(
            PicProxy::Cf.proxify("http://example.com/a.png"),
            "https://images.weserv.nl/?url=example.com/a.png"
        );
    }

    #[test]
    fn google_encodes_whole_url() {
        let out = PicProxy::Google.proxify("https://pic1.zhimg.com/v2-abc_r.jpg?x=1&y=2");
        assert_eq!(
            out,
            "https://images1-focus-opensocial.googleusercontent.com/gadgets/proxy?url=https%3A%2F%2Fpic1.zhimg.com%2Fv2-abc_r.jpg%3Fx%3D1%26y%3D2&container=focus"
        );
    }

    #[test]
    fn unknown_key_fails() {
        assert!("imgur".parse::<PicProxy>().is_err());
        assert!(PicProxy::from_arg(Some("bogus")).is_err());
        assert_eq!(PicProxy::from_arg(None).expect("none"), None);
        assert_eq!(PicProxy::from_arg(Some("cf")).expect("cf"), Some(PicProxy::Cf));
    }

    #[test]
    fn only_matching_sources_are_rewritten() {
        let mut frag = Fragment::parse(
            r#"<img src="https://pic3.zhimg.com/a.jpg"><img src="https://other.example/b.jpg">"#,
        );
        proxify_pics(&mut frag, &ZHIHU_IMG, PicProxy::Cf);
        assert_eq!(
            frag.to_html(),
            r#"<img src="https://images.weserv.nl/?url=ssl:pic3.zhimg.com/a.jpg"><img src="https://other.example/b.jpg">"#
        );
    }
}
