//! Rewriting passes that turn scraped fragments into syndication-safe HTML.
//!
//! Each pass is independent and idempotent. [`tidy_content`] applies the
//! core passes in the order they depend on each other and finishes with an
//! allowlist sanitizer, so whatever reaches a feed reader is inert markup.

use std::sync::LazyLock;

use ammonia::Builder;
use url::Url;

use super::{Element, Fragment, Node};

/// Outbound links on Zhihu are wrapped in this redirector; the real
/// destination is in the `target` query parameter.
pub const REDIRECT_PREFIX: &str = "https://link.zhihu.com/?target=";

/// Image attributes that only make sense to the source site's renderer.
const IMG_PRESENTATION_ATTRS: &[&str] = &["class", "data-rawwidth", "data-rawheight", "data-actualsrc"];

const LINK_TRACKING_ATTRS: &[&str] = &["rel", "class"];

/// Ammonia's default allowlist plus the few attributes our own rewriting
/// passes emit.
static SANITIZER: LazyLock<Builder<'static>> = LazyLock::new(|| {
    let mut builder = Builder::default();
    builder
        .add_tag_attributes("img", &["referrerpolicy", "style"])
        .add_tag_attributes("a", &["target"])
        .add_tag_attributes("div", &["style"])
        .add_tag_attributes("code", &["class"])
        .link_rel(None);
    builder
});

/// Parse, tidy and serialize in one go.
pub fn normalize(html: &str) -> String {
    let mut frag = Fragment::parse(html);
    tidy_content(&mut frag);
    frag.to_html()
}

pub fn tidy_content(frag: &mut Fragment) {
    remove_br_after_paragraph(frag);
    promote_noscript_images(frag);
    unwrap_noscript(frag);
    clean_images(frag);
    unwrap_redirect_links(frag);
    strip_link_attrs(frag);
    sanitize(frag);
}

/// Drop `<br>` runs that directly follow a `<p>` sibling. Whitespace text in
/// between does not break the run.
pub fn remove_br_after_paragraph(frag: &mut Fragment) {
    frag.for_each_sibling_list_mut(&mut |siblings| {
        let mut after_p = false;
        siblings.retain(|node| {
            if node.is_element("p") {
                after_p = true;
                true
            } else if node.is_element("br") {
                !after_p
            } else if node.is_blank_text() {
                true
            } else {
                after_p = false;
                true
            }
        });
    });
}

/// `<noscript><img real></noscript><img placeholder>` becomes `<img real>`.
pub fn promote_noscript_images(frag: &mut Fragment) {
    frag.for_each_sibling_list_mut(&mut |siblings| {
        let mut i = 0;
        while i < siblings.len() {
            if !siblings[i].is_element("noscript") {
                i += 1;
                continue;
            }

            let next = (i + 1..siblings.len()).find(|&j| !siblings[j].is_blank_text());
            let Some(j) = next.filter(|&j| siblings[j].is_element("img")) else {
                i += 1;
                continue;
            };

            let first_child = siblings[i]
                .as_element_mut()
                .and_then(|ns| {
                    let pos = ns.children.iter().position(|c| matches!(c, Node::Element(_)))?;
                    Some(ns.children.remove(pos))
                });

            siblings.remove(j);
            match first_child {
                Some(child) => siblings[i] = child,
                None => {
                    siblings.remove(i);
                    continue;
                }
            }
            i += 1;
        }
    });
}

/// Replace any `<noscript>` left after promotion with its parsed children.
pub fn unwrap_noscript(frag: &mut Fragment) {
    frag.for_each_sibling_list_mut(&mut |siblings| {
        while siblings.iter().any(|n| n.is_element("noscript")) {
            let flattened = std::mem::take(siblings)
                .into_iter()
                .flat_map(|node| match node {
                    Node::Element(el) if el.is("noscript") => el.children,
                    other => vec![other],
                })
                .collect();
            *siblings = flattened;
        }
    });
}

/// Force no-referrer, resolve lazy `data-original`, strip presentation hints.
pub fn clean_images(frag: &mut Fragment) {
    frag.for_each_element_mut(&mut |el| {
        if !el.is("img") || !el.has_attr("src") {
            return;
        }
        el.set_attr("referrerpolicy", "no-referrer");
        if let Some(original) = el.remove_attr("data-original") {
            el.set_attr("src", original);
        }
        for attr in IMG_PRESENTATION_ATTRS {
            el.remove_attr(attr);
        }
    });
}

pub fn unwrap_redirect_links(frag: &mut Fragment) {
    frag.for_each_element_mut(&mut |el| {
        if !el.is("a") {
            return;
        }
        let target = el
            .attr("href")
            .filter(|href| href.starts_with(REDIRECT_PREFIX))
            .and_then(redirect_target);
        if let Some(target) = target {
            el.set_attr("href", target);
        }
    });
}

fn redirect_target(href: &str) -> Option<String> {
    let url = Url::parse(href).ok()?;
    url.query_pairs()
        .find(|(k, _)| k == "target")
        .map(|(_, v)| v.into_owned())
}

pub fn strip_link_attrs(frag: &mut Fragment) {
    frag.for_each_element_mut(&mut |el| {
        if el.is("a") {
            for attr in LINK_TRACKING_ATTRS {
                el.remove_attr(attr);
            }
        }
    });
}

/// Run the fragment through the allowlist sanitizer. Scripts, styles,
/// event handlers, frames, forms and non-web URL schemes do not survive.
pub fn sanitize(frag: &mut Fragment) {
    let clean = SANITIZER.clean(&frag.to_html()).to_string();
    *frag = Fragment::parse(&clean);
}

/// Wrap attributed `<code>` blocks in `<pre>` so feed readers keep their
/// line breaks.
pub fn wrap_code_blocks(frag: &mut Fragment) {
    wrap_code_in(&mut frag.nodes, false);
}

fn wrap_code_in(nodes: &mut [Node], in_pre: bool) {
    for node in nodes.iter_mut() {
        let Node::Element(el) = node else { continue };
        if el.is("code") && !in_pre && !el.attrs.is_empty() {
            let code = std::mem::replace(el, Element::new("pre"));
            el.children.push(Node::Element(code));
            continue;
        }
        let inside = in_pre || el.is("pre");
        wrap_code_in(&mut el.children, inside);
    }
}

/// Resolve relative `href` and `src` attributes against the page URL.
pub fn absolutize_links(frag: &mut Fragment, base: &Url) {
    frag.for_each_element_mut(&mut |el| {
        for key in ["href", "src"] {
            let resolved = el.attr(key).and_then(|v| base.join(v).ok());
            if let Some(resolved) = resolved {
                el.set_attr(key, resolved.to_string());
            }
        }
    });
}

/// Remove backspace control characters some upstream editors leave behind.
pub fn strip_control_chars(s: &str) -> String {
    s.replace('\u{8}', "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn br_after_paragraph_is_removed() {
        let out = normalize("<p>one</p><br><br><p>two</p> <br><span>x</span><br>");
        assert_eq!(out, "<p>one</p><p>two</p> <span>x</span><br>");
    }

    #[test]
    fn noscript_followed_by_img_is_promoted() {
        let html = concat!(
            r#"<figure><noscript><img src="https://pic1.zhimg.com/real_b.jpg" data-original="https://pic1.zhimg.com/real_r.jpg" class="origin_image"></noscript>"#,
            r#"<img src="data:image/svg+xml;utf8,&lt;svg/&gt;" class="origin_image lazy" data-original="https://pic1.zhimg.com/real_r.jpg"></figure>"#,
        );
        let out = normalize(html);
        assert_eq!(
            out,
            r#"<figure><img src="https://pic1.zhimg.com/real_r.jpg" referrerpolicy="no-referrer"></figure>"#
        );
        assert!(!out.contains("noscript"));
        assert_eq!(out.matches("<img").count(), 1);
    }

    #[test]
    fn noscript_without_following_img_is_unwrapped() {
        let out = normalize("<noscript><img src=\"a.jpg\"></noscript><p>text</p>");
        assert_eq!(out, r#"<img src="a.jpg" referrerpolicy="no-referrer"><p>text</p>"#);
    }

    #[test]
    fn raw_text_content_is_stable_across_runs() {
        for html in [
            "<noscript>a &amp; b</noscript>",
            "<noscript>x > y</noscript>",
            "<iframe>a &amp; b</iframe>",
            "<p>1 &lt; 2</p><xmp>a &amp; b</xmp>",
        ] {
            let once = normalize(html);
            let twice = normalize(&once);
            assert_eq!(once, twice, "input: {html}");
            assert!(!once.contains("<noscript") && !once.contains("<iframe"));
        }
        assert_eq!(normalize("<noscript>a &amp; b</noscript>"), "a &amp; b");
    }

    #[test]
    fn obfuscated_script_urls_and_active_elements_are_dropped() {
        let out = normalize(concat!(
            r#"<a href="java&#9;script:alert(1)">a</a>"#,
            r#"<a href=" JAVASCRIPT:alert(1)">b</a>"#,
            r#"<iframe srcdoc="<script>alert(1)</script>"></iframe>"#,
            r#"<form action="javascript:alert(1)"><input formaction="javascript:alert(2)"></form>"#,
            r#"<svg><a xlink:href="javascript:alert(3)">c</a></svg>"#,
            r#"<object data="x.swf"></object><style>p{}</style>"#,
        ));
        let lower = out.to_ascii_lowercase();
        for needle in ["javascript", "script", "srcdoc", "action", "<iframe", "<form", "<svg", "<object", "<style"] {
            assert!(!lower.contains(needle), "{needle} survived in {out}");
        }
        assert!(out.contains(">a</a>") && out.contains(">b</a>"));
    }

    #[test]
    fn lazy_image_is_resolved_and_opted_out_of_referrer() {
        let out = normalize(
            r#"<img src="placeholder.svg" data-original="https://pic2.zhimg.com/v2-a.jpg" data-rawwidth="600" data-rawheight="400" class="lazy">"#,
        );
        assert_eq!(
            out,
            r#"<img src="https://pic2.zhimg.com/v2-a.jpg" referrerpolicy="no-referrer">"#
        );
    }

    #[test]
    fn redirect_links_are_unwrapped_and_stripped() {
        let out = normalize(
            r#"<p><a href="https://link.zhihu.com/?target=https%3A//example.com/a%3Fb%3D1" class="external" rel="nofollow noreferrer">x</a><a href="/local" class="internal">y</a></p>"#,
        );
        assert_eq!(
            out,
            r#"<p><a href="https://example.com/a?b=1">x</a><a href="/local">y</a></p>"#
        );
        assert!(!out.contains("rel="));
        assert!(!out.contains("class="));
    }

    #[test]
    fn malformed_redirect_is_kept() {
        let out = normalize(r#"<a href="https://link.zhihu.com/?target=">x</a>"#);
        assert_eq!(out, r#"<a href="">x</a>"#);
        let out = normalize(r#"<a href="https://link.zhihu.com/?other=1">y</a>"#);
        assert_eq!(out, r#"<a href="https://link.zhihu.com/?other=1">y</a>"#);
    }

    #[test]
    fn normalize_is_idempotent() {
        let html = concat!(
            "<p>intro &amp; more</p><br>",
            r#"<figure><noscript><img src="https://pic1.zhimg.com/x_b.jpg"></noscript><img src="data:," data-original="https://pic1.zhimg.com/x_r.jpg" class="lazy"></figure>"#,
            r#"<p><a href="https://link.zhihu.com/?target=https%3A//example.org" rel="nofollow">link</a>&nbsp;tail</p>"#,
            "<pre><code class=\"language-rust\">fn main() { 1 &lt; 2 }</code></pre>",
        );
        let once = normalize(html);
        let twice = normalize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn scripts_and_handlers_are_removed() {
        let out = normalize(
            r#"<p onclick="x()">a<script>alert(1)</script></p><a href="javascript:void(0)">b</a><img src="i.png" onerror="y()">"#,
        );
        assert_eq!(out, r#"<p>a</p><a>b</a><img src="i.png" referrerpolicy="no-referrer">"#);
    }

    #[test]
    fn code_blocks_are_wrapped_once() {
        let mut frag = Fragment::parse(r#"<code class="language-py">print(1)</code><pre><code class="x">y</code></pre><code>inline</code>"#);
        wrap_code_blocks(&mut frag);
        assert_eq!(
            frag.to_html(),
            r#"<pre><code class="language-py">print(1)</code></pre><pre><code class="x">y</code></pre><code>inline</code>"#
        );
        wrap_code_blocks(&mut frag);
        assert_eq!(frag.to_html().matches("<pre>").count(), 2);
    }

    #[test]
    fn relative_links_become_absolute() {
        let base = Url::parse("https://www.v2ex.com/t/1").expect("base");
        let mut frag = Fragment::parse(r#"<a href="/member/bob">bob</a><img src="//i.v2ex.co/a.png">"#);
        absolutize_links(&mut frag, &base);
        assert_eq!(
            frag.to_html(),
            r#"<a href="https://www.v2ex.com/member/bob">bob</a><img src="https://i.v2ex.co/a.png">"#
        );
    }
}
