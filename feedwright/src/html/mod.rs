//! Owned HTML fragment model.
//!
//! Fragments are parsed with `scraper` (html5ever) and copied into a small
//! owned tree so that rewriting passes can restructure it freely. The
//! serializer emits attributes in source order, which keeps
//! parse → rewrite → serialize stable across repeated runs.

pub mod pic;
pub mod tidy;

use ego_tree::NodeRef;
use scraper::{ElementRef, Html};

/// Elements that never have a closing tag.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

/// Elements html5ever tokenizes as raw text; their content is emitted
/// without escaping so it reads back unchanged.
const RAW_TEXT_ELEMENTS: &[&str] = &[
    "script", "style", "xmp", "iframe", "noembed", "noframes", "plaintext",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
    Comment(String),
}

/// A parsed subtree of HTML content, not a whole document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fragment {
    pub nodes: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_attr(&self, key: &str) -> bool {
        self.attr(key).is_some()
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.attr("class")
            .map_or(false, |c| c.split_ascii_whitespace().any(|c| c == class))
    }

    pub fn first_child_element_mut(&mut self) -> Option<&mut Element> {
        self.children.iter_mut().find_map(Node::as_element_mut)
    }

    /// Replace in place when present so attribute order stays stable.
    pub fn set_attr(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((key.to_string(), value)),
        }
    }

    pub fn remove_attr(&mut self, key: &str) -> Option<String> {
        let pos = self.attrs.iter().position(|(k, _)| k == key)?;
        Some(self.attrs.remove(pos).1)
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    /// Concatenated text content of the subtree.
    pub fn text(&self) -> String {
        let mut out = String::new();
        collect_text(&self.children, &mut out);
        out
    }

    pub fn to_html(&self) -> String {
        let mut out = String::new();
        write_element(self, &mut out);
        out
    }

    pub fn inner_html(&self) -> String {
        let mut out = String::new();
        write_nodes(&self.children, self.is_raw_text(), &mut out);
        out
    }

    fn is_raw_text(&self) -> bool {
        RAW_TEXT_ELEMENTS.iter().any(|n| self.is(n))
    }

    fn is_void(&self) -> bool {
        VOID_ELEMENTS.iter().any(|n| self.is(n))
    }
}

impl Node {
    pub fn text(s: impl Into<String>) -> Self {
        Node::Text(s.into())
    }

    pub fn as_element(&self) -> Option<&Element> {
        match self {
            Node::Element(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_element_mut(&mut self) -> Option<&mut Element> {
        match self {
            Node::Element(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_element(&self, name: &str) -> bool {
        self.as_element().map_or(false, |e| e.is(name))
    }

    pub fn is_blank_text(&self) -> bool {
        matches!(self, Node::Text(t) if t.trim().is_empty())
    }
}

impl From<Element> for Node {
    fn from(e: Element) -> Self {
        Node::Element(e)
    }
}

impl Fragment {
    pub fn parse(html: &str) -> Self {
        let doc = Html::parse_fragment(html);
        Self {
            nodes: convert_children(doc.root_element()),
        }
    }

    /// Copy a scraped element (itself included) into an owned fragment.
    pub fn from_element(el: ElementRef<'_>) -> Self {
        Self {
            nodes: convert_node(*el).into_iter().collect(),
        }
    }

    pub fn to_html(&self) -> String {
        let mut out = String::new();
        write_nodes(&self.nodes, false, &mut out);
        out
    }

    pub fn text(&self) -> String {
        let mut out = String::new();
        collect_text(&self.nodes, &mut out);
        out
    }

    /// Visit every element, depth-first, parents before children.
    pub fn for_each_element_mut(&mut self, f: &mut impl FnMut(&mut Element)) {
        walk_elements(&mut self.nodes, f);
    }

    /// Visit every list of siblings: the top level and each element's children.
    pub fn for_each_sibling_list_mut(&mut self, f: &mut impl FnMut(&mut Vec<Node>)) {
        walk_sibling_lists(&mut self.nodes, f);
    }

    /// First element in document order with the given tag name.
    pub fn find(&self, name: &str) -> Option<&Element> {
        find_in(&self.nodes, name)
    }
}

fn walk_elements(nodes: &mut [Node], f: &mut impl FnMut(&mut Element)) {
    for node in nodes.iter_mut() {
        if let Node::Element(el) = node {
            f(el);
            walk_elements(&mut el.children, f);
        }
    }
}

fn walk_sibling_lists(nodes: &mut Vec<Node>, f: &mut impl FnMut(&mut Vec<Node>)) {
    f(nodes);
    for node in nodes.iter_mut() {
        if let Node::Element(el) = node {
            walk_sibling_lists(&mut el.children, f);
        }
    }
}

fn find_in<'a>(nodes: &'a [Node], name: &str) -> Option<&'a Element> {
    for node in nodes {
        if let Node::Element(el) = node {
            if el.is(name) {
                return Some(el);
            }
            if let Some(found) = find_in(&el.children, name) {
                return Some(found);
            }
        }
    }
    None
}

fn collect_text(nodes: &[Node], out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(t) => out.push_str(t),
            Node::Element(el) => collect_text(&el.children, out),
            Node::Comment(_) => {}
        }
    }
}

fn convert_children(el: ElementRef<'_>) -> Vec<Node> {
    el.children().flat_map(convert_node).collect()
}

fn convert_node(node: NodeRef<'_, scraper::Node>) -> Option<Node> {
    match node.value() {
        scraper::Node::Text(t) => Some(Node::Text(t.to_string())),
        scraper::Node::Comment(c) => Some(Node::Comment(c.to_string())),
        scraper::Node::Element(e) => {
            let el_ref = ElementRef::wrap(node)?;
            let mut children = convert_children(el_ref);

            // With scripting enabled html5ever keeps <noscript> content as
            // raw text; parse it again so the fallback markup is reachable
            // and the text round-trips through the escaping serializer.
            if e.name().eq_ignore_ascii_case("noscript")
                && children.iter().all(|c| matches!(c, Node::Text(_)))
            {
                let raw: String = children
                    .iter()
                    .filter_map(|c| match c {
                        Node::Text(t) => Some(t.as_str()),
                        _ => None,
                    })
                    .collect();
                children = Fragment::parse(&raw).nodes;
            }

            Some(Node::Element(Element {
                name: e.name().to_string(),
                attrs: e
                    .attrs()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                children,
            }))
        }
        _ => None,
    }
}

fn write_nodes(nodes: &[Node], raw: bool, out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(t) if raw => out.push_str(t),
            Node::Text(t) => escape_into(t, false, out),
            Node::Comment(c) => {
                out.push_str("<!--");
                out.push_str(c);
                out.push_str("-->");
            }
            Node::Element(el) => write_element(el, out),
        }
    }
}

fn write_element(el: &Element, out: &mut String) {
    out.push('<');
    out.push_str(&el.name);
    for (k, v) in &el.attrs {
        out.push(' ');
        out.push_str(k);
        out.push_str("=\"");
        escape_into(v, true, out);
        out.push('"');
    }
    out.push('>');

    if el.is_void() {
        return;
    }

    write_nodes(&el.children, el.is_raw_text(), out);
    out.push_str("</");
    out.push_str(&el.name);
    out.push('>');
}

/// Escape plain text for interpolation into markup, text or attribute.
pub fn escape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

fn escape_into(s: &str, attr: bool, out: &mut String) {
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            '"' if attr => out.push_str("&quot;"),
            '<' if !attr => out.push_str("&lt;"),
            '>' if !attr => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
}
