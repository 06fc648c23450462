//! Matters: recommendation lists, user pages, tags and circles, read from
//! the public GraphQL endpoint.
//!
//! Query documents are fixed; everything the requester supplies travels in
//! the `variables` object.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::FeedError;
use crate::feed::{build_feed, first_sentence, ChannelMeta, FeedItem};
use crate::fetch::{FetchOptions, UpstreamClient};
use crate::html::tidy::tidy_content;
use crate::html::{escape_text, Fragment};

const ARTICLE_FRAGMENT: &str = r#"
fragment ArticleFeed on Article {
  id
  title
  slug
  mediaHash
  summary
  content
  createdAt
  author { userName displayName }
  access { type }
  __typename
}
"#;

const COMMENT_FRAGMENTS: &str = r#"
fragment CommentFeed on Comment {
  id
  content
  createdAt
  author { id userName displayName }
  __typename
}

fragment NestedCommentFeed on Comment {
  ...CommentFeed
  replyTo { ...CommentFeed }
  parentComment { id }
  node { ...ArticleFeed }
}
"#;

const USER_ARTICLES_QUERY: &str = r#"
query UserArticles($userName: String!) {
  user(input: { userName: $userName }) {
    id
    displayName
    info { description }
    articles(input: { first: 20 }) { edges { node { ...ArticleFeed } } }
  }
}
"#;

const USER_PROFILE_QUERY: &str = r#"
query UserProfile($userName: String!) {
  user(input: { userName: $userName }) {
    id
    displayName
    info { description }
  }
}
"#;

const USER_COMMENTS_QUERY: &str = r#"
query UserComments($id: ID!) {
  node(input: { id: $id }) {
    ... on User {
      commentedArticles(input: { first: 5 }) {
        edges {
          node {
            comments(input: { filter: { author: $id }, first: null }) {
              edges { node { ...NestedCommentFeed } }
            }
          }
        }
      }
    }
  }
}
"#;

const TAG_QUERY: &str = r#"
query TagArticles($id: ID!, $selected: Boolean!) {
  node(input: { id: $id }) {
    ... on Tag {
      id
      content
      description
      articles(input: { first: 10, selected: $selected }) { edges { node { ...ArticleFeed } } }
    }
  }
}
"#;

const CIRCLE_WORKS_QUERY: &str = r#"
query CircleWorks($name: String!) {
  circle(input: { name: $name }) {
    id
    displayName
    description
    articles: works(input: { first: 5 }) { edges { node { ...ArticleFeed } } }
  }
}
"#;

const CIRCLE_BROADCAST_QUERY: &str = r#"
query CircleBroadcast($name: String!) {
  circle(input: { name: $name }) {
    id
    displayName
    description
    broadcast(input: { first: 10 }) { edges { node { ...NestedCommentFeed } } }
  }
}
"#;

/// Rejection when every content switch is off.
const NOTHING_SELECTED: &str = "select at least one kind of content";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    #[serde(default)]
    pub id: String,
    pub user_name: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Access {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    pub id: String,
    pub title: String,
    pub slug: String,
    pub media_hash: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub author: Author,
    pub access: Access,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotedComment {
    pub id: String,
    #[serde(default)]
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub author: Author,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommentId {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    #[serde(default)]
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub author: Author,
    pub reply_to: Option<QuotedComment>,
    pub parent_comment: Option<CommentId>,
    /// What the comment hangs off. Only articles carry the fields we read;
    /// anything else (a circle, for broadcasts) comes back empty.
    pub node: Option<Value>,
}

impl Comment {
    fn article(&self) -> Option<Article> {
        self.node
            .clone()
            .and_then(|node| serde_json::from_value(node).ok())
    }
}

/// One connection node, by its `__typename`.
#[derive(Debug, Clone)]
pub enum Entry {
    Article(Article),
    Comment(Comment),
    /// A circle owner's post to its members.
    Broadcast(Comment),
    Unrecognized(String),
}

impl Entry {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let kind = value
            .get("__typename")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(match kind.as_str() {
            "Article" => Entry::Article(serde_json::from_value(value)?),
            "Comment" => Entry::Comment(serde_json::from_value(value)?),
            _ => Entry::Unrecognized(kind),
        })
    }

    fn into_broadcast(self) -> Self {
        match self {
            Entry::Comment(c) => Entry::Broadcast(c),
            other => other,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct Connection {
    #[serde(default)]
    edges: Vec<Edge>,
}

#[derive(Debug, Deserialize)]
struct Edge {
    node: Value,
}

impl Connection {
    fn entries(self) -> Vec<Entry> {
        self.edges
            .into_iter()
            .filter_map(|edge| match Entry::from_value(edge.node) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("malformed matters node, skipping: {}", e);
                    None
                }
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct FeedData {
    viewer: Viewer,
}

#[derive(Debug, Deserialize)]
struct Viewer {
    recommendation: Recommendation,
}

#[derive(Debug, Deserialize)]
struct Recommendation {
    feed: Connection,
}

#[derive(Debug, Deserialize)]
struct Info {
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserNode {
    id: String,
    display_name: String,
    info: Option<Info>,
    articles: Option<Connection>,
}

#[derive(Debug, Deserialize)]
struct UserData {
    user: Option<UserNode>,
}

#[derive(Debug, Deserialize)]
struct NodeData {
    node: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentedArticles {
    commented_articles: CommentedConnection,
}

#[derive(Debug, Deserialize)]
struct CommentedConnection {
    #[serde(default)]
    edges: Vec<CommentedEdge>,
}

#[derive(Debug, Deserialize)]
struct CommentedEdge {
    node: CommentedArticle,
}

#[derive(Debug, Deserialize)]
struct CommentedArticle {
    comments: Connection,
}

#[derive(Debug, Deserialize)]
struct TagNode {
    content: String,
    description: Option<String>,
    articles: Connection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CircleNode {
    display_name: String,
    description: Option<String>,
    articles: Option<Connection>,
    broadcast: Option<Connection>,
}

#[derive(Debug, Deserialize)]
struct CircleData {
    circle: Option<CircleNode>,
}

/// Which recommendation list to follow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FeedKind {
    #[default]
    Hottest,
    Newest,
    Icymi,
}

impl FeedKind {
    /// Unknown values fall back to the hottest list.
    pub fn from_arg(arg: Option<&str>) -> Self {
        match arg {
            Some("newest") => FeedKind::Newest,
            Some("icymi") => FeedKind::Icymi,
            _ => FeedKind::Hottest,
        }
    }

    fn field(self) -> &'static str {
        match self {
            FeedKind::Hottest => "hottest",
            FeedKind::Newest => "newest",
            FeedKind::Icymi => "icymi",
        }
    }

    fn label(self) -> &'static str {
        match self {
            FeedKind::Hottest => "热门",
            FeedKind::Newest => "最新",
            FeedKind::Icymi => "精华",
        }
    }
}

/// Content switches default to on; only a literal `"1"` keeps them on when given.
pub fn switch_enabled(arg: Option<&str>) -> bool {
    arg.map_or(true, |a| a == "1")
}

pub struct MattersApi<'a> {
    client: &'a UpstreamClient,
    endpoint: &'a str,
    www: &'a str,
}

impl<'a> MattersApi<'a> {
    pub fn new(client: &'a UpstreamClient, endpoint: &'a str, www: &'a str) -> Self {
        Self {
            client,
            endpoint,
            www: www.trim_end_matches('/'),
        }
    }

    async fn query<T: DeserializeOwned>(&self, document: &str, variables: Value) -> Result<T, FeedError> {
        let body = json!({ "query": document, "variables": variables });
        let res: GraphQlResponse<T> = self
            .client
            .post_json(self.endpoint, &body, &FetchOptions::default())
            .await?;

        if !res.errors.is_empty() {
            let messages: Vec<&str> = res.errors.iter().map(|e| e.message.as_str()).collect();
            debug!(errors = ?messages, "matters answered with errors");
        }
        res.data.ok_or_else(|| match res.errors.first() {
            Some(e) => FeedError::Internal(anyhow::anyhow!("matters query failed: {}", e.message)),
            None => FeedError::Internal(anyhow::anyhow!("matters answered without data")),
        })
    }

    fn user_url(&self, user_name: &str) -> String {
        format!("{}/@{}", self.www, user_name)
    }

    fn article_url(&self, article: &Article) -> String {
        format!(
            "{}/@{}/{}-{}",
            self.www, article.author.user_name, article.slug, article.media_hash
        )
    }

    /// Map one entry to an item and its creation time. `fallback_link` names
    /// comments that do not hang off an article.
    pub fn entry_to_item(&self, entry: Entry, fallback_link: &str) -> Option<(FeedItem, DateTime<Utc>)> {
        match entry {
            Entry::Article(a) => Some(self.article_to_item(a)),
            Entry::Comment(c) => Some(self.comment_to_item(c, "评论", fallback_link)),
            Entry::Broadcast(c) => Some(self.comment_to_item(c, "广播", fallback_link)),
            Entry::Unrecognized(kind) => {
                warn!(kind = %kind, "unknown matters node type, skipping");
                None
            }
        }
    }

    fn article_to_item(&self, article: Article) -> (FeedItem, DateTime<Utc>) {
        let access = match article.access.kind.as_str() {
            "public" => "公开作品",
            "paywall" => "付费作品",
            _ => "未知",
        };
        let link = self.article_url(&article);
        let body = render(&format!(
            "<p>{}</p><br/><br/>{}",
            escape_text(&article.summary),
            article.content
        ));
        let item = FeedItem::new(format!("[{}] {}", access, article.title), link, body)
            .author(article.author.display_name)
            .published(Some(article.created_at));
        (item, article.created_at)
    }

    fn comment_to_item(&self, comment: Comment, label: &str, fallback_link: &str) -> (FeedItem, DateTime<Utc>) {
        let mut body = String::new();
        let mut link = format!("{}#{}", fallback_link, comment.id);

        if let Some(article) = comment.article() {
            let article_url = self.article_url(&article);
            body.push_str(&format!(
                r#"<div><a href="{}">{}</a> 在 <a href="{}">《{}》</a> 下的评论</div>"#,
                escape_text(&self.user_url(&comment.author.user_name)),
                escape_text(&comment.author.display_name),
                escape_text(&article_url),
                escape_text(&article.title),
            ));
            link = match &comment.parent_comment {
                Some(parent) => format!("{}#{}-{}", article_url, parent.id, comment.id),
                None => format!("{}#{}", article_url, comment.id),
            };
        }

        body.push_str(&format!("<div>{}</div><p>{}</p>", comment.content, stamp(comment.created_at)));

        if let Some(reply) = &comment.reply_to {
            body.push_str(&format!(
                r#"<blockquote><p>回复： <a href="{}">{}</a></p><div>{}</div><p>{}</p></blockquote>"#,
                escape_text(&self.user_url(&reply.author.user_name)),
                escape_text(&reply.author.display_name),
                reply.content,
                stamp(reply.created_at),
            ));
        }

        let text = Fragment::parse(&comment.content).text();
        let item = FeedItem::new(format!("[{}] {}", label, first_sentence(&text)), link, render(&body))
            .author(comment.author.display_name)
            .published(Some(comment.created_at));
        (item, comment.created_at)
    }

    fn items(&self, entries: Vec<Entry>, fallback_link: &str) -> Vec<(FeedItem, DateTime<Utc>)> {
        entries
            .into_iter()
            .filter_map(|e| self.entry_to_item(e, fallback_link))
            .collect()
    }
}

fn render(html: &str) -> String {
    let mut frag = Fragment::parse(html);
    tidy_content(&mut frag);
    frag.to_html()
}

fn stamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Merged article and comment lists are ordered newest first.
fn newest_first(mut items: Vec<(FeedItem, DateTime<Utc>)>) -> Vec<FeedItem> {
    items.sort_by(|a, b| b.1.cmp(&a.1));
    items.into_iter().map(|(item, _)| item).collect()
}

pub async fn recommendation_feed(api: &MattersApi<'_>, kind: FeedKind) -> Result<String, FeedError> {
    let document = format!(
        "query {{ viewer {{ recommendation {{ feed: {}(input: {{ first: 10 }}) {{ edges {{ node {{ ...ArticleFeed }} }} }} }} }} }}\n{}",
        kind.field(),
        ARTICLE_FRAGMENT
    );
    let data: FeedData = api.query(&document, json!({})).await?;

    let link = format!("{}/", api.www);
    let items = api.items(data.viewer.recommendation.feed.entries(), &link);
    let meta = ChannelMeta {
        title: format!("Matters {}", kind.label()),
        link,
        description: String::new(),
    };
    Ok(build_feed(&meta, items.into_iter().map(|(item, _)| item).collect())?)
}

pub async fn user_feed(api: &MattersApi<'_>, user_name: &str, articles: bool, responses: bool) -> Result<String, FeedError> {
    if !articles && !responses {
        return Err(FeedError::BadRequest(NOTHING_SELECTED.to_string()));
    }
    let vars = json!({ "userName": user_name });
    let data: UserData = if articles {
        api.query(&format!("{}{}", USER_ARTICLES_QUERY, ARTICLE_FRAGMENT), vars).await?
    } else {
        api.query(USER_PROFILE_QUERY, vars).await?
    };
    let user = data.user.ok_or(FeedError::NotFound)?;

    let link = api.user_url(user_name);
    let mut entries = user.articles.map(Connection::entries).unwrap_or_default();

    if responses {
        let document = format!("{}{}{}", USER_COMMENTS_QUERY, COMMENT_FRAGMENTS, ARTICLE_FRAGMENT);
        let data: NodeData = api.query(&document, json!({ "id": user.id })).await?;
        let commented: Option<CommentedArticles> = data.node.and_then(|n| serde_json::from_value(n).ok());
        for edge in commented.map(|c| c.commented_articles.edges).unwrap_or_default() {
            entries.extend(edge.node.comments.entries());
        }
    }

    let meta = ChannelMeta {
        title: format!("{} - Matters 用户", user.display_name),
        link: link.clone(),
        description: user.info.and_then(|i| i.description).unwrap_or_default(),
    };
    Ok(build_feed(&meta, newest_first(api.items(entries, &link)))?)
}

pub async fn topic_feed(api: &MattersApi<'_>, id: &str, selected: bool) -> Result<String, FeedError> {
    let document = format!("{}{}", TAG_QUERY, ARTICLE_FRAGMENT);
    let data: NodeData = api.query(&document, json!({ "id": id, "selected": selected })).await?;
    let tag: TagNode = data
        .node
        .and_then(|n| serde_json::from_value(n).ok())
        .ok_or(FeedError::NotFound)?;

    let link = format!("{}/tags/{}", api.www, id);
    let items = api.items(tag.articles.entries(), &link);
    let meta = ChannelMeta {
        title: format!("{} - {} - Matters 标签", tag.content, if selected { "精选" } else { "最新" }),
        link,
        description: tag.description.unwrap_or_default(),
    };
    Ok(build_feed(&meta, items.into_iter().map(|(item, _)| item).collect())?)
}

pub async fn circle_feed(api: &MattersApi<'_>, name: &str, articles: bool, broadcasts: bool) -> Result<String, FeedError> {
    if !articles && !broadcasts {
        return Err(FeedError::BadRequest(NOTHING_SELECTED.to_string()));
    }
    let vars = json!({ "name": name });
    let mut channel: Option<(String, Option<String>)> = None;
    let mut entries = Vec::new();

    if articles {
        let data: CircleData = api
            .query(&format!("{}{}", CIRCLE_WORKS_QUERY, ARTICLE_FRAGMENT), vars.clone())
            .await?;
        let circle = data.circle.ok_or(FeedError::NotFound)?;
        entries.extend(circle.articles.map(Connection::entries).unwrap_or_default());
        channel = Some((circle.display_name, circle.description));
    }
    if broadcasts {
        let document = format!("{}{}{}", CIRCLE_BROADCAST_QUERY, COMMENT_FRAGMENTS, ARTICLE_FRAGMENT);
        let data: CircleData = api.query(&document, vars).await?;
        let circle = data.circle.ok_or(FeedError::NotFound)?;
        let posts = circle.broadcast.map(Connection::entries).unwrap_or_default();
        entries.extend(posts.into_iter().map(Entry::into_broadcast));
        channel = Some((circle.display_name, circle.description));
    }
    let (display_name, description) = channel.ok_or(FeedError::NotFound)?;

    let link = format!("{}/~{}", api.www, name);
    let meta = ChannelMeta {
        title: format!("{} - Matters 围炉", display_name),
        link: link.clone(),
        description: description.unwrap_or_default(),
    };
    Ok(build_feed(&meta, newest_first(api.items(entries, &link)))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{ProxyConfig, UpstreamConfig};

    fn client() -> UpstreamClient {
        UpstreamClient::new(&UpstreamConfig::default(), &ProxyConfig::default(), None).expect("client")
    }

    fn article_json(id: &str, access: &str, created: &str) -> Value {
        json!({
            "__typename": "Article",
            "id": id,
            "title": format!("Title {}", id),
            "slug": "a-slug",
            "mediaHash": format!("hash{}", id),
            "summary": "sum < mary",
            "content": "<p>body<script>x()</script></p>",
            "createdAt": created,
            "author": {"userName": "ferris", "displayName": "Ferris"},
            "access": {"type": access}
        })
    }

    #[test]
    fn nodes_dispatch_on_typename() {
        let article = Entry::from_value(article_json("1", "public", "2024-05-01T08:00:00.000Z")).expect("article");
        assert!(matches!(article, Entry::Article(a) if a.media_hash == "hash1"));
        let other = Entry::from_value(json!({"__typename": "Draft", "id": "9"})).expect("draft");
        assert!(matches!(other, Entry::Unrecognized(k) if k == "Draft"));
        assert!(Entry::from_value(json!({"__typename": "Article", "id": "2"})).is_err());
    }

    #[test]
    fn article_item_links_to_the_canonical_page() {
        let client = client();
        let api = MattersApi::new(&client, "https://server.matters.news/graphql", "https://matters.news/");
        let entry = Entry::from_value(article_json("1", "paywall", "2024-05-01T08:00:00.000Z")).expect("article");
        let (item, _) = api.entry_to_item(entry, "https://matters.news/").expect("item");

        assert_eq!(item.title, "[付费作品] Title 1");
        assert_eq!(item.link, "https://matters.news/@ferris/a-slug-hash1");
        assert_eq!(item.author.as_deref(), Some("Ferris"));
        assert!(item.description.starts_with("<p>sum &lt; mary</p>"));
        assert!(!item.description.contains("script"));
    }

    #[test]
    fn comment_item_names_article_reply_and_thread_anchor() {
        let client = client();
        let api = MattersApi::new(&client, "https://server.matters.news/graphql", "https://matters.news");
        let comment = json!({
            "__typename": "Comment",
            "id": "c2",
            "content": "<p>Agreed, mostly. More later</p>",
            "createdAt": "2024-05-02T09:30:00.000Z",
            "author": {"id": "u1", "userName": "bob", "displayName": "Bob"},
            "replyTo": {
                "id": "c1",
                "content": "<p>First!</p>",
                "createdAt": "2024-05-02T09:00:00.000Z",
                "author": {"id": "u2", "userName": "amy", "displayName": "Amy"}
            },
            "parentComment": {"id": "c1"},
            "node": article_json("7", "public", "2024-05-01T08:00:00.000Z")
        });
        let (item, at) = api
            .entry_to_item(Entry::from_value(comment).expect("comment"), "https://matters.news/@bob")
            .expect("item");

        assert_eq!(item.title, "[评论] Agreed");
        assert_eq!(item.link, "https://matters.news/@ferris/a-slug-hash7#c1-c2");
        assert!(item.description.contains("《Title 7》"));
        assert!(item.description.contains(r#"<a href="https://matters.news/@amy">Amy</a>"#));
        assert!(item.description.contains("2024-05-02 09:30:00"));
        assert_eq!(at.to_rfc3339(), "2024-05-02T09:30:00+00:00");
    }

    #[test]
    fn broadcast_without_article_uses_the_fallback_link() {
        let client = client();
        let api = MattersApi::new(&client, "https://server.matters.news/graphql", "https://matters.news");
        let broadcast = Entry::from_value(json!({
            "__typename": "Comment",
            "id": "b1",
            "content": "<p>Hello members</p>",
            "createdAt": "2024-05-03T00:00:00.000Z",
            "author": {"userName": "ferris", "displayName": "Ferris"},
            "node": {}
        }))
        .expect("broadcast")
        .into_broadcast();
        let (item, _) = api.entry_to_item(broadcast, "https://matters.news/~crabs").expect("item");
        assert_eq!(item.title, "[广播] Hello members");
        assert_eq!(item.link, "https://matters.news/~crabs#b1");
    }

    #[test]
    fn switches_and_kinds_parse_leniently() {
        assert!(switch_enabled(None));
        assert!(switch_enabled(Some("1")));
        assert!(!switch_enabled(Some("0")));
        assert_eq!(FeedKind::from_arg(Some("icymi")), FeedKind::Icymi);
        assert_eq!(FeedKind::from_arg(Some("bogus")), FeedKind::Hottest);
        assert_eq!(FeedKind::from_arg(None).label(), "热门");
    }
}
