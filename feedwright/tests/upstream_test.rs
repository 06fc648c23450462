use std::sync::Arc;

use common::{ProxyConfig, UpstreamConfig};
use feedwright::error::FeedError;
use feedwright::fetch::proxy::{HttpProxyList, ProxyPool, ProxySignal, ProxySource};
use feedwright::fetch::{FetchOptions, UpstreamClient};
use mockito::Matcher;
use reqwest::header::HeaderMap;

fn client() -> UpstreamClient {
    let cfg = UpstreamConfig {
        timeout_seconds: 5,
        ..UpstreamConfig::default()
    };
    UpstreamClient::new(&cfg, &ProxyConfig::default(), None).expect("build client")
}

fn zhihu_opts() -> FetchOptions {
    FetchOptions {
        bot_marker: Some("unhuman"),
        use_proxy: false,
    }
}

#[tokio::test]
async fn permanent_redirect_is_followed_once() {
    let mut server = mockito::Server::new_async().await;
    let first = server
        .mock("GET", "/old")
        .with_status(301)
        .with_header("Location", "/new")
        .create_async()
        .await;
    let second = server
        .mock("GET", "/new")
        .with_status(301)
        .with_header("Location", "/newer")
        .create_async()
        .await;
    let third = server.mock("GET", "/newer").expect(0).create_async().await;

    let res = client()
        .fetch(&format!("{}/old", server.url()), HeaderMap::new(), &zhihu_opts())
        .await
        .expect("second 301 is accepted as-is");
    assert_eq!(res.status.as_u16(), 301);

    first.assert_async().await;
    second.assert_async().await;
    third.assert_async().await;
}

#[tokio::test]
async fn bot_challenge_and_missing_pages_are_classified() {
    let mut server = mockito::Server::new_async().await;
    let _challenge = server
        .mock("GET", "/challenge")
        .with_status(403)
        .with_body("<html>please verify: unhuman</html>")
        .create_async()
        .await;
    let _redirect = server
        .mock("GET", "/redirect")
        .with_status(302)
        .with_header("Location", "https://www.zhihu.com/account/unhuman?need_login=true")
        .create_async()
        .await;
    let _missing = server.mock("GET", "/missing").with_status(404).create_async().await;
    let _broken = server.mock("GET", "/broken").with_status(500).create_async().await;

    let client = client();
    let get = |path: &str| {
        let url = format!("{}{}", server.url(), path);
        let client = &client;
        async move { client.fetch_text(&url, &zhihu_opts()).await }
    };

    assert!(matches!(get("/challenge").await, Err(FeedError::RateLimited(_))));
    assert!(matches!(get("/redirect").await, Err(FeedError::RateLimited(_))));
    assert!(matches!(get("/missing").await, Err(FeedError::NotFound)));
    assert!(matches!(get("/broken").await, Err(FeedError::UpstreamStatus(s)) if s.as_u16() == 500));
}

#[tokio::test]
async fn default_user_agent_is_sent() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/ua")
        .match_header("user-agent", mockito::Matcher::Regex("Firefox".into()))
        .with_body("ok")
        .create_async()
        .await;

    let body = client()
        .fetch_text(&format!("{}/ua", server.url()), &FetchOptions::default())
        .await
        .expect("fetch");
    assert_eq!(body, "ok");
    mock.assert_async().await;
}

#[tokio::test]
async fn proxy_pool_refills_from_list_and_drops_dead_endpoints() {
    let mut server = mockito::Server::new_async().await;
    let list = server
        .mock("GET", "/proxies.txt")
        .with_body("# fresh list\n10.0.0.1:8080\n\nnot-a-proxy\n10.0.0.2:3128\n10.0.0.1:8080\n")
        .expect_at_least(1)
        .create_async()
        .await;

    let source = HttpProxyList::new(format!("{}/proxies.txt", server.url())).expect("source");
    let pool = Arc::new(ProxyPool::new(Box::new(source), 10, 2));

    let endpoint = pool.checkout().await.expect("pool refilled on demand");
    assert_eq!(pool.len(), 2);
    list.assert_async().await;

    pool.report(&endpoint, ProxySignal::BotChallenge);
    assert_eq!(pool.score_of(&endpoint.address), None);
    assert_eq!(pool.len(), 1);
}

/// A fixed proxy list, served without validation.
struct FixedList(Vec<String>);

#[async_trait::async_trait]
impl ProxySource for FixedList {
    async fn fetch_proxies(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

fn proxied_client(address: &str) -> (UpstreamClient, Arc<ProxyPool>) {
    let pool = Arc::new(ProxyPool::new(Box::new(FixedList(vec![address.to_string()])), 1, 10));
    let cfg = UpstreamConfig {
        timeout_seconds: 5,
        ..UpstreamConfig::default()
    };
    let proxy_cfg = ProxyConfig {
        request_timeout_seconds: 5,
        ..ProxyConfig::default()
    };
    let client = UpstreamClient::new(&cfg, &proxy_cfg, Some(pool.clone())).expect("build client");
    (client, pool)
}

fn proxied_opts() -> FetchOptions {
    FetchOptions {
        bot_marker: Some("unhuman"),
        use_proxy: true,
    }
}

#[tokio::test]
async fn proxied_success_raises_the_score() {
    let mut proxy = mockito::Server::new_async().await;
    let relayed = proxy
        .mock("GET", Matcher::Any)
        .with_body("via proxy")
        .create_async()
        .await;
    let address = proxy.host_with_port();
    let (client, pool) = proxied_client(&address);

    let body = client
        .fetch_text("http://upstream.test/p/1", &proxied_opts())
        .await
        .expect("fetch through proxy");
    assert_eq!(body, "via proxy");
    assert_eq!(pool.score_of(&address), Some(11));
    relayed.assert_async().await;
}

#[tokio::test]
async fn proxied_forbidden_halves_the_score() {
    let mut proxy = mockito::Server::new_async().await;
    let _forbidden = proxy
        .mock("GET", Matcher::Any)
        .with_status(403)
        .with_body("denied")
        .create_async()
        .await;
    let address = proxy.host_with_port();
    let (client, pool) = proxied_client(&address);

    let err = client
        .fetch_text("http://upstream.test/p/1", &proxied_opts())
        .await
        .expect_err("403 is an error");
    assert!(matches!(err, FeedError::UpstreamStatus(s) if s.as_u16() == 403));
    assert_eq!(pool.score_of(&address), Some(5));
}

#[tokio::test]
async fn proxied_bot_redirect_evicts_the_endpoint() {
    let mut proxy = mockito::Server::new_async().await;
    let _challenge = proxy
        .mock("GET", Matcher::Any)
        .with_status(302)
        .with_header("Location", "https://www.zhihu.com/account/unhuman?need_login=true")
        .create_async()
        .await;
    let address = proxy.host_with_port();
    let (client, pool) = proxied_client(&address);

    let err = client
        .fetch_text("http://upstream.test/p/1", &proxied_opts())
        .await
        .expect_err("bot redirect");
    assert!(matches!(err, FeedError::RateLimited(_)));
    assert_eq!(pool.score_of(&address), None);
    assert!(pool.is_empty());
}

#[tokio::test]
async fn unreachable_proxy_halves_the_score() {
    let closed = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let address = closed.local_addr().expect("addr").to_string();
    drop(closed);
    let (client, pool) = proxied_client(&address);

    assert!(client
        .fetch_text("http://upstream.test/p/1", &proxied_opts())
        .await
        .is_err());
    assert_eq!(pool.score_of(&address), Some(5));
}

#[tokio::test]
async fn malformed_proxy_entry_falls_back_to_a_direct_fetch() {
    let mut server = mockito::Server::new_async().await;
    let direct = server.mock("GET", "/p/1").with_body("direct").create_async().await;
    let (client, pool) = proxied_client("bad host:8080");

    let body = client
        .fetch_text(&format!("{}/p/1", server.url()), &proxied_opts())
        .await
        .expect("direct fetch");
    assert_eq!(body, "direct");
    assert_eq!(pool.score_of("bad host:8080"), None);
    direct.assert_async().await;
}
