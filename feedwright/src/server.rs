use std::future::Future;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rocket::http::Status;
use rocket::request::Request;
use rocket::response::{self, Responder, Response};
use rocket::serde::json::Json;
use rocket::{catch, catchers, get, routes, Build, FromForm, Rocket, State};
use serde::Serialize;
use tokio::sync::mpsc::Receiver;
use tracing::info;

use common::Config;

use crate::cache::queue::FetchQueue;
use crate::cache::ArticleCache;
use crate::error::{FeedError, StatusPage};
use crate::feed::{PageLimits, RenderOptions, RssFeed, FEED_CACHE_CONTROL};
use crate::fetch::proxy::{HttpProxyList, ProxyPool};
use crate::fetch::UpstreamClient;
use crate::html::pic::PicProxy;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::sites::jike::{jike_feed, DataPlan, JikeTarget};
use crate::sites::matters::{self, switch_enabled, FeedKind, MattersApi};
use crate::sites::zhihu::column::ColumnSource;
use crate::sites::zhihu::{article, stream, ZhihuApi};
use crate::sites::{gogs, telegram, v2ex};

/// Application state stored inside Rocket managed state.
#[derive(Clone)]
pub struct AppState {
    pub started_at: DateTime<Utc>,
    pub config: Arc<Config>,
    pub upstream: Arc<UpstreamClient>,
    pub zhihu: Arc<ZhihuApi>,
    pub proxies: Option<Arc<ProxyPool>>,
    pub cache: Arc<ArticleCache>,
    pub queue: Arc<FetchQueue>,
    pub metrics: Arc<Metrics>,
    pub limits: PageLimits,
}

/// Wire up the shared clients, cache and fill queue. The returned receiver
/// belongs to the background fetcher.
pub fn build_state(config: Config) -> Result<(AppState, Receiver<u64>)> {
    let proxies = match (&config.proxy.list_url, config.proxy.enabled) {
        (Some(url), true) => {
            let source = HttpProxyList::new(url.clone())?;
            info!(list_url = %url, "proxy rotation enabled for zhihu");
            Some(Arc::new(ProxyPool::new(
                Box::new(source),
                config.proxy.low_water,
                config.proxy.initial_score,
            )))
        }
        (None, true) => {
            tracing::warn!("proxy.enabled is set without proxy.list_url; fetching directly");
            None
        }
        _ => None,
    };

    let upstream = Arc::new(UpstreamClient::new(&config.upstream, &config.proxy, proxies.clone())?);
    let zhihu = Arc::new(ZhihuApi::new(upstream.clone(), &config.upstream, proxies.is_some()));
    let metrics = Arc::new(Metrics::new());
    let (queue, rx) = FetchQueue::new(config.cache.queue_capacity, metrics.clone());

    let state = AppState {
        started_at: Utc::now(),
        cache: Arc::new(ArticleCache::from_config(&config.cache)),
        limits: PageLimits::from_config(&config.feed),
        config: Arc::new(config),
        upstream,
        zhihu,
        proxies,
        queue: Arc::new(queue),
        metrics,
    };
    Ok((state, rx))
}

async fn timed<T, F>(state: &AppState, name: &str, fut: F) -> T
where
    F: Future<Output = T>,
{
    let started = Instant::now();
    let out = fut.await;
    state.metrics.timing(name, started.elapsed().as_millis());
    out
}

/// A standalone HTML document.
#[derive(Debug)]
pub struct HtmlPage(pub String);

impl<'r> Responder<'r, 'static> for HtmlPage {
    fn respond_to(self, _req: &'r Request<'_>) -> response::Result<'static> {
        Response::build()
            .status(Status::Ok)
            .raw_header("Content-Type", "text/html; charset=utf-8")
            .raw_header("Cache-Control", FEED_CACHE_CONTROL)
            .sized_body(self.0.len(), Cursor::new(self.0))
            .ok()
    }
}

/// Response structure for `/api/v1/status`.
#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    uptime_seconds: i64,
    queue_in_flight: usize,
    queue_capacity: usize,
    proxy_pool_size: Option<usize>,
    metrics: MetricsSnapshot,
}

#[get("/health")]
async fn health() -> &'static str {
    "OK"
}

/// Status endpoint returning uptime, fill queue depth and counters.
#[get("/api/v1/status")]
async fn status(state: &State<AppState>) -> Json<StatusResponse> {
    let uptime = (Utc::now() - state.started_at).num_seconds();
    Json(StatusResponse {
        status: "ok",
        uptime_seconds: uptime,
        queue_in_flight: state.queue.in_flight(),
        queue_capacity: state.queue.capacity(),
        proxy_pool_size: state.proxies.as_ref().map(|p| p.len()),
        metrics: state.metrics.snapshot(),
    })
}

#[get("/zhihuzhuanlan/<name>?<pic>&<digest>&<fullonly>")]
async fn zhihu_column(
    state: &State<AppState>,
    name: &str,
    pic: Option<&str>,
    digest: Option<&str>,
    fullonly: Option<&str>,
) -> Result<RssFeed, FeedError> {
    let opts = RenderOptions::from_query(pic, digest, fullonly)?;
    let source = ColumnSource {
        api: &state.zhihu,
        cache: &state.cache,
        queue: &state.queue,
        metrics: &state.metrics,
        limits: state.limits,
    };
    timed(state, "zhihu_column", source.feed(name, opts)).await.map(RssFeed)
}

#[get("/zhihu/<name>?<pic>&<digest>")]
async fn zhihu_stream(
    state: &State<AppState>,
    name: &str,
    pic: Option<&str>,
    digest: Option<&str>,
) -> Result<RssFeed, FeedError> {
    let opts = RenderOptions::from_query(pic, digest, None)?;
    let feed = stream::activities_feed(&state.zhihu, name, opts, state.limits);
    timed(state, "zhihu_stream", feed).await.map(RssFeed)
}

#[get("/static_zhihu/<id>?<pic>")]
async fn zhihu_static(state: &State<AppState>, id: u64, pic: Option<&str>) -> Result<HtmlPage, FeedError> {
    let pic = PicProxy::from_arg(pic)?;
    let data = timed(state, "zhihu_static", article::fetch_article(&state.zhihu, id)).await?;
    Ok(HtmlPage(article::render_page(&state.zhihu, id, &data, pic)))
}

#[get("/v2ex/<tid>")]
async fn v2ex_comments(state: &State<AppState>, tid: &str) -> Result<RssFeed, FeedError> {
    let feed = v2ex::comments_feed(&state.upstream, &state.config.upstream.v2ex, tid);
    timed(state, "v2ex", feed).await.map(RssFeed)
}

#[get("/tgchannel/<channel>")]
async fn tg_channel(state: &State<AppState>, channel: &str) -> Result<RssFeed, FeedError> {
    let feed = telegram::channel_feed(&state.upstream, &state.config.upstream.telegram, channel);
    timed(state, "tgchannel", feed).await.map(RssFeed)
}

#[get("/jike/user/<id>?<data>")]
async fn jike_user(state: &State<AppState>, id: &str, data: Option<&str>) -> Result<RssFeed, FeedError> {
    let feed = jike_feed(&state.upstream, &state.config.upstream.jike, JikeTarget::User, id, DataPlan::from_arg(data));
    timed(state, "jike_user", feed).await.map(RssFeed)
}

#[get("/jike/topic/<id>?<data>")]
async fn jike_topic(state: &State<AppState>, id: &str, data: Option<&str>) -> Result<RssFeed, FeedError> {
    let feed = jike_feed(&state.upstream, &state.config.upstream.jike, JikeTarget::Topic, id, DataPlan::from_arg(data));
    timed(state, "jike_topic", feed).await.map(RssFeed)
}

fn matters_api(state: &AppState) -> MattersApi<'_> {
    MattersApi::new(
        &state.upstream,
        &state.config.upstream.matters_api,
        &state.config.upstream.matters_www,
    )
}

/// The `type` query argument of the Matters listings.
#[derive(Debug, FromForm)]
struct ListingType<'r> {
    #[field(name = "type")]
    kind: Option<&'r str>,
}

#[get("/matters/feed?<listing..>")]
async fn matters_recommended(state: &State<AppState>, listing: ListingType<'_>) -> Result<RssFeed, FeedError> {
    let api = matters_api(state);
    let feed = matters::recommendation_feed(&api, FeedKind::from_arg(listing.kind));
    timed(state, "matters_feed", feed).await.map(RssFeed)
}

#[get("/matters/user/<name>?<article>&<response>")]
async fn matters_user(
    state: &State<AppState>,
    name: &str,
    article: Option<&str>,
    response: Option<&str>,
) -> Result<RssFeed, FeedError> {
    let api = matters_api(state);
    let feed = matters::user_feed(&api, name, switch_enabled(article), switch_enabled(response));
    timed(state, "matters_user", feed).await.map(RssFeed)
}

#[get("/matters/topic/<id>?<listing..>")]
async fn matters_topic(state: &State<AppState>, id: &str, listing: ListingType<'_>) -> Result<RssFeed, FeedError> {
    let api = matters_api(state);
    let feed = matters::topic_feed(&api, id, listing.kind == Some("selected"));
    timed(state, "matters_topic", feed).await.map(RssFeed)
}

#[get("/matters/circle/<name>?<article>&<broadcast>")]
async fn matters_circle(
    state: &State<AppState>,
    name: &str,
    article: Option<&str>,
    broadcast: Option<&str>,
) -> Result<RssFeed, FeedError> {
    let api = matters_api(state);
    let feed = matters::circle_feed(&api, name, switch_enabled(article), switch_enabled(broadcast));
    timed(state, "matters_circle", feed).await.map(RssFeed)
}

#[get("/gogs/<host>/<user>/<repo>/issues/<nr>")]
async fn gogs_issue(
    state: &State<AppState>,
    host: &str,
    user: &str,
    repo: &str,
    nr: u64,
) -> Result<RssFeed, FeedError> {
    let feed = gogs::issue_feed(&state.upstream, &state.config.upstream.gogs_scheme, host, user, repo, nr);
    timed(state, "gogs_issue", feed).await.map(RssFeed)
}

#[catch(default)]
fn default_catcher(status: Status, _req: &Request<'_>) -> StatusPage {
    StatusPage(status)
}

/// Assemble the Rocket instance without binding it, so tests can drive it
/// through a local client.
pub fn build_rocket(state: AppState) -> Rocket<Build> {
    let fig = rocket::Config::figment()
        .merge(("address", state.config.server.address.clone()))
        .merge(("port", state.config.server.port));

    rocket::custom(fig)
        .manage(state)
        .mount(
            "/",
            routes![
                health,
                status,
                zhihu_column,
                zhihu_stream,
                zhihu_static,
                v2ex_comments,
                tg_channel,
                jike_user,
                jike_topic,
                matters_recommended,
                matters_user,
                matters_topic,
                matters_circle,
                gogs_issue,
            ],
        )
        .register("/", catchers![default_catcher])
}

/// Launch the Rocket server and block until it shuts down.
pub async fn launch_rocket(state: AppState) -> Result<()> {
    info!(
        address = %state.config.server.address,
        port = state.config.server.port,
        "starting feed server"
    );
    build_rocket(state)
        .launch()
        .await
        .map_err(|e| anyhow!("Rocket failed: {}", e))?;
    Ok(())
}
