/*
feedwright - single-binary main.rs
This binary starts the Rocket HTTP server and runs the background article fetcher inside the same process.
*/

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use common::Config;
use tokio::sync::Notify;
use tokio::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use feedwright::cache::worker::{supervise, Backoff, BackgroundFetcher};
use feedwright::server::{build_state, launch_rocket};
use feedwright::sites::zhihu::article::ZhihuArticleSource;

#[derive(Parser, Debug)]
#[command(name = "feedwright", about = "Feedwright RSS server + background article fetcher")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Disable the background fetcher (column feeds then only show cached full text)
    #[arg(long)]
    no_worker: bool,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    // Resolve config paths
    let default_path = PathBuf::from("config.default.toml");
    let override_path = if let Some(p) = args.config {
        if !p.exists() {
            error!(path = ?p, "specified config file not found");
            return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
        }
        Some(p)
    } else {
        let p = PathBuf::from("config.toml");
        if p.exists() { Some(p) } else { None }
    };

    let config = match Config::load_with_defaults(
        if default_path.exists() { Some(&default_path) } else { None },
        override_path.as_deref(),
    )
    .await
    {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(%e, "failed to load configuration");
            return Err(e);
        }
    };
    info!(default = ?default_path, override = ?override_path, "configuration loaded");
    info!(cache_root = %config.cache.root, shard_size = config.cache.shard_size, "article cache");

    let worker_enabled = config.worker.enabled && !args.no_worker;
    let backoff = Backoff::from_config(&config.worker);
    let (state, rx) = build_state(config)?;

    // Prepare a shutdown notifier to signal worker tasks
    let shutdown_notify = Arc::new(Notify::new());

    let mut worker_handle = None;
    if worker_enabled {
        info!("Spawning background fetcher task");
        let fetcher = Arc::new(BackgroundFetcher::new(
            Arc::new(ZhihuArticleSource::new(state.zhihu.clone())),
            state.cache.clone(),
            state.queue.clone(),
            rx,
            state.metrics.clone(),
            backoff,
        ));
        let w_shutdown = shutdown_notify.clone();
        worker_handle = Some(tokio::spawn(async move {
            let task_shutdown = w_shutdown.clone();
            supervise(
                "background fetcher",
                move || {
                    let fetcher = fetcher.clone();
                    let shutdown = task_shutdown.clone();
                    async move { fetcher.run(shutdown).await }
                },
                backoff,
                w_shutdown,
            )
            .await
        }));
    } else {
        // Dropping the receiver closes the queue; uncached items keep their placeholder.
        drop(rx);
        info!("Background fetcher disabled");
    }

    info!("Launching Rocket HTTP server");
    if let Err(e) = launch_rocket(state).await {
        error!(%e, "Rocket server failed");
    }

    info!("HTTP server stopped; notifying worker to shutdown");
    shutdown_notify.notify_waiters();

    if let Some(handle) = worker_handle {
        match tokio::time::timeout(Duration::from_secs(20), handle).await {
            Ok(Ok(restarts)) => info!(restarts, "worker exited cleanly"),
            Ok(Err(join_err)) => error!(%join_err, "worker task panicked"),
            Err(_) => info!("Timed out waiting for worker to exit; continuing shutdown"),
        }
    }

    info!("Shutdown complete");
    Ok(())
}
