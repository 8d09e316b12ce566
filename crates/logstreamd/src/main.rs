use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use logstream_core::{
    init_tracing, ChunkFetcher, JenkinsFetcher, MemoryBuildStore, PostBuildConfig, PostBuildPool,
    StreamConfig, StreamCoordinator, UpstreamConfig,
};
use tokio::signal;
use tracing::{info, warn, Level};

mod routes;

/// Live CI build-log streaming daemon.
#[derive(Parser, Debug)]
#[command(name = "logstreamd", version)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "LOGSTREAM_LISTEN", default_value = "0.0.0.0:8087")]
    listen: SocketAddr,

    /// Base URL of the CI server
    #[arg(long, env = "LOGSTREAM_UPSTREAM_URL")]
    upstream_url: String,

    #[arg(long, env = "LOGSTREAM_UPSTREAM_USER")]
    upstream_user: Option<String>,

    #[arg(long, env = "LOGSTREAM_UPSTREAM_TOKEN", hide_env_values = true)]
    upstream_token: Option<String>,

    /// Per-request timeout against the CI server, in seconds
    #[arg(long, env = "LOGSTREAM_UPSTREAM_TIMEOUT_SECS", default_value_t = 30)]
    upstream_timeout_secs: u64,

    /// Sleep between two fetches of the same build, in milliseconds
    #[arg(long, env = "LOGSTREAM_POLL_INTERVAL_MS", default_value_t = 1000)]
    poll_interval_ms: u64,

    /// Longest time a viewer stays connected before it must reconnect
    #[arg(long, env = "LOGSTREAM_SUBSCRIBER_TIMEOUT_SECS", default_value_t = 3600)]
    subscriber_timeout_secs: u64,

    #[arg(long, env = "LOGSTREAM_POST_BUILD_WORKERS", default_value_t = 2)]
    post_build_workers: usize,

    #[arg(long, env = "LOGSTREAM_POST_BUILD_QUEUE", default_value_t = 32)]
    post_build_queue: usize,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,
}

impl Args {
    fn upstream(&self) -> UpstreamConfig {
        let mut config = UpstreamConfig::new(&self.upstream_url);
        if let (Some(user), Some(token)) = (&self.upstream_user, &self.upstream_token) {
            config = config.with_credentials(user, token);
        }
        config.request_timeout = Duration::from_secs(self.upstream_timeout_secs);
        config
    }

    fn stream(&self) -> StreamConfig {
        StreamConfig::default()
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_subscriber_timeout(Duration::from_secs(self.subscriber_timeout_secs))
    }

    fn post_build(&self) -> PostBuildConfig {
        PostBuildConfig {
            workers: self.post_build_workers,
            queue_capacity: self.post_build_queue,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs, Level::INFO);

    let post_build_config = args.post_build();
    post_build_config
        .validate()
        .context("invalid post-build settings")?;

    let jenkins = JenkinsFetcher::new(args.upstream())
        .context("failed to build upstream client")?;
    let fetcher: Arc<dyn ChunkFetcher> = Arc::new(jenkins);
    let coordinator = StreamCoordinator::new(Arc::clone(&fetcher), args.stream());
    warn!(
        event = "store.not_durable",
        "build results and stages are kept in memory and lost on restart"
    );
    let store = Arc::new(MemoryBuildStore::new());
    let post_build = Arc::new(PostBuildPool::new(fetcher, store, post_build_config));

    let state = routes::AppState {
        coordinator: coordinator.clone(),
        post_build: Arc::clone(&post_build),
    };

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!(listen = %args.listen, upstream = %args.upstream_url, "logstreamd started");

    axum::serve(listener, routes::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    coordinator.shutdown().await;
    post_build.shutdown().await;
    info!("logstreamd stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
