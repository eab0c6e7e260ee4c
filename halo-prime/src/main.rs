use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::routing::get;
use clap::Parser;
use halo_prime::{AppState, api, app_state, cache::MemoryCache, config::Config};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEV_SIGNING_SECRET: &str = "halo-dev-signing-secret";

#[derive(Parser)]
#[command(name = "halo-prime")]
#[command(about = "Halo Prime device bootstrap service")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "halo-prime.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "tracing=info,halo_prime=info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        info!(path = ?cli.config, "Loading configuration");
        Config::load(&cli.config)?
    } else {
        info!("No configuration file found, using defaults");
        Config::default()
    };

    if config.bootstrap.signing_secret == DEV_SIGNING_SECRET {
        warn!("Using the built-in development signing secret");
    }

    info!(
        http_addr = %config.server.http_addr,
        resolution_mode = ?config.bootstrap.resolution_mode,
        "Starting server"
    );

    let state = app_state(&config, MemoryCache::new());
    run_server(state, config.server.http_addr).await
}

async fn run_server(
    state: AppState<MemoryCache>,
    http_addr: SocketAddr,
) -> color_eyre::Result<()> {
    let cancel = CancellationToken::new();

    tokio::spawn(purge_expired_entries(state.guard.cache().clone(), cancel.clone()));

    let axum_app = api::router(state).route("/health", get(health_handler));

    let axum_listener = TcpListener::bind(http_addr).await?;
    info!(%http_addr, "HTTP server listening");

    let cancel_clone = cancel.clone();
    tokio::select! {
        result = axum::serve(axum_listener, axum_app).with_graceful_shutdown(async move {
            cancel_clone.cancelled().await;
        }) => {
            if let Err(e) = result {
                tracing::error!(error = ?e, "HTTP server error");
            }
            info!("HTTP server shut down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    cancel.cancel();
    Ok(())
}

async fn purge_expired_entries(cache: MemoryCache, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => match cache.purge_expired() {
                Ok(0) => {}
                Ok(purged) => debug!(purged, "purged expired idempotency entries"),
                Err(e) => warn!(error = %e, "failed to purge idempotency cache"),
            },
        }
    }
}

async fn health_handler() -> &'static str {
    "OK"
}
