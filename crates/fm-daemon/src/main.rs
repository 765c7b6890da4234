//! fm-daemon entry point: the composition root.
//!
//! Boot order matters here — migrate, restore interrupted jobs, then spawn
//! the background loops (workers, relay, janitor) before accepting HTTP.
//! Handlers live in `routes.rs`, shared state in `state.rs`; nothing below
//! retrieves a dependency by name, everything is constructed once and
//! passed in.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use fm_config::Settings;
use fm_daemon::{routes, state};
use fm_janitor::JanitorConfig;
use fm_media::MediaRunner;
use fm_pipeline::Pipeline;
use fm_queue::{restore_on_start, CancelRegistry, ProgressBus, WorkerPool};
use fm_relay::{Relay, SubscriberRegistry};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Dev machines keep FM_DATABASE_URL in .env.local; a missing file is
    // fine.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let settings = load_settings()?;

    let pool = fm_db::connect_from_env().await?;
    fm_db::migrate(&pool).await?;

    // Restore interrupted work before any worker claims.
    let restored = restore_on_start(&pool).await?;
    info!(
        enqueued = restored.enqueued,
        released = restored.released_claims,
        "restoration done"
    );

    let cancels = CancelRegistry::new();
    let progress = ProgressBus::default();
    let pipeline = Pipeline::new(pool.clone(), settings.costs.clone(), cancels.clone());
    let shared = Arc::new(state::AppState::new(pool.clone(), pipeline));

    // Event fanout: relay -> SSE bus; progress bus -> SSE bus.
    let registry = Arc::new(SubscriberRegistry::new());
    state::wire_event_fanout(&registry, shared.bus.clone());
    state::spawn_progress_forwarder(&progress, shared.bus.clone());

    let _relay = Relay::new(
        pool.clone(),
        settings.relay.clone(),
        Arc::clone(&registry),
        "fm-daemon",
    )
    .start();

    let runner = Arc::new(MediaRunner::new(
        settings.media.clone(),
        settings.storage.root.clone(),
    ));
    let _workers = WorkerPool::new(
        pool.clone(),
        runner,
        settings.workers.clone(),
        progress.clone(),
        cancels.clone(),
    )
    .start();

    let _janitor = fm_janitor::start(pool.clone(), JanitorConfig::from_settings(&settings.janitor));

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8787)));
    info!("fm-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Layered YAML config from FM_CONFIG (comma-separated paths); defaults
/// when unset or empty.
fn load_settings() -> anyhow::Result<Settings> {
    match std::env::var("FM_CONFIG") {
        Ok(paths) if !paths.trim().is_empty() => {
            let paths: Vec<&str> = paths.split(',').map(str::trim).collect();
            let loaded = fm_config::load_layered_yaml(&paths)?;
            info!(config_hash = %loaded.config_hash, "config loaded");
            loaded.settings()
        }
        _ => Ok(Settings::default()),
    }
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("FM_DAEMON_ADDR").ok()?.parse().ok()
}

/// CORS for local front-end development: loopback hosts only, bare and on
/// the usual dev-server ports.
fn cors_localhost_only() -> CorsLayer {
    let mut origins: Vec<HeaderValue> = Vec::new();
    for host in ["localhost", "127.0.0.1"] {
        origins.extend(HeaderValue::from_str(&format!("http://{host}")).ok());
        for port in [3000u16, 5173] {
            origins.extend(HeaderValue::from_str(&format!("http://{host}:{port}")).ok());
        }
    }

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(tower_http::cors::Any)
}
