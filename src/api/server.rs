use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, routing::get, routing::post};
use tokio::net::TcpListener;
use tower_http::decompression::RequestDecompressionLayer;
use tracing::info;

use super::{
    services::{
        cancel_session, get_session, health, ingest_upload, ingest_url, sse_events, ws_events,
    },
    state::AppState,
};
use crate::config::{Config, StorageProvider};
use crate::convert::PassthroughExecutor;
use crate::dedup::DuplicateDetector;
use crate::observability::Metrics;
use crate::progress::{relay_events, ProgressBroadcaster, TransportManager, WebhookChannel};
use crate::queue::ConversionQueue;
use crate::session::SessionTracker;
use crate::storage::StorageClient;
use crate::store::MediaStore;

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/uploads", post(ingest_upload))
        .route("/uploads/url", post(ingest_url))
        .route("/sessions/{session_id}", get(get_session))
        .route("/sessions/{session_id}/cancel", post(cancel_session))
        .route("/sessions/{session_id}/events", get(sse_events))
        .route("/sessions/{session_id}/ws", get(ws_events))
        .route("/health", get(health))
        .with_state(state)
        // Automatically decompress gzip/deflate/brotli request bodies
        // Handles Content-Encoding header transparently at the middleware level
        .layer(RequestDecompressionLayer::new())
}

pub async fn run(address: Option<SocketAddr>) -> Result<(), AnyError> {
    // Load config
    info!("Loading configuration");
    let config =
        Config::load().map_err(|e| format!("Failed to load config: {}", e))?;
    let address = address.unwrap_or(config.server.bind_addr);

    // Open Fjall store
    info!(path = %config.server.fjall_path.display(), "Opening media store");
    let store = Arc::new(
        MediaStore::open(&config.server.fjall_path)
            .map_err(|e| format!("Failed to open media store: {}", e))?,
    );

    // Initialize blob storage
    let storage = Arc::new(match config.storage.provider {
        StorageProvider::Local => StorageClient::local(&config.storage.path)
            .map_err(|e| format!("Failed to open blob storage: {}", e))?,
        StorageProvider::Memory => StorageClient::in_memory(),
        StorageProvider::S3 => {
            return Err("S3 blob storage is configured but not yet wired up".into());
        }
    });

    let sessions = Arc::new(SessionTracker::new(store.clone()));
    let broadcaster = ProgressBroadcaster::new(
        config.progress.success_grace(),
        config.progress.failure_grace(),
    );
    let detector = Arc::new(DuplicateDetector::new(store.clone(), config.dedup));
    let metrics = Arc::new(Metrics::default());
    let http = reqwest::Client::new();

    // Outbound progress relay, when a downstream endpoint is configured
    if let Some(relay_url) = config.progress.relay_url.clone() {
        info!(url = %relay_url, "Starting progress relay");
        let push = Arc::new(WebhookChannel::new(http.clone(), relay_url));
        let fallback = config
            .progress
            .relay_fallback_url
            .clone()
            .map(|url| Arc::new(WebhookChannel::new(http.clone(), url)) as _);
        let manager = Arc::new(TransportManager::new(
            push,
            fallback,
            config.progress.transport_policy(),
        ));
        let (_, events) = broadcaster.subscribe_global().await;
        tokio::spawn(relay_events(manager, events));
    }

    // TODO: swap in an ffmpeg-backed executor once the sidecar lands
    let executor = Arc::new(PassthroughExecutor);
    let queue = ConversionQueue::new(
        &config.queue,
        executor,
        broadcaster.clone(),
        sessions.clone(),
        store.clone(),
        storage.clone(),
        metrics.clone(),
    );

    let state = AppState {
        config: Arc::new(config),
        store,
        storage,
        sessions,
        queue,
        broadcaster,
        detector,
        metrics,
        http,
    };

    let app = router(state);

    let listener = TcpListener::bind(address).await?;
    info!(%address, "Soundbox API listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// One-shot retention sweep, for `soundbox prune`. Deletes sessions and
/// job records older than the configured TTLs and syncs the store.
pub async fn prune() -> Result<(), AnyError> {
    let config =
        Config::load().map_err(|e| format!("Failed to load config: {}", e))?;

    info!(path = %config.server.fjall_path.display(), "Opening media store");
    let store = MediaStore::open(&config.server.fjall_path)
        .map_err(|e| format!("Failed to open media store: {}", e))?;

    let stats = store.prune_expired(
        config.retention.session_ttl_days,
        config.retention.job_ttl_days,
    )?;
    store.persist()?;

    info!(
        sessions_removed = stats.sessions_removed,
        jobs_removed = stats.jobs_removed,
        "Retention sweep finished"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
