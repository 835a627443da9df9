//! QuerySync inspector server
//!
//! Runs a query client over the in-memory backend and exposes its cache,
//! pending mutations and invalidation controls over HTTP.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use serde_json::json;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use querysync::entities::{THOUGHTS, THOUGHT_KEYS, TRENDING_KEYS, TRENDING_TOPICS};
use querysync::{api::create_router, spawn_gc_task, AppState, Config, MemoryBackend, QueryClient};

/// Main entry point for the inspector server.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Seed the in-memory backend and create the query client
/// 4. Warm the cache and subscribe to pushed changes
/// 5. Start background garbage collection
/// 6. Start HTTP server on configured port
/// 7. Handle graceful shutdown on SIGINT/SIGTERM
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "querysync=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting QuerySync inspector");

    let config = Config::from_env();
    info!(
        "Configuration loaded: stale_time={}ms, gc_time={}ms, retries={}, port={}, gc_interval={}s",
        config.default_stale_time_ms,
        config.default_gc_time_ms,
        config.default_retry_count,
        config.server_port,
        config.gc_interval
    );

    let backend = Arc::new(seeded_backend());
    let client = QueryClient::with_realtime(&config, backend.clone(), backend);

    // Keep the main lists observed so pushed changes refetch them
    let thoughts = client.watch(
        &THOUGHT_KEYS.list(),
        client.entity_fetcher(THOUGHTS, json!({})),
        client.default_options(),
    );
    let trending = client.watch(
        &TRENDING_KEYS.list(),
        client.entity_fetcher(TRENDING_TOPICS, json!({})),
        client.default_options(),
    );
    let subscriptions: Vec<_> = [THOUGHTS, TRENDING_TOPICS]
        .into_iter()
        .filter_map(|entity| client.subscribe_realtime(entity, None, None))
        .collect();
    info!(
        observers = 2,
        channels = subscriptions.len(),
        "Cache warmed and realtime channels open"
    );

    let mut notices = client.notices();
    let notice_handle = tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            info!(rule = %notice.rule, id = ?notice.id, "{}", notice.message);
        }
    });

    let gc_handle = spawn_gc_task(client.clone(), config.gc_interval);
    info!("Background garbage collection started");

    let app = create_router(AppState::new(client.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    gc_handle.abort();
    notice_handle.abort();
    drop(subscriptions);
    drop((thoughts, trending));
    client.teardown();
    warn!("Background tasks stopped");

    info!("Server shutdown complete");
    Ok(())
}

/// Demo data set with the same validation the hosted store enforces.
fn seeded_backend() -> MemoryBackend {
    let backend = MemoryBackend::new();
    backend.require(THOUGHTS, "content");
    backend.seed(
        THOUGHTS,
        vec![
            json!({"content": "Ship the offline mode", "author": "demo"}),
            json!({"content": "Voice notes should auto-tag", "author": "demo"}),
        ],
    );
    backend.seed(
        TRENDING_TOPICS,
        vec![
            json!({"topic": "offline", "mention_count": 3}),
            json!({"topic": "voice", "mention_count": 7}),
        ],
    );
    backend
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(%err, "Failed to install Ctrl+C handler");
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
                error!(%err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
