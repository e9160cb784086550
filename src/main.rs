use workshop::api::{self, ApiState};
use workshop::blobs::BlobStore;
use workshop::config::Config;
use workshop::fanout::Registry;
use workshop::messages::MessageStore;
use workshop::presence::PresenceStore;
use workshop::tasks::TaskStore;
use workshop::{cleanup, db, fanout};

use anyhow::Context as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_env();
    let pool = db::connect(&config.db_path).await?;
    let blobs = BlobStore::open(&config.blob_dir).await?;

    let messages = MessageStore::new(pool.clone());
    let tasks = TaskStore::new(pool.clone());
    let presence = PresenceStore::new(pool);
    let registry = Arc::new(Registry::default());

    fanout::spawn_keepalive(registry.clone());
    cleanup::spawn(messages.clone(), presence.clone(), config.retention_days);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let state = Arc::new(ApiState {
        config: config.clone(),
        messages,
        tasks,
        presence,
        blobs,
        registry,
        started_at: Instant::now(),
    });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(
        %addr,
        db = %config.db_path.display(),
        blobs = %config.blob_dir.display(),
        retention_days = config.retention_days,
        "workshop listening"
    );

    axum::serve(listener, api::app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .init();
}

/// Resolve on SIGINT or SIGTERM. In-flight streams close with the acceptor.
async fn shutdown_signal() {
    let interrupt = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::warn!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
