//! Shared state handed to every handler.

use crate::blobs::BlobStore;
use crate::config::Config;
use crate::fanout::Registry;
use crate::messages::MessageStore;
use crate::presence::PresenceStore;
use crate::tasks::TaskStore;
use std::sync::Arc;
use std::time::Instant;

pub struct ApiState {
    pub config: Config,
    pub messages: MessageStore,
    pub tasks: TaskStore,
    pub presence: PresenceStore,
    pub blobs: BlobStore,
    pub registry: Arc<Registry>,
    pub started_at: Instant,
}

/// State over an in-memory database and a throwaway blob directory.
#[cfg(test)]
pub(crate) async fn test_state() -> Arc<ApiState> {
    let pool = crate::db::connect_memory().await;
    let blob_dir = std::env::temp_dir().join(format!("workshop-test-{}", crate::id::mint()));

    Arc::new(ApiState {
        config: Config::default(),
        messages: MessageStore::new(pool.clone()),
        tasks: TaskStore::new(pool.clone()),
        presence: PresenceStore::new(pool),
        blobs: BlobStore::open(&blob_dir).await.expect("temp blob dir"),
        registry: Arc::new(Registry::default()),
        started_at: Instant::now(),
    })
}
