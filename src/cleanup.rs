//! Periodic retention sweep.
//!
//! Runs at startup and then hourly: old messages fall out of the log after
//! the configured retention window, presence rows after seven days. Blobs
//! are never deleted. Failures are logged and retried on the next tick.

use crate::messages::MessageStore;
use crate::presence::{self, PresenceStore};
use std::time::Duration;

const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

pub fn spawn(
    messages: MessageStore,
    presence: PresenceStore,
    retention_days: f64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            // The first tick fires immediately: sweep on startup.
            ticker.tick().await;
            sweep(&messages, &presence, retention_days).await;
        }
    })
}

async fn sweep(messages: &MessageStore, presence_store: &PresenceStore, retention_days: f64) {
    let now = crate::now();

    match messages.delete_older_than(now - retention_days * 86_400.0).await {
        Ok(deleted) if deleted > 0 => tracing::info!(deleted, "expired old messages"),
        Ok(_) => {}
        Err(error) => tracing::warn!(%error, "message retention sweep failed"),
    }

    match presence_store
        .delete_older_than(now - presence::RETENTION_SECS)
        .await
    {
        Ok(deleted) if deleted > 0 => tracing::info!(deleted, "expired dead presence rows"),
        Ok(_) => {}
        Err(error) => tracing::warn!(%error, "presence retention sweep failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Envelope, empty_object};
    use crate::{db, id, now};

    #[tokio::test]
    async fn sweep_applies_both_retention_windows() {
        let pool = db::connect_memory().await;
        let messages = MessageStore::new(pool.clone());
        let presence_store = PresenceStore::new(pool);

        let mut old = Envelope {
            id: id::mint(),
            ts: now() - 40.0 * 86_400.0,
            from: "u".into(),
            ch: "alpha".into(),
            kind: "t".into(),
            v: 1,
            body: empty_object(),
            files: Vec::new(),
            reply_to: None,
        };
        messages.insert(&old).await.unwrap();
        old.id = id::mint();
        old.ts = now();
        messages.insert(&old).await.unwrap();

        presence_store
            .upsert("dead", &[], &empty_object(), now() - 8.0 * 86_400.0)
            .await
            .unwrap();
        presence_store
            .upsert("alive", &[], &empty_object(), now())
            .await
            .unwrap();

        sweep(&messages, &presence_store, 30.0).await;

        assert_eq!(messages.count().await.unwrap(), 1);
        let live = presence_store.live(now()).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].agent_id, "alive");
    }
}
