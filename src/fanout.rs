//! Live fan-out: the subscriber registry, push-frame codec, and keepalives.
//!
//! Each subscriber owns a bounded queue; delivery uses `try_send` so a slow
//! or dead subscriber can never stall the publisher. Any failed send evicts
//! the handle — disconnect detection is the send failure itself.

use crate::messages::Envelope;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};

/// Registry key whose subscribers receive every event regardless of channel.
pub const ALL_CHANNELS: &str = "*";

/// Comment-only frame written on the keepalive tick.
pub const KEEPALIVE_FRAME: &[u8] = b": keepalive\n\n";

/// Frames a subscriber may lag behind before it is treated as dead.
const SUBSCRIBER_QUEUE: usize = 256;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Encode an envelope as a push-stream frame: an id line, a data line with
/// the JSON envelope, and a blank terminator.
pub fn encode_frame(envelope: &Envelope) -> Bytes {
    let json = serde_json::to_string(envelope).unwrap_or_else(|_| String::from("{}"));
    Bytes::from(format!("id: {}\ndata: {json}\n\n", envelope.id))
}

/// A live subscriber: the queue end plus the identity needed to detach.
pub struct Subscription {
    pub id: u64,
    pub ch: String,
    pub rx: mpsc::Receiver<Bytes>,
}

/// Process-wide map from channel name to the set of attached subscribers.
#[derive(Default)]
pub struct Registry {
    channels: RwLock<HashMap<String, HashMap<u64, mpsc::Sender<Bytes>>>>,
    next_id: AtomicU64,
}

impl Registry {
    /// Attach a new subscriber to a channel (or the all-channels sentinel).
    pub async fn subscribe(&self, ch: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);

        let mut channels = self.channels.write().await;
        channels.entry(ch.to_string()).or_default().insert(id, tx);

        Subscription { id, ch: ch.to_string(), rx }
    }

    pub async fn unsubscribe(&self, ch: &str, id: u64) {
        let mut channels = self.channels.write().await;
        if let Some(set) = channels.get_mut(ch) {
            set.remove(&id);
            if set.is_empty() {
                channels.remove(ch);
            }
        }
    }

    /// Encode a freshly persisted envelope and deliver it to the channel's
    /// subscribers and, for ordinary channels, the all-channels set.
    pub async fn fan_out(&self, envelope: &Envelope) {
        let frame = encode_frame(envelope);
        self.deliver(&envelope.ch, &frame).await;
        if envelope.ch != ALL_CHANNELS {
            self.deliver(ALL_CHANNELS, &frame).await;
        }
    }

    /// Send one frame to every subscriber of `ch`. Iteration runs over a
    /// snapshot so concurrent detaches never corrupt the traversal; failed
    /// sends evict afterwards.
    async fn deliver(&self, ch: &str, frame: &Bytes) {
        let snapshot: Vec<(u64, mpsc::Sender<Bytes>)> = {
            let channels = self.channels.read().await;
            match channels.get(ch) {
                Some(set) => set.iter().map(|(id, tx)| (*id, tx.clone())).collect(),
                None => return,
            }
        };

        let mut dead = Vec::new();
        for (id, tx) in snapshot {
            if tx.try_send(frame.clone()).is_err() {
                dead.push(id);
            }
        }

        for id in dead {
            tracing::debug!(ch, subscriber = id, "evicting dead subscriber");
            self.unsubscribe(ch, id).await;
        }
    }

    /// Write a comment-only frame to every subscriber in every set, evicting
    /// any handle that fails.
    pub async fn keepalive_sweep(&self) {
        let snapshot: Vec<(String, u64, mpsc::Sender<Bytes>)> = {
            let channels = self.channels.read().await;
            channels
                .iter()
                .flat_map(|(ch, set)| {
                    set.iter().map(|(id, tx)| (ch.clone(), *id, tx.clone()))
                })
                .collect()
        };

        let frame = Bytes::from_static(KEEPALIVE_FRAME);
        for (ch, id, tx) in snapshot {
            if tx.try_send(frame.clone()).is_err() {
                tracing::debug!(ch = %ch, subscriber = id, "evicting dead subscriber on keepalive");
                self.unsubscribe(&ch, id).await;
            }
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        let channels = self.channels.read().await;
        channels.values().map(HashMap::len).sum()
    }
}

/// Background keepalive loop, one tick every 20 seconds.
pub fn spawn_keepalive(registry: Arc<Registry>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
        // The first tick fires immediately; subscribers don't need it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            registry.keepalive_sweep().await;
        }
    })
}
