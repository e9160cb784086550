//! Envelope model and the append-only message log.
//!
//! Every channel message shares the same JSON shape. Envelopes are immutable
//! once persisted; history reads run newest-first and are reversed by the
//! HTTP layer when a chronological view is wanted.

use crate::error::Result;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

/// The common shape of every channel message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub ts: f64,
    pub from: String,
    pub ch: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub v: i64,
    pub body: serde_json::Value,
    pub files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

/// Client-supplied fields of a publish request. The server assigns `id`, `ts`
/// and `ch`; everything absent defaults rather than failing deserialization so
/// missing-field errors stay distinct from malformed JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct Draft {
    #[serde(default)]
    pub from: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default = "default_schema_version")]
    pub v: i64,
    #[serde(default = "empty_object")]
    pub body: serde_json::Value,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

pub(crate) fn default_schema_version() -> i64 {
    1
}

pub(crate) fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Persistent store for envelopes.
#[derive(Clone)]
pub struct MessageStore {
    pool: SqlitePool,
}

impl MessageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append an envelope. Ids are unique across all channels; a duplicate
    /// insert is a hard error.
    pub async fn insert(&self, envelope: &Envelope) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages (id, ts, sender, ch, type, v, body, files, reply_to)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&envelope.id)
        .bind(envelope.ts)
        .bind(&envelope.from)
        .bind(&envelope.ch)
        .bind(&envelope.kind)
        .bind(envelope.v)
        .bind(envelope.body.to_string())
        .bind(serde_json::to_string(&envelope.files).unwrap_or_else(|_| "[]".into()))
        .bind(&envelope.reply_to)
        .execute(&self.pool)
        .await
        .context("failed to insert message")?;

        Ok(())
    }

    /// Recent messages on one channel, newest first. `since` is a strict
    /// greater-than filter on id; `kind_prefix` matches `type LIKE prefix%`.
    pub async fn channel_history(
        &self,
        ch: &str,
        since: Option<&str>,
        kind_prefix: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Envelope>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT id, ts, sender, ch, type, v, body, files, reply_to
             FROM messages
             WHERE ch = ?
               AND (? IS NULL OR id > ?)
               AND (? IS NULL OR type LIKE ? || '%')
             ORDER BY id DESC
             LIMIT ?",
        )
        .bind(ch)
        .bind(since)
        .bind(since)
        .bind(kind_prefix)
        .bind(kind_prefix)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to query channel history")?;

        Ok(rows.into_iter().map(MessageRow::into_envelope).collect())
    }

    /// Recent messages across all channels, newest first.
    pub async fn global_history(&self, limit: i64) -> Result<Vec<Envelope>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT id, ts, sender, ch, type, v, body, files, reply_to
             FROM messages
             ORDER BY id DESC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to query history")?;

        Ok(rows.into_iter().map(MessageRow::into_envelope).collect())
    }

    /// Every message with `id > since`, oldest first, optionally scoped to one
    /// channel. Backs gap recovery on reconnect.
    pub async fn replay_after(&self, ch: Option<&str>, since: &str) -> Result<Vec<Envelope>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT id, ts, sender, ch, type, v, body, files, reply_to
             FROM messages
             WHERE (? IS NULL OR ch = ?)
               AND id > ?
             ORDER BY id ASC",
        )
        .bind(ch)
        .bind(ch)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("failed to query replay window")?;

        Ok(rows.into_iter().map(MessageRow::into_envelope).collect())
    }

    /// Distinct channel names, alphabetical.
    pub async fn channels(&self) -> Result<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT ch FROM messages ORDER BY ch ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list channels")?;

        Ok(names)
    }

    pub async fn count(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await
            .context("failed to count messages")?;

        Ok(count)
    }

    /// Retention sweep: drop everything older than the cutoff timestamp.
    pub async fn delete_older_than(&self, cutoff_ts: f64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE ts < ?")
            .bind(cutoff_ts)
            .execute(&self.pool)
            .await
            .context("failed to expire messages")?;

        Ok(result.rows_affected())
    }
}

/// Internal row type for sqlx deserialization.
#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    ts: f64,
    sender: String,
    ch: String,
    #[sqlx(rename = "type")]
    kind: String,
    v: i64,
    body: String,
    files: String,
    reply_to: Option<String>,
}

impl MessageRow {
    fn into_envelope(self) -> Envelope {
        Envelope {
            id: self.id,
            ts: self.ts,
            from: self.sender,
            ch: self.ch,
            kind: self.kind,
            v: self.v,
            body: serde_json::from_str(&self.body).unwrap_or_else(|_| empty_object()),
            files: serde_json::from_str(&self.files).unwrap_or_default(),
            reply_to: self.reply_to,
        }
    }
}
