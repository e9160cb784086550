//! Agent presence: heartbeat upserts and the live-agent window.

use crate::error::Result;
use crate::messages::empty_object;
use anyhow::Context as _;
use serde::Serialize;
use sqlx::SqlitePool;

/// Seconds since the last heartbeat within which an agent counts as live.
pub const LIVE_WINDOW_SECS: f64 = 60.0;

/// Heartbeat rows older than this are swept by the retention loop.
pub const RETENTION_SECS: f64 = 7.0 * 86_400.0;

#[derive(Debug, Clone, Serialize)]
pub struct AgentPresence {
    pub agent_id: String,
    pub last_seen: f64,
    pub channels: Vec<String>,
    pub meta: serde_json::Value,
}

#[derive(Clone)]
pub struct PresenceStore {
    pool: SqlitePool,
}

impl PresenceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a heartbeat, overwriting any previous row for the agent.
    pub async fn upsert(
        &self,
        agent_id: &str,
        channels: &[String],
        meta: &serde_json::Value,
        now: f64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO presence (agent_id, last_seen, channels, meta)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(agent_id) DO UPDATE SET
                 last_seen = excluded.last_seen,
                 channels = excluded.channels,
                 meta = excluded.meta",
        )
        .bind(agent_id)
        .bind(now)
        .bind(serde_json::to_string(channels).unwrap_or_else(|_| "[]".into()))
        .bind(meta.to_string())
        .execute(&self.pool)
        .await
        .context("failed to upsert presence")?;

        Ok(())
    }

    /// Agents seen within the live window.
    pub async fn live(&self, now: f64) -> Result<Vec<AgentPresence>> {
        let rows = sqlx::query_as::<_, PresenceRow>(
            "SELECT agent_id, last_seen, channels, meta
             FROM presence
             WHERE last_seen > ?
             ORDER BY agent_id ASC",
        )
        .bind(now - LIVE_WINDOW_SECS)
        .fetch_all(&self.pool)
        .await
        .context("failed to list presence")?;

        Ok(rows.into_iter().map(PresenceRow::into_presence).collect())
    }

    pub async fn count_live(&self, now: f64) -> Result<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM presence WHERE last_seen > ?")
                .bind(now - LIVE_WINDOW_SECS)
                .fetch_one(&self.pool)
                .await
                .context("failed to count live agents")?;

        Ok(count)
    }

    /// Retention sweep: drop rows for agents silent past the cutoff.
    pub async fn delete_older_than(&self, cutoff: f64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM presence WHERE last_seen < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("failed to expire presence rows")?;

        Ok(result.rows_affected())
    }
}

/// Internal row type for sqlx deserialization.
#[derive(sqlx::FromRow)]
struct PresenceRow {
    agent_id: String,
    last_seen: f64,
    channels: String,
    meta: String,
}

impl PresenceRow {
    fn into_presence(self) -> AgentPresence {
        AgentPresence {
            agent_id: self.agent_id,
            last_seen: self.last_seen,
            channels: serde_json::from_str(&self.channels).unwrap_or_default(),
            meta: serde_json::from_str(&self.meta).unwrap_or_else(|_| empty_object()),
        }
    }
}
