//! Task records, the status machine, and the tasks table.
//!
//! The only states are open → claimed → done, with claimed → open on
//! abandon. The claim path is a compare-and-set: the UPDATE carries
//! `WHERE status = 'open'`, so of any number of concurrent claimants exactly
//! one mutates the row and a read-back identifies the winner.

use crate::error::Result;
use crate::messages::empty_object;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Open,
    Claimed,
    Done,
    Abandoned,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Done => "done",
            TaskStatus::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(TaskStatus::Open),
            "claimed" => Ok(TaskStatus::Claimed),
            "done" => Ok(TaskStatus::Done),
            "abandoned" => Ok(TaskStatus::Abandoned),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub created_at: f64,
    pub updated_at: f64,
    pub created_by: String,
    pub assigned_to: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<f64>,
    pub status: TaskStatus,
    pub title: String,
    pub context: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub files: Vec<String>,
    pub ch: String,
}

/// Filters for task listing. `agent` matches either `assigned_to` or
/// `claimed_by` (the documented OR); `assigned`/`claimed` are the narrower
/// single-column variants.
#[derive(Debug, Default)]
pub struct TaskFilter<'a> {
    pub status: Option<TaskStatus>,
    pub agent: Option<&'a str>,
    pub assigned: Option<&'a str>,
    pub claimed: Option<&'a str>,
}

/// Persistent store for tasks.
#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, task: &Task) -> Result<()> {
        sqlx::query(
            "INSERT INTO tasks (id, created_at, updated_at, created_by, assigned_to,
                                claimed_by, claimed_at, status, title, context, result, files, ch)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(&task.created_by)
        .bind(&task.assigned_to)
        .bind(&task.claimed_by)
        .bind(task.claimed_at)
        .bind(task.status.as_str())
        .bind(&task.title)
        .bind(task.context.to_string())
        .bind(task.result.as_ref().map(|r| r.to_string()))
        .bind(serde_json::to_string(&task.files).unwrap_or_else(|_| "[]".into()))
        .bind(&task.ch)
        .execute(&self.pool)
        .await
        .context("failed to insert task")?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(
            "SELECT id, created_at, updated_at, created_by, assigned_to, claimed_by,
                    claimed_at, status, title, context, result, files, ch
             FROM tasks WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch task")?;

        row.map(TaskRow::into_task).transpose()
    }

    pub async fn list(&self, filter: &TaskFilter<'_>) -> Result<Vec<Task>> {
        let status = filter.status.map(|s| s.as_str());
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT id, created_at, updated_at, created_by, assigned_to, claimed_by,
                    claimed_at, status, title, context, result, files, ch
             FROM tasks
             WHERE (? IS NULL OR status = ?)
               AND (? IS NULL OR assigned_to = ? OR claimed_by = ?)
               AND (? IS NULL OR assigned_to = ?)
               AND (? IS NULL OR claimed_by = ?)
             ORDER BY created_at DESC",
        )
        .bind(status)
        .bind(status)
        .bind(filter.agent)
        .bind(filter.agent)
        .bind(filter.agent)
        .bind(filter.assigned)
        .bind(filter.assigned)
        .bind(filter.claimed)
        .bind(filter.claimed)
        .fetch_all(&self.pool)
        .await
        .context("failed to list tasks")?;

        rows.into_iter().map(TaskRow::into_task).collect()
    }

    /// Guarded claim. Only an UPDATE that observes `open` mutates the row;
    /// every concurrent loser is a no-op. Callers re-read the row to learn
    /// the winner.
    pub async fn try_claim(&self, id: &str, agent: &str, now: f64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE tasks
             SET status = 'claimed', claimed_by = ?, claimed_at = ?, updated_at = ?
             WHERE id = ? AND status = 'open'",
        )
        .bind(agent)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to claim task")?;

        Ok(result.rows_affected() > 0)
    }

    /// Bump `updated_at` without touching any other column.
    pub async fn touch(&self, id: &str, now: f64) -> Result<()> {
        sqlx::query("UPDATE tasks SET updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to touch task")?;

        Ok(())
    }

    pub async fn complete(
        &self,
        id: &str,
        result: &serde_json::Value,
        files: &[String],
        now: f64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET status = 'done', result = ?, files = ?, updated_at = ? WHERE id = ?",
        )
        .bind(result.to_string())
        .bind(serde_json::to_string(files).unwrap_or_else(|_| "[]".into()))
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to complete task")?;

        Ok(())
    }

    /// Abandon: back to the pool, claim cleared.
    pub async fn release(&self, id: &str, now: f64) -> Result<()> {
        sqlx::query(
            "UPDATE tasks
             SET status = 'open', claimed_by = NULL, claimed_at = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to release task")?;

        Ok(())
    }

    pub async fn count(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM tasks")
            .fetch_one(&self.pool)
            .await
            .context("failed to count tasks")?;

        Ok(count)
    }
}

/// Internal row type for sqlx deserialization.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    created_at: f64,
    updated_at: f64,
    created_by: String,
    assigned_to: Option<String>,
    claimed_by: Option<String>,
    claimed_at: Option<f64>,
    status: String,
    title: String,
    context: String,
    result: Option<String>,
    files: String,
    ch: String,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        let status: TaskStatus = self
            .status
            .parse()
            .map_err(|e: String| anyhow::anyhow!("invalid status in database: {e}"))?;

        Ok(Task {
            id: self.id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            created_by: self.created_by,
            assigned_to: self.assigned_to,
            claimed_by: self.claimed_by,
            claimed_at: self.claimed_at,
            status,
            title: self.title,
            context: serde_json::from_str(&self.context).unwrap_or_else(|_| empty_object()),
            result: self
                .result
                .as_deref()
                .and_then(|r| serde_json::from_str(r).ok()),
            files: serde_json::from_str(&self.files).unwrap_or_default(),
            ch: self.ch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, id, now};

    fn new_task(title: &str) -> Task {
        let ts = now();
        Task {
            id: id::mint(),
            created_at: ts,
            updated_at: ts,
            created_by: "creator".into(),
            assigned_to: None,
            claimed_by: None,
            claimed_at: None,
            status: TaskStatus::Open,
            title: title.into(),
            context: empty_object(),
            result: None,
            files: Vec::new(),
            ch: "tasks".into(),
        }
    }

    #[tokio::test]
    async fn insert_and_get_round_trip() {
        let store = TaskStore::new(db::connect_memory().await);
        let task = new_task("write docs");
        store.insert(&task).await.unwrap();

        let loaded = store.get(&task.id).await.unwrap().expect("task exists");
        assert_eq!(loaded.status, TaskStatus::Open);
        assert_eq!(loaded.title, "write docs");
        assert!(loaded.claimed_by.is_none());

        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_is_a_compare_and_set() {
        let store = TaskStore::new(db::connect_memory().await);
        let task = new_task("race me");
        store.insert(&task).await.unwrap();

        assert!(store.try_claim(&task.id, "a1", now()).await.unwrap());
        // Second claimant observes `claimed`, not `open`: no-op.
        assert!(!store.try_claim(&task.id, "a2", now()).await.unwrap());

        let loaded = store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Claimed);
        assert_eq!(loaded.claimed_by.as_deref(), Some("a1"));
        assert!(loaded.claimed_at.is_some());
    }

    #[tokio::test]
    async fn done_preserves_the_claim_for_audit() {
        let store = TaskStore::new(db::connect_memory().await);
        let task = new_task("finish me");
        store.insert(&task).await.unwrap();
        store.try_claim(&task.id, "a1", now()).await.unwrap();

        store
            .complete(&task.id, &serde_json::json!({ "ok": true }), &["sha256:aa".into()], now())
            .await
            .unwrap();

        let loaded = store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Done);
        assert_eq!(loaded.claimed_by.as_deref(), Some("a1"));
        assert_eq!(loaded.result, Some(serde_json::json!({ "ok": true })));
        assert_eq!(loaded.files, vec!["sha256:aa"]);
    }

    #[tokio::test]
    async fn release_reopens_and_clears_the_claim() {
        let store = TaskStore::new(db::connect_memory().await);
        let task = new_task("give back");
        store.insert(&task).await.unwrap();
        store.try_claim(&task.id, "a1", now()).await.unwrap();

        store.release(&task.id, now()).await.unwrap();

        let loaded = store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Open);
        assert!(loaded.claimed_by.is_none());
        assert!(loaded.claimed_at.is_none());

        // Reopened tasks are claimable again.
        assert!(store.try_claim(&task.id, "a2", now()).await.unwrap());
    }

    #[tokio::test]
    async fn touch_only_bumps_updated_at() {
        let store = TaskStore::new(db::connect_memory().await);
        let task = new_task("note me");
        store.insert(&task).await.unwrap();

        let later = task.updated_at + 5.0;
        store.touch(&task.id, later).await.unwrap();

        let loaded = store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.updated_at, later);
        assert_eq!(loaded.status, TaskStatus::Open);
        assert_eq!(loaded.title, task.title);
    }

    #[tokio::test]
    async fn list_filters_by_status_and_agent() {
        let store = TaskStore::new(db::connect_memory().await);

        let mut assigned = new_task("assigned to a1");
        assigned.assigned_to = Some("a1".into());
        let claimed = new_task("claimed by a1");
        let unrelated = new_task("someone else's");
        for task in [&assigned, &claimed, &unrelated] {
            store.insert(task).await.unwrap();
        }
        store.try_claim(&claimed.id, "a1", now()).await.unwrap();
        store.try_claim(&unrelated.id, "a2", now()).await.unwrap();

        // `agent` matches assigned_to OR claimed_by.
        let for_a1 = store
            .list(&TaskFilter { agent: Some("a1"), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(for_a1.len(), 2);

        let open = store
            .list(&TaskFilter { status: Some(TaskStatus::Open), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, assigned.id);

        let claimed_by_a1 = store
            .list(&TaskFilter { claimed: Some("a1"), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(claimed_by_a1.len(), 1);
        assert_eq!(claimed_by_a1[0].id, claimed.id);

        let everything = store.list(&TaskFilter::default()).await.unwrap();
        assert_eq!(everything.len(), 3);
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            TaskStatus::Open,
            TaskStatus::Claimed,
            TaskStatus::Done,
            TaskStatus::Abandoned,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<TaskStatus>().is_err());
    }
}
