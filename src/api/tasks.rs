//! Task engine endpoints.
//!
//! Every handler reads the current row, validates `from`, applies its guard,
//! performs a single UPDATE, and announces a lifecycle event on the task's
//! channel through the publish pipeline. The claim handler's UPDATE carries
//! `WHERE status = 'open'` — the compare-and-set that makes concurrent
//! claims race-safe — and a read-back names the winner.

use super::state::ApiState;
use super::parse_json;

use crate::error::{Error, Result};
use crate::id;
use crate::messages::{Draft, empty_object};
use crate::tasks::{Task, TaskFilter, TaskStatus};

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

#[derive(Deserialize)]
pub(super) struct CreateTaskRequest {
    #[serde(default)]
    from: String,
    #[serde(default)]
    created_by: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    assigned_to: Option<String>,
    #[serde(default = "empty_object")]
    context: Value,
    #[serde(default)]
    ch: Option<String>,
}

#[derive(Deserialize)]
pub(super) struct AgentRequest {
    #[serde(default)]
    from: String,
}

#[derive(Deserialize)]
pub(super) struct UpdateRequest {
    #[serde(default)]
    from: String,
    #[serde(default)]
    note: Option<Value>,
}

#[derive(Deserialize)]
pub(super) struct DoneRequest {
    #[serde(default)]
    from: String,
    #[serde(default = "empty_object")]
    result: Value,
    #[serde(default)]
    files: Vec<String>,
}

#[derive(Deserialize)]
pub(super) struct InterruptRequest {
    #[serde(default)]
    from: String,
    #[serde(default)]
    reason: Option<Value>,
}

#[derive(Deserialize)]
pub(super) struct ListQuery {
    status: Option<String>,
    /// Matches either `assigned_to` or `claimed_by` — the documented OR.
    #[serde(rename = "for")]
    agent: Option<String>,
    assigned: Option<String>,
    claimed: Option<String>,
}

/// POST /tasks
pub(super) async fn create(
    State(state): State<Arc<ApiState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>)> {
    let request: CreateTaskRequest = parse_json(&body)?;

    let creator = if request.from.trim().is_empty() {
        request.created_by.trim()
    } else {
        request.from.trim()
    };
    if creator.is_empty() {
        return Err(Error::BadRequest("missing 'from'".into()));
    }
    if request.title.trim().is_empty() {
        return Err(Error::BadRequest("missing 'title'".into()));
    }

    let ts = crate::now();
    let task = Task {
        id: id::mint(),
        created_at: ts,
        updated_at: ts,
        created_by: creator.to_string(),
        assigned_to: request.assigned_to.filter(|a| !a.trim().is_empty()),
        claimed_by: None,
        claimed_at: None,
        status: TaskStatus::Open,
        title: request.title.trim().to_string(),
        context: request.context,
        result: None,
        files: Vec::new(),
        ch: request
            .ch
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| "tasks".to_string()),
    };
    state.tasks.insert(&task).await?;

    let extra = match &task.assigned_to {
        Some(assigned) => json!({ "assigned_to": assigned }),
        None => json!({}),
    };
    announce(&state, &task, creator, "task.created", extra, Vec::new()).await?;

    Ok((StatusCode::CREATED, Json(json!({ "id": task.id }))))
}

/// GET /tasks/{id}
pub(super) async fn get_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Task>> {
    let task = state.tasks.get(&id).await?.ok_or_else(not_found)?;
    Ok(Json(task))
}

/// GET /tasks
pub(super) async fn list(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Task>>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<TaskStatus>)
        .transpose()
        .map_err(Error::BadRequest)?;

    let filter = TaskFilter {
        status,
        agent: query.agent.as_deref(),
        assigned: query.assigned.as_deref(),
        claimed: query.claimed.as_deref(),
    };
    Ok(Json(state.tasks.list(&filter).await?))
}

/// POST /tasks/{id}/claim
pub(super) async fn claim(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>> {
    let request: AgentRequest = parse_json(&body)?;
    let agent = require_from(&request.from)?;

    let task = state.tasks.get(&id).await?.ok_or_else(not_found)?;
    if task.status != TaskStatus::Open {
        return Err(Error::Conflict(format!(
            "task is {}, not open",
            task.status
        )));
    }

    state.tasks.try_claim(&id, agent, crate::now()).await?;

    // Under concurrent claims only the UPDATE that observed `open` mutated
    // the row, so the re-read deterministically names the winner.
    let task = state.tasks.get(&id).await?.ok_or_else(not_found)?;
    if task.claimed_by.as_deref() != Some(agent) {
        return Err(Error::Conflict("lost claim race".into()));
    }

    announce(
        &state,
        &task,
        agent,
        "task.claimed",
        json!({ "claimed-by": agent }),
        Vec::new(),
    )
    .await?;

    Ok(Json(json!({
        "id": task.id,
        "status": task.status,
        "claimed-by": agent,
    })))
}

/// POST /tasks/{id}/update — progress note; bumps `updated_at`, nothing else.
pub(super) async fn update(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>> {
    let request: UpdateRequest = parse_json(&body)?;
    let agent = require_from(&request.from)?;

    let task = state.tasks.get(&id).await?.ok_or_else(not_found)?;
    state.tasks.touch(&id, crate::now()).await?;

    let extra = match request.note {
        Some(note) => json!({ "note": note }),
        None => json!({}),
    };
    announce(&state, &task, agent, "task.updated", extra, Vec::new()).await?;

    Ok(Json(json!({ "id": task.id })))
}

/// POST /tasks/{id}/done
pub(super) async fn done(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>> {
    let request: DoneRequest = parse_json(&body)?;
    let agent = require_from(&request.from)?;

    let task = state.tasks.get(&id).await?.ok_or_else(not_found)?;
    check_claimant(&task, agent)?;

    state
        .tasks
        .complete(&id, &request.result, &request.files, crate::now())
        .await?;
    let task = state.tasks.get(&id).await?.ok_or_else(not_found)?;

    announce(
        &state,
        &task,
        agent,
        "task.done",
        json!({ "result": task.result }),
        request.files,
    )
    .await?;

    Ok(Json(json!({ "id": task.id, "status": task.status })))
}

/// POST /tasks/{id}/abandon — back to the pool.
pub(super) async fn abandon(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>> {
    let request: AgentRequest = parse_json(&body)?;
    let agent = require_from(&request.from)?;

    let task = state.tasks.get(&id).await?.ok_or_else(not_found)?;
    check_claimant(&task, agent)?;

    state.tasks.release(&id, crate::now()).await?;
    let task = state.tasks.get(&id).await?.ok_or_else(not_found)?;

    announce(&state, &task, agent, "task.abandoned", json!({}), Vec::new()).await?;

    Ok(Json(json!({ "id": task.id, "status": task.status })))
}

/// POST /tasks/{id}/interrupt — announcement only, no mutation.
pub(super) async fn interrupt(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>> {
    let request: InterruptRequest = parse_json(&body)?;
    let agent = require_from(&request.from)?;

    let task = state.tasks.get(&id).await?.ok_or_else(not_found)?;

    let extra = match request.reason {
        Some(reason) => json!({ "reason": reason }),
        None => json!({}),
    };
    announce(&state, &task, agent, "task.interrupt", extra, Vec::new()).await?;

    Ok(Json(json!({ "id": task.id, "signalled": true })))
}

/// `done` and `abandon` are claimant-only operations on claimed tasks.
fn check_claimant(task: &Task, agent: &str) -> Result<()> {
    if task.status != TaskStatus::Claimed {
        return Err(Error::Conflict(format!(
            "task is {}, not claimed",
            task.status
        )));
    }
    match task.claimed_by.as_deref() {
        Some(claimant) if claimant == agent => Ok(()),
        Some(claimant) => Err(Error::Forbidden(format!("task is claimed by {claimant}"))),
        None => Err(Error::Conflict("task has no claimant".into())),
    }
}

fn require_from(from: &str) -> Result<&str> {
    let from = from.trim();
    if from.is_empty() {
        return Err(Error::BadRequest("missing 'from'".into()));
    }
    Ok(from)
}

fn not_found() -> Error {
    Error::NotFound("no such task".into())
}

/// Emit a lifecycle event on the task's channel. The event body always
/// carries the task id and title; operations add their own fields.
async fn announce(
    state: &ApiState,
    task: &Task,
    actor: &str,
    kind: &str,
    extra: Value,
    files: Vec<String>,
) -> Result<()> {
    let mut body = json!({ "task-id": task.id, "title": task.title });
    if let (Some(base), Value::Object(extra)) = (body.as_object_mut(), extra) {
        base.extend(extra);
    }

    let draft = Draft {
        from: actor.to_string(),
        kind: kind.to_string(),
        v: 1,
        body,
        files,
        reply_to: None,
    };
    super::channels::publish_draft(state, &task.ch, draft).await?;

    Ok(())
}
