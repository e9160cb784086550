//! Presence endpoints: heartbeat upserts and the live-agent listing.

use super::state::ApiState;
use super::parse_json;

use crate::error::{Error, Result};
use crate::messages::empty_object;
use crate::presence::AgentPresence;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

#[derive(Deserialize)]
pub(super) struct HeartbeatRequest {
    #[serde(default)]
    agent_id: String,
    #[serde(default)]
    channels: Vec<String>,
    #[serde(default = "empty_object")]
    meta: Value,
}

/// POST /presence
pub(super) async fn heartbeat(
    State(state): State<Arc<ApiState>>,
    body: Bytes,
) -> Result<Json<Value>> {
    let request: HeartbeatRequest = parse_json(&body)?;
    let agent_id = request.agent_id.trim();
    if agent_id.is_empty() {
        return Err(Error::BadRequest("missing 'agent_id'".into()));
    }

    state
        .presence
        .upsert(agent_id, &request.channels, &request.meta, crate::now())
        .await?;

    Ok(Json(json!({ "ok": true })))
}

/// GET /presence
pub(super) async fn list_live(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Vec<AgentPresence>>> {
    Ok(Json(state.presence.live(crate::now()).await?))
}
