//! Counts and uptime.

use super::state::ApiState;

use crate::error::Result;

use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};
use std::sync::Arc;

/// GET /status
pub(super) async fn status(State(state): State<Arc<ApiState>>) -> Result<Json<Value>> {
    let now = crate::now();
    let messages = state.messages.count().await?;
    let tasks = state.tasks.count().await?;
    let channels = state.messages.channels().await?.len();
    let agents_live = state.presence.count_live(now).await?;
    let subscribers = state.registry.subscriber_count().await;

    Ok(Json(json!({
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "messages": messages,
        "tasks": tasks,
        "channels": channels,
        "agents_live": agents_live,
        "subscribers": subscribers,
    })))
}
