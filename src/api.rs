//! HTTP surface: routing, CORS, and boundary decoding.
//!
//! Handlers live in the submodules and raise typed [`Error`]s; rendering to
//! `{"error": <message>}` JSON happens in one place (`error.rs`). The CORS
//! middleware answers preflights and stamps every response permissive.

mod channels;
mod files;
mod presence;
mod state;
mod status;
mod tasks;

pub use state::ApiState;

use crate::error::{Error, Result};
use axum::Router;
use axum::extract::Request;
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use std::sync::Arc;

/// Resumption header carrying the last-observed envelope id.
pub const RESUME_HEADER: &str = "last-event-id";

pub fn app(state: Arc<ApiState>) -> Router {
    let verbose = state.config.verbose;

    let router = Router::new()
        .route("/", get(channels::subscribe_all))
        .route("/status", get(status::status))
        .route("/channels", get(channels::list_channels))
        .route("/history", get(channels::global_history))
        .route("/ch/{ch}", post(channels::publish).get(channels::subscribe))
        .route("/ch/{ch}/history", get(channels::channel_history))
        .route("/tasks", post(tasks::create).get(tasks::list))
        .route("/tasks/{id}", get(tasks::get_task))
        .route("/tasks/{id}/claim", post(tasks::claim))
        .route("/tasks/{id}/update", post(tasks::update))
        .route("/tasks/{id}/done", post(tasks::done))
        .route("/tasks/{id}/abandon", post(tasks::abandon))
        .route("/tasks/{id}/interrupt", post(tasks::interrupt))
        .route("/files", post(files::upload))
        .route("/files/{hash}", get(files::download))
        .route("/presence", post(presence::heartbeat).get(presence::list_live))
        .with_state(state);

    let router = router.layer(middleware::from_fn(cors));
    if verbose {
        router.layer(middleware::from_fn(log_requests))
    } else {
        router
    }
}

/// Decode a JSON request body. Parse failures are a 400 with an explicit
/// message, kept distinct from missing-field validation errors: request
/// structs default every field and validate afterwards.
pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|_| Error::BadRequest("invalid JSON body".into()))
}

/// Answer preflights with 204 and stamp every other response with the
/// permissive origin header.
async fn cors(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return preflight();
    }

    let mut response = next.run(request).await;
    response
        .headers_mut()
        .entry(header::ACCESS_CONTROL_ALLOW_ORIGIN)
        .or_insert(HeaderValue::from_static("*"));
    response
}

fn preflight() -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, HEAD, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Last-Event-ID"),
    );
    response
}

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let response = next.run(request).await;
    tracing::info!(%method, path, status = response.status().as_u16(), "request");
    response
}
