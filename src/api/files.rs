//! Blob upload and download.

use super::state::ApiState;

use crate::error::{Error, Result};

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::Response;
use futures::StreamExt as _;
use serde_json::{Value, json};
use std::sync::Arc;

/// POST /files
///
/// The declared `Content-Length` is checked before reading; the actual
/// length is re-checked as the body streams in, so an oversized upload is
/// cut off at the limit rather than buffered whole.
pub(super) async fn upload(
    State(state): State<Arc<ApiState>>,
    request: Request,
) -> Result<(StatusCode, Json<Value>)> {
    let max = state.config.max_upload_bytes;

    if let Some(declared) = declared_length(request.headers())
        && declared > max
    {
        return Err(Error::TooLarge("blob too large".into()));
    }

    let mut stream = request.into_body().into_data_stream();
    let mut buffer: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|error| Error::BadRequest(format!("failed to read upload: {error}")))?;
        if buffer.len() + chunk.len() > max {
            return Err(Error::TooLarge("blob too large".into()));
        }
        buffer.extend_from_slice(&chunk);
    }

    let digest = state.blobs.put(&buffer).await?;
    tracing::debug!(hash = %digest, size = buffer.len(), "stored blob");

    Ok((
        StatusCode::CREATED,
        Json(json!({ "hash": digest, "size": buffer.len() })),
    ))
}

/// GET /files/{hash}
pub(super) async fn download(
    State(state): State<Arc<ApiState>>,
    Path(hash): Path<String>,
) -> Result<Response> {
    let bytes = state
        .blobs
        .get(&hash)
        .await?
        .ok_or_else(|| Error::NotFound("no such blob".into()))?;

    let mut response = Response::new(Body::from(bytes));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    Ok(response)
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}
