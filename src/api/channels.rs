//! Channel endpoints: publish, live subscription with gap recovery, history.

use super::state::ApiState;
use super::{RESUME_HEADER, parse_json};

use crate::error::{Error, Result};
use crate::fanout::{ALL_CHANNELS, encode_frame};
use crate::id;
use crate::messages::{Draft, Envelope};

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::Response;
use futures::StreamExt as _;
use futures::stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;

/// Hard cap on history reads; `n` beyond this is clamped.
const HISTORY_CAP: i64 = 200;
const GLOBAL_HISTORY_DEFAULT: i64 = 100;

/// Shared publish pipeline: validate, mint id and timestamp, persist, fan
/// out. The task engine announces lifecycle events through here too.
pub(super) async fn publish_draft(state: &ApiState, ch: &str, draft: Draft) -> Result<Envelope> {
    if draft.from.trim().is_empty() {
        return Err(Error::BadRequest("missing 'from'".into()));
    }
    if draft.kind.trim().is_empty() {
        return Err(Error::BadRequest("missing 'type'".into()));
    }

    let envelope = Envelope {
        id: id::mint(),
        ts: crate::now(),
        from: draft.from,
        ch: ch.to_string(),
        kind: draft.kind,
        v: draft.v,
        body: draft.body,
        files: draft.files,
        reply_to: draft.reply_to,
    };

    state.messages.insert(&envelope).await?;
    state.registry.fan_out(&envelope).await;

    Ok(envelope)
}

/// POST /ch/{ch}
pub(super) async fn publish(
    State(state): State<Arc<ApiState>>,
    Path(ch): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    let draft: Draft = parse_json(&body)?;
    let envelope = publish_draft(&state, &ch, draft).await?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "id": envelope.id, "ts": envelope.ts })),
    ))
}

/// GET/HEAD /ch/{ch} — live push stream for one channel.
pub(super) async fn subscribe(
    State(state): State<Arc<ApiState>>,
    Path(ch): Path<String>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response> {
    stream_channel(&state, &ch, method, &headers).await
}

/// GET / — live push stream across every channel.
pub(super) async fn subscribe_all(
    State(state): State<Arc<ApiState>>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response> {
    stream_channel(&state, ALL_CHANNELS, method, &headers).await
}

async fn stream_channel(
    state: &ApiState,
    ch: &str,
    method: Method,
    headers: &HeaderMap,
) -> Result<Response> {
    if method == Method::HEAD {
        return Ok(stream_response(Body::empty()));
    }

    // Attach before the replay query: a message published in between lands
    // in the queue and at worst duplicates a replayed frame. Clients dedupe
    // by id; the opposite ordering would lose the message entirely.
    let subscription = state.registry.subscribe(ch).await;

    let mut replay = Vec::new();
    if let Some(since) = resume_id(headers) {
        let scope = (ch != ALL_CHANNELS).then_some(ch);
        match state.messages.replay_after(scope, &since).await {
            Ok(envelopes) => replay.extend(envelopes.iter().map(encode_frame)),
            Err(error) => {
                state
                    .registry
                    .unsubscribe(&subscription.ch, subscription.id)
                    .await;
                return Err(error);
            }
        }
    }

    let replayed = stream::iter(replay.into_iter().map(Ok::<_, Infallible>));
    let live = ReceiverStream::new(subscription.rx).map(Ok::<_, Infallible>);

    Ok(stream_response(Body::from_stream(replayed.chain(live))))
}

/// Commit the stream headers before any payload: event-stream media type,
/// no-cache, and the proxy-buffering-off hint without which reverse proxies
/// buffer the stream into invisibility.
fn stream_response(body: Body) -> Response {
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

fn resume_id(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(RESUME_HEADER)?.to_str().ok()?.trim();
    (!value.is_empty()).then(|| value.to_string())
}

#[derive(Deserialize)]
pub(super) struct ChannelHistoryQuery {
    since: Option<String>,
    n: Option<i64>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// GET /ch/{ch}/history — recent messages, chronological, NDJSON.
pub(super) async fn channel_history(
    State(state): State<Arc<ApiState>>,
    Path(ch): Path<String>,
    Query(query): Query<ChannelHistoryQuery>,
) -> Result<Response> {
    let limit = effective_limit(query.n, HISTORY_CAP);
    let mut envelopes = state
        .messages
        .channel_history(&ch, query.since.as_deref(), query.kind.as_deref(), limit)
        .await?;
    envelopes.reverse();

    Ok(ndjson(&envelopes))
}

#[derive(Deserialize)]
pub(super) struct GlobalHistoryQuery {
    n: Option<i64>,
}

/// GET /history — recent messages across channels, NDJSON.
pub(super) async fn global_history(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<GlobalHistoryQuery>,
) -> Result<Response> {
    let limit = effective_limit(query.n.or(Some(GLOBAL_HISTORY_DEFAULT)), HISTORY_CAP);
    let mut envelopes = state.messages.global_history(limit).await?;
    envelopes.reverse();

    Ok(ndjson(&envelopes))
}

/// GET /channels
pub(super) async fn list_channels(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Vec<String>>> {
    Ok(Json(state.messages.channels().await?))
}

fn effective_limit(requested: Option<i64>, cap: i64) -> i64 {
    requested.unwrap_or(cap).clamp(1, cap)
}

fn ndjson(envelopes: &[Envelope]) -> Response {
    let mut out = String::new();
    for envelope in envelopes {
        if let Ok(line) = serde_json::to_string(envelope) {
            out.push_str(&line);
            out.push('\n');
        }
    }

    let mut response = Response::new(Body::from(out));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-ndjson"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::state::test_state;
    use futures::{Stream, StreamExt as _};
    use tokio::time::{Duration, timeout};

    fn draft(kind: &str) -> Draft {
        Draft {
            from: "u".into(),
            kind: kind.into(),
            v: 1,
            body: crate::messages::empty_object(),
            files: Vec::new(),
            reply_to: None,
        }
    }

    // Ids minted in the same millisecond carry no order guarantee; space out
    // order-sensitive publishes.
    async fn tick() {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    async fn next_chunk(
        stream: &mut (impl Stream<Item = Result<Bytes, axum::Error>> + Unpin),
    ) -> String {
        let chunk = timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("stream produced a frame in time")
            .expect("stream still open")
            .expect("chunk ok");
        String::from_utf8(chunk.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn publish_rejects_malformed_json_distinctly() {
        let state = test_state().await;

        let error = publish(
            State(state),
            Path("alpha".into()),
            Bytes::from_static(b"{invalid"),
        )
        .await
        .unwrap_err();

        assert_eq!(error.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error.to_string(), "invalid JSON body");
    }

    #[tokio::test]
    async fn publish_requires_from_and_type() {
        let state = test_state().await;

        let error = publish(
            State(state.clone()),
            Path("alpha".into()),
            Bytes::from_static(br#"{"type":"t"}"#),
        )
        .await
        .unwrap_err();
        assert_eq!(error.to_string(), "missing 'from'");

        let error = publish(
            State(state),
            Path("alpha".into()),
            Bytes::from_static(br#"{"from":"u"}"#),
        )
        .await
        .unwrap_err();
        assert_eq!(error.to_string(), "missing 'type'");
    }

    #[tokio::test]
    async fn publish_persists_and_fans_out_the_same_envelope() {
        let state = test_state().await;
        let mut subscription = state.registry.subscribe("alpha").await;

        let (status, Json(reply)) = publish(
            State(state.clone()),
            Path("alpha".into()),
            Bytes::from_static(br#"{"from":"u","type":"t","body":{"k":1}}"#),
        )
        .await
        .unwrap();

        assert_eq!(status, StatusCode::CREATED);
        let minted_id = reply["id"].as_str().unwrap().to_string();
        assert_eq!(minted_id.len(), id::ID_LEN);

        let frame = subscription.rx.try_recv().expect("frame queued");
        let text = String::from_utf8(frame.to_vec()).unwrap();
        assert!(text.starts_with(&format!("id: {minted_id}\ndata: ")));
        assert!(text.contains(r#""ch":"alpha""#));

        let history = state
            .messages
            .channel_history("alpha", None, None, 200)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, minted_id);
        assert_eq!(history[0].kind, "t");
    }

    #[tokio::test]
    async fn head_requests_get_headers_and_no_subscription() {
        let state = test_state().await;

        let response = subscribe(
            State(state.clone()),
            Path("alpha".into()),
            Method::HEAD,
            HeaderMap::new(),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        assert_eq!(response.headers().get("x-accel-buffering").unwrap(), "no");
        assert_eq!(state.registry.subscriber_count().await, 0);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn gap_recovery_replays_before_live_traffic() {
        let state = test_state().await;

        // M1 observed, then M2 and M3 arrive while disconnected.
        let m1 = publish_draft(&state, "beta", draft("t1")).await.unwrap();
        tick().await;
        let m2 = publish_draft(&state, "beta", draft("t2")).await.unwrap();
        tick().await;
        let m3 = publish_draft(&state, "beta", draft("t3")).await.unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(RESUME_HEADER, HeaderValue::from_str(&m1.id).unwrap());
        let response = subscribe(
            State(state.clone()),
            Path("beta".into()),
            Method::GET,
            headers,
        )
        .await
        .unwrap();

        let mut body = response.into_body().into_data_stream();
        let first = next_chunk(&mut body).await;
        assert!(first.starts_with(&format!("id: {}\n", m2.id)), "got: {first}");
        let second = next_chunk(&mut body).await;
        assert!(second.starts_with(&format!("id: {}\n", m3.id)));

        // Live traffic follows the replay.
        tick().await;
        let m4 = publish_draft(&state, "beta", draft("t4")).await.unwrap();
        let third = next_chunk(&mut body).await;
        assert!(third.starts_with(&format!("id: {}\n", m4.id)));
    }

    #[tokio::test]
    async fn history_is_chronological_ndjson() {
        let state = test_state().await;

        let first = publish_draft(&state, "alpha", draft("a")).await.unwrap();
        tick().await;
        let second = publish_draft(&state, "alpha", draft("b")).await.unwrap();

        let response = channel_history(
            State(state),
            Path("alpha".into()),
            Query(ChannelHistoryQuery {
                since: None,
                n: Some(1_000_000),
                kind: None,
            }),
        )
        .await
        .unwrap();

        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/x-ndjson"
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let lines: Vec<serde_json::Value> = std::str::from_utf8(&body)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["id"], first.id.as_str());
        assert_eq!(lines[1]["id"], second.id.as_str());
    }

    #[test]
    fn history_limit_is_capped() {
        assert_eq!(effective_limit(None, 200), 200);
        assert_eq!(effective_limit(Some(50), 200), 50);
        assert_eq!(effective_limit(Some(1_000_000), 200), 200);
        assert_eq!(effective_limit(Some(0), 200), 1);
        assert_eq!(effective_limit(Some(-5), 200), 1);
    }
}
