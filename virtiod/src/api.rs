//! HTTP surface of the VirtIO feeder: seed ingestion from the aggregator
//! and a chunked byte stream for guest consumers.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use trng_common::BoundedQueue;

/// Idle wait between queue polls while a stream consumer is ahead of the
/// producers.
const STREAM_IDLE_WAIT: Duration = Duration::from_millis(50);

pub struct VirtioState {
    pub queue: BoundedQueue,
    pub seeds_received: AtomicU64,
    pub bytes_streamed: AtomicU64,
}

impl VirtioState {
    pub fn new(queue_size: usize) -> Self {
        Self {
            queue: BoundedQueue::new(queue_size),
            seeds_received: AtomicU64::new(0),
            bytes_streamed: AtomicU64::new(0),
        }
    }
}

pub fn all_routes(state: Arc<VirtioState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/seed", post(seed_handler))
        .route("/stream", get(stream_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<VirtioState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "details": { "queued_blocks": state.queue.len() }
    }))
}

async fn status_handler(State(state): State<Arc<VirtioState>>) -> Json<Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "queue": state.queue.stats(),
        "seeds_received": state.seeds_received.load(Ordering::Relaxed),
        "bytes_streamed": state.bytes_streamed.load(Ordering::Relaxed),
    }))
}

#[derive(Deserialize)]
struct SeedRequest {
    data: String,
}

async fn seed_handler(
    State(state): State<Arc<VirtioState>>,
    Json(request): Json<SeedRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let bytes = hex::decode(&request.data).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "data must be hex" })),
        )
    })?;
    if bytes.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "data must not be empty" })),
        ));
    }
    state.queue.push(bytes);
    state.seeds_received.fetch_add(1, Ordering::Relaxed);
    Ok(Json(json!({ "status": "ok", "queued_blocks": state.queue.len() })))
}

/// Chunked octet stream draining the queue; runs until the client
/// disconnects, idling briefly whenever the queue is empty.
async fn stream_handler(State(state): State<Arc<VirtioState>>) -> Response {
    let stream = futures_util::stream::unfold(state, |state| async move {
        loop {
            if let Some(block) = state.queue.get(1, 0, true).pop() {
                state
                    .bytes_streamed
                    .fetch_add(block.data.len() as u64, Ordering::Relaxed);
                return Some((Ok::<Bytes, Infallible>(Bytes::from(block.data)), state));
            }
            tokio::time::sleep(STREAM_IDLE_WAIT).await;
        }
    });
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(stream),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::http::Request;
    use futures_util::StreamExt;
    use tower::ServiceExt;

    fn test_state() -> Arc<VirtioState> {
        Arc::new(VirtioState::new(16))
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn seed_fills_the_queue() {
        let state = test_state();
        let router = all_routes(Arc::clone(&state));
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/seed")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        json!({ "data": hex::encode([0x42; 32]) }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.queue.len(), 1);
        assert_eq!(state.seeds_received.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn malformed_or_empty_seeds_are_rejected() {
        for payload in [json!({ "data": "zz" }), json!({ "data": "" })] {
            let router = all_routes(test_state());
            let response = router
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/seed")
                        .header(header::CONTENT_TYPE, "application/json")
                        .body(Body::from(payload.to_string()))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn stream_drains_queued_blocks_in_order() {
        let state = test_state();
        state.queue.push(vec![1, 2, 3]);
        state.queue.push(vec![4, 5]);
        let router = all_routes(Arc::clone(&state));
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/stream")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/octet-stream"
        );
        let mut data = response.into_body().into_data_stream();
        assert_eq!(data.next().await.unwrap().unwrap().as_ref(), &[1, 2, 3]);
        assert_eq!(data.next().await.unwrap().unwrap().as_ref(), &[4, 5]);
        assert!(state.queue.is_empty());
        assert_eq!(state.bytes_streamed.load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn status_reports_queue_counters() {
        let state = test_state();
        state.queue.push(vec![0; 8]);
        let router = all_routes(state);
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["queue"]["total_pushed"], 1);
        assert_eq!(body["queue"]["current_size"], 1);
    }
}
