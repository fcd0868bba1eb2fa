//! HTTP surface of the hardware node.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use log::error;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::device::{AteccDevice, SessionState};

pub const MAX_BLOCKS_PER_REQUEST: usize = 100;

pub struct Metrics {
    pub blocks_served: AtomicU64,
    pub generate_failures: AtomicU64,
    pub start_time: SystemTime,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            blocks_served: AtomicU64::new(0),
            generate_failures: AtomicU64::new(0),
            start_time: SystemTime::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub struct NodeState {
    pub device: Arc<AteccDevice>,
    pub metrics: Metrics,
}

pub fn all_routes(state: Arc<NodeState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/info", get(info_handler))
        .route("/generate", get(generate_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<NodeState>>) -> Json<Value> {
    let session = state.device.state();
    let status = if session == SessionState::Healthy {
        "ok"
    } else {
        "degraded"
    };
    Json(json!({
        "status": status,
        "details": {
            "session": session,
            "consecutive_failures": state.device.consecutive_failures(),
        }
    }))
}

async fn info_handler(State(state): State<Arc<NodeState>>) -> Json<Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_s": state.metrics.uptime_seconds(),
        "revision": state.device.revision().map(hex::encode),
        "session": state.device.state(),
        "blocks_served": state.metrics.blocks_served.load(Ordering::Relaxed),
        "generate_failures": state.metrics.generate_failures.load(Ordering::Relaxed),
    }))
}

#[derive(Deserialize)]
struct GenerateQuery {
    #[serde(default = "default_count")]
    count: usize,
}

fn default_count() -> usize {
    1
}

pub(crate) fn count_in_range(count: usize) -> bool {
    (1..=MAX_BLOCKS_PER_REQUEST).contains(&count)
}

/// `{data: hex}` for a single block, `{data: [hex…]}` for more.
pub(crate) fn shape_generate_response(mut blocks: Vec<String>) -> Value {
    if blocks.len() == 1 {
        json!({ "data": blocks.remove(0) })
    } else {
        json!({ "data": blocks })
    }
}

async fn generate_handler(
    State(state): State<Arc<NodeState>>,
    Query(query): Query<GenerateQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if !count_in_range(query.count) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("count must be between 1 and {MAX_BLOCKS_PER_REQUEST}") })),
        ));
    }

    let mut blocks = Vec::with_capacity(query.count);
    for _ in 0..query.count {
        let device = Arc::clone(&state.device);
        let result = tokio::task::spawn_blocking(move || device.generate_random()).await;
        match result {
            Ok(Ok(block)) => {
                state.metrics.blocks_served.fetch_add(1, Ordering::Relaxed);
                blocks.push(hex::encode(block));
            }
            Ok(Err(e)) => {
                state.metrics.generate_failures.fetch_add(1, Ordering::Relaxed);
                if e.is_fatal() {
                    // supervision restarts the process; exiting is the signal
                    error!("fatal hardware condition: {e}");
                    std::process::exit(1);
                }
                state.device.begin_recovery();
                return Err((
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({ "error": "hardware unavailable" })),
                ));
            }
            Err(e) => {
                error!("generate task panicked: {e}");
                return Err((
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal error" })),
                ));
            }
        }
    }
    Ok(Json(shape_generate_response(blocks)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_bounds_match_the_api_contract() {
        assert!(!count_in_range(0));
        assert!(count_in_range(1));
        assert!(count_in_range(100));
        assert!(!count_in_range(101));
    }

    #[test]
    fn single_block_is_a_bare_hex_string() {
        let v = shape_generate_response(vec!["ab12".to_string()]);
        assert_eq!(v, json!({ "data": "ab12" }));
    }

    #[test]
    fn multiple_blocks_are_an_array() {
        let v = shape_generate_response(vec!["ab".to_string(), "cd".to_string()]);
        assert_eq!(v, json!({ "data": ["ab", "cd"] }));
    }
}
