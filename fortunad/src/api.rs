//! HTTP surface of the Fortuna node.
//!
//! The generator sits behind one mutex; `generate` holds it while the
//! counter advances, so output requests from concurrent handlers serialize.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use trng_common::Fortuna;

/// Per-request output cap (1 MiB).
pub const MAX_GENERATE_BYTES: usize = 1_048_576;

pub struct Metrics {
    pub bytes_generated: AtomicU64,
    pub seed_batches: AtomicU64,
    pub amplify_calls: AtomicU64,
    pub start_time: SystemTime,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            bytes_generated: AtomicU64::new(0),
            seed_batches: AtomicU64::new(0),
            amplify_calls: AtomicU64::new(0),
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

pub struct FortunaState {
    pub fortuna: Mutex<Fortuna>,
    pub metrics: Metrics,
}

pub fn all_routes(state: Arc<FortunaState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/info", get(info_handler))
        .route("/generate", get(generate_handler))
        .route("/seed", post(seed_handler))
        .route("/amplify", post(amplify_handler))
        .with_state(state)
}

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message.into() })),
    )
}

async fn health_handler(State(state): State<Arc<FortunaState>>) -> Json<Value> {
    let fortuna = state.fortuna.lock().unwrap_or_else(|e| e.into_inner());
    let status = if fortuna.is_healthy() { "ok" } else { "degraded" };
    Json(json!({
        "status": status,
        "details": {
            "reseed_count": fortuna.reseed_count(),
            "seconds_since_reseed": fortuna.seconds_since_reseed(),
        }
    }))
}

async fn info_handler(State(state): State<Arc<FortunaState>>) -> Json<Value> {
    let (reseed_count, reseed_age, pooled_bytes) = {
        let fortuna = state.fortuna.lock().unwrap_or_else(|e| e.into_inner());
        (
            fortuna.reseed_count(),
            fortuna.seconds_since_reseed(),
            fortuna.pool_fill().iter().sum::<usize>(),
        )
    };
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_s": state.metrics.uptime_seconds(),
        "reseed_count": reseed_count,
        "seconds_since_reseed": reseed_age,
        "pooled_bytes": pooled_bytes,
        "bytes_generated": state.metrics.bytes_generated.load(Ordering::Relaxed),
        "seed_batches": state.metrics.seed_batches.load(Ordering::Relaxed),
        "amplify_calls": state.metrics.amplify_calls.load(Ordering::Relaxed),
    }))
}

#[derive(Deserialize)]
struct GenerateQuery {
    #[serde(default = "default_size")]
    size: usize,
}

fn default_size() -> usize {
    32
}

async fn generate_handler(
    State(state): State<Arc<FortunaState>>,
    Query(query): Query<GenerateQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if !(1..=MAX_GENERATE_BYTES).contains(&query.size) {
        return Err(bad_request(format!(
            "size must be between 1 and {MAX_GENERATE_BYTES}"
        )));
    }
    let out = {
        let mut fortuna = state.fortuna.lock().unwrap_or_else(|e| e.into_inner());
        fortuna.generate(query.size)
    };
    state
        .metrics
        .bytes_generated
        .fetch_add(out.len() as u64, Ordering::Relaxed);
    Ok(Json(json!({ "data": hex::encode(&out), "size": out.len() })))
}

#[derive(Deserialize)]
struct SeedRequest {
    seeds: Vec<String>,
}

async fn seed_handler(
    State(state): State<Arc<FortunaState>>,
    Json(request): Json<SeedRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if request.seeds.is_empty() {
        return Err(bad_request("seeds must not be empty"));
    }
    let mut seeds = Vec::with_capacity(request.seeds.len());
    for seed in &request.seeds {
        let bytes = hex::decode(seed).map_err(|_| bad_request("seeds must be hex"))?;
        seeds.push(bytes);
    }
    let reseed_count = {
        let mut fortuna = state.fortuna.lock().unwrap_or_else(|e| e.into_inner());
        fortuna
            .reseed(&seeds)
            .map_err(|e| bad_request(e.to_string()))?;
        fortuna.reseed_count()
    };
    state.metrics.seed_batches.fetch_add(1, Ordering::Relaxed);
    Ok(Json(json!({ "status": "ok", "reseed_count": reseed_count })))
}

#[derive(Deserialize)]
struct AmplifyRequest {
    seed: String,
    size: usize,
}

async fn amplify_handler(
    State(state): State<Arc<FortunaState>>,
    Json(request): Json<AmplifyRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if !(1..=MAX_GENERATE_BYTES).contains(&request.size) {
        return Err(bad_request(format!(
            "size must be between 1 and {MAX_GENERATE_BYTES}"
        )));
    }
    let seed = hex::decode(&request.seed).map_err(|_| bad_request("seed must be hex"))?;
    let out = {
        let mut fortuna = state.fortuna.lock().unwrap_or_else(|e| e.into_inner());
        fortuna
            .amplify(&seed, request.size)
            .map_err(|e| bad_request(e.to_string()))?
    };
    state.metrics.amplify_calls.fetch_add(1, Ordering::Relaxed);
    state
        .metrics
        .bytes_generated
        .fetch_add(out.len() as u64, Ordering::Relaxed);
    Ok(Json(json!({ "data": hex::encode(&out), "size": out.len() })))
}
