//! `/api/v1` surface of the aggregator.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::context::{DataSource, ServiceContext};
use crate::format::{decode_values, DataFormat};

pub const MAX_DATA_LIMIT: usize = 100_000;
pub const QUEUE_SIZE_MIN: usize = 10;
pub const QUEUE_SIZE_MAX: usize = 1_000_000;

/// A poller that has not succeeded for this long marks its dependency stale.
const POLLER_STALE_SECS: u64 = 10;

pub fn all_routes(ctx: Arc<ServiceContext>) -> Router {
    Router::new()
        .route(
            "/api/v1/config/queue",
            get(get_queue_config).put(put_queue_config),
        )
        .route(
            "/api/v1/config/consume",
            get(get_consume).put(put_consume),
        )
        .route("/api/v1/data", post(data_handler))
        .route("/api/v1/status", get(status_handler))
        .route("/api/v1/health", get(health_handler))
        .with_state(ctx)
}

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message.into() })),
    )
}

fn no_data() -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "No data available" })),
    )
}

#[derive(Serialize)]
struct QueueConfig {
    trng_queue_size: usize,
    fortuna_queue_size: usize,
}

async fn get_queue_config(State(ctx): State<Arc<ServiceContext>>) -> Json<QueueConfig> {
    Json(QueueConfig {
        trng_queue_size: ctx.trng_queue.capacity(),
        fortuna_queue_size: ctx.fortuna_queue.capacity(),
    })
}

#[derive(Deserialize)]
struct QueueConfigUpdate {
    #[serde(default)]
    trng_queue_size: Option<usize>,
    #[serde(default)]
    fortuna_queue_size: Option<usize>,
}

async fn put_queue_config(
    State(ctx): State<Arc<ServiceContext>>,
    Json(update): Json<QueueConfigUpdate>,
) -> Result<Json<QueueConfig>, (StatusCode, Json<Value>)> {
    for size in [update.trng_queue_size, update.fortuna_queue_size]
        .into_iter()
        .flatten()
    {
        if !(QUEUE_SIZE_MIN..=QUEUE_SIZE_MAX).contains(&size) {
            return Err(bad_request(format!(
                "queue size must be between {QUEUE_SIZE_MIN} and {QUEUE_SIZE_MAX}"
            )));
        }
    }
    if let Some(size) = update.trng_queue_size {
        ctx.trng_queue.resize(size);
    }
    if let Some(size) = update.fortuna_queue_size {
        ctx.fortuna_queue.resize(size);
    }
    Ok(Json(QueueConfig {
        trng_queue_size: ctx.trng_queue.capacity(),
        fortuna_queue_size: ctx.fortuna_queue.capacity(),
    }))
}

#[derive(Serialize, Deserialize)]
struct ConsumeConfig {
    consume: bool,
}

async fn get_consume(State(ctx): State<Arc<ServiceContext>>) -> Json<ConsumeConfig> {
    Json(ConsumeConfig {
        consume: ctx.consume.load(Ordering::Relaxed),
    })
}

async fn put_consume(
    State(ctx): State<Arc<ServiceContext>>,
    Json(update): Json<ConsumeConfig>,
) -> Json<ConsumeConfig> {
    ctx.consume.store(update.consume, Ordering::Relaxed);
    Json(update)
}

#[derive(Deserialize)]
struct DataRequest {
    format: DataFormat,
    limit: usize,
    #[serde(default)]
    offset: usize,
    source: DataSource,
}

async fn data_handler(
    State(ctx): State<Arc<ServiceContext>>,
    Json(request): Json<DataRequest>,
) -> Result<Response, (StatusCode, Json<Value>)> {
    if !(1..=MAX_DATA_LIMIT).contains(&request.limit) {
        return Err(bad_request(format!(
            "limit must be between 1 and {MAX_DATA_LIMIT}"
        )));
    }
    let consume = ctx.consume.load(Ordering::Relaxed);
    let queue = ctx.queue_for(request.source);
    let needed = request.limit * request.format.value_size();

    // Blocks vary in size, so pull one at a time until enough bytes arrived
    // or the queue runs dry. In consume mode the offset blocks are consumed
    // along with the returned ones (documented queue semantics).
    let mut bytes: Vec<u8> = Vec::new();
    if consume {
        let mut first = true;
        while bytes.len() < needed {
            let offset = if first { request.offset } else { 0 };
            first = false;
            match queue.get(1, offset, true).pop() {
                Some(block) => bytes.extend(block.data),
                None => break,
            }
        }
    } else {
        let mut index = request.offset;
        while bytes.len() < needed {
            match queue.get(1, index, false).pop() {
                Some(block) => bytes.extend(block.data),
                None => break,
            }
            index += 1;
        }
    }

    if bytes.is_empty() {
        return Err(no_data());
    }
    if request.format.is_binary() {
        bytes.truncate(request.limit);
        return Ok((
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response());
    }
    let values = decode_values(&bytes, request.format, request.limit);
    if values.is_empty() {
        return Err(no_data());
    }
    Ok(Json(Value::Array(values)).into_response())
}

async fn status_handler(State(ctx): State<Arc<ServiceContext>>) -> Json<Value> {
    let m = &ctx.metrics;
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_s": m.uptime_seconds(),
        "consume": ctx.consume.load(Ordering::Relaxed),
        "sources": {
            "trng": {
                "queue": ctx.trng_queue.stats(),
                "polls": m.trng_polls.load(Ordering::Relaxed),
                "poll_errors": m.trng_poll_errors.load(Ordering::Relaxed),
            },
            "fortuna": {
                "queue": ctx.fortuna_queue.stats(),
                "polls": m.fortuna_polls.load(Ordering::Relaxed),
                "poll_errors": m.fortuna_poll_errors.load(Ordering::Relaxed),
            },
        },
        "seeding": {
            "reseeds": m.reseeds.load(Ordering::Relaxed),
            "reseed_errors": m.reseed_errors.load(Ordering::Relaxed),
            "virtio_seeds": m.virtio_seeds.load(Ordering::Relaxed),
            "virtio_seed_errors": m.virtio_seed_errors.load(Ordering::Relaxed),
        },
        "quality": ctx.quality.report(),
    }))
}

fn dep_status(age: Option<u64>, stale_after: u64) -> &'static str {
    match age {
        None => "unreachable",
        Some(age) if age > stale_after => "stale",
        Some(_) => "ok",
    }
}

async fn health_handler(State(ctx): State<Arc<ServiceContext>>) -> Json<Value> {
    let m = &ctx.metrics;
    let controller = dep_status(m.trng_success_age(), POLLER_STALE_SECS);
    let fortuna = dep_status(m.fortuna_success_age(), POLLER_STALE_SECS);
    let seeding = dep_status(m.reseed_success_age(), ctx.config.seed_interval_s * 3);
    let status = if [controller, fortuna, seeding].iter().all(|s| *s == "ok") {
        "ok"
    } else {
        "degraded"
    };
    Json(json!({
        "status": status,
        "details": {
            "api": "ok",
            "controller": controller,
            "fortuna": fortuna,
            "seeding": seeding,
        }
    }))
}
