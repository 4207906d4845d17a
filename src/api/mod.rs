//! JSON-over-HTTP control plane.
//!
//! Accepts POST-only commands that rewire the running agent: mode overrides,
//! token-bucket budgets, PMU group swaps, symbol hints, and monitoring
//! targets. Every endpoint answers `200 ok` on success and `400 invalid
//! request` on any parse or validation failure; commands are idempotent at
//! the application level.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{ControlConfig, PmuEventDesc, PmuGroupConfig};
use crate::mode::bucket::BucketUpdateRequest;
use crate::mode::AgentMode;
use crate::pipeline::targets::TargetSpec;
use crate::sampler::event::PmuEventKind;

/// Request bodies above this size are rejected outright.
const MAX_REQUEST_BYTES: usize = 8192;

/// Per-arm PMU group replacement; an absent arm is left untouched.
#[derive(Debug, Clone, Default)]
pub struct PmuConfigUpdate {
    pub sentinel: Option<Vec<PmuGroupConfig>>,
    pub diagnostic: Option<Vec<PmuGroupConfig>>,
}

/// JIT code-range registration for the symbolizer.
#[derive(Debug, Clone)]
pub struct JitRegionRequest {
    pub pid: u32,
    pub start: u64,
    pub end: u64,
    pub path: String,
    pub build_id: String,
}

/// Explicit data-object registration for the symbolizer.
#[derive(Debug, Clone)]
pub struct DataObjectRequest {
    pub pid: u32,
    pub address: u64,
    pub name: String,
    pub type_name: String,
    pub size: u64,
}

/// Callbacks into the runtime, invoked synchronously per request.
pub struct ControlHandlers {
    pub on_mode: Box<dyn Fn(AgentMode) + Send + Sync>,
    pub on_bucket: Box<dyn Fn(BucketUpdateRequest) + Send + Sync>,
    pub on_pmu_config: Box<dyn Fn(PmuConfigUpdate) + Send + Sync>,
    pub on_jit: Box<dyn Fn(JitRegionRequest) + Send + Sync>,
    pub on_data_object: Box<dyn Fn(DataObjectRequest) + Send + Sync>,
    pub on_targets: Box<dyn Fn(Vec<TargetSpec>) + Send + Sync>,
}

/// Control-plane HTTP listener.
pub struct ControlPlane {
    cfg: ControlConfig,
    handlers: Arc<ControlHandlers>,
}

impl ControlPlane {
    pub fn new(cfg: ControlConfig, handlers: ControlHandlers) -> Self {
        Self {
            cfg,
            handlers: Arc::new(handlers),
        }
    }

    /// Bind the listener and spawn the server task.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let addr = format!("{}:{}", self.cfg.address, self.cfg.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding control listener on {addr}"))?;

        let app = router(Arc::clone(&self.handlers));

        info!(addr = %addr, "control plane listening");

        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await;
        });

        Ok(())
    }
}

/// Build the control-plane router; separated out so tests can drive it
/// without a listener.
pub fn router(handlers: Arc<ControlHandlers>) -> Router {
    Router::new()
        .route("/api/v1/mode", post(handle_mode))
        .route("/api/v1/token-bucket", post(handle_token_bucket))
        .route("/api/v1/pmu-config", post(handle_pmu_config))
        .route("/api/v1/symbols/jit", post(handle_jit))
        .route("/api/v1/symbols/data", post(handle_data_object))
        .route("/api/v1/targets", post(handle_targets))
        .fallback(reject)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BYTES))
        .with_state(handlers)
}

fn ok() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

fn invalid() -> (StatusCode, &'static str) {
    (StatusCode::BAD_REQUEST, "invalid request")
}

async fn reject() -> impl IntoResponse {
    invalid()
}

#[derive(Deserialize)]
struct ModeBody {
    mode: String,
}

async fn handle_mode(
    State(handlers): State<Arc<ControlHandlers>>,
    body: Bytes,
) -> impl IntoResponse {
    let Ok(req) = serde_json::from_slice::<ModeBody>(&body) else {
        return invalid();
    };
    let Some(mode) = AgentMode::parse(&req.mode) else {
        return invalid();
    };
    (handlers.on_mode)(mode);
    ok()
}

#[derive(Deserialize)]
struct TokenBucketBody {
    #[serde(default)]
    sentinel_samples_per_sec: Option<u64>,
    #[serde(default)]
    diagnostic_samples_per_sec: Option<u64>,
    #[serde(default)]
    hard_drop_ns: Option<u64>,
    /// Legacy alias for the sentinel budget.
    #[serde(default)]
    samples_per_sec: Option<u64>,
}

async fn handle_token_bucket(
    State(handlers): State<Arc<ControlHandlers>>,
    body: Bytes,
) -> impl IntoResponse {
    let Ok(req) = serde_json::from_slice::<TokenBucketBody>(&body) else {
        return invalid();
    };

    let mut update = BucketUpdateRequest {
        sentinel_budget: req.sentinel_samples_per_sec.filter(|v| *v > 0),
        diagnostic_budget: req.diagnostic_samples_per_sec.filter(|v| *v > 0),
        hard_drop_ns: req.hard_drop_ns.filter(|v| *v > 0),
    };

    if update.sentinel_budget.is_none()
        && update.diagnostic_budget.is_none()
        && update.hard_drop_ns.is_none()
    {
        match req.samples_per_sec.filter(|v| *v > 0) {
            Some(legacy) => update.sentinel_budget = Some(legacy),
            None => return invalid(),
        }
    }

    (handlers.on_bucket)(update);
    ok()
}

/// Logical event identity: either a numeric `ms_pmu_event_type` value or a
/// canonical name such as "l3_miss".
#[derive(Deserialize)]
#[serde(untagged)]
enum LogicalEventBody {
    Value(u32),
    Name(String),
}

#[derive(Deserialize)]
struct PmuEventBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "type")]
    perf_type: Option<u32>,
    #[serde(default)]
    config: Option<u64>,
    #[serde(default)]
    sample_period: Option<u64>,
    #[serde(default)]
    precise: Option<bool>,
    #[serde(default)]
    logical: Option<LogicalEventBody>,
}

#[derive(Deserialize)]
struct PmuGroupBody {
    name: String,
    events: Vec<PmuEventBody>,
}

#[derive(Deserialize)]
struct PmuConfigBody {
    #[serde(default)]
    sentinel: Option<Vec<PmuGroupBody>>,
    #[serde(default)]
    diagnostic: Option<Vec<PmuGroupBody>>,
}

fn resolve_logical(logical: Option<LogicalEventBody>) -> Option<u32> {
    match logical {
        None => Some(1),
        Some(LogicalEventBody::Value(v)) => Some(v),
        Some(LogicalEventBody::Name(name)) => {
            PmuEventKind::from_name(&name).map(|kind| kind as u32)
        }
    }
}

fn build_groups(bodies: Vec<PmuGroupBody>) -> Option<Vec<PmuGroupConfig>> {
    let mut groups = Vec::with_capacity(bodies.len());
    for body in bodies {
        if body.events.is_empty() {
            return None;
        }
        let mut events = Vec::with_capacity(body.events.len());
        for event in body.events {
            let logical = resolve_logical(event.logical)?;
            events.push(PmuEventDesc {
                name: event.name.unwrap_or_default(),
                perf_type: event.perf_type.unwrap_or(0),
                config: event.config.unwrap_or(0),
                sample_period: event.sample_period.unwrap_or(100_000),
                logical,
                precise: event.precise.unwrap_or(true),
            });
        }
        groups.push(PmuGroupConfig {
            name: body.name,
            events,
        });
    }
    Some(groups)
}

async fn handle_pmu_config(
    State(handlers): State<Arc<ControlHandlers>>,
    body: Bytes,
) -> impl IntoResponse {
    let Ok(req) = serde_json::from_slice::<PmuConfigBody>(&body) else {
        return invalid();
    };
    if req.sentinel.is_none() && req.diagnostic.is_none() {
        return invalid();
    }

    let mut update = PmuConfigUpdate::default();
    if let Some(bodies) = req.sentinel {
        if bodies.is_empty() {
            return invalid();
        }
        match build_groups(bodies) {
            Some(groups) => update.sentinel = Some(groups),
            None => return invalid(),
        }
    }
    if let Some(bodies) = req.diagnostic {
        if bodies.is_empty() {
            return invalid();
        }
        match build_groups(bodies) {
            Some(groups) => update.diagnostic = Some(groups),
            None => return invalid(),
        }
    }

    (handlers.on_pmu_config)(update);
    ok()
}

#[derive(Deserialize)]
struct JitBody {
    pid: u32,
    start: u64,
    end: u64,
    path: String,
    #[serde(default)]
    build_id: String,
}

async fn handle_jit(
    State(handlers): State<Arc<ControlHandlers>>,
    body: Bytes,
) -> impl IntoResponse {
    let Ok(req) = serde_json::from_slice::<JitBody>(&body) else {
        return invalid();
    };
    if req.pid == 0 || req.start == 0 || req.end <= req.start || req.path.is_empty() {
        return invalid();
    }
    (handlers.on_jit)(JitRegionRequest {
        pid: req.pid,
        start: req.start,
        end: req.end,
        path: req.path,
        build_id: req.build_id,
    });
    ok()
}

#[derive(Deserialize)]
struct DataObjectBody {
    pid: u32,
    address: u64,
    name: String,
    #[serde(default, rename = "type")]
    type_name: String,
    #[serde(default)]
    size: u64,
}

async fn handle_data_object(
    State(handlers): State<Arc<ControlHandlers>>,
    body: Bytes,
) -> impl IntoResponse {
    let Ok(req) = serde_json::from_slice::<DataObjectBody>(&body) else {
        return invalid();
    };
    if req.pid == 0 || req.address == 0 || req.name.is_empty() {
        return invalid();
    }
    (handlers.on_data_object)(DataObjectRequest {
        pid: req.pid,
        address: req.address,
        name: req.name,
        type_name: req.type_name,
        size: req.size,
    });
    ok()
}

#[derive(Deserialize)]
struct TargetsBody {
    targets: Vec<TargetSpec>,
}

async fn handle_targets(
    State(handlers): State<Arc<ControlHandlers>>,
    body: Bytes,
) -> impl IntoResponse {
    let Ok(req) = serde_json::from_slice::<TargetsBody>(&body) else {
        return invalid();
    };
    (handlers.on_targets)(req.targets);
    ok()
}
