//! Local RPC API (C7): a minimal axum router bound to loopback, backed by
//! an `Arc<AppState>` the way the portal server elsewhere in this dependency
//! tree is — handlers read the telemetry store and a config snapshot, they
//! never touch the decision engine's lock directly. Mutating calls
//! (`action`, `config.set`) go through the [`RpcBackend`] seam into the
//! supervisor task.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::action::ActionRequest;
use crate::config::Config;
use crate::error::StarfailError;
use crate::model::{Class, DetectMode, Event, Member, Sample};
use crate::telemetry::TelemetryStore;

/// The seam between the HTTP layer and the live supervisor state: every
/// mutating or cross-cutting call goes through here instead of the router
/// reaching into the decision engine directly.
#[async_trait::async_trait]
pub trait RpcBackend: Send + Sync {
    fn current_primary(&self) -> Option<String>;
    fn members(&self) -> Vec<Member>;
    fn latest_sample(&self, name: &str) -> Option<Sample>;
    fn ranking(&self) -> Vec<(String, f64)>;
    async fn submit_action(&self, request: ActionRequest) -> Result<serde_json::Value, StarfailError>;
    async fn set_config(&self, text: String) -> Result<(), StarfailError>;
}

pub struct AppState {
    pub store: Arc<TelemetryStore>,
    pub backend: Arc<dyn RpcBackend>,
    pub config: ArcSwap<Config>,
    pub started_at_ms: u64,
    pub version: &'static str,
    /// Applies a new `tracing` filter directive string to the live
    /// subscriber. Kept as a boxed closure rather than a direct dependency on
    /// `tracing-subscriber`'s reload handle so this crate doesn't need that
    /// dependency just to shuttle one setter through.
    pub log_filter_handle: Arc<dyn Fn(&str) -> Result<(), String> + Send + Sync>,
}

/// Routes always present: the local RPC surface (C7). `/healthz` and
/// `/metrics` are mounted alongside it (same loopback port) but each checks
/// its own `main.health_listener`/`main.metrics_listener` flag at request
/// time and answers 404 when disabled, since the flags can change across a
/// config reload without rebuilding the router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/members", get(get_members))
        .route("/metrics/{name}", get(get_metrics))
        .route("/history/{name}", get(get_history))
        .route("/events", get(get_events))
        .route("/action", post(post_action))
        .route("/config", get(get_config).post(post_config))
        .route("/loglevel", post(post_loglevel))
        .route("/healthz", get(get_healthz))
        .route("/metrics", get(get_prometheus_metrics))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct RankEntry {
    name: String,
    score: f64,
}

#[derive(Debug, Serialize)]
struct StatusView {
    primary: Option<String>,
    ranking: Vec<RankEntry>,
    last_event: Option<Event>,
    config_digest: String,
}

fn config_digest(cfg: &Config) -> String {
    format!(
        "poll_interval_ms={};members={};use_policy_engine={}",
        cfg.main.poll_interval_ms,
        cfg.members.len(),
        cfg.main.use_policy_engine
    )
}

async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusView> {
    let ranking = state
        .backend
        .ranking()
        .into_iter()
        .map(|(name, score)| RankEntry { name, score })
        .collect();
    let last_event = state.store.recent_events(1).into_iter().next();
    let cfg = state.config.load();

    Json(StatusView {
        primary: state.backend.current_primary(),
        ranking,
        last_event,
        config_digest: config_digest(&cfg),
    })
}

#[derive(Debug, Serialize)]
struct MemberView {
    name: String,
    class: Class,
    detect: DetectMode,
    weight: u8,
    eligible: bool,
    in_warmup: bool,
    in_cooldown: bool,
    latest: Option<Sample>,
}

async fn get_members(State(state): State<Arc<AppState>>) -> Json<Vec<MemberView>> {
    let views = state
        .backend
        .members()
        .into_iter()
        .map(|m| {
            let latest = state.backend.latest_sample(&m.name);
            MemberView {
                name: m.name.clone(),
                class: m.class,
                detect: m.detect,
                weight: m.weight,
                eligible: m.eligible,
                in_warmup: m.in_warmup,
                in_cooldown: m.in_cooldown,
                latest,
            }
        })
        .collect();
    Json(views)
}

async fn get_metrics(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Json<Vec<Sample>> {
    Json(state.store.last_n_samples(&name, 256))
}

#[derive(Debug, serde::Deserialize)]
struct HistoryQuery {
    since_s: Option<u64>,
}

async fn get_history(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    axum::extract::Query(query): axum::extract::Query<HistoryQuery>,
) -> Json<Vec<Sample>> {
    let since_s = query.since_s.unwrap_or(300);
    let now_ms = crate::now_ms();
    let since_ms = now_ms.saturating_sub(since_s * 1_000);
    Json(state.store.recent_samples(&name, since_ms))
}

#[derive(Debug, serde::Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
}

async fn get_events(
    State(state): State<Arc<AppState>>,
    axum::extract::Query(query): axum::extract::Query<EventsQuery>,
) -> Json<Vec<Event>> {
    Json(state.store.recent_events(query.limit.unwrap_or(50)))
}

fn error_response(err: StarfailError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &err {
        StarfailError::Config { .. } => StatusCode::BAD_REQUEST,
        StarfailError::ProviderUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        StarfailError::ProviderTransient { .. } => StatusCode::SERVICE_UNAVAILABLE,
        StarfailError::ControllerConflict { .. } => StatusCode::CONFLICT,
        StarfailError::MemoryPressure { .. } => StatusCode::INSUFFICIENT_STORAGE,
        StarfailError::Throttle { .. } => StatusCode::TOO_MANY_REQUESTS,
        StarfailError::Fatal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({
            "error": err.kind(),
            "detail": err.to_string(),
        })),
    )
}

async fn post_action(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ActionRequest>,
) -> impl IntoResponse {
    match state.backend.submit_action(request).await {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn get_config(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let cfg = state.config.load();
    Json(serde_json::json!({
        "main": {
            "poll_interval_ms": cfg.main.poll_interval_ms,
            "use_policy_engine": cfg.main.use_policy_engine,
            "predictive": cfg.main.predictive,
            "switch_margin": cfg.main.switch_margin,
            "cooldown_s": cfg.main.cooldown_s,
        },
        "members": cfg.members.iter().map(|m| m.name.clone()).collect::<Vec<_>>(),
    }))
}

#[derive(Debug, serde::Deserialize)]
struct ConfigSetRequest {
    text: String,
}

async fn post_config(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ConfigSetRequest>,
) -> impl IntoResponse {
    match state.backend.set_config(body.text).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

#[derive(Debug, serde::Deserialize)]
struct LogLevelRequest {
    level: String,
}

/// `starfailctl setlog` backing endpoint: applies a new filter directive to
/// the live subscriber without a restart.
async fn post_loglevel(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LogLevelRequest>,
) -> impl IntoResponse {
    let level = body.level.to_ascii_lowercase();
    if !matches!(level.as_str(), "trace" | "debug" | "info" | "warn" | "error") {
        return error_response(StarfailError::Config {
            section: "main".to_string(),
            option: "log_level".to_string(),
            detail: format!("unknown log level '{level}'"),
        })
        .into_response();
    }
    match (state.log_filter_handle)(&level) {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"status": "ok", "level": level}))).into_response(),
        Err(detail) => {
            error_response(StarfailError::Fatal { detail }).into_response()
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthView {
    status: &'static str,
    uptime_s: u64,
    version: &'static str,
    checks: HashMap<String, &'static str>,
}

async fn get_healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if !state.config.load().main.health_listener {
        return StatusCode::NOT_FOUND.into_response();
    }

    let now_ms = crate::now_ms();
    let uptime_s = now_ms.saturating_sub(state.started_at_ms) / 1000;
    let primary = state.backend.current_primary();

    let mut checks = HashMap::new();
    checks.insert("has_primary".to_string(), if primary.is_some() { "pass" } else { "fail" });

    let status = if primary.is_some() { "ok" } else { "degraded" };
    Json(HealthView { status, uptime_s, version: state.version, checks }).into_response()
}

/// Simple `key{labels} value` Prometheus-text-format exposition (section 6):
/// one gauge per member per scored metric, no histograms or help text.
async fn get_prometheus_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if !state.config.load().main.metrics_listener {
        return StatusCode::NOT_FOUND.into_response();
    }

    let mut out = String::new();
    for member in state.backend.members() {
        let Some(sample) = state.backend.latest_sample(&member.name) else {
            continue;
        };
        let labels = format!("member=\"{}\",class=\"{}\"", member.name, member.class.as_str());
        out.push_str(&format!("starfail_score_instant{{{labels}}} {}\n", sample.instant));
        out.push_str(&format!("starfail_score_ewma{{{labels}}} {}\n", sample.ewma));
        out.push_str(&format!("starfail_score_final{{{labels}}} {}\n", sample.r#final));
        out.push_str(&format!("starfail_loss_pct{{{labels}}} {}\n", sample.loss_pct));
        if let Some(latency) = sample.latency_ms {
            out.push_str(&format!("starfail_latency_ms{{{labels}}} {latency}\n"));
        }
        out.push_str(&format!(
            "starfail_eligible{{{labels}}} {}\n",
            if member.eligible { 1 } else { 0 }
        ));
        out.push_str(&format!(
            "starfail_is_primary{{{labels}}} {}\n",
            if state.backend.current_primary().as_deref() == Some(member.name.as_str()) { 1 } else { 0 }
        ));
    }
    (StatusCode::OK, out).into_response()
}
