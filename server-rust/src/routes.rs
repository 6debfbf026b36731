use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use fleet_protocol::{Certificate, GenerationRequest, HeartbeatReport, RegisterRequest};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

use crate::attestation::SearchCriteria;
use crate::error::{FleetError, Result};
use crate::models::{DonationIntake, Period};
use crate::registry::tokens_match;
use crate::state::AppState;
use crate::storage;

const MAX_BODY_BYTES: usize = 1024 * 1024;
const DEFAULT_LEDGER_PAGE: usize = 1000;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/workers/heartbeat", post(heartbeat))
        .route("/api/v1/workers/status", get(fleet_status))
        .route("/api/v1/workers/{worker_id}", delete(unregister_worker))
        .route("/api/v1/generate", post(generate))
        .route("/api/v1/donations", post(record_donation))
        .route("/api/v1/donations/stats", get(donation_stats))
        .route("/api/v1/distributions/{period}", post(run_distribution))
        .route("/api/v1/transparency/months", get(available_months))
        .route("/api/v1/transparency/{period}", get(transparency_report))
        .route("/api/v1/certificate/verify", post(verify_certificate))
        .route("/api/v1/certificate/public-key", get(public_key))
        .route("/api/v1/certificate/ledger", get(public_ledger))
        .route("/api/v1/certificate/search", get(search_certificates))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn check_admin(state: &AppState, headers: &HeaderMap) -> Result<()> {
    match bearer(headers) {
        Some(token) if tokens_match(&state.config.admin_token, token) => Ok(()),
        _ => Err(FleetError::Unauthorized("admin token required".into())),
    }
}

fn ok(data: impl serde::Serialize) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

/// Address the worker will be reached on when it does not state one
fn peer_address(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .unwrap_or("127.0.0.1")
        .to_string()
}

async fn persist_workers(state: &AppState) {
    if let Err(e) = storage::save_state(state).await {
        tracing::warn!(error = %e, "Failed to persist worker registry");
    }
}

// --- Workers ---

async fn register_worker(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(mut req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<Value>)> {
    if req.ip_address.as_deref().map_or(true, |ip| ip.trim().is_empty()) {
        req.ip_address = Some(peer_address(&headers));
    }
    let resp = state.registry.register(req).await?;
    persist_workers(&state).await;
    Ok((StatusCode::CREATED, ok(resp)))
}

async fn heartbeat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(report): Json<HeartbeatReport>,
) -> Result<Json<Value>> {
    state.registry.heartbeat(report, bearer(&headers)).await?;
    Ok(ok(json!({ "acknowledged": true, "timestamp": Utc::now() })))
}

async fn unregister_worker(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(worker_id): Path<String>,
) -> Result<Json<Value>> {
    let token = bearer(&headers)
        .ok_or_else(|| FleetError::Unauthorized("missing authorization token".into()))?;
    state.registry.unregister(&worker_id, token).await?;
    persist_workers(&state).await;
    Ok(ok(json!({ "worker_id": worker_id, "status": "offline" })))
}

async fn fleet_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let health = state.dispatcher.health_check().await;
    let workers: Vec<_> = state
        .registry
        .list_available()
        .await
        .iter()
        .map(|w| w.view())
        .collect();
    ok(json!({
        "health": health,
        "workers": workers,
        "uptime_secs": (Utc::now() - state.start_time).num_seconds(),
    }))
}

// --- Generation ---

async fn generate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<GenerationRequest>,
) -> Result<Response> {
    check_admin(&state, &headers)?;
    let outcome = state.generation.generate(req).await?;

    let short_request: String = outcome.request_id.chars().take(8).collect();
    let short_worker: String = outcome.worker_id.chars().take(8).collect();
    let headers = [
        (header::CONTENT_TYPE.as_str(), "audio/wav".to_string()),
        (
            header::CONTENT_DISPOSITION.as_str(),
            format!("attachment; filename=\"generation_{short_request}.wav\""),
        ),
        ("x-request-id", outcome.request_id.clone()),
        ("x-worker-id", short_worker),
        ("x-sha256", outcome.content_hash.clone()),
        ("x-certificate-id", outcome.certificate.data.request_id.clone()),
        ("x-certificate-signature", outcome.certificate.signature.clone()),
        ("x-processing-time", outcome.processing_time_ms.to_string()),
    ];
    Ok((headers, outcome.audio).into_response())
}

// --- Revenue ---

async fn record_donation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(intake): Json<DonationIntake>,
) -> Result<(StatusCode, Json<Value>)> {
    check_admin(&state, &headers)?;
    let donation = state.revenue.record_donation(intake).await?;
    Ok((StatusCode::CREATED, ok(donation)))
}

async fn run_distribution(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(period): Path<String>,
) -> Result<Json<Value>> {
    check_admin(&state, &headers)?;
    let period: Period = period.parse()?;
    Ok(ok(state.revenue.run_distribution(period).await?))
}

async fn transparency_report(
    State(state): State<Arc<AppState>>,
    Path(period): Path<String>,
) -> Result<Json<Value>> {
    let period: Period = if period == "current" { Period::current() } else { period.parse()? };
    Ok(ok(state.revenue.transparency_report(period).await))
}

async fn available_months(State(state): State<Arc<AppState>>) -> Json<Value> {
    let months = state.revenue.available_periods().await;
    ok(json!({
        "months": months,
        "current_month": Period::current(),
        "last_processed": months.first(),
    }))
}

async fn donation_stats(State(state): State<Arc<AppState>>) -> Json<Value> {
    ok(state.revenue.donation_stats().await)
}

// --- Certificates ---

async fn verify_certificate(
    State(state): State<Arc<AppState>>,
    Json(cert): Json<Certificate>,
) -> Json<Value> {
    ok(state.attestation.verify(&cert).await)
}

async fn public_key(State(state): State<Arc<AppState>>) -> Json<Value> {
    ok(json!({
        "algorithm": "ed25519",
        "public_key": state.attestation.public_key_hex(),
        "fingerprint": state.attestation.fingerprint(),
    }))
}

#[derive(Debug, Deserialize)]
struct LedgerQuery {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

async fn public_ledger(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LedgerQuery>,
) -> Json<Value> {
    let limit = q.limit.unwrap_or(DEFAULT_LEDGER_PAGE).min(DEFAULT_LEDGER_PAGE);
    ok(state.attestation.public_ledger(limit, q.offset.unwrap_or(0)).await)
}

async fn search_certificates(
    State(state): State<Arc<AppState>>,
    Query(criteria): Query<SearchCriteria>,
) -> Json<Value> {
    let results = state.attestation.search(&criteria).await;
    ok(json!({ "count": results.len(), "certificates": results }))
}
