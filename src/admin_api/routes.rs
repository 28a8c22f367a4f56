use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use crate::analytics::scheduler::{JobKind, JobRunner};
use crate::models::block::UnblockOutcome;
use crate::models::flag::{NewFlag, RuleCategory};
use crate::protection::blocklist::BlockRegistry;
use crate::storage::cache::DecisionCache;
use crate::storage::{FlagStore, LogStore};

/// Shared state for every admin handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<BlockRegistry>,
    pub flags: Arc<dyn FlagStore>,
    pub log: Arc<dyn LogStore>,
    pub cache: Arc<DecisionCache>,
    pub jobs: Arc<JobRunner>,
    pub start_time: Instant,
    pub api_key: String,
}

pub type ApiError = (StatusCode, Json<Value>);
type ApiResult = Result<(StatusCode, Json<Value>), ApiError>;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1_000;

fn internal(err: impl std::fmt::Display) -> ApiError {
    error!(error = %err, "Admin API store error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
}

fn bad_request(message: String) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn not_found(message: String) -> ApiError {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message })))
}

/// IPv4-mapped IPv6 input is stored in its IPv4 form.
fn parse_address(raw: &str) -> Result<IpAddr, ApiError> {
    raw.trim()
        .parse::<IpAddr>()
        .map(|ip| ip.to_canonical())
        .map_err(|_| bad_request(format!("Invalid IP address: {}", raw)))
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, ApiError> {
    serde_json::to_value(value).map_err(internal)
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct BlocklistParams {
    pub all: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct AddBlocklistRequest {
    pub address: String,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FlagParams {
    pub resolved: Option<bool>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CreateFlagRequest {
    pub address: String,
    pub reason: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResolveFlagRequest {
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RequestLogParams {
    pub address: Option<String>,
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /api/status
pub async fn get_status(State(state): State<AppState>) -> ApiResult {
    let active_blocks = state.registry.list(true).map_err(internal)?.len();
    let unresolved_flags = state.flags.list_flags(Some(false), usize::MAX).map_err(internal)?.len();

    Ok((
        StatusCode::OK,
        Json(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": state.start_time.elapsed().as_secs(),
            "cache_entries": state.cache.len(),
            "active_blocks": active_blocks,
            "unresolved_flags": unresolved_flags,
        })),
    ))
}

/// GET /api/blocklist?all=bool
pub async fn get_blocklist(
    State(state): State<AppState>,
    Query(params): Query<BlocklistParams>,
) -> ApiResult {
    let only_active = !params.all.unwrap_or(false);
    let entries = state.registry.list(only_active).map_err(internal)?;
    Ok((StatusCode::OK, Json(to_value(&entries)?)))
}

/// POST /api/blocklist
pub async fn add_to_blocklist(
    State(state): State<AppState>,
    Json(body): Json<AddBlocklistRequest>,
) -> ApiResult {
    let address = parse_address(&body.address)?;
    let reason = body.reason.as_deref().unwrap_or("");
    let outcome = state.registry.block(address, reason).map_err(internal)?;

    let status = if outcome.created() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(json!({ "address": address, "outcome": outcome }))))
}

/// DELETE /api/blocklist/{address}
pub async fn remove_from_blocklist(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<StatusCode, ApiError> {
    let address = parse_address(&address)?;
    match state.registry.unblock(address).map_err(internal)? {
        UnblockOutcome::Unblocked => Ok(StatusCode::NO_CONTENT),
        UnblockOutcome::NotFound => Err(not_found(format!("IP {} is not in the blocklist", address))),
    }
}

/// GET /api/flags?resolved=bool&limit=N
pub async fn get_flags(
    State(state): State<AppState>,
    Query(params): Query<FlagParams>,
) -> ApiResult {
    let flags = state
        .flags
        .list_flags(params.resolved, clamp_limit(params.limit))
        .map_err(internal)?;
    Ok((StatusCode::OK, Json(to_value(&flags)?)))
}

/// POST /api/flags
pub async fn create_flag(
    State(state): State<AppState>,
    Json(body): Json<CreateFlagRequest>,
) -> ApiResult {
    let address = parse_address(&body.address)?;
    if body.reason.trim().is_empty() {
        return Err(bad_request("reason must not be empty".to_string()));
    }

    let id = state
        .flags
        .insert_flag(&NewFlag {
            address,
            category: RuleCategory::Manual,
            reason: body.reason,
            subject: None,
            request_count: 0,
            flagged_at: Utc::now(),
        })
        .map_err(internal)?;

    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

/// POST /api/flags/{id}/resolve. The JSON body is optional.
pub async fn resolve_flag(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let request: ResolveFlagRequest = if body.is_empty() {
        ResolveFlagRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| bad_request(format!("Invalid body: {}", e)))?
    };

    let resolved = state
        .flags
        .resolve_flag(id, Utc::now(), request.notes.as_deref())
        .map_err(internal)?;

    if resolved {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(format!("No unresolved flag with id {}", id)))
    }
}

/// GET /api/requests?address=&limit=
pub async fn get_requests(
    State(state): State<AppState>,
    Query(params): Query<RequestLogParams>,
) -> ApiResult {
    let address = match params.address.as_deref() {
        Some(raw) if !raw.is_empty() => Some(parse_address(raw)?),
        _ => None,
    };
    let records = state
        .log
        .recent(address, clamp_limit(params.limit))
        .map_err(internal)?;
    Ok((StatusCode::OK, Json(to_value(&records)?)))
}

/// POST /api/jobs/{name}
pub async fn run_job(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    let kind = JobKind::from_str_name(&name).ok_or_else(|| not_found(format!("Unknown job: {}", name)))?;
    let outcome = state.jobs.run_blocking(kind).await.map_err(internal)?;
    Ok((StatusCode::OK, Json(to_value(&outcome)?)))
}
