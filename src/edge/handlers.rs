use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Path, Query, State},
    http::{
        header::{CACHE_CONTROL, CONTENT_TYPE, LOCATION},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

use super::error::ApiError;
use super::router::{CacheTarget, Diagnostics, EdgeRouter, EdgeStatus, FlushSummary};
use crate::detection::extract_client_ip;
use crate::link::LinkInspection;
use crate::models::{DeviceRule, EdgeClickEvent, EdgeRequest, GeoRule};
use crate::queue::{DeadLetterEntry, IngestReport};

const DEFAULT_DLQ_LIMIT: usize = 100;

fn parse_json<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

/// `GET /c/{signed_code}`: always answers with a redirect
pub async fn click(
    State(edge): State<Arc<EdgeRouter>>,
    Path(signed_code): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let client_ip = extract_client_ip(&headers, addr.ip(), &edge.config().network);
    let request = EdgeRequest::new(client_ip, headers);

    let outcome = edge.handle_click(&signed_code, &request).await;
    edge.spawn_deferred(outcome.deferred);

    let location = HeaderValue::from_str(&outcome.location).or_else(|_| {
        tracing::warn!(location = %outcome.location, "destination is not a valid header value");
        HeaderValue::from_str(&edge.config().default_fallback_url)
    });
    let Ok(location) = location else {
        return (StatusCode::SERVICE_UNAVAILABLE, "No valid destination").into_response();
    };

    let mut response = StatusCode::FOUND.into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(LOCATION, location);
    response_headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    if let Ok(value) = HeaderValue::from_str(&outcome.decision) {
        response_headers.insert("x-edge-decision", value);
    }
    if let Some(reason) = &outcome.reason {
        if let Ok(value) = HeaderValue::from_str(&reason.to_string()) {
            response_headers.insert("x-edge-reason", value);
        }
    }
    response
}

#[derive(Deserialize)]
pub struct VerifyQuery {
    pub link: Option<String>,
}

pub async fn verify(
    State(edge): State<Arc<EdgeRouter>>,
    Query(query): Query<VerifyQuery>,
) -> Result<Json<LinkInspection>, ApiError> {
    let link = query
        .link
        .filter(|l| !l.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing 'link' query parameter".to_string()))?;
    Ok(Json(edge.verify(&link)))
}

pub async fn diagnostics(State(edge): State<Arc<EdgeRouter>>) -> Json<Diagnostics> {
    Json(edge.diagnostics().await)
}

pub async fn status(State(edge): State<Arc<EdgeRouter>>) -> Json<EdgeStatus> {
    Json(edge.status().await)
}

/// `GET /edge/metrics`: Prometheus text exposition
pub async fn metrics(State(edge): State<Arc<EdgeRouter>>) -> Result<Response, ApiError> {
    let body = edge.metrics().export()?;
    Ok((
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response())
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub edge_location: String,
    pub timestamp: i64,
}

pub async fn health(State(edge): State<Arc<EdgeRouter>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        edge_location: edge.config().edge_location.clone(),
        timestamp: chrono::Utc::now().timestamp_millis(),
    })
}

#[derive(Deserialize)]
pub struct EmitRequest {
    pub events: Vec<EdgeClickEvent>,
}

/// Bulk ingest of events produced elsewhere (other edges, replays)
pub async fn emit(
    State(edge): State<Arc<EdgeRouter>>,
    payload: Result<Json<EmitRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<IngestReport>), ApiError> {
    let request = parse_json(payload)?;
    if request.events.is_empty() {
        return Err(ApiError::BadRequest("'events' must not be empty".to_string()));
    }

    let location = &edge.config().edge_location;
    let events = request
        .events
        .into_iter()
        .map(|mut event| {
            if event.edge_location.is_empty() {
                event.edge_location = location.clone();
            }
            event
        })
        .collect();

    let report = edge.queue().ingest(events).await;
    let status = if report.failed == 0 {
        StatusCode::ACCEPTED
    } else {
        StatusCode::MULTI_STATUS
    };
    Ok((status, Json(report)))
}

#[derive(Deserialize)]
pub struct CacheRefreshRequest {
    #[serde(rename = "type")]
    pub target: CacheTarget,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Serialize)]
pub struct CacheRefreshResponse {
    pub target: CacheTarget,
    pub removed: usize,
}

pub async fn refresh_cache(
    State(edge): State<Arc<EdgeRouter>>,
    payload: Result<Json<CacheRefreshRequest>, JsonRejection>,
) -> Result<Json<CacheRefreshResponse>, ApiError> {
    let request = parse_json(payload)?;
    let removed = edge
        .refresh_cache(request.target, request.id.as_deref().filter(|id| !id.is_empty()))
        .await?;
    tracing::info!(cache = ?request.target, id = ?request.id, removed, "cache refreshed");
    Ok(Json(CacheRefreshResponse {
        target: request.target,
        removed,
    }))
}

pub async fn flush_queue(State(edge): State<Arc<EdgeRouter>>) -> Result<Json<FlushSummary>, ApiError> {
    Ok(Json(edge.flush().await?))
}

#[derive(Deserialize)]
pub struct DlqQuery {
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct DlqResponse {
    pub count: usize,
    pub entries: Vec<DeadLetterEntry>,
}

pub async fn list_dead_letters(
    State(edge): State<Arc<EdgeRouter>>,
    Query(query): Query<DlqQuery>,
) -> Result<Json<DlqResponse>, ApiError> {
    let entries = edge
        .queue()
        .dead_letters(query.limit.unwrap_or(DEFAULT_DLQ_LIMIT).clamp(1, 1000))
        .await?;
    Ok(Json(DlqResponse {
        count: entries.len(),
        entries,
    }))
}

#[derive(Deserialize, Default)]
pub struct ReplayRequest {
    #[serde(default)]
    pub keys: Option<Vec<String>>,
}

#[derive(Serialize)]
pub struct ReplayResponse {
    pub replayed: usize,
}

pub async fn replay_dead_letters(
    State(edge): State<Arc<EdgeRouter>>,
    payload: Option<Json<ReplayRequest>>,
) -> Result<Json<ReplayResponse>, ApiError> {
    let request = payload.map(|Json(r)| r).unwrap_or_default();
    let replayed = edge
        .queue()
        .replay_dead_letters(request.keys.as_deref())
        .await?;
    Ok(Json(ReplayResponse { replayed }))
}

#[derive(Serialize)]
pub struct RuleStored {
    pub key: String,
}

/// `PUT /edge/rules/{kind}` with a geo or device rule body
pub async fn put_rule(
    State(edge): State<Arc<EdgeRouter>>,
    Path(kind): Path<String>,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<(StatusCode, Json<RuleStored>), ApiError> {
    let body = parse_json(payload)?;
    let invalid = |e: serde_json::Error| ApiError::BadRequest(format!("Invalid {kind} rule: {e}"));

    let key = match kind.as_str() {
        "geo" => {
            let rule: GeoRule = serde_json::from_value(body).map_err(invalid)?;
            edge.geo().store_rule(&rule).await?
        }
        "device" => {
            let rule: DeviceRule = serde_json::from_value(body).map_err(invalid)?;
            edge.devices().store_rule(&rule).await?
        }
        other => return Err(ApiError::NotFound(format!("Unknown rule kind '{other}'"))),
    };
    Ok((StatusCode::CREATED, Json(RuleStored { key })))
}
