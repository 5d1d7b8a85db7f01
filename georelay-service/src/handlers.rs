//! HTTP request handlers for the relay front-end.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use georelay::{CorrelationError, ForwardError, ForwardReply, ForwardRequest, Health};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::{IntoParams, ToSchema};

use crate::AppState;

/// Forward request body.
///
/// Locations are given either as `geohashes` (array or `|`-delimited string)
/// or as `locations` (array of `{lat, lng}` objects, array of strings, or a
/// `|`-delimited string). A non-empty `geohashes` field wins.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ForwardBody {
    /// Overlay address of the remote relay.
    pub dest: String,
    /// Elevation dataset; defaults to the configured one.
    pub dataset: Option<String>,
    #[schema(value_type = Object)]
    pub geohashes: Option<Value>,
    #[schema(value_type = Object)]
    pub locations: Option<Value>,
}

/// The remote relay's answer.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ForwardResponse {
    pub ok: bool,
    /// Correlation id of the exchange.
    pub id: String,
    /// Status reported by the remote relay.
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub duration_ms: u64,
    /// Response body, base64-encoded.
    pub body_b64: String,
    /// Response body as text, when non-empty.
    pub body_utf8: Option<String>,
}

impl From<ForwardReply> for ForwardResponse {
    fn from(reply: ForwardReply) -> Self {
        Self {
            ok: reply.ok,
            id: reply.id,
            status: reply.status,
            headers: reply.headers,
            duration_ms: reply.duration_ms,
            body_b64: reply.body_b64,
            body_utf8: reply.body_utf8,
        }
    }
}

/// Error response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message.
    pub error: String,
}

impl ErrorResponse {
    fn reply(status: StatusCode, message: impl Into<String>) -> Response {
        (
            status,
            Json(Self {
                error: message.into(),
            }),
        )
            .into_response()
    }
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub ok: bool,
    /// Whether the overlay client has reported its address.
    pub ready: bool,
    /// Overlay address of this relay.
    pub addr: Option<String>,
    pub elev_base: String,
    pub dataset: String,
    /// Forwards waiting on a reply.
    pub pending: usize,
    /// Backend calls in progress.
    pub in_flight: usize,
    /// Most backend calls ever in progress at once.
    pub peak_in_flight: usize,
    /// Clients currently tracked by the rate limiter.
    pub clients: usize,
    /// Server time in milliseconds since the Unix epoch.
    pub ts: u64,
}

impl From<Health> for HealthResponse {
    fn from(health: Health) -> Self {
        Self {
            ok: health.ok,
            ready: health.ready,
            addr: health.addr,
            elev_base: health.elev_base,
            dataset: health.dataset,
            pending: health.pending,
            in_flight: health.in_flight,
            peak_in_flight: health.peak_in_flight,
            clients: health.clients,
            ts: health.ts,
        }
    }
}

/// Query parameters for the local elevation route.
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct LocalQuery {
    /// `|`-delimited geohashes or `lat,lng` pairs.
    pub locations: Option<String>,
}

/// Health check endpoint.
#[utoipa::path(
    get,
    path = "/healthz",
    tag = "system",
    responses(
        (status = 200, description = "Relay is running", body = HealthResponse),
        (status = 429, description = "Rate limit exceeded", body = ErrorResponse)
    )
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(state.relay.health().into())
}

/// Forward an elevation query to a remote relay and wait for its answer.
///
/// # Returns
///
/// - `200 OK` with the remote reply
/// - `400 Bad Request` if `dest` is missing or the locations are invalid
/// - `502 Bad Gateway` if the overlay send failed
/// - `504 Gateway Timeout` if no reply arrived in time
#[utoipa::path(
    post,
    path = "/forward",
    tag = "relay",
    request_body = ForwardBody,
    responses(
        (status = 200, description = "Reply from the remote relay", body = ForwardResponse),
        (status = 400, description = "Missing destination or bad locations", body = ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = ErrorResponse),
        (status = 502, description = "Overlay send failed", body = ErrorResponse),
        (status = 504, description = "No reply before the deadline", body = ErrorResponse)
    )
)]
pub async fn forward(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request = match parse_forward(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    match state.relay.forward(request).await {
        Ok(reply) => {
            tracing::info!(id = %reply.id, status = reply.status, "Forward completed");
            (StatusCode::OK, Json(ForwardResponse::from(reply))).into_response()
        }
        Err(e) => forward_error_response(e),
    }
}

/// Parse a forward body leniently: an unreadable body is treated as `{}`.
fn parse_forward(body: &[u8]) -> Result<ForwardRequest, Response> {
    let value: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
    match serde_json::from_value::<ForwardRequest>(value.clone()) {
        Ok(request) => Ok(request),
        Err(e) => {
            let has_dest = value
                .get("dest")
                .and_then(Value::as_str)
                .is_some_and(|d| !d.trim().is_empty());
            if has_dest {
                Err(ErrorResponse::reply(
                    StatusCode::BAD_REQUEST,
                    format!("bad payload: {e}"),
                ))
            } else {
                Err(forward_error_response(ForwardError::MissingDest))
            }
        }
    }
}

/// Map a forward failure to its HTTP status and error body.
pub fn forward_error_response(e: ForwardError) -> Response {
    let (status, message) = match &e {
        ForwardError::MissingDest | ForwardError::BadPayload(_) => {
            (StatusCode::BAD_REQUEST, e.to_string())
        }
        ForwardError::Send(_) => (StatusCode::BAD_GATEWAY, e.to_string()),
        ForwardError::Correlation(CorrelationError::Timeout { .. }) => {
            (StatusCode::GATEWAY_TIMEOUT, "dm response timeout".to_string())
        }
        ForwardError::Correlation(CorrelationError::Closed { .. }) => {
            (StatusCode::SERVICE_UNAVAILABLE, "relay shutting down".to_string())
        }
        ForwardError::Correlation(CorrelationError::DuplicateId { .. })
        | ForwardError::Encode(_) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    if status.is_server_error() {
        tracing::warn!(status = status.as_u16(), error = %e, "Forward failed");
    } else {
        tracing::debug!(status = status.as_u16(), error = %e, "Forward rejected");
    }

    ErrorResponse::reply(status, message)
}

/// Query the local elevation backend.
///
/// Geohash batches are answered as `{"results":[{"geohash","elevation"}]}`;
/// coordinate batches return the backend body unchanged.
#[utoipa::path(
    get,
    path = "/v1/{dataset}",
    tag = "elevation",
    params(
        ("dataset" = String, Path, description = "Elevation dataset name"),
        LocalQuery
    ),
    responses(
        (status = 200, description = "Backend response"),
        (status = 400, description = "Missing or invalid locations", body = ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = ErrorResponse),
        (status = 502, description = "Backend unreachable", body = ErrorResponse)
    )
)]
pub async fn local_query(
    State(state): State<Arc<AppState>>,
    Path(dataset): Path<String>,
    Query(query): Query<LocalQuery>,
) -> Response {
    let Some(locations) = query.locations.filter(|l| !l.trim().is_empty()) else {
        return ErrorResponse::reply(StatusCode::BAD_REQUEST, "missing locations");
    };

    match state.relay.query_local(&dataset, &locations).await {
        Ok(upstream) => {
            let status = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut headers = HeaderMap::new();
            for (name, value) in &upstream.headers {
                if is_hop_by_hop(name) {
                    continue;
                }
                if let (Ok(name), Ok(value)) = (
                    HeaderName::try_from(name.as_str()),
                    HeaderValue::try_from(value.as_str()),
                ) {
                    headers.insert(name, value);
                }
            }
            (status, headers, upstream.body).into_response()
        }
        Err(e) => ErrorResponse::reply(StatusCode::BAD_REQUEST, format!("bad locations: {e}")),
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection" | "content-length" | "transfer-encoding" | "keep-alive"
    )
}

/// Identify the caller for rate limiting: the first `X-Forwarded-For`
/// entry, else the peer address.
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "0.0.0.0".to_string())
}

/// Per-client token bucket in front of every route.
pub async fn rate_guard(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_identity(request.headers(), peer);

    match state.relay.admit(&client) {
        Ok(()) => next.run(request).await,
        Err(e) => {
            tracing::debug!(client = %client, retry_after = ?e.retry_after, "Rate limited");
            let mut response = ErrorResponse::reply(StatusCode::TOO_MANY_REQUESTS, "rate limit");
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(e.retry_after_secs()));
            response
        }
    }
}
