//! Routing of inbound overlay messages.
//!
//! Every `message` event from the sidecar carries a base64 JSON payload.
//! Replies to our own queries are handed to the [`CorrelationStore`]; fresh
//! queries from peers are answered from the elevation backend. Each fresh
//! query yields exactly one `http.response`, errors included.

use std::sync::Arc;

use percent_encoding::percent_decode_str;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::correlation::CorrelationStore;
use crate::envelope::{
    decode_b64, ElevQuery, HttpRequest, ResponseEnvelope, ELEV_QUERY, HTTP_REQUEST, HTTP_RESPONSE,
};
use crate::location::{self, LocationSet};
use crate::repackage::repackage;
use crate::transport::{Outbound, SidecarEvent};
use crate::upstream::{ElevationClient, UpstreamResponse};

/// Reply to a `http.request` that is not `GET /v1/...`.
pub const ONLY_GET_SUPPORTED: &str = "only GET /v1/<dataset>?locations=... supported";
/// Reply to a `http.request` without a `locations` query value.
pub const MISSING_LOCATIONS: &str = "missing locations";

/// What an inbound payload turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A response to one of our own exchanges.
    Reply(ResponseEnvelope),
    /// A query we must answer.
    Query(FreshQuery),
    /// Unknown type or unusable payload.
    Ignored,
}

/// A query from a peer, already validated.
#[derive(Debug, Clone, PartialEq)]
pub struct FreshQuery {
    pub id: Option<String>,
    pub dataset: Option<String>,
    /// The normalized locations, or the error text for a `400` reply.
    pub request: Result<LocationSet, String>,
}

/// Decode an inbound payload.
///
/// The `type` field is matched case-insensitively.
pub fn classify(payload: &[u8]) -> Inbound {
    let value: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!(error = %e, "Dropping non-JSON payload");
            return Inbound::Ignored;
        }
    };
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let peeked_id = value.get("id").and_then(Value::as_str).map(str::to_string);

    match kind.as_str() {
        HTTP_RESPONSE => match serde_json::from_value::<ResponseEnvelope>(value) {
            Ok(reply) => Inbound::Reply(reply),
            Err(e) => {
                tracing::debug!(error = %e, "Dropping malformed response");
                Inbound::Ignored
            }
        },
        ELEV_QUERY => Inbound::Query(match serde_json::from_value::<ElevQuery>(value) {
            Ok(query) => FreshQuery {
                request: location::normalize(query.geohashes.as_ref(), query.locations.as_ref())
                    .map_err(|e| format!("bad request: {e}")),
                id: query.id,
                dataset: query.dataset,
            },
            Err(e) => FreshQuery {
                id: peeked_id,
                dataset: None,
                request: Err(format!("bad request: {e}")),
            },
        }),
        HTTP_REQUEST => Inbound::Query(match serde_json::from_value::<HttpRequest>(value) {
            Ok(request) => {
                let (dataset, request_result) = match parse_http_request(&request) {
                    Ok((dataset, set)) => (Some(dataset), Ok(set)),
                    Err(msg) => (None, Err(msg)),
                };
                FreshQuery {
                    id: request.id,
                    dataset,
                    request: request_result,
                }
            }
            Err(e) => FreshQuery {
                id: peeked_id,
                dataset: None,
                request: Err(format!("bad request: {e}")),
            },
        }),
        other => {
            tracing::debug!(kind = %other, "Ignoring message of unknown type");
            Inbound::Ignored
        }
    }
}

/// Validate a proxied request and extract `(dataset, locations)`.
///
/// The url must be `/v1/<dataset>?locations=<value>` with `locations` as the
/// first query parameter. The value is percent-decoded only, so `+` stays
/// a literal plus.
fn parse_http_request(request: &HttpRequest) -> Result<(String, LocationSet), String> {
    let url = request.url.trim();
    let rest = match url.strip_prefix("/v1/") {
        Some(rest) if request.method.eq_ignore_ascii_case("GET") => rest,
        _ => return Err(ONLY_GET_SUPPORTED.to_string()),
    };

    let (dataset, raw) = rest
        .split_once('?')
        .filter(|(dataset, _)| !dataset.is_empty())
        .and_then(|(dataset, query)| Some((dataset, query.strip_prefix("locations=")?)))
        .filter(|(_, raw)| !raw.is_empty())
        .ok_or_else(|| MISSING_LOCATIONS.to_string())?;

    let locations = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|e| format!("bad locations: {e}"))?;
    let set = location::parse_joined(&locations).map_err(|e| format!("bad locations: {e}"))?;
    Ok((dataset.to_string(), set))
}

/// Answers peer queries and routes replies to waiting exchanges.
pub struct Dispatcher {
    client: Arc<ElevationClient>,
    exchanges: Arc<CorrelationStore>,
}

impl Dispatcher {
    pub fn new(client: Arc<ElevationClient>, exchanges: Arc<CorrelationStore>) -> Self {
        Self { client, exchanges }
    }

    pub fn client(&self) -> &Arc<ElevationClient> {
        &self.client
    }

    pub fn exchanges(&self) -> &Arc<CorrelationStore> {
        &self.exchanges
    }

    /// Classify a payload and resolve it if it is a reply.
    ///
    /// Returns the fresh query that still needs an answer, if any.
    pub fn route(&self, payload: &[u8]) -> Option<FreshQuery> {
        match classify(payload) {
            Inbound::Reply(reply) => {
                let id = reply.id.clone();
                if !self.exchanges.resolve(&id, reply) {
                    tracing::debug!(id = %id, "Late or unknown reply ignored");
                }
                None
            }
            Inbound::Query(query) => Some(query),
            Inbound::Ignored => None,
        }
    }

    /// Query the backend for a normalized batch and repackage the result.
    pub async fn lookup(&self, set: &LocationSet, dataset: Option<&str>) -> UpstreamResponse {
        let response = self.client.query(set.points(), dataset).await;
        repackage(set, response)
    }

    /// Build the reply for a fresh query. A missing id is generated.
    pub async fn answer(&self, query: FreshQuery) -> ResponseEnvelope {
        let id = query
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

        match query.request {
            Err(message) => ResponseEnvelope::error(id, 400, message),
            Ok(set) => {
                let response = self.lookup(&set, query.dataset.as_deref()).await;
                ResponseEnvelope {
                    id,
                    status: response.status,
                    headers: response.headers,
                    body: response.body,
                    duration_ms: response.duration_ms,
                }
            }
        }
    }

    /// Decode a `message` payload and route it. Returns the fresh query to
    /// answer, if any; replies are resolved here.
    pub fn intake(&self, src: &str, payload_b64: &str) -> Option<FreshQuery> {
        match decode_b64(payload_b64) {
            Ok(payload) => self.route(&payload),
            Err(e) => {
                tracing::debug!(src = %src, error = %e, "Dropping message with bad base64");
                None
            }
        }
    }

    /// Handle one `message` event end to end.
    pub async fn handle(&self, src: &str, payload_b64: &str, outbound: &dyn Outbound) {
        if let Some(query) = self.intake(src, payload_b64) {
            self.respond(src, query, outbound).await;
        }
    }

    async fn respond(&self, src: &str, query: FreshQuery, outbound: &dyn Outbound) {
        let reply = self.answer(query).await;
        tracing::info!(
            src = %src,
            id = %reply.id,
            status = reply.status,
            duration_ms = reply.duration_ms,
            "Answering peer query"
        );
        let bytes = match reply.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(id = %reply.id, error = %e, "Failed to encode reply");
                return;
            }
        };
        if let Err(e) = outbound.send(src, &bytes, &reply.id).await {
            tracing::warn!(src = %src, id = %reply.id, error = %e, "Failed to send reply");
        }
    }

    /// Consume sidecar events until the channel closes.
    ///
    /// Replies are resolved inline; each fresh query is answered on its own
    /// task so slow upstream calls never stall the loop.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<SidecarEvent>,
        outbound: Arc<dyn Outbound>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                SidecarEvent::Message { src, payload_b64 } => {
                    let Some(query) = self.intake(&src, &payload_b64) else {
                        continue;
                    };
                    let dispatcher = Arc::clone(&self);
                    let outbound = Arc::clone(&outbound);
                    tokio::spawn(async move {
                        dispatcher.respond(&src, query, outbound.as_ref()).await;
                    });
                }
                SidecarEvent::Sent { id, dest } => {
                    tracing::trace!(id = ?id, dest = ?dest, "Overlay accepted message");
                }
                SidecarEvent::Ready { .. } | SidecarEvent::Error { .. } => {}
            }
        }
        tracing::info!("Dispatcher stopped");
    }
}
