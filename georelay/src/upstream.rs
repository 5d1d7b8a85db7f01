//! HTTP client for the local elevation backend.
//!
//! The backend answers `GET {base}/v1/{dataset}?locations=lat,lng|lat,lng|...`
//! with a JSON body containing a `results` array. Every call runs under the
//! shared [`ConcurrencyGate`], and transport failures are folded into a
//! synthetic `502` response so callers always have something to forward.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;

use crate::envelope::{error_body, json_headers};
use crate::gate::ConcurrencyGate;
use crate::location::LatLng;

/// Status used when the backend could not be reached.
pub const BAD_GATEWAY: u16 = 502;

/// Transport-agnostic view of a backend response.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub duration_ms: u64,
}

impl UpstreamResponse {
    /// A `502` carrying `{"error": message}`.
    pub fn failure(message: impl AsRef<str>) -> Self {
        Self {
            status: BAD_GATEWAY,
            headers: json_headers(),
            body: error_body(message.as_ref()),
            duration_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Batched elevation lookups against the configured backend.
pub struct ElevationClient {
    http: Client,
    base_url: String,
    default_dataset: String,
    gate: Arc<ConcurrencyGate>,
}

impl ElevationClient {
    /// Create a client for `base_url` (a trailing `/` is ignored).
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built (e.g. TLS
    /// backend initialization failure).
    pub fn new(
        base_url: impl Into<String>,
        default_dataset: impl Into<String>,
        timeout: Duration,
        gate: Arc<ConcurrencyGate>,
    ) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_dataset: default_dataset.into(),
            gate,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn default_dataset(&self) -> &str {
        &self.default_dataset
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.gate
    }

    /// Build the backend URL for a batch of points.
    ///
    /// A missing or blank dataset falls back to the default one.
    pub fn query_url(&self, points: &[LatLng], dataset: Option<&str>) -> String {
        let dataset = dataset
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or(&self.default_dataset);
        let locations = points
            .iter()
            .map(LatLng::key)
            .collect::<Vec<_>>()
            .join("|");
        format!("{}/v1/{}?locations={}", self.base_url, dataset, locations)
    }

    /// Query elevations for all points in a single upstream call.
    ///
    /// Never fails: transport errors and timeouts become a `502` response
    /// with a JSON error body.
    pub async fn query(&self, points: &[LatLng], dataset: Option<&str>) -> UpstreamResponse {
        let url = self.query_url(points, dataset);

        let _permit = match self.gate.acquire().await {
            Ok(permit) => permit,
            Err(_) => return UpstreamResponse::failure("upstream failure: relay is shutting down"),
        };

        tracing::debug!(url = %url, points = points.len(), "Upstream query");
        let started = Instant::now();

        match self.fetch(&url).await {
            Ok((status, headers, body)) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                tracing::debug!(status = status, duration_ms = duration_ms, "Upstream replied");
                UpstreamResponse {
                    status,
                    headers,
                    body,
                    duration_ms,
                }
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Upstream query failed");
                UpstreamResponse::failure(format!("upstream failure: {e}"))
            }
        }
    }

    async fn fetch(
        &self,
        url: &str,
    ) -> Result<(u16, BTreeMap<String, String>, Vec<u8>), reqwest::Error> {
        let response = self.http.get(url).send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response.bytes().await?.to_vec();
        Ok((status, headers, body))
    }
}
