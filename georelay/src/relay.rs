//! The relay: forward operation, local queries, admission and health.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use georelay::{Relay, RelayConfig, Sidecar};
//!
//! let config = RelayConfig::from_env()?;
//! let (sidecar, events) = Sidecar::start(&config.sidecar())?;
//! let sidecar = Arc::new(sidecar);
//!
//! let relay = Relay::new(&config, sidecar.clone())?;
//! tokio::spawn(relay.dispatcher().run(events, sidecar));
//!
//! let reply = relay.forward(request).await?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::RelayConfig;
use crate::correlation::CorrelationStore;
use crate::dispatcher::Dispatcher;
use crate::envelope::{encode_b64, ElevQuery, Envelope};
use crate::error::{ForwardError, LocationError, RateLimitExceeded, RelayError};
use crate::gate::ConcurrencyGate;
use crate::location::{self, GeohashInput, LocationInput, LocationSet};
use crate::rate_limit::RateLimiter;
use crate::transport::Outbound;
use crate::upstream::{ElevationClient, UpstreamResponse};

/// Body of a forward request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForwardRequest {
    #[serde(default)]
    pub dest: Option<String>,
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default)]
    pub geohashes: Option<GeohashInput>,
    #[serde(default)]
    pub locations: Option<LocationInput>,
}

/// The remote peer's answer to a forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardReply {
    pub ok: bool,
    pub id: String,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub duration_ms: u64,
    pub body_b64: String,
    pub body_utf8: Option<String>,
}

/// Liveness and readiness snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health {
    pub ok: bool,
    /// Whether the overlay address is known.
    pub ready: bool,
    pub addr: Option<String>,
    pub elev_base: String,
    pub dataset: String,
    /// Forwards waiting on a reply.
    pub pending: usize,
    /// Upstream calls in progress.
    pub in_flight: usize,
    /// Most upstream calls ever in progress at once.
    pub peak_in_flight: usize,
    /// Client identities holding a rate bucket.
    pub clients: usize,
    /// Milliseconds since the Unix epoch.
    pub ts: u64,
}

/// Shared state behind the front-end and the dispatcher.
pub struct Relay {
    outbound: Arc<dyn Outbound>,
    dispatcher: Arc<Dispatcher>,
    exchanges: Arc<CorrelationStore>,
    limiter: RateLimiter,
    gate: Arc<ConcurrencyGate>,
    default_dataset: String,
    elev_base: String,
    forward_timeout: Duration,
}

impl Relay {
    /// Build a relay sending through `outbound`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Client`] if the upstream HTTP client cannot be
    /// built.
    pub fn new(config: &RelayConfig, outbound: Arc<dyn Outbound>) -> Result<Self, RelayError> {
        let gate = Arc::new(ConcurrencyGate::new(config.concurrency));
        let client = ElevationClient::new(
            config.elev_base.clone(),
            config.elev_dataset.clone(),
            config.elev_timeout,
            Arc::clone(&gate),
        )?;
        let exchanges = Arc::new(CorrelationStore::new());
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(client), Arc::clone(&exchanges)));

        tracing::info!(
            elev_base = %config.elev_base,
            dataset = %config.elev_dataset,
            concurrency = config.concurrency,
            rate_rps = config.rate_rps,
            rate_burst = config.rate_burst,
            "Relay configured"
        );

        Ok(Self {
            outbound,
            dispatcher,
            exchanges,
            limiter: RateLimiter::new(config.rate_rps, config.rate_burst),
            gate,
            default_dataset: config.elev_dataset.clone(),
            elev_base: config.elev_base.clone(),
            forward_timeout: config.forward_timeout(),
        })
    }

    /// Send an elevation query to a remote peer and wait for its reply.
    ///
    /// The exchange is registered before the send so an early reply is
    /// never missed. It is removed on every failure path.
    ///
    /// # Errors
    ///
    /// - [`ForwardError::MissingDest`] for a blank destination
    /// - [`ForwardError::BadPayload`] when the locations cannot be normalized
    /// - [`ForwardError::Send`] when the sidecar rejects the send
    /// - [`ForwardError::Correlation`] on timeout or shutdown
    pub async fn forward(&self, request: ForwardRequest) -> Result<ForwardReply, ForwardError> {
        let dest = request
            .dest
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .ok_or(ForwardError::MissingDest)?
            .to_string();
        let dataset = request
            .dataset
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or(&self.default_dataset)
            .to_string();
        let set = location::normalize(request.geohashes.as_ref(), request.locations.as_ref())?;

        let id = uuid::Uuid::new_v4().simple().to_string();
        let query = match set {
            LocationSet::Geohash { tokens, .. } => ElevQuery {
                id: Some(id.clone()),
                dataset: Some(dataset),
                geohashes: Some(GeohashInput::List(tokens)),
                locations: None,
            },
            LocationSet::LatLng(points) => ElevQuery {
                id: Some(id.clone()),
                dataset: Some(dataset),
                geohashes: None,
                locations: Some(LocationInput::Points(points)),
            },
        };
        let payload = Envelope::ElevQuery(query).to_bytes()?;

        let handle = self
            .exchanges
            .register(id.clone(), Instant::now() + self.forward_timeout)?;

        tracing::info!(id = %id, dest = %dest, "Forwarding query");
        if let Err(e) = self.outbound.send(&dest, &payload, &id).await {
            tracing::warn!(id = %id, dest = %dest, error = %e, "Forward send failed");
            return Err(e.into());
        }

        let reply = handle.wait(self.forward_timeout).await.map_err(|e| {
            tracing::warn!(id = %id, error = %e, "Forward did not complete");
            e
        })?;

        Ok(ForwardReply {
            ok: true,
            id,
            status: reply.status,
            body_b64: encode_b64(&reply.body),
            body_utf8: reply.body_utf8(),
            headers: reply.headers,
            duration_ms: reply.duration_ms,
        })
    }

    /// Answer a `locations` query against the local backend directly.
    pub async fn query_local(
        &self,
        dataset: &str,
        locations: &str,
    ) -> Result<UpstreamResponse, LocationError> {
        let set = location::parse_joined(locations)?;
        Ok(self.dispatcher.lookup(&set, Some(dataset)).await)
    }

    /// Charge one request to `client`'s rate bucket.
    pub fn admit(&self, client: &str) -> Result<(), RateLimitExceeded> {
        self.limiter.check(client)
    }

    pub fn health(&self) -> Health {
        let addr = self.outbound.address();
        Health {
            ok: true,
            ready: addr.is_some(),
            addr,
            elev_base: self.elev_base.clone(),
            dataset: self.default_dataset.clone(),
            pending: self.exchanges.len(),
            in_flight: self.gate.in_flight(),
            peak_in_flight: self.gate.peak_in_flight(),
            clients: self.limiter.tracked_clients(),
            ts: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
        }
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn exchanges(&self) -> &Arc<CorrelationStore> {
        &self.exchanges
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.gate
    }

    pub fn forward_timeout(&self) -> Duration {
        self.forward_timeout
    }

    /// Override how long a forward waits for its reply.
    pub fn with_forward_timeout(mut self, timeout: Duration) -> Self {
        self.forward_timeout = timeout;
        self
    }

    /// Refuse new upstream calls and fail all pending forwards.
    pub fn shutdown(&self) -> usize {
        self.gate.close();
        let drained = self.exchanges.drain();
        tracing::info!(drained = drained, "Relay shut down");
        drained
    }
}
