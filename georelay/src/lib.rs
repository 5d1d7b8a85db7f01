//! # GeoRelay - Geohash-aware elevation relay
//!
//! Bridges an overlay messaging network and a local HTTP elevation backend.
//! Peers send elevation queries as direct messages; the relay answers them
//! from the backend. Local callers can also forward queries to a remote relay
//! and wait for the reply.
//!
//! ## Features
//!
//! - **Geohash or lat/lng**: Batches are given as geohash tokens or
//!   coordinates; geohash replies come back keyed by the original tokens
//! - **Correlated exchanges**: Outbound queries are matched to replies by id,
//!   with deadlines and no leaked entries
//! - **Bounded**: A process-wide gate caps concurrent upstream calls and a
//!   per-client token bucket caps request rate
//! - **Sidecar transport**: The overlay client runs as a child process
//!   speaking newline-delimited JSON
//!
//! ## Quick Start
//!
//! ```ignore
//! use georelay::{geohash, location};
//!
//! let (lat, lng) = geohash::decode("ezs42")?;
//! assert_eq!(geohash::encode(lat, lng, 5), "ezs42");
//!
//! let set = location::parse_joined("9q8yyxk6p|ezs42")?;
//! assert!(set.is_geohash());
//! ```
//!
//! ## Message Format
//!
//! Overlay payloads are JSON objects tagged by `type`:
//!
//! - `elev.query`: `{id, dataset?, geohashes? | locations?}`
//! - `http.request`: `{id, method, url: "/v1/<dataset>?locations=..."}`
//! - `http.response`: `{id, status, headers, body_b64, duration_ms}`

pub mod config;
pub mod correlation;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod gate;
pub mod geohash;
pub mod location;
pub mod rate_limit;
pub mod relay;
pub mod repackage;
pub mod transport;
pub mod upstream;

// Re-export main types at crate root for convenience
pub use config::{OverlayConfig, RelayConfig};
pub use correlation::{CorrelationStore, ExchangeHandle};
pub use dispatcher::Dispatcher;
pub use envelope::{Envelope, ResponseEnvelope};
pub use error::{
    ConfigError, CorrelationError, ForwardError, LocationError, RateLimitExceeded, RelayError,
    Result, TransportError,
};
pub use gate::ConcurrencyGate;
pub use location::{LatLng, LocationSet};
pub use rate_limit::RateLimiter;
pub use relay::{ForwardReply, ForwardRequest, Health, Relay};
pub use transport::{Outbound, Sidecar, SidecarConfig, SidecarEvent};
pub use upstream::{ElevationClient, UpstreamResponse};
