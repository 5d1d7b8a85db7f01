//! Error types for the GeoRelay library.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while turning a request's location fields into a
/// [`LocationSet`](crate::location::LocationSet).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LocationError {
    /// A geohash token contains a character outside the base-32 alphabet.
    #[error("invalid geohash char {ch:?} in {token:?}")]
    InvalidToken { token: String, ch: char },

    /// A `lat,lng` token has no comma or a non-numeric component.
    #[error("malformed coordinate {token:?} (expected \"lat,lng\")")]
    MalformedCoordinate { token: String },

    /// Neither `geohashes` nor `locations` carried anything usable.
    #[error("no locations/geohashes provided")]
    Empty,
}

/// Errors from the sidecar transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The program that runs the sidecar could not be found on this host.
    #[error("sidecar runtime {program:?} is not available on this host")]
    RuntimeUnavailable { program: String },

    /// The sidecar process failed to start for another reason.
    #[error("failed to spawn sidecar: {0}")]
    Spawn(#[source] std::io::Error),

    /// The sidecar is not running or its stdin has been closed.
    #[error("sidecar not running")]
    Unavailable,

    /// Writing a command line to the sidecar failed.
    #[error("sidecar write failed: {0}")]
    Io(#[from] std::io::Error),

    /// A command could not be serialized.
    #[error("failed to encode sidecar command: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors from the correlation store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    /// An exchange with this id is already pending.
    #[error("exchange {id} is already pending")]
    DuplicateId { id: String },

    /// No reply arrived before the exchange deadline.
    #[error("no reply for exchange {id} before its deadline")]
    Timeout { id: String },

    /// The exchange was dropped by a store shutdown before any reply.
    #[error("exchange {id} was closed before a reply arrived")]
    Closed { id: String },
}

/// A client exhausted its token bucket.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
#[error("rate limit exceeded, retry after {retry_after:?}")]
pub struct RateLimitExceeded {
    /// Time until one more token is available.
    pub retry_after: Duration,
}

impl RateLimitExceeded {
    /// Retry hint rounded up to whole seconds, never less than one.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs_f64().ceil() as u64;
        secs.max(1)
    }
}

/// Errors returned by the forward operation.
#[derive(Error, Debug)]
pub enum ForwardError {
    /// The request named no destination peer.
    #[error("dest required")]
    MissingDest,

    /// The request's location fields could not be normalized.
    #[error("bad payload: {0}")]
    BadPayload(#[from] LocationError),

    /// The query could not be handed to the sidecar.
    #[error("send failed: {0}")]
    Send(#[from] TransportError),

    /// Registration or waiting on the exchange failed.
    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    /// The outgoing query could not be serialized.
    #[error("failed to encode query: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Invalid configuration values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable holds a value that cannot be parsed.
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Top-level error for the library.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error(transparent)]
    Location(#[from] LocationError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),

    #[error(transparent)]
    Forward(#[from] ForwardError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The upstream HTTP client could not be constructed.
    #[error("failed to build upstream client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Result type alias using [`RelayError`].
pub type Result<T> = std::result::Result<T, RelayError>;
