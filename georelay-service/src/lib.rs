//! GeoRelay Service Library
//!
//! HTTP handlers, router and OpenAPI description for the relay front-end.
//! This library is used by both the georelay-service binary and integration
//! tests.

pub mod handlers;

use std::future::Future;
use std::io;
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use georelay::Relay;
use tokio::net::TcpListener;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;

/// Application state shared across handlers.
pub struct AppState {
    /// The relay behind every route.
    pub relay: Relay,
}

impl AppState {
    pub fn new(relay: Relay) -> Self {
        Self { relay }
    }
}

/// OpenAPI documentation for the relay front-end.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "GeoRelay",
        version = "0.1.0",
        description = "Geohash-aware relay between an overlay network and a local elevation backend.",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    paths(handlers::health_check, handlers::forward, handlers::local_query),
    components(schemas(
        handlers::ForwardBody,
        handlers::ForwardResponse,
        handlers::ErrorResponse,
        handlers::HealthResponse,
    )),
    tags(
        (name = "relay", description = "Forwarding to remote relays"),
        (name = "elevation", description = "Local elevation queries"),
        (name = "system", description = "System and health endpoints")
    )
)]
pub struct ApiDoc;

/// Build the router.
///
/// Every route passes the rate guard, and at most `http_workers` requests
/// are handled at once.
pub fn app(state: Arc<AppState>, http_workers: usize) -> Router {
    Router::new()
        .route("/healthz", get(handlers::health_check))
        .route("/forward", post(handlers::forward))
        .route("/v1/:dataset", get(handlers::local_query))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            handlers::rate_guard,
        ))
        .layer(GlobalConcurrencyLimitLayer::new(http_workers.max(1)))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Bind the first free port among `ports` on `host`.
///
/// # Errors
///
/// Returns the last bind error when every port is taken.
pub async fn bind_first_free(
    host: &str,
    ports: impl IntoIterator<Item = u16>,
) -> io::Result<TcpListener> {
    let mut last_error = None;
    for port in ports {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                tracing::debug!(host = host, port = port, error = %e, "Port unavailable");
                last_error = Some(e);
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "no port to bind")))
}

/// Wait for `signal`, then stop upstream calls and fail every pending
/// forward with 503 so graceful shutdown does not wait on them.
pub async fn drain_on<F>(state: Arc<AppState>, signal: F)
where
    F: Future<Output = ()>,
{
    signal.await;
    let drained = state.relay.shutdown();
    tracing::info!(drained = drained, "Pending forwards released");
}

// Re-export commonly used types for convenience
pub use handlers::{ErrorResponse, ForwardBody, ForwardResponse, HealthResponse};
