//! GeoRelay Service - overlay relay for elevation queries.
//!
//! Starts the overlay sidecar, answers elevation queries arriving from peers
//! and serves a small HTTP front-end.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `FORWARD_BIND` | HTTP bind address | `0.0.0.0` |
//! | `FORWARD_PORT` | First HTTP port tried (100 more follow) | `9011` |
//! | `FORWARD_FORCE_LOCAL` | Keep a loopback bind | `0` |
//! | `FORWARD_CONCURRENCY` | Concurrent upstream calls | `16` |
//! | `FORWARD_RATE_RPS` | Requests per second per client | `20` |
//! | `FORWARD_RATE_BURST` | Burst size per client | `40` |
//! | `ELEV_BASE` | Elevation backend base URL | `http://localhost:5000` |
//! | `ELEV_DATASET` | Default dataset | `mapzen` |
//! | `ELEV_TIMEOUT_MS` | Backend timeout | `10000` |
//! | `NKN_IDENTIFIER` | Overlay identity | `forwarder` |
//! | `NKN_SEED` | Overlay seed | empty |
//! | `NKN_SUBCLIENTS` | Overlay subclients | `4` |
//! | `NKN_RPC_ADDRS` | Comma-separated bootstrap addresses | empty |
//! | `SIDECAR_RUNTIME` | Program running the sidecar | `node` |
//! | `SIDECAR_SCRIPT` | Sidecar script | `sidecar/sidecar.js` |
//! | `RUST_LOG` | Log filter | `georelay=info,...` |
//!
//! ## Endpoints
//!
//! - `POST /forward` - Send a query to a remote relay and wait for the reply
//! - `GET /v1/{dataset}?locations=...` - Query the local backend
//! - `GET /healthz` - Health check
//! - `GET /docs` - OpenAPI documentation (Swagger UI)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use georelay::{Relay, RelayConfig, Sidecar};
use georelay_service::{app, bind_first_free, drain_on, ApiDoc, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "georelay=info,georelay_service=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RelayConfig::from_env()?;

    let bind = config.effective_bind();
    if bind != config.bind {
        tracing::warn!(
            requested = %config.bind,
            bind = %bind,
            "Loopback bind widened to all interfaces; set FORWARD_FORCE_LOCAL=1 to keep it"
        );
    }
    let listener = bind_first_free(&bind, config.port_candidates()).await?;
    let addr = listener.local_addr()?;

    let (sidecar, events) = match Sidecar::start(&config.sidecar()) {
        Ok(started) => started,
        Err(e) => {
            tracing::error!(error = %e, "Cannot start overlay sidecar");
            return Err(e.into());
        }
    };
    let sidecar = Arc::new(sidecar);

    let relay = Relay::new(&config, sidecar.clone())?;
    let dispatcher = tokio::spawn(relay.dispatcher().run(events, sidecar.clone()));

    {
        let sidecar = Arc::clone(&sidecar);
        tokio::spawn(async move {
            if sidecar.wait_ready(Duration::from_secs(60)).await.is_none() {
                tracing::warn!("Overlay not ready after 60s, still waiting");
            }
        });
    }

    tracing::info!(
        addr = %addr,
        elev_base = %config.elev_base,
        dataset = %config.elev_dataset,
        http_workers = config.http_workers(),
        "Starting GeoRelay service"
    );

    let state = Arc::new(AppState::new(relay));
    let router = app(Arc::clone(&state), config.http_workers())
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()));

    tracing::info!("Listening on http://{}", addr);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(drain_on(Arc::clone(&state), shutdown_signal()))
    .await?;

    sidecar.close().await;
    if tokio::time::timeout(Duration::from_secs(2), dispatcher)
        .await
        .is_err()
    {
        tracing::warn!("Dispatcher did not stop after sidecar close");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
