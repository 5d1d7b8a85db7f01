//! Integration tests for the HTTP API.

use std::collections::HashMap;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{Path, Query},
    http::{HeaderName, HeaderValue, StatusCode},
    routing::get,
    Json, Router,
};
use axum_test::TestServer;
use georelay::envelope::encode_b64;
use georelay::{Dispatcher, Outbound, Relay, RelayConfig, TransportError};
use georelay_service::{app, drain_on, AppState};
use parking_lot::Mutex;
use serde_json::{json, Value};

/// Overlay stand-in: every query sent to a peer is answered by the relay's
/// own dispatcher, whose reply comes back through the same path.
#[derive(Default)]
struct Loopback {
    dispatcher: Mutex<Option<Arc<Dispatcher>>>,
}

#[async_trait]
impl Outbound for Loopback {
    async fn send(&self, dest: &str, payload: &[u8], _id: &str) -> Result<(), TransportError> {
        match dest {
            "unreachable" => Err(TransportError::Unavailable),
            "silent" => Ok(()),
            _ => {
                let dispatcher = self.dispatcher.lock().clone();
                if let Some(dispatcher) = dispatcher {
                    dispatcher.handle("peer.test", &encode_b64(payload), self).await;
                }
                Ok(())
            }
        }
    }

    fn address(&self) -> Option<String> {
        Some("relay.test".to_string())
    }
}

/// Elevation backend answering every point with `lat + lng`.
async fn spawn_backend() -> String {
    let app = Router::new().route(
        "/v1/:dataset",
        get(
            |Path(dataset): Path<String>, Query(q): Query<HashMap<String, String>>| async move {
                let results: Vec<_> = q
                    .get("locations")
                    .map(String::as_str)
                    .unwrap_or_default()
                    .split('|')
                    .filter_map(|p| p.split_once(','))
                    .map(|(lat, lng)| {
                        let lat: f64 = lat.parse().unwrap();
                        let lng: f64 = lng.parse().unwrap();
                        json!({"location": {"lat": lat, "lng": lng}, "elevation": lat + lng})
                    })
                    .collect();
                Json(json!({"dataset": dataset, "results": results}))
            },
        ),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Elevation backend that answers each distinct point once, elevation 7.
async fn spawn_dedup_backend() -> String {
    let app = Router::new().route(
        "/v1/:dataset",
        get(|Query(q): Query<HashMap<String, String>>| async move {
            let mut seen = Vec::new();
            for point in q.get("locations").map(String::as_str).unwrap_or_default().split('|') {
                if !seen.contains(&point) {
                    seen.push(point);
                }
            }
            let results: Vec<_> = seen
                .iter()
                .filter_map(|p| p.split_once(','))
                .map(|(lat, lng)| {
                    let lat: f64 = lat.parse().unwrap();
                    let lng: f64 = lng.parse().unwrap();
                    json!({"location": {"lat": lat, "lng": lng}, "elevation": 7})
                })
                .collect();
            Json(json!({"results": results}))
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn server_with(config: RelayConfig, forward_timeout: Option<Duration>) -> TestServer {
    server_and_state(config, forward_timeout).0
}

fn server_and_state(
    config: RelayConfig,
    forward_timeout: Option<Duration>,
) -> (TestServer, Arc<AppState>) {
    let outbound = Arc::new(Loopback::default());
    let mut relay = Relay::new(&config, outbound.clone()).unwrap();
    if let Some(timeout) = forward_timeout {
        relay = relay.with_forward_timeout(timeout);
    }
    *outbound.dispatcher.lock() = Some(relay.dispatcher());

    let state = Arc::new(AppState::new(relay));
    let server = TestServer::new(app(Arc::clone(&state), 8)).unwrap();
    (server, state)
}

async fn create_test_server() -> TestServer {
    let base = spawn_backend().await;
    server_with(
        RelayConfig::default()
            .with_elev_base(base)
            .with_elev_timeout(Duration::from_secs(5)),
        None,
    )
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = create_test_server().await;

    let response = server.get("/healthz").await;
    response.assert_status_ok();

    let json: Value = response.json();
    assert_eq!(json["ok"], true);
    assert_eq!(json["ready"], true);
    assert_eq!(json["addr"], "relay.test");
    assert_eq!(json["dataset"], "mapzen");
    assert_eq!(json["pending"], 0);
    assert_eq!(json["in_flight"], 0);
    assert_eq!(json["peak_in_flight"], 0);
    // The health request itself passed the rate guard
    assert_eq!(json["clients"], 1);
    assert!(json["elev_base"].as_str().unwrap().starts_with("http://127.0.0.1:"));
    assert!(json["ts"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn test_forward_missing_dest() {
    let server = create_test_server().await;

    let response = server
        .post("/forward")
        .json(&json!({"geohashes": ["ezs42"]}))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);

    let json: Value = response.json();
    assert_eq!(json["error"], "dest required");
}

#[tokio::test]
async fn test_forward_unreadable_body() {
    let server = create_test_server().await;

    let response = server.post("/forward").text("{not json").await;
    response.assert_status(StatusCode::BAD_REQUEST);

    let json: Value = response.json();
    assert_eq!(json["error"], "dest required");
}

#[tokio::test]
async fn test_forward_bad_geohash() {
    let server = create_test_server().await;

    let response = server
        .post("/forward")
        .json(&json!({"dest": "peer.a", "geohashes": "9q8a"}))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);

    let json: Value = response.json();
    assert!(json["error"].as_str().unwrap().starts_with("bad payload:"));
}

#[tokio::test]
async fn test_forward_no_locations() {
    let server = create_test_server().await;

    let response = server
        .post("/forward")
        .json(&json!({"dest": "peer.a"}))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);

    let json: Value = response.json();
    assert_eq!(
        json["error"],
        "bad payload: no locations/geohashes provided"
    );
}

#[tokio::test]
async fn test_forward_geohash_roundtrip() {
    let server = create_test_server().await;

    let response = server
        .post("/forward")
        .json(&json!({"dest": "peer.a", "geohashes": "s0000|s0000"}))
        .await;
    response.assert_status_ok();

    let json: Value = response.json();
    assert_eq!(json["ok"], true);
    assert_eq!(json["status"], 200);
    assert_eq!(json["id"].as_str().unwrap().len(), 32);
    assert_eq!(json["headers"]["content-type"], "application/json");

    let body: Value = serde_json::from_str(json["body_utf8"].as_str().unwrap()).unwrap();
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    for result in results {
        assert_eq!(result["geohash"], "s0000");
        let elevation = result["elevation"].as_f64().unwrap();
        assert!(elevation > 0.0 && elevation < 0.1, "elevation {elevation}");
    }
}

#[tokio::test]
async fn test_forward_latlng_passthrough() {
    let server = create_test_server().await;

    let response = server
        .post("/forward")
        .json(&json!({
            "dest": "peer.a",
            "dataset": "srtm30m",
            "locations": [{"lat": 10.0, "lng": 20.0}]
        }))
        .await;
    response.assert_status_ok();

    let json: Value = response.json();
    let body: Value = serde_json::from_str(json["body_utf8"].as_str().unwrap()).unwrap();
    assert_eq!(body["dataset"], "srtm30m");
    assert_eq!(body["results"][0]["elevation"], 30.0);
    assert_eq!(body["results"][0]["location"]["lat"], 10.0);
}

#[tokio::test]
async fn test_forward_send_failure() {
    let server = create_test_server().await;

    let response = server
        .post("/forward")
        .json(&json!({"dest": "unreachable", "geohashes": ["ezs42"]}))
        .await;
    response.assert_status(StatusCode::BAD_GATEWAY);

    let json: Value = response.json();
    assert_eq!(json["error"], "send failed: sidecar not running");
}

#[tokio::test]
async fn test_forward_timeout() {
    let base = spawn_backend().await;
    let server = server_with(
        RelayConfig::default().with_elev_base(base),
        Some(Duration::from_millis(100)),
    );

    let response = server
        .post("/forward")
        .json(&json!({"dest": "silent", "geohashes": ["ezs42"]}))
        .await;
    response.assert_status(StatusCode::GATEWAY_TIMEOUT);

    let json: Value = response.json();
    assert_eq!(json["error"], "dm response timeout");

    // The abandoned exchange is gone
    let health: Value = server.get("/healthz").await.json();
    assert_eq!(health["pending"], 0);
}

#[tokio::test]
async fn test_shutdown_releases_pending_forward() {
    let base = spawn_backend().await;
    let (server, state) = server_and_state(
        RelayConfig::default().with_elev_base(base),
        Some(Duration::from_secs(30)),
    );

    let (signal_tx, signal_rx) = tokio::sync::oneshot::channel::<()>();
    let drained = tokio::spawn(drain_on(Arc::clone(&state), async move {
        let _ = signal_rx.await;
    }));

    let request = server
        .post("/forward")
        .json(&json!({"dest": "silent", "geohashes": ["ezs42"]}))
        .into_future();
    let trigger = async {
        for _ in 0..200 {
            if state.relay.exchanges().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state.relay.exchanges().len(), 1);
        signal_tx.send(()).unwrap();
    };

    let (response, ()) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(request, trigger)
    })
    .await
    .expect("pending forward was not released");

    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    let json: Value = response.json();
    assert_eq!(json["error"], "relay shutting down");

    drained.await.unwrap();
    assert!(state.relay.exchanges().is_empty());
}

#[tokio::test]
async fn test_rate_limit() {
    let base = spawn_backend().await;
    let server = server_with(
        RelayConfig::default()
            .with_elev_base(base)
            .with_rate(1.0, 2.0),
        None,
    );

    server.get("/healthz").await.assert_status_ok();
    server.get("/healthz").await.assert_status_ok();

    let response = server.get("/healthz").await;
    response.assert_status(StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.header("retry-after"), "1");

    let json: Value = response.json();
    assert_eq!(json, json!({"error": "rate limit"}));
}

#[tokio::test]
async fn test_rate_limit_per_client() {
    let base = spawn_backend().await;
    let server = server_with(
        RelayConfig::default()
            .with_elev_base(base)
            .with_rate(1.0, 1.0),
        None,
    );
    let forwarded = HeaderName::from_static("x-forwarded-for");

    server
        .get("/healthz")
        .add_header(forwarded.clone(), HeaderValue::from_static("203.0.113.1"))
        .await
        .assert_status_ok();
    server
        .get("/healthz")
        .add_header(forwarded.clone(), HeaderValue::from_static("203.0.113.1, 10.0.0.1"))
        .await
        .assert_status(StatusCode::TOO_MANY_REQUESTS);
    server
        .get("/healthz")
        .add_header(forwarded, HeaderValue::from_static("203.0.113.2"))
        .await
        .assert_status_ok();
}

#[tokio::test]
async fn test_local_query_geohash() {
    let server = create_test_server().await;

    let response = server
        .get("/v1/mapzen")
        .add_query_param("locations", "s0000|ezs42")
        .await;
    response.assert_status_ok();
    assert_eq!(response.header("content-type"), "application/json");

    let json: Value = response.json();
    let results = json["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["geohash"], "s0000");
    assert_eq!(results[1]["geohash"], "ezs42");
    assert!(results[1]["elevation"].as_f64().unwrap() < 40.0);
}

#[tokio::test]
async fn test_local_query_repeated_geohash_deduplicated_upstream() {
    let base = spawn_dedup_backend().await;
    let server = server_with(RelayConfig::default().with_elev_base(base), None);

    let response = server
        .get("/v1/mapzen")
        .add_query_param("locations", "s0000|s0000")
        .await;
    response.assert_status_ok();

    let json: Value = response.json();
    assert_eq!(
        json,
        json!({"results": [
            {"geohash": "s0000", "elevation": 7},
            {"geohash": "s0000", "elevation": 7}
        ]})
    );
}

#[tokio::test]
async fn test_health_reports_upstream_peak() {
    let server = create_test_server().await;

    server
        .get("/v1/mapzen")
        .add_query_param("locations", "ezs42")
        .await
        .assert_status_ok();

    let json: Value = server.get("/healthz").await.json();
    assert_eq!(json["in_flight"], 0);
    assert_eq!(json["peak_in_flight"], 1);
}

#[tokio::test]
async fn test_local_query_latlng() {
    let server = create_test_server().await;

    let response = server
        .get("/v1/srtm90m")
        .add_query_param("locations", "1.5,2.5")
        .await;
    response.assert_status_ok();

    let json: Value = response.json();
    assert_eq!(json["dataset"], "srtm90m");
    assert_eq!(json["results"][0]["elevation"], 4.0);
}

#[tokio::test]
async fn test_local_query_missing_locations() {
    let server = create_test_server().await;

    let response = server.get("/v1/mapzen").await;
    response.assert_status(StatusCode::BAD_REQUEST);

    let json: Value = response.json();
    assert_eq!(json["error"], "missing locations");
}

#[tokio::test]
async fn test_local_query_bad_locations() {
    let server = create_test_server().await;

    let response = server
        .get("/v1/mapzen")
        .add_query_param("locations", "abc,def")
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);

    let json: Value = response.json();
    assert!(json["error"].as_str().unwrap().starts_with("bad locations:"));
}

#[tokio::test]
async fn test_local_query_backend_down() {
    let server = server_with(
        RelayConfig::default()
            .with_elev_base("http://127.0.0.1:9")
            .with_elev_timeout(Duration::from_secs(2)),
        None,
    );

    let response = server
        .get("/v1/mapzen")
        .add_query_param("locations", "ezs42")
        .await;
    response.assert_status(StatusCode::BAD_GATEWAY);

    let json: Value = response.json();
    assert!(json["error"]
        .as_str()
        .unwrap()
        .starts_with("upstream failure:"));
}
