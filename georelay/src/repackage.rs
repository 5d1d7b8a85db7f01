//! Rewrite upstream elevation results in terms of the caller's geohashes.
//!
//! The backend only knows coordinates. For a geohash-mode request the reply
//! body is rebuilt as `{"results":[{"geohash":..., "elevation":...}, ...]}`
//! in the order the tokens were supplied.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::json_headers;
use crate::location::{LatLng, LocationSet};
use crate::upstream::UpstreamResponse;

#[derive(Debug, Deserialize)]
struct UpstreamBody {
    #[serde(default)]
    results: Option<Vec<UpstreamResult>>,
}

#[derive(Debug, Deserialize)]
struct UpstreamResult {
    #[serde(default)]
    location: Option<UpstreamLocation>,
    #[serde(default)]
    elevation: Value,
}

#[derive(Debug, Serialize)]
struct GeohashBody<'a> {
    results: Vec<GeohashElevation<'a>>,
}

#[derive(Debug, Serialize)]
struct GeohashElevation<'a> {
    geohash: &'a str,
    elevation: Value,
}

#[derive(Debug, Default, Deserialize)]
struct UpstreamLocation {
    #[serde(default)]
    lat: f64,
    #[serde(default)]
    lng: f64,
}

/// Pick one elevation per requested point.
///
/// When the upstream returned exactly one result per point, results are
/// matched by position. Otherwise each point is looked up by its
/// six-decimal `"lat,lng"` key and missing points get `null`.
pub fn align_elevations(points: &[LatLng], body: &[u8]) -> Result<Vec<Value>, serde_json::Error> {
    let parsed: UpstreamBody = if body.iter().all(u8::is_ascii_whitespace) {
        UpstreamBody { results: None }
    } else {
        serde_json::from_slice(body)?
    };
    let results = parsed.results.unwrap_or_default();

    if results.len() == points.len() {
        return Ok(results.into_iter().map(|r| r.elevation).collect());
    }

    tracing::debug!(
        requested = points.len(),
        returned = results.len(),
        "Result count mismatch, joining on coordinates"
    );
    let by_key: std::collections::HashMap<String, Value> = results
        .into_iter()
        .map(|r| {
            let loc = r.location.unwrap_or_default();
            (LatLng::new(loc.lat, loc.lng).key(), r.elevation)
        })
        .collect();

    Ok(points
        .iter()
        .map(|p| by_key.get(&p.key()).cloned().unwrap_or(Value::Null))
        .collect())
}

/// Build the compact geohash-keyed body.
pub fn repackage_body(
    tokens: &[String],
    points: &[LatLng],
    body: &[u8],
) -> Result<Vec<u8>, serde_json::Error> {
    let elevations = align_elevations(points, body)?;
    let results = tokens
        .iter()
        .zip(elevations)
        .map(|(geohash, elevation)| GeohashElevation { geohash, elevation })
        .collect();
    serde_json::to_vec(&GeohashBody { results })
}

/// Apply geohash repackaging to an upstream response when it applies.
///
/// Lat/lng requests and non-2xx responses pass through untouched, so a
/// backend error keeps its status and message. A body that cannot be parsed
/// is logged and passed through as well.
pub fn repackage(set: &LocationSet, mut response: UpstreamResponse) -> UpstreamResponse {
    let LocationSet::Geohash { tokens, points } = set else {
        return response;
    };
    if !response.is_success() {
        return response;
    }

    match repackage_body(tokens, points, &response.body) {
        Ok(body) => {
            response.body = body;
            response.headers.extend(json_headers());
            response
        }
        Err(e) => {
            tracing::warn!(error = %e, "Repackaging failed, passing upstream body through");
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn geohash_set(tokens: &[&str]) -> LocationSet {
        LocationSet::from_geohashes(tokens.iter().map(|t| t.to_string()).collect()).unwrap()
    }

    fn ok_response(body: &str) -> UpstreamResponse {
        UpstreamResponse {
            status: 200,
            headers: BTreeMap::from([("content-type".to_string(), "text/plain".to_string())]),
            body: body.as_bytes().to_vec(),
            duration_ms: 12,
        }
    }

    fn body_json(resp: &UpstreamResponse) -> Value {
        serde_json::from_slice(&resp.body).unwrap()
    }

    #[test]
    fn test_positional_zip_when_counts_match() {
        let set = geohash_set(&["9q8yyxk6p", "ezs42"]);
        let resp = repackage(
            &set,
            ok_response(r#"{"results":[{"elevation":16.0},{"elevation":512.5}]}"#),
        );

        assert_eq!(
            body_json(&resp),
            json!({"results":[
                {"geohash":"9q8yyxk6p","elevation":16.0},
                {"geohash":"ezs42","elevation":512.5}
            ]})
        );
        assert_eq!(resp.headers["content-type"], "application/json");
        assert_eq!(resp.duration_ms, 12);
    }

    #[test]
    fn test_coordinate_join_when_counts_differ() {
        // Upstream dropped the second point and reordered nothing
        let set = geohash_set(&["9q8yyxk6p", "ezs42"]);
        let upstream = r#"{"results":[{"location":{"lat":37.789214,"lng":-122.40351},"elevation":16}]}"#;
        let resp = repackage(&set, ok_response(upstream));

        assert_eq!(
            body_json(&resp),
            json!({"results":[
                {"geohash":"9q8yyxk6p","elevation":16},
                {"geohash":"ezs42","elevation":null}
            ]})
        );
    }

    #[test]
    fn test_deduplicated_points_share_one_result() {
        // Both tokens decode to the same point; upstream answered it once
        let set = geohash_set(&["s0000", "s0000", "ezs42"]);
        let (lat, lng) = crate::geohash::decode("s0000").unwrap();
        let (elat, elng) = crate::geohash::decode("ezs42").unwrap();
        let upstream = json!({"results": [
            {"location": {"lat": elat, "lng": elng}, "elevation": 512},
            {"location": {"lat": lat, "lng": lng}, "elevation": 3.5}
        ]});
        let resp = repackage(&set, ok_response(&upstream.to_string()));

        assert_eq!(
            body_json(&resp),
            json!({"results":[
                {"geohash":"s0000","elevation":3.5},
                {"geohash":"s0000","elevation":3.5},
                {"geohash":"ezs42","elevation":512}
            ]})
        );
    }

    #[test]
    fn test_missing_results_field_yields_nulls() {
        let set = geohash_set(&["ezs42"]);
        let resp = repackage(&set, ok_response("{}"));
        assert_eq!(
            body_json(&resp),
            json!({"results":[{"geohash":"ezs42","elevation":null}]})
        );
    }

    #[test]
    fn test_malformed_body_passes_through() {
        let set = geohash_set(&["ezs42"]);
        let resp = repackage(&set, ok_response("<html>oops</html>"));
        assert_eq!(resp.body, b"<html>oops</html>");
        assert_eq!(resp.headers["content-type"], "text/plain");
    }

    #[test]
    fn test_latlng_mode_is_byte_identical() {
        let set = LocationSet::LatLng(vec![LatLng::new(1.0, 2.0)]);
        let raw = r#"{"results": [ {"elevation": 3} ] }"#;
        let resp = repackage(&set, ok_response(raw));
        assert_eq!(resp.body, raw.as_bytes());
    }

    #[test]
    fn test_error_status_passes_through() {
        let set = geohash_set(&["ezs42"]);
        let failure = UpstreamResponse::failure("upstream failure: refused");
        let resp = repackage(&set, failure.clone());
        assert_eq!(resp, failure);
    }

    #[test]
    fn test_backend_error_keeps_message() {
        let set = geohash_set(&["ezs42", "s0000"]);
        let raw = r#"{"error":"Unknown dataset 'moon'"}"#;
        let backend_error = UpstreamResponse {
            status: 400,
            ..ok_response(raw)
        };

        let resp = repackage(&set, backend_error);

        assert_eq!(resp.status, 400);
        assert_eq!(resp.body, raw.as_bytes());
        assert_eq!(resp.headers["content-type"], "text/plain");
        assert!(body_json(&resp).get("results").is_none());
    }

    #[test]
    fn test_output_is_compact() {
        let points = [LatLng::new(0.0, 0.0)];
        let body = repackage_body(
            &["s0000".to_string()],
            &points,
            br#"{"results":[{"elevation":1}]}"#,
        )
        .unwrap();
        assert_eq!(
            String::from_utf8(body).unwrap(),
            r#"{"results":[{"geohash":"s0000","elevation":1}]}"#
        );
    }
}
