//! Location batches and their normalization.
//!
//! A request names its points either as geohash tokens or as explicit
//! latitude/longitude pairs. [`normalize`] settles the mode once per request
//! and produces a [`LocationSet`] whose order matches the eventual results.

use serde::{Deserialize, Serialize};

use crate::error::LocationError;
use crate::geohash;

/// A point in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// `"lat,lng"` with six decimals, as sent upstream and used as join key.
    pub fn key(&self) -> String {
        format!("{:.6},{:.6}", self.lat, self.lng)
    }
}

/// The `geohashes` field: a list or a `|`-delimited string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GeohashInput {
    Joined(String),
    List(Vec<String>),
}

impl GeohashInput {
    /// Trimmed, non-empty tokens in order.
    pub fn tokens(&self) -> Vec<String> {
        match self {
            GeohashInput::Joined(s) => split_joined(s),
            GeohashInput::List(list) => trimmed(list),
        }
    }
}

/// The `locations` field.
///
/// Either explicit `{lat, lng}` objects, a list of free-form tokens, or a
/// `|`-delimited string of tokens. Free-form tokens may be geohashes or
/// `"lat,lng"` pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LocationInput {
    Joined(String),
    Points(Vec<LatLng>),
    Tokens(Vec<String>),
}

/// A normalized batch of locations.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationSet {
    /// Geohash tokens and their decoded centroids, index-aligned.
    Geohash {
        tokens: Vec<String>,
        points: Vec<LatLng>,
    },
    /// Explicit coordinates.
    LatLng(Vec<LatLng>),
}

impl LocationSet {
    /// Decode a list of geohash tokens.
    pub fn from_geohashes(tokens: Vec<String>) -> Result<Self, LocationError> {
        let points = tokens
            .iter()
            .map(|t| geohash::decode(t).map(|(lat, lng)| LatLng::new(lat, lng)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(LocationSet::Geohash { tokens, points })
    }

    /// The coordinates sent upstream.
    pub fn points(&self) -> &[LatLng] {
        match self {
            LocationSet::Geohash { points, .. } => points,
            LocationSet::LatLng(points) => points,
        }
    }

    pub fn is_geohash(&self) -> bool {
        matches!(self, LocationSet::Geohash { .. })
    }

    pub fn len(&self) -> usize {
        self.points().len()
    }

    pub fn is_empty(&self) -> bool {
        self.points().is_empty()
    }
}

/// Normalize a request's location fields.
///
/// A non-empty `geohashes` field wins over `locations`. Free-form tokens are
/// read as geohashes only if every one of them looks like a geohash;
/// otherwise each must be a `"lat,lng"` pair.
///
/// # Errors
///
/// - [`LocationError::InvalidToken`] for a geohash with a bad character
/// - [`LocationError::MalformedCoordinate`] for a token that is not `lat,lng`
/// - [`LocationError::Empty`] when no points were supplied
pub fn normalize(
    geohashes: Option<&GeohashInput>,
    locations: Option<&LocationInput>,
) -> Result<LocationSet, LocationError> {
    if let Some(input) = geohashes {
        let tokens = input.tokens();
        if !tokens.is_empty() {
            return LocationSet::from_geohashes(tokens);
        }
    }

    match locations {
        Some(LocationInput::Points(points)) if !points.is_empty() => {
            Ok(LocationSet::LatLng(points.clone()))
        }
        Some(LocationInput::Tokens(list)) => classify_tokens(trimmed(list)),
        Some(LocationInput::Joined(s)) => classify_tokens(split_joined(s)),
        _ => Err(LocationError::Empty),
    }
}

/// Normalize a `|`-delimited `locations` query value.
pub fn parse_joined(value: &str) -> Result<LocationSet, LocationError> {
    classify_tokens(split_joined(value))
}

fn classify_tokens(tokens: Vec<String>) -> Result<LocationSet, LocationError> {
    if tokens.is_empty() {
        return Err(LocationError::Empty);
    }
    if tokens.iter().all(|t| geohash::looks_like_geohash(t)) {
        return LocationSet::from_geohashes(tokens);
    }
    tokens
        .iter()
        .map(|t| parse_pair(t))
        .collect::<Result<Vec<_>, _>>()
        .map(LocationSet::LatLng)
}

fn parse_pair(token: &str) -> Result<LatLng, LocationError> {
    let malformed = || LocationError::MalformedCoordinate {
        token: token.to_string(),
    };
    let (lat, lng) = token.split_once(',').ok_or_else(malformed)?;
    let lat: f64 = lat.trim().parse().map_err(|_| malformed())?;
    let lng: f64 = lng.trim().parse().map_err(|_| malformed())?;
    Ok(LatLng::new(lat, lng))
}

fn split_joined(s: &str) -> Vec<String> {
    s.split('|')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn trimmed(list: &[String]) -> Vec<String> {
    list.iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_json(json: &str) -> Result<LocationSet, LocationError> {
        #[derive(Deserialize)]
        struct Fields {
            geohashes: Option<GeohashInput>,
            locations: Option<LocationInput>,
        }
        let fields: Fields = serde_json::from_str(json).unwrap();
        normalize(fields.geohashes.as_ref(), fields.locations.as_ref())
    }

    #[test]
    fn test_explicit_geohash_list() {
        let set = from_json(r#"{"geohashes": ["9q8yyxk6p", " ezs42 "]}"#).unwrap();
        match set {
            LocationSet::Geohash { tokens, points } => {
                assert_eq!(tokens, vec!["9q8yyxk6p", "ezs42"]);
                assert_eq!(points.len(), 2);
                assert_eq!(points[1], LatLng::new(42.60498046875, -5.60302734375));
            }
            other => panic!("expected geohash mode, got {other:?}"),
        }
    }

    #[test]
    fn test_explicit_geohash_pipe_string() {
        let set = from_json(r#"{"geohashes": "9q8yyxk6p||ezs42"}"#).unwrap();
        assert!(set.is_geohash());
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_geohashes_win_over_locations() {
        let set = from_json(
            r#"{"geohashes": ["ezs42"], "locations": [{"lat": 1.0, "lng": 2.0}]}"#,
        )
        .unwrap();
        assert!(set.is_geohash());
    }

    #[test]
    fn test_empty_geohashes_fall_back_to_locations() {
        let set =
            from_json(r#"{"geohashes": [], "locations": [{"lat": 1.0, "lng": 2.0}]}"#).unwrap();
        assert_eq!(set, LocationSet::LatLng(vec![LatLng::new(1.0, 2.0)]));
    }

    #[test]
    fn test_latlng_objects() {
        let set = from_json(r#"{"locations": [{"lat": 37.77, "lng": -122.42}]}"#).unwrap();
        assert!(!set.is_geohash());
        assert_eq!(set.points(), &[LatLng::new(37.77, -122.42)]);
    }

    #[test]
    fn test_ambiguous_tokens_all_geohash() {
        let set = from_json(r#"{"locations": ["9q8yyxk6p", "ezs42"]}"#).unwrap();
        assert!(set.is_geohash());
    }

    #[test]
    fn test_one_coordinate_token_forces_latlng_mode() {
        let err = from_json(r#"{"locations": ["9q8yyxk6p", "37.77,-122.42"]}"#).unwrap_err();
        assert_eq!(
            err,
            LocationError::MalformedCoordinate {
                token: "9q8yyxk6p".to_string()
            }
        );

        let set = from_json(r#"{"locations": ["37.77,-122.42", "1.5, 2.5"]}"#).unwrap();
        assert_eq!(
            set,
            LocationSet::LatLng(vec![LatLng::new(37.77, -122.42), LatLng::new(1.5, 2.5)])
        );
    }

    #[test]
    fn test_pipe_string_locations() {
        let set = from_json(r#"{"locations": "37.77,-122.42|36.1,-115.2"}"#).unwrap();
        assert_eq!(set.len(), 2);
        assert!(!set.is_geohash());

        let set = from_json(r#"{"locations": "9q8yyxk6p|ezs42"}"#).unwrap();
        assert!(set.is_geohash());
    }

    #[test]
    fn test_geohash_like_token_with_bad_char_is_not_geohash() {
        // 'a' disqualifies the token, so the batch is parsed as coordinates
        let err = from_json(r#"{"locations": ["9q8a"]}"#).unwrap_err();
        assert!(matches!(err, LocationError::MalformedCoordinate { .. }));

        let err = from_json(r#"{"geohashes": ["9q8a"]}"#).unwrap_err();
        assert!(matches!(err, LocationError::InvalidToken { ch: 'a', .. }));
    }

    #[test]
    fn test_malformed_coordinate_numbers() {
        let err = from_json(r#"{"locations": "abc,def"}"#).unwrap_err();
        assert!(matches!(err, LocationError::MalformedCoordinate { .. }));
    }

    #[test]
    fn test_nothing_provided() {
        assert_eq!(from_json("{}").unwrap_err(), LocationError::Empty);
        assert_eq!(
            from_json(r#"{"locations": []}"#).unwrap_err(),
            LocationError::Empty
        );
        assert_eq!(
            from_json(r#"{"locations": " | "}"#).unwrap_err(),
            LocationError::Empty
        );
    }

    #[test]
    fn test_parse_joined() {
        assert!(parse_joined("9q8yyxk6p").unwrap().is_geohash());
        assert_eq!(parse_joined("1,2|3,4").unwrap().len(), 2);
    }

    #[test]
    fn test_key_format() {
        assert_eq!(LatLng::new(37.77, -122.42).key(), "37.770000,-122.420000");
        assert_eq!(LatLng::new(1.0000004, 2.0).key(), "1.000000,2.000000");
    }
}
