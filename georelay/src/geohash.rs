//! Geohash codec.
//!
//! A geohash is a base-32 string in which every character carries five bits of
//! an interleaved longitude/latitude binary search. The first bit halves the
//! longitude range, the second the latitude range, and so on. Longer tokens
//! denote smaller cells.
//!
//! # Example
//!
//! ```
//! use georelay::geohash;
//!
//! let (lat, lng) = geohash::decode("ezs42").unwrap();
//! assert!((lat - 42.605).abs() < 0.001);
//! assert!((lng + 5.603).abs() < 0.001);
//!
//! assert!(geohash::looks_like_geohash("9q8yyxk6p"));
//! assert!(!geohash::looks_like_geohash("37.77,-122.42"));
//! ```

use crate::error::LocationError;

/// The 32-symbol geohash alphabet (`a`, `i`, `l` and `o` are excluded).
pub const ALPHABET: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Bit masks applied to each character value, most significant first.
const BIT_MASKS: [u8; 5] = [16, 8, 4, 2, 1];

/// Value of a geohash character, or `None` if it is outside the alphabet.
///
/// Matching is ASCII case-insensitive.
fn char_value(ch: char) -> Option<u8> {
    let lower = ch.to_ascii_lowercase();
    ALPHABET
        .iter()
        .position(|&b| b as char == lower)
        .map(|i| i as u8)
}

/// Bounding box of a geohash cell, in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    fn world() -> Self {
        Self {
            min_lat: -90.0,
            max_lat: 90.0,
            min_lng: -180.0,
            max_lng: 180.0,
        }
    }

    /// Centroid of the cell as `(lat, lng)`.
    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }

    /// Whether the point lies inside the cell (edges inclusive).
    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        (self.min_lat..=self.max_lat).contains(&lat) && (self.min_lng..=self.max_lng).contains(&lng)
    }
}

/// Compute the bounding box of a geohash token.
///
/// Surrounding whitespace is ignored. An empty token yields the whole world.
///
/// # Errors
///
/// Returns [`LocationError::InvalidToken`] if any character is outside
/// [`ALPHABET`].
pub fn bounds(token: &str) -> Result<Bounds, LocationError> {
    let mut bounds = Bounds::world();
    let mut is_lng = true;

    for ch in token.trim().chars() {
        let value = char_value(ch).ok_or_else(|| LocationError::InvalidToken {
            token: token.to_string(),
            ch,
        })?;

        for mask in BIT_MASKS {
            if is_lng {
                let mid = (bounds.min_lng + bounds.max_lng) / 2.0;
                if value & mask != 0 {
                    bounds.min_lng = mid;
                } else {
                    bounds.max_lng = mid;
                }
            } else {
                let mid = (bounds.min_lat + bounds.max_lat) / 2.0;
                if value & mask != 0 {
                    bounds.min_lat = mid;
                } else {
                    bounds.max_lat = mid;
                }
            }
            is_lng = !is_lng;
        }
    }

    Ok(bounds)
}

/// Decode a geohash token to the `(lat, lng)` centroid of its cell.
///
/// # Errors
///
/// Returns [`LocationError::InvalidToken`] if any character is outside
/// [`ALPHABET`].
pub fn decode(token: &str) -> Result<(f64, f64), LocationError> {
    bounds(token).map(|b| b.center())
}

/// Encode a coordinate as a geohash with `precision` characters.
///
/// Coordinates are clamped to the valid latitude/longitude ranges.
pub fn encode(lat: f64, lng: f64, precision: usize) -> String {
    let lat = lat.clamp(-90.0, 90.0);
    let lng = lng.clamp(-180.0, 180.0);

    let mut bounds = Bounds::world();
    let mut out = String::with_capacity(precision);
    let mut is_lng = true;
    let mut bit = 0;
    let mut value = 0u8;

    while out.len() < precision {
        if is_lng {
            let mid = (bounds.min_lng + bounds.max_lng) / 2.0;
            if lng >= mid {
                value |= BIT_MASKS[bit];
                bounds.min_lng = mid;
            } else {
                bounds.max_lng = mid;
            }
        } else {
            let mid = (bounds.min_lat + bounds.max_lat) / 2.0;
            if lat >= mid {
                value |= BIT_MASKS[bit];
                bounds.min_lat = mid;
            } else {
                bounds.max_lat = mid;
            }
        }
        is_lng = !is_lng;

        if bit < 4 {
            bit += 1;
        } else {
            out.push(ALPHABET[value as usize] as char);
            bit = 0;
            value = 0;
        }
    }

    out
}

/// Whether a free-form token should be read as a geohash.
///
/// True iff the trimmed token is non-empty, contains no comma or whitespace,
/// and every character is in the alphabet (case-insensitive).
pub fn looks_like_geohash(token: &str) -> bool {
    let token = token.trim();
    if token.is_empty() {
        return false;
    }
    token
        .chars()
        .all(|ch| ch != ',' && !ch.is_whitespace() && char_value(ch).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_known_tokens() {
        let (lat, lng) = decode("ezs42").unwrap();
        assert_eq!(lat, 42.60498046875);
        assert_eq!(lng, -5.60302734375);

        let (lat, lng) = decode("s").unwrap();
        assert_eq!((lat, lng), (22.5, 22.5));
    }

    #[test]
    fn test_decode_uses_six_decimal_centroid() {
        let (lat, lng) = decode("9q8yyxk6p").unwrap();
        assert_eq!(format!("{:.6},{:.6}", lat, lng), "37.789214,-122.403510");
    }

    #[test]
    fn test_decode_invalid_char() {
        let err = decode("9q8a").unwrap_err();
        assert_eq!(
            err,
            LocationError::InvalidToken {
                token: "9q8a".to_string(),
                ch: 'a'
            }
        );
        assert!(decode("u4p,").is_err());
    }

    #[test]
    fn test_decode_is_case_insensitive() {
        assert_eq!(decode("EZS42").unwrap(), decode("ezs42").unwrap());
        assert_eq!(decode("  ezs42 ").unwrap(), decode("ezs42").unwrap());
    }

    #[test]
    fn test_encode_known_point() {
        assert_eq!(encode(57.64911, 10.40744, 11), "u4pruydqqvj");
        assert_eq!(encode(42.605, -5.603, 5), "ezs42");
    }

    #[test]
    fn test_decoded_point_lies_inside_cell() {
        let points = [
            (0.0, 0.0),
            (37.7749, -122.4194),
            (-33.8688, 151.2093),
            (89.9, 179.9),
            (-89.9, -179.9),
            (35.3606, 138.7274),
        ];
        for &(lat, lng) in &points {
            for precision in 1..=12 {
                let token = encode(lat, lng, precision);
                let cell = bounds(&token).unwrap();
                let (clat, clng) = decode(&token).unwrap();
                assert!(cell.contains(clat, clng), "{token}");
                assert!(cell.contains(lat, lng), "{token} should contain input");
                assert_eq!(decode(&token).unwrap(), (clat, clng));
            }
        }
    }

    #[test]
    fn test_every_symbol_decodes() {
        for &b in ALPHABET.iter() {
            let token = (b as char).to_string();
            let (lat, lng) = decode(&token).unwrap();
            assert!(bounds(&token).unwrap().contains(lat, lng));
            assert_eq!(encode(lat, lng, 1), token);
        }
    }

    #[test]
    fn test_looks_like_geohash() {
        assert!(looks_like_geohash("9q8yyxk6p"));
        assert!(looks_like_geohash(" u4pruydqqvj "));
        assert!(looks_like_geohash("9Q8YY"));

        assert!(!looks_like_geohash(""));
        assert!(!looks_like_geohash("   "));
        assert!(!looks_like_geohash("37.77,-122.42"));
        assert!(!looks_like_geohash("9q8 yy"));
        assert!(!looks_like_geohash("hello"));
        assert!(!looks_like_geohash("12.5"));
    }
}
