use anyhow::{Context, Result};
use georelay::geohash;
use serde::Serialize;

#[derive(Serialize)]
struct DecodeResponse<'a> {
    geohash: &'a str,
    lat: f64,
    lng: f64,
    bounds: [f64; 4],
}

pub fn run(token: &str, json: bool) -> Result<()> {
    let token = token.trim();
    let bounds = geohash::bounds(token).with_context(|| format!("Cannot decode '{token}'"))?;
    let (lat, lng) = bounds.center();

    if json {
        let response = DecodeResponse {
            geohash: token,
            lat,
            lng,
            bounds: [bounds.min_lat, bounds.min_lng, bounds.max_lat, bounds.max_lng],
        };
        println!("{}", serde_json::to_string(&response)?);
    } else {
        println!("{lat:.6},{lng:.6}");
    }

    Ok(())
}
