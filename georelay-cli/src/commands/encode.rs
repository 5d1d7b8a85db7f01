use anyhow::{bail, Result};
use georelay::geohash;

pub fn run(lat: f64, lon: f64, precision: usize) -> Result<()> {
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        bail!("Coordinate out of range: {lat},{lon}");
    }
    if precision == 0 || precision > 12 {
        bail!("Precision must be between 1 and 12, got {precision}");
    }

    println!("{}", geohash::encode(lat, lon, precision));
    Ok(())
}
