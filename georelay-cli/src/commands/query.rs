use anyhow::{bail, Context, Result};
use georelay::{location, repackage};

use super::Backend;

pub async fn run(backend: &Backend, locations: &str, pretty: bool) -> Result<()> {
    let set = location::parse_joined(locations).context("Invalid locations")?;
    let client = backend.client()?;

    let response = repackage::repackage(&set, client.query(set.points(), None).await);

    let output = match serde_json::from_slice::<serde_json::Value>(&response.body) {
        Ok(value) if pretty => serde_json::to_string_pretty(&value)?,
        _ => String::from_utf8_lossy(&response.body).into_owned(),
    };

    if !response.is_success() {
        bail!("Backend returned {}: {}", response.status, output);
    }

    println!("{output}");
    Ok(())
}
