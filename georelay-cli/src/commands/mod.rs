pub mod batch;
pub mod decode;
pub mod encode;
pub mod query;

use anyhow::{Context, Result};
use georelay::{ConcurrencyGate, ElevationClient};
use std::sync::Arc;
use std::time::Duration;

/// Elevation backend settings shared by the query commands.
pub struct Backend {
    pub base: String,
    pub dataset: String,
    pub timeout_ms: u64,
}

impl Backend {
    pub fn client(&self) -> Result<ElevationClient> {
        ElevationClient::new(
            self.base.clone(),
            self.dataset.clone(),
            Duration::from_millis(self.timeout_ms.max(1)),
            Arc::new(ConcurrencyGate::new(1)),
        )
        .context("Failed to create HTTP client")
    }
}
