//! Runtime configuration from environment variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `FORWARD_BIND` | `0.0.0.0` |
//! | `FORWARD_PORT` | `9011` |
//! | `FORWARD_FORCE_LOCAL` | `0` |
//! | `FORWARD_CONCURRENCY` | `16` |
//! | `FORWARD_RATE_RPS` | `20` |
//! | `FORWARD_RATE_BURST` | `40` |
//! | `ELEV_BASE` | `http://localhost:5000` |
//! | `ELEV_DATASET` | `mapzen` |
//! | `ELEV_TIMEOUT_MS` | `10000` |
//! | `NKN_IDENTIFIER` | `forwarder` |
//! | `NKN_SEED` | empty |
//! | `NKN_SUBCLIENTS` | `4` |
//! | `NKN_RPC_ADDRS` | empty (comma-separated) |
//! | `SIDECAR_RUNTIME` | `node` |
//! | `SIDECAR_SCRIPT` | `sidecar/sidecar.js` |

use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::transport::SidecarConfig;

/// Extra time a forward waits beyond the upstream timeout.
pub const FORWARD_GRACE: Duration = Duration::from_secs(5);
/// Number of consecutive ports tried after the configured one.
pub const PORT_SEARCH_RANGE: u16 = 100;

/// Overlay identity handed to the sidecar.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayConfig {
    pub identifier: String,
    pub seed: String,
    pub subclients: usize,
    pub rpc_addrs: Vec<String>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            identifier: "forwarder".to_string(),
            seed: String::new(),
            subclients: 4,
            rpc_addrs: Vec::new(),
        }
    }
}

/// Settings for the whole relay process.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub bind: String,
    pub port: u16,
    /// Keep a loopback bind instead of widening it.
    pub force_local: bool,
    /// Maximum concurrent upstream calls.
    pub concurrency: usize,
    pub rate_rps: f64,
    pub rate_burst: f64,
    pub elev_base: String,
    pub elev_dataset: String,
    pub elev_timeout: Duration,
    pub overlay: OverlayConfig,
    pub sidecar_runtime: String,
    pub sidecar_script: String,
    pub sidecar_close_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 9011,
            force_local: false,
            concurrency: 16,
            rate_rps: 20.0,
            rate_burst: 40.0,
            elev_base: "http://localhost:5000".to_string(),
            elev_dataset: "mapzen".to_string(),
            elev_timeout: Duration::from_millis(10_000),
            overlay: OverlayConfig::default(),
            sidecar_runtime: "node".to_string(),
            sidecar_script: "sidecar/sidecar.js".to_string(),
            sidecar_close_grace: Duration::from_secs(3),
        }
    }
}

impl RelayConfig {
    /// Read the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a numeric variable is set but
    /// cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |key: &str, default: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let overlay = OverlayConfig {
            identifier: text("NKN_IDENTIFIER", &defaults.overlay.identifier),
            seed: lookup("NKN_SEED").map(|v| v.trim().to_string()).unwrap_or_default(),
            subclients: number(&lookup, "NKN_SUBCLIENTS", defaults.overlay.subclients)?.max(1),
            rpc_addrs: lookup("NKN_RPC_ADDRS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|a| !a.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        };

        Ok(Self {
            bind: text("FORWARD_BIND", &defaults.bind),
            port: number(&lookup, "FORWARD_PORT", defaults.port)?,
            force_local: lookup("FORWARD_FORCE_LOCAL").is_some_and(|v| truthy(&v)),
            concurrency: number(&lookup, "FORWARD_CONCURRENCY", defaults.concurrency)?.max(1),
            rate_rps: number(&lookup, "FORWARD_RATE_RPS", defaults.rate_rps)?.max(1.0),
            rate_burst: number(&lookup, "FORWARD_RATE_BURST", defaults.rate_burst)?.max(1.0),
            elev_base: text("ELEV_BASE", &defaults.elev_base)
                .trim_end_matches('/')
                .to_string(),
            elev_dataset: text("ELEV_DATASET", &defaults.elev_dataset),
            elev_timeout: Duration::from_millis(number(&lookup, "ELEV_TIMEOUT_MS", 10_000u64)?),
            overlay,
            sidecar_runtime: text("SIDECAR_RUNTIME", &defaults.sidecar_runtime),
            sidecar_script: text("SIDECAR_SCRIPT", &defaults.sidecar_script),
            sidecar_close_grace: defaults.sidecar_close_grace,
        })
    }

    /// How long a forward waits for its reply.
    pub fn forward_timeout(&self) -> Duration {
        self.elev_timeout + FORWARD_GRACE
    }

    /// Maximum concurrent HTTP requests handled by the front-end.
    pub fn http_workers(&self) -> usize {
        (self.concurrency * 2).max(8)
    }

    /// The address actually bound: a loopback bind is widened to all
    /// interfaces unless `force_local` is set.
    pub fn effective_bind(&self) -> String {
        if is_loopback(&self.bind) && !self.force_local {
            "0.0.0.0".to_string()
        } else {
            self.bind.clone()
        }
    }

    /// Ports to try, in order.
    pub fn port_candidates(&self) -> impl Iterator<Item = u16> {
        let start = self.port;
        let end = start.saturating_add(PORT_SEARCH_RANGE);
        start..=end
    }

    /// Launch settings for the overlay sidecar.
    pub fn sidecar(&self) -> SidecarConfig {
        SidecarConfig::new(&self.sidecar_runtime)
            .arg(&self.sidecar_script)
            .env("NKN_IDENTIFIER", &self.overlay.identifier)
            .env("NKN_SEED", &self.overlay.seed)
            .env("NKN_SUBCLIENTS", self.overlay.subclients.to_string())
            .env("NKN_RPC_ADDRS", self.overlay.rpc_addrs.join(","))
            .close_grace(self.sidecar_close_grace)
    }

    pub fn with_elev_base(mut self, base: impl Into<String>) -> Self {
        self.elev_base = base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_elev_timeout(mut self, timeout: Duration) -> Self {
        self.elev_timeout = timeout;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_rate(mut self, rps: f64, burst: f64) -> Self {
        self.rate_rps = rps.max(1.0);
        self.rate_burst = burst.max(1.0);
        self
    }
}

fn number<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|_| ConfigError::Invalid { key, value: raw })
        }
        _ => Ok(default),
    }
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// `true` for `localhost` and loopback IP literals.
pub fn is_loopback(host: &str) -> bool {
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');
    host.eq_ignore_ascii_case("localhost")
        || host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}
