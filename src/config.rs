//! Configuration loading and validation.
//!
//! The balancer reads its YAML configuration exactly once at startup.
//! Backend URLs, the listen address, and every duration are validated up
//! front so that a bad file stops the process before any listener is bound.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{BalancerError, Result};

/// Default interval between liveness sweeps.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Default upper bound on a single TCP connectivity probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default fan-out bound when probing backends concurrently.
pub const DEFAULT_MAX_CONCURRENT_PROBES: usize = 8;

/// Default host the balancer binds to (all IPv4 interfaces).
pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";

/// Default idle timeout for pooled upstream connections.
pub const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default maximum number of idle connections kept per backend.
pub const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 32;

/// Raw configuration as deserialized from the YAML file.
///
/// This struct maps directly to the on-disk schema. After loading, it is
/// transformed into a [`RuntimeConfig`] holding validated backend URIs and
/// concrete durations.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Backend base URLs, in rotation order (e.g. `"http://localhost:9001"`).
    #[serde(default)]
    pub service_url: Vec<String>,
    /// Port the balancer listens on. Required.
    #[serde(default)]
    pub balance_port: Option<u16>,
    /// IP address to bind (default `"0.0.0.0"`).
    #[serde(default)]
    pub listen_host: Option<String>,
    /// Liveness probing configuration.
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    /// Upper bound in milliseconds on a forwarded round-trip. When absent,
    /// forwarding waits as long as the backend takes.
    #[serde(default)]
    pub forward_timeout_ms: Option<u64>,
    /// Idle timeout in milliseconds for pooled upstream connections
    /// (default: 60000).
    #[serde(default)]
    pub pool_idle_timeout_ms: Option<u64>,
    /// Maximum idle upstream connections kept per backend (default: 32).
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

/// How a liveness sweep walks the pool.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMode {
    /// One backend at a time, in pool order.
    #[default]
    Sequential,
    /// All backends at once, bounded by `max_concurrent_probes`.
    Concurrent,
}

/// Liveness probing configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckConfig {
    /// Interval between sweeps in milliseconds (default: 5000).
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Per-probe connect timeout in milliseconds (default: 2000).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Sweep strategy (default: sequential).
    #[serde(default)]
    pub mode: ProbeMode,
    /// Maximum probes in flight during a concurrent sweep (default: 8).
    #[serde(default = "default_max_concurrent_probes")]
    pub max_concurrent_probes: usize,
}

fn default_interval_ms() -> u64 {
    DEFAULT_HEALTH_CHECK_INTERVAL.as_millis() as u64
}

fn default_timeout_ms() -> u64 {
    DEFAULT_PROBE_TIMEOUT.as_millis() as u64
}

fn default_max_concurrent_probes() -> usize {
    DEFAULT_MAX_CONCURRENT_PROBES
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            timeout_ms: default_timeout_ms(),
            mode: ProbeMode::default(),
            max_concurrent_probes: default_max_concurrent_probes(),
        }
    }
}

/// Validated prober settings.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheckSettings {
    /// Time between the start of consecutive sweeps.
    pub interval: Duration,
    /// Upper bound on a single connectivity probe.
    pub timeout: Duration,
    /// Sweep strategy.
    pub mode: ProbeMode,
    /// Fan-out bound for [`ProbeMode::Concurrent`].
    pub max_concurrent_probes: usize,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            timeout: DEFAULT_PROBE_TIMEOUT,
            mode: ProbeMode::Sequential,
            max_concurrent_probes: DEFAULT_MAX_CONCURRENT_PROBES,
        }
    }
}

/// Fully validated, ready-to-use configuration.
///
/// Created once at startup. Contains every value the balancer needs at
/// runtime without touching the filesystem again.
#[derive(Debug)]
pub struct RuntimeConfig {
    /// Socket address the balancer binds to.
    pub listen: SocketAddr,
    /// Backend base URIs in configuration order.
    pub backends: Vec<hyper::Uri>,
    /// Liveness probing settings.
    pub health_check: HealthCheckSettings,
    /// Optional deadline on a forwarded round-trip. Expiry yields 504.
    pub forward_timeout: Option<Duration>,
    /// Idle timeout for pooled upstream connections.
    pub pool_idle_timeout: Duration,
    /// Maximum idle connections per backend.
    pub pool_max_idle_per_host: usize,
}

/// Validates a single backend URL string.
///
/// The URL must carry an `http` scheme and an authority; its path, if any,
/// becomes the base path requests are forwarded under.
pub fn validate_backend(address: &str) -> Result<hyper::Uri> {
    if address.trim().is_empty() {
        return Err(BalancerError::InvalidBackend(
            "backend url must not be empty".into(),
        ));
    }

    let uri = address
        .trim()
        .parse::<hyper::Uri>()
        .map_err(|e| BalancerError::InvalidBackend(format!("{address}: {e}")))?;

    match uri.scheme_str() {
        Some(scheme) if scheme.eq_ignore_ascii_case("http") => {}
        Some(scheme) => {
            return Err(BalancerError::InvalidBackend(format!(
                "unsupported scheme \"{scheme}\" in {address}"
            )));
        }
        None => {
            return Err(BalancerError::InvalidBackend(format!(
                "backend url has no scheme: {address}"
            )));
        }
    }

    if uri.host().is_none_or(str::is_empty) {
        return Err(BalancerError::InvalidBackend(format!(
            "backend url has no host: {address}"
        )));
    }

    Ok(uri)
}

fn positive_millis(value: u64, field: &str) -> Result<Duration> {
    if value == 0 {
        return Err(BalancerError::Config(format!("{field} must be positive")));
    }
    Ok(Duration::from_millis(value))
}

impl Config {
    /// Loads configuration from a YAML file at the given path.
    ///
    /// Returns a [`BalancerError::Config`] if the file cannot be opened or
    /// its contents fail YAML deserialization.
    pub fn load_from_file(file_path: &(impl AsRef<Path> + ?Sized)) -> Result<Self> {
        let file = std::fs::File::open(file_path).map_err(|e| {
            BalancerError::Config(format!(
                "failed to open {}: {e}",
                file_path.as_ref().display()
            ))
        })?;

        serde_yaml::from_reader(file)
            .map_err(|e| BalancerError::Config(format!("failed to parse config: {e}")))
    }

    /// Validates all fields, producing a [`RuntimeConfig`].
    ///
    /// At least one backend must be configured and every backend URL must
    /// parse.
    pub fn into_runtime(self) -> Result<RuntimeConfig> {
        if self.service_url.is_empty() {
            return Err(BalancerError::Config(
                "please provide one or more backends to load balance".into(),
            ));
        }

        let port = self
            .balance_port
            .ok_or_else(|| BalancerError::Config("balance_port must be set".into()))?;

        let host = self.listen_host.as_deref().unwrap_or(DEFAULT_LISTEN_HOST);
        let ip = host.parse::<IpAddr>().map_err(|e| {
            BalancerError::Config(format!("invalid listen host \"{host}\": {e}"))
        })?;

        let backends = self
            .service_url
            .iter()
            .map(|address| validate_backend(address))
            .collect::<Result<Vec<_>>>()?;

        let hc = self.health_check;
        if hc.max_concurrent_probes == 0 {
            return Err(BalancerError::Config(
                "health_check.max_concurrent_probes must be positive".into(),
            ));
        }
        let health_check = HealthCheckSettings {
            interval: positive_millis(hc.interval_ms, "health_check.interval_ms")?,
            timeout: positive_millis(hc.timeout_ms, "health_check.timeout_ms")?,
            mode: hc.mode,
            max_concurrent_probes: hc.max_concurrent_probes,
        };

        let forward_timeout = self
            .forward_timeout_ms
            .map(|ms| positive_millis(ms, "forward_timeout_ms"))
            .transpose()?;

        let pool_idle_timeout = self
            .pool_idle_timeout_ms
            .map_or(DEFAULT_POOL_IDLE_TIMEOUT, Duration::from_millis);

        let pool_max_idle_per_host = self
            .pool_max_idle_per_host
            .unwrap_or(DEFAULT_POOL_MAX_IDLE_PER_HOST);

        Ok(RuntimeConfig {
            listen: SocketAddr::new(ip, port),
            backends,
            health_check,
            forward_timeout,
            pool_idle_timeout,
            pool_max_idle_per_host,
        })
    }
}
