//! Minimal runtime configuration helpers.
//! Defaults match the Trio firmware (port 5333) and the original 15s cadence.

use std::num::NonZeroU32;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 5333;
pub const DEFAULT_POLL_SECS: u64 = 15;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MAX_REQUEST_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

/// Upper bound for both poll cadences (one day).
pub const MAX_INTERVAL_SECS: u64 = 86_400;
pub const MAX_REQUEST_TIMEOUT_SECS: u64 = 300;
pub const MAX_RETRY_BACKOFF_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Cadence of the main (everything but pressure) loop.
    pub main_interval: Duration,
    /// Cadence of the pressure loop.
    pub pressure_interval: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Attempts per request, including the first one.
    pub max_request_attempts: NonZeroU32,
    /// Backoff unit; attempt `n` waits `n * retry_backoff` before retrying.
    pub retry_backoff: Duration,
}

impl Config {
    pub fn new(host: impl Into<String>) -> Self {
        Config {
            host: host.into(),
            port: DEFAULT_PORT,
            main_interval: Duration::from_secs(DEFAULT_POLL_SECS),
            pressure_interval: Duration::from_secs(DEFAULT_POLL_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_request_attempts: NonZeroU32::new(DEFAULT_MAX_REQUEST_ATTEMPTS).unwrap_or(NonZeroU32::MIN),
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
        }
    }

    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let host = get("SAFETEC_HOST").ok_or_else(|| "Missing device host: set SAFETEC_HOST".to_string())?;
        let mut cfg = Config::new(host);

        if let Some(port) = get("SAFETEC_PORT") {
            cfg.port = port
                .parse::<u16>()
                .map_err(|_| format!("SAFETEC_PORT must be a port number, got {port:?}"))?;
        }

        if let Some(secs) = get("POLL_INTERVAL_SECS") {
            cfg.main_interval = parse_interval("POLL_INTERVAL_SECS", &secs, MAX_INTERVAL_SECS)?;
            cfg.pressure_interval = cfg.main_interval;
        }
        if let Some(secs) = get("PRESSURE_INTERVAL_SECS") {
            cfg.pressure_interval = parse_interval("PRESSURE_INTERVAL_SECS", &secs, MAX_INTERVAL_SECS)?;
        }
        if let Some(secs) = get("REQUEST_TIMEOUT_SECS") {
            cfg.request_timeout = parse_interval("REQUEST_TIMEOUT_SECS", &secs, MAX_REQUEST_TIMEOUT_SECS)?;
        }

        if let Some(n) = get("MAX_REQUEST_ATTEMPTS") {
            cfg.max_request_attempts = n
                .parse::<u32>()
                .ok()
                .and_then(NonZeroU32::new)
                .ok_or_else(|| format!("MAX_REQUEST_ATTEMPTS must be a positive integer, got {n:?}"))?;
        }

        if let Some(ms) = get("RETRY_BACKOFF_MS") {
            cfg.retry_backoff = match ms.parse::<u64>() {
                Ok(v) if v <= MAX_RETRY_BACKOFF_MS => Duration::from_millis(v),
                Ok(_) => return Err(format!("RETRY_BACKOFF_MS must be at most {MAX_RETRY_BACKOFF_MS}, got {ms:?}")),
                Err(_) => {
                    return Err(format!("RETRY_BACKOFF_MS must be a whole number of milliseconds, got {ms:?}"));
                }
            };
        }

        Ok(cfg)
    }

    /// Root of the device API, e.g. `http://192.168.1.81:5333/trio`.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}/trio", self.host, self.port)
    }
}

fn parse_interval(name: &str, raw: &str, max_secs: u64) -> Result<Duration, String> {
    match raw.parse::<u64>() {
        Ok(0) => Err(format!("{name} must be greater than zero")),
        Ok(secs) if secs > max_secs => Err(format!("{name} must be at most {max_secs} seconds, got {raw:?}")),
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(_) => Err(format!("{name} must be a whole number of seconds, got {raw:?}")),
    }
}
