//! HTTP client for the Trio local API.
//!
//! - Blocking client using `ureq` (no async); one `Agent` is shared by both
//!   polling threads.
//! - Every request is bounded by the configured timeout and retried with a
//!   linear backoff. Backoff sleeps end early on shutdown.
//! - The [`Transport`] trait is the seam the snapshot assembler talks to.

use log::debug;
use serde_json::Value as Json;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::Config;
use crate::shutdown::Shutdown;

/// Path of the admin-mode trigger sent before every main poll.
pub const ADMIN_TRIGGER_PATH: &str = "set/adm/(2)f";
/// Aggregate endpoint returning every register in one object.
pub const BATCH_PATH: &str = "get/all";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },
    #[error("timed out fetching {url}")]
    Timeout { url: String },
    #[error("http {status} from {url}")]
    Status { url: String, status: u16 },
    #[error("unparsable json from {url}: {message}")]
    Json { url: String, message: String },
    #[error("request to {url} cancelled by shutdown")]
    Cancelled { url: String },
}

impl TransportError {
    /// Connection faults, timeouts and non-2xx answers are worth another try.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Network { .. } | TransportError::Timeout { .. } | TransportError::Status { .. }
        )
    }

    fn from_ureq(url: &str, err: ureq::Error) -> Self {
        let url = url.to_string();
        match err {
            ureq::Error::Timeout(_) => TransportError::Timeout { url },
            ureq::Error::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => TransportError::Timeout { url },
            ureq::Error::StatusCode(status) => TransportError::Status { url, status },
            other => TransportError::Network {
                url,
                message: other.to_string(),
            },
        }
    }
}

/// What the snapshot assembler needs from the device.
pub trait Transport: Send + Sync {
    /// GET `path` and parse the body as JSON.
    fn get_json(&self, path: &str) -> Result<Json, TransportError>;

    /// GET `path`, check the status and discard the body.
    fn fire_and_forget(&self, path: &str) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn get_json(&self, path: &str) -> Result<Json, TransportError> {
        (**self).get_json(path)
    }

    fn fire_and_forget(&self, path: &str) -> Result<(), TransportError> {
        (**self).fire_and_forget(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: NonZeroU32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}

pub struct TrioClient {
    agent: ureq::Agent,
    base_url: String,
    retry: RetryPolicy,
    shutdown: Shutdown,
}

impl TrioClient {
    pub fn new(cfg: &Config, shutdown: Shutdown) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(cfg.request_timeout))
            .http_status_as_error(false)
            .build()
            .into();

        TrioClient {
            agent,
            base_url: cfg.base_url(),
            retry: RetryPolicy {
                max_attempts: cfg.max_request_attempts,
                backoff: cfg.retry_backoff,
            },
            shutdown,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn check_status(url: &str, status: http::StatusCode) -> Result<(), TransportError> {
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            })
        }
    }

    fn get_once(&self, url: &str) -> Result<String, TransportError> {
        let mut res = self
            .agent
            .get(url)
            .header("Accept", "application/json")
            .call()
            .map_err(|e| TransportError::from_ureq(url, e))?;
        Self::check_status(url, res.status())?;
        res.body_mut()
            .read_to_string()
            .map_err(|e| TransportError::from_ureq(url, e))
    }

    fn status_once(&self, url: &str) -> Result<(), TransportError> {
        let res = self
            .agent
            .get(url)
            .call()
            .map_err(|e| TransportError::from_ureq(url, e))?;
        Self::check_status(url, res.status())
    }

    fn with_retries<T>(&self, url: &str, op: impl Fn() -> Result<T, TransportError>) -> Result<T, TransportError> {
        let max = self.retry.max_attempts.get();
        let mut attempt = 1;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < max => {
                    let delay = self.retry.delay(attempt);
                    debug!(
                        "Client: attempt {}/{} failed ({}); retrying in {}ms",
                        attempt,
                        max,
                        e,
                        delay.as_millis()
                    );
                    if self.shutdown.wait(delay) {
                        return Err(TransportError::Cancelled { url: url.to_string() });
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Transport for TrioClient {
    fn get_json(&self, path: &str) -> Result<Json, TransportError> {
        let url = self.url(path);
        let body = self.with_retries(&url, || self.get_once(&url))?;
        serde_json::from_str(&body).map_err(|e| TransportError::Json {
            url: url.clone(),
            message: e.to_string(),
        })
    }

    fn fire_and_forget(&self, path: &str) -> Result<(), TransportError> {
        let url = self.url(path);
        self.with_retries(&url, || self.status_once(&url))
    }
}
