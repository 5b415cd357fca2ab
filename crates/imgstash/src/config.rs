//! Daemon endpoint discovery.
//!
//! The connection to the container daemon follows the daemon's standard
//! environment convention: `DOCKER_HOST` names the endpoint, and when it is
//! unset the conventional local TCP endpoint is used. Only HTTP transports
//! are supported — `tcp://` values are normalised to `http://`, and
//! `unix://` sockets are rejected up front rather than failing obscurely on
//! the first request.

use crate::error::{CacheError, Result};

/// Environment variable naming the daemon endpoint.
pub const DOCKER_HOST: &str = "DOCKER_HOST";

/// Endpoint used when `DOCKER_HOST` is unset.
pub const DEFAULT_ENDPOINT: &str = "http://localhost:2375";

/// Connection parameters for the container daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// HTTP base URL of the daemon API, without a trailing slash.
    pub endpoint: String,
}

impl DaemonConfig {
    /// Discover the daemon endpoint from the environment.
    pub fn from_env() -> Result<Self> {
        match std::env::var(DOCKER_HOST) {
            Ok(value) if !value.is_empty() => Self::from_endpoint(&value),
            _ => Ok(Self {
                endpoint: DEFAULT_ENDPOINT.to_string(),
            }),
        }
    }

    /// Normalise an endpoint string to an HTTP base URL.
    pub fn from_endpoint(endpoint: &str) -> Result<Self> {
        let endpoint = endpoint.trim_end_matches('/');
        if let Some(rest) = endpoint.strip_prefix("tcp://") {
            return Ok(Self {
                endpoint: format!("http://{rest}"),
            });
        }
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return Ok(Self {
                endpoint: endpoint.to_string(),
            });
        }
        if endpoint.starts_with("unix://") {
            return Err(CacheError::Config(format!(
                "unix socket endpoint '{endpoint}' is not supported, \
                 expose the daemon over TCP and set {DOCKER_HOST} accordingly"
            )));
        }
        Err(CacheError::Config(format!(
            "unrecognised daemon endpoint '{endpoint}'"
        )))
    }
}
