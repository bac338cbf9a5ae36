//! Gateway configuration: immutable startup values supplied by the
//! orchestrator before the gateway is started.
//!
//! The orchestrator hands the gateway its listen address, the shared
//! authorization secret, the workload identifier used to detect
//! misdirected requests, and the container the runtime execs into. All
//! values are fixed for the lifetime of the process.

use thiserror::Error;

/// Container runtime CLI used when none is configured.
pub const DEFAULT_RUNTIME: &str = "docker";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid listen address {0:?}: expected HOST:PORT")]
    InvalidAddress(String),
    #[error("missing required value: {0}")]
    Missing(&'static str),
}

/// Immutable gateway startup configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Externally reachable host, advertised back to the orchestrator.
    pub listen_host: String,
    /// Listen port; `0` asks the gateway to pick a free port.
    pub listen_port: u16,
    /// Shared secret the upgrade endpoint requires from callers.
    pub auth_secret: String,
    /// Identifier of the workload this gateway fronts.
    pub workload_id: String,
    /// Container the runtime execs into.
    pub container_id: String,
    /// Container runtime CLI binary (e.g. `docker`).
    pub runtime: String,
}

impl GatewayConfig {
    /// Build a config from orchestrator-supplied values.
    ///
    /// `address` is `HOST:PORT` where HOST is the address of this
    /// machine as seen from the orchestrator, and PORT is either the
    /// desired listen port or `0` to pick a free one.
    pub fn new(
        address: &str,
        auth_secret: String,
        workload_id: String,
        container_id: String,
        runtime: String,
    ) -> Result<Self, ConfigError> {
        let (listen_host, listen_port) = split_listen_addr(address)?;
        if auth_secret.is_empty() {
            return Err(ConfigError::Missing("auth secret"));
        }
        if workload_id.is_empty() {
            return Err(ConfigError::Missing("workload id"));
        }
        if container_id.is_empty() {
            return Err(ConfigError::Missing("container id"));
        }
        let runtime = if runtime.is_empty() {
            DEFAULT_RUNTIME.to_string()
        } else {
            runtime
        };
        Ok(Self {
            listen_host,
            listen_port,
            auth_secret,
            workload_id,
            container_id,
            runtime,
        })
    }
}

/// Split an orchestrator-supplied `HOST:PORT` listen address.
///
/// Accepts bracketed IPv6 hosts (`[::1]:0`).
pub fn split_listen_addr(address: &str) -> Result<(String, u16), ConfigError> {
    let invalid = || ConfigError::InvalidAddress(address.to_string());
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    let port: u16 = port.parse().map_err(|_| invalid())?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}
