//! Configuration for barbican-proxy-ssh.
//!
//! Loaded from a TOML file; every field has a default so an embedding
//! service can also construct the config programmatically.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Default bound on dialing the remote and on per-write deadlines.
const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 10;

/// Default read deadline during the SSH handshake. Reads blocked on a human
/// decision are kept alive past this by the retry discipline.
const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 15;

/// Proxy configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Bound on dialing the remote host, in seconds. Also bounds each write
    /// on the remote connection.
    pub dial_timeout_secs: u64,

    /// Read deadline during the SSH handshake, in seconds.
    pub handshake_timeout_secs: u64,

    /// Hook commands keyed by phase (see [`crate::hooks::HookPhase::key`]).
    pub hooks: HashMap<String, HookCommand>,
}

/// One configured hook command.
#[derive(Debug, Clone, Deserialize)]
pub struct HookCommand {
    /// Program to execute.
    pub command: String,

    /// Arguments passed to the program.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            dial_timeout_secs: DEFAULT_DIAL_TIMEOUT_SECS,
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            hooks: HashMap::new(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ProxyConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Bound on dialing the remote and on per-write deadlines.
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    /// Read deadline during the SSH handshake.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}
