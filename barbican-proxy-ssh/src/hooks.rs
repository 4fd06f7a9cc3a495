//! Pre-connect hooks: user-configured commands run at fixed lifecycle
//! phases, with their textual output streamed back to the client.

use crate::config::{HookCommand, ProxyConfig};
use crate::error::HookError;
use std::collections::HashMap;
use std::future::Future;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Lifecycle phases at which hooks can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    /// Before the remote host is dialed.
    BeforeConnecting,
}

impl HookPhase {
    /// Configuration key for this phase.
    pub fn key(self) -> &'static str {
        match self {
            Self::BeforeConnecting => "before_connecting",
        }
    }
}

/// Ordered key/value parameters handed to a hook.
#[derive(Debug, Clone, Default)]
pub struct HookParameters {
    entries: Vec<(String, String)>,
}

impl HookParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one parameter, preserving insertion order.
    pub fn insert(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.push((key.into(), value.into()));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Environment variable name for a parameter key, e.g.
    /// `Remote Address` -> `BARBICAN_HOOK_REMOTE_ADDRESS`.
    fn env_name(key: &str) -> String {
        let mut name = String::from("BARBICAN_HOOK_");
        for c in key.chars() {
            if c.is_ascii_alphanumeric() {
                name.push(c.to_ascii_uppercase());
            } else {
                name.push('_');
            }
        }
        name
    }
}

/// Runs user-defined hooks; textual output is streamed through `output`.
pub trait Hooks: Send + Sync + 'static {
    fn run(
        &self,
        cancel: &CancellationToken,
        phase: HookPhase,
        params: &HookParameters,
        output: mpsc::Sender<Vec<u8>>,
    ) -> impl Future<Output = Result<(), HookError>> + Send;
}

/// Hooks implementation that never runs anything.
#[derive(Debug, Default, Clone)]
pub struct NoHooks;

impl Hooks for NoHooks {
    async fn run(
        &self,
        _cancel: &CancellationToken,
        _phase: HookPhase,
        _params: &HookParameters,
        _output: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), HookError> {
        Ok(())
    }
}

/// Hooks implementation that runs the commands configured per phase,
/// exposing parameters as environment variables and streaming stdout.
#[derive(Debug, Clone)]
pub struct CommandHooks {
    commands: HashMap<String, HookCommand>,
}

impl CommandHooks {
    pub fn new(commands: HashMap<String, HookCommand>) -> Self {
        Self { commands }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(config.hooks.clone())
    }
}

impl Hooks for CommandHooks {
    async fn run(
        &self,
        cancel: &CancellationToken,
        phase: HookPhase,
        params: &HookParameters,
        output: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), HookError> {
        let Some(hook) = self.commands.get(phase.key()) else {
            return Ok(());
        };

        debug!(phase = phase.key(), command = %hook.command, "Running hook");

        let mut child = Command::new(&hook.command)
            .args(&hook.args)
            .envs(
                params
                    .iter()
                    .map(|(k, v)| (HookParameters::env_name(k), v.to_string())),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(HookError::Spawn)?;

        let mut stdout = child
            .stdout
            .take()
            .expect("child stdout was requested piped");

        let mut buf = [0u8; 1024];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    return Err(HookError::Cancelled);
                }
                read = stdout.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        // Receiver gone means the session stopped caring;
                        // let the hook finish on its own.
                        if output.send(buf[..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => return Err(HookError::Io(e)),
                },
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                return Err(HookError::Cancelled);
            }
            status = child.wait() => status.map_err(HookError::Io)?,
        };

        if !status.success() {
            return Err(HookError::Failed(status));
        }

        Ok(())
    }
}
