//! CNI plugin invocation.
//!
//! A plugin is an opaque executable driven entirely through its
//! environment, stdin, and stdout:
//!
//! - `argv[0]` is the plugin name, with no further arguments;
//! - the environment is replaced wholesale with the `CNI_*` variables
//!   and a `PATH` (plugins shell out to `iptables`, `ip`, ...);
//! - stdin receives the full network-configuration file;
//! - stdout carries the result JSON (success) or error JSON (failure);
//! - stderr is discarded.
//!
//! The child shares the agent's session and process group so that
//! signals aimed at the agent reach in-flight plugins too. stdout is
//! read to EOF before the child is reaped; a plugin that prints more
//! than a pipe buffer must not deadlock against us. If the caller
//! drops the invocation future, the child still runs to completion and
//! its result is discarded.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::constants::DEFAULT_PLUGIN_PATH;
use crate::error::{Error, Result};

// =============================================================================
// Environment Contract
// =============================================================================

/// The CNI operation being requested of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CniCommand {
    /// Attach the container to the network.
    Add,
    /// Detach the container from the network.
    Del,
}

impl CniCommand {
    /// The `CNI_COMMAND` value for this operation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Del => "DEL",
        }
    }
}

/// The environment handed to one plugin invocation.
#[derive(Debug, Clone)]
pub struct PluginEnv {
    /// Operation to perform.
    pub command: CniCommand,
    /// ID of the container being attached or detached.
    pub container_id: String,
    /// Directory of plugin executables, for plugins that chain to
    /// others.
    pub plugin_dir: PathBuf,
    /// Interface name inside the container namespace.
    pub if_name: String,
    /// Path to the bind-mounted namespace handle. Not a
    /// `/proc/<pid>/ns/net` path: the handle outlives the container
    /// process.
    pub netns: PathBuf,
}

impl PluginEnv {
    /// Renders the full environment for the child process.
    ///
    /// `PATH` is inherited from the agent, or defaulted so plugins can
    /// locate `iptables` and friends when the agent has none.
    #[must_use]
    pub fn to_env(&self) -> Vec<(String, String)> {
        let path = std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PLUGIN_PATH.to_string());

        vec![
            ("CNI_COMMAND".to_string(), self.command.as_str().to_string()),
            ("CNI_CONTAINERID".to_string(), self.container_id.clone()),
            (
                "CNI_PATH".to_string(),
                self.plugin_dir.to_string_lossy().into_owned(),
            ),
            ("CNI_IFNAME".to_string(), self.if_name.clone()),
            (
                "CNI_NETNS".to_string(),
                self.netns.to_string_lossy().into_owned(),
            ),
            ("PATH".to_string(), path),
        ]
    }
}

// =============================================================================
// Invocation
// =============================================================================

/// What a finished plugin invocation produced.
#[derive(Debug, Clone)]
pub struct PluginOutput {
    /// Exit code, or `None` when the child was killed by a signal.
    pub status: Option<i32>,
    /// Everything the plugin printed on stdout.
    pub stdout: String,
}

impl PluginOutput {
    /// Returns true if the plugin exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs a CNI plugin to completion.
///
/// Spawns `plugin_path` with `argv[0]` = `plugin_name`, writes `stdin`
/// to the child, reads stdout to EOF, and reaps the child.
///
/// # Errors
///
/// Returns an error if the child cannot be spawned, written to, or
/// reaped. A non-zero exit status is not an error at this layer; the
/// caller decides what a failed `ADD` or `DEL` means.
pub async fn run_plugin(
    plugin_path: &Path,
    plugin_name: &str,
    stdin: &[u8],
    env: &PluginEnv,
) -> Result<PluginOutput> {
    let mut command = std::process::Command::new(plugin_path);

    {
        use std::os::unix::process::CommandExt;
        command.arg0(plugin_name);
    }

    command
        .env_clear()
        .envs(env.to_env())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = Command::from(command)
        .spawn()
        .map_err(|e| Error::PluginSpawnFailed {
            plugin: plugin_name.to_string(),
            reason: e.to_string(),
        })?;

    // The pipe write can fail with EPIPE when the plugin exits without
    // reading its config; the exit status and stdout still decide the
    // outcome, so only report errors other than a closed pipe.
    if let Some(mut pipe) = child.stdin.take() {
        match pipe.write_all(stdin).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Err(e) => {
                return Err(Error::PluginSpawnFailed {
                    plugin: plugin_name.to_string(),
                    reason: format!("failed to write network configuration: {e}"),
                })
            }
        }
    }

    // Reads stdout to EOF before waiting on the exit status.
    let output = child
        .wait_with_output()
        .await
        .map_err(|_| Error::PluginReapFailed {
            plugin: plugin_name.to_string(),
        })?;

    Ok(PluginOutput {
        status: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
    })
}

// =============================================================================
// Tests
// =============================================================================
