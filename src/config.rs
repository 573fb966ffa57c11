//! Network configuration loading.
//!
//! Scans the operator-supplied configuration directory once at startup,
//! validates that every referenced plugin (and IPAM plugin) is an
//! executable file in the plugin directory, and builds the frozen
//! name → configuration map the lifecycle core consults. There is no
//! hot-reload: the map is fixed for the agent's lifetime.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::constants::ROOT_DIR;
use crate::error::{Error, Result};
use crate::spec::{self, NetworkConfig};

// =============================================================================
// Flags
// =============================================================================

/// Policy for checkpointed plugin results that fail to parse during
/// recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryPolicy {
    /// A corrupt checkpoint fails the whole recovery.
    #[default]
    Strict,
    /// A corrupt checkpoint is logged and the attachment is recovered
    /// without a parsed result (the DEL path does not need it).
    Lenient,
}

/// Agent flags consumed by the CNI network isolator.
///
/// When neither directory is set the isolator runs in passive mode: it
/// stays transparent for host-network containers and rejects any
/// container that names a CNI network.
#[derive(Debug, Clone)]
pub struct CniFlags {
    /// Directory containing CNI plugin executables.
    pub network_cni_plugins_dir: Option<PathBuf>,
    /// Directory containing CNI network configuration files, one network
    /// per file.
    pub network_cni_config_dir: Option<PathBuf>,
    /// Root of the checkpoint hierarchy.
    pub network_cni_root_dir: PathBuf,
    /// How recovery treats corrupt checkpointed plugin results.
    pub recovery_policy: RecoveryPolicy,
}

impl Default for CniFlags {
    fn default() -> Self {
        Self {
            network_cni_plugins_dir: None,
            network_cni_config_dir: None,
            network_cni_root_dir: PathBuf::from(ROOT_DIR),
            recovery_policy: RecoveryPolicy::default(),
        }
    }
}

impl CniFlags {
    /// Creates flags pointing at the given plugin and configuration
    /// directories.
    #[must_use]
    pub fn new(plugins_dir: impl Into<PathBuf>, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            network_cni_plugins_dir: Some(plugins_dir.into()),
            network_cni_config_dir: Some(config_dir.into()),
            ..Self::default()
        }
    }

    /// Overrides the checkpoint root directory.
    #[must_use]
    pub fn with_root_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.network_cni_root_dir = root_dir.into();
        self
    }

    /// Overrides the recovery policy for corrupt checkpoints.
    #[must_use]
    pub fn with_recovery_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.recovery_policy = policy;
        self
    }
}

// =============================================================================
// Loaded Configuration
// =============================================================================

/// One loaded network configuration.
///
/// Keeps the parsed fields, the source path, and the raw file bytes;
/// the bytes are what a plugin later receives on stdin.
#[derive(Debug, Clone)]
pub struct NetworkConfigInfo {
    /// Parsed configuration fields.
    pub config: NetworkConfig,
    /// Path of the configuration file this network was loaded from.
    pub path: PathBuf,
    /// Raw contents of the configuration file.
    pub bytes: Vec<u8>,
}

/// Scans `config_dir` and builds the network name → configuration map.
///
/// Every non-directory entry must parse as a CNI network configuration,
/// its plugin (and IPAM plugin, when present) must exist under
/// `plugins_dir` with at least one execute bit, and network names must
/// be unique. Any violation is a startup error.
///
/// # Errors
///
/// Returns an error if either directory is missing, the plugin directory
/// is empty, a configuration file is unreadable or invalid, a plugin is
/// missing or not executable, a network name is duplicated, or no valid
/// configuration was found.
pub fn load_networks(
    plugins_dir: &Path,
    config_dir: &Path,
) -> Result<HashMap<String, NetworkConfigInfo>> {
    if !plugins_dir.exists() {
        return Err(Error::DirectoryMissing {
            kind: "plugin",
            path: plugins_dir.to_path_buf(),
        });
    }

    if !config_dir.exists() {
        return Err(Error::DirectoryMissing {
            kind: "network configuration",
            path: config_dir.to_path_buf(),
        });
    }

    let plugin_entries = fs::read_dir(plugins_dir)
        .map_err(|e| Error::ListDirFailed {
            path: plugins_dir.to_path_buf(),
            reason: e.to_string(),
        })?
        .count();

    if plugin_entries == 0 {
        return Err(Error::PluginDirEmpty {
            path: plugins_dir.to_path_buf(),
        });
    }

    let entries = fs::read_dir(config_dir).map_err(|e| Error::ListDirFailed {
        path: config_dir.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut networks: HashMap<String, NetworkConfigInfo> = HashMap::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::ListDirFailed {
            path: config_dir.to_path_buf(),
            reason: e.to_string(),
        })?;

        let path = entry.path();
        if path.is_dir() {
            continue;
        }

        let bytes = fs::read(&path).map_err(|e| Error::ConfigReadFailed {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let config = spec::parse_network_config(&bytes).map_err(|e| Error::ConfigParseFailed {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        if networks.contains_key(&config.name) {
            return Err(Error::DuplicateNetworkName(config.name));
        }

        check_plugin(plugins_dir, &config.plugin, &path)?;
        if let Some(ipam) = &config.ipam {
            check_plugin(plugins_dir, &ipam.plugin, &path)?;
        }

        tracing::debug!(
            "Loaded CNI network '{}' (plugin '{}') from '{}'",
            config.name,
            config.plugin,
            path.display()
        );

        networks.insert(
            config.name.clone(),
            NetworkConfigInfo {
                config,
                path,
                bytes,
            },
        );
    }

    if networks.is_empty() {
        return Err(Error::NoNetworkConfigs {
            path: config_dir.to_path_buf(),
        });
    }

    Ok(networks)
}

/// Checks that `plugins_dir/<name>` exists and has at least one execute
/// bit set.
fn check_plugin(plugins_dir: &Path, name: &str, config_path: &Path) -> Result<()> {
    let plugin_path = plugins_dir.join(name);

    let metadata = fs::metadata(&plugin_path).map_err(|_| Error::PluginNotFound {
        plugin: plugin_path.clone(),
        config: config_path.to_path_buf(),
    })?;

    if metadata.permissions().mode() & 0o111 == 0 {
        return Err(Error::PluginNotExecutable {
            plugin: plugin_path,
            config: config_path.to_path_buf(),
        });
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_plugin(dir: &Path, name: &str) {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_load_single_network() {
        let plugins = TempDir::new().unwrap();
        let configs = TempDir::new().unwrap();
        write_plugin(plugins.path(), "mock");
        fs::write(
            configs.path().join("net1.json"),
            r#"{"name":"net1","type":"mock"}"#,
        )
        .unwrap();

        let networks = load_networks(plugins.path(), configs.path()).unwrap();

        assert_eq!(networks.len(), 1);
        let info = &networks["net1"];
        assert_eq!(info.config.plugin, "mock");
        assert_eq!(info.bytes, br#"{"name":"net1","type":"mock"}"#);
    }

    #[test]
    fn test_load_rejects_duplicate_names() {
        let plugins = TempDir::new().unwrap();
        let configs = TempDir::new().unwrap();
        write_plugin(plugins.path(), "mock");
        fs::write(
            configs.path().join("a.json"),
            r#"{"name":"net1","type":"mock"}"#,
        )
        .unwrap();
        fs::write(
            configs.path().join("b.json"),
            r#"{"name":"net1","type":"mock"}"#,
        )
        .unwrap();

        let result = load_networks(plugins.path(), configs.path());

        assert!(matches!(result, Err(Error::DuplicateNetworkName(name)) if name == "net1"));
    }

    #[test]
    fn test_load_rejects_non_executable_plugin() {
        let plugins = TempDir::new().unwrap();
        let configs = TempDir::new().unwrap();
        let plugin = plugins.path().join("mock");
        fs::write(&plugin, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&plugin, fs::Permissions::from_mode(0o644)).unwrap();
        fs::write(
            configs.path().join("net1.json"),
            r#"{"name":"net1","type":"mock"}"#,
        )
        .unwrap();

        let result = load_networks(plugins.path(), configs.path());

        assert!(matches!(result, Err(Error::PluginNotExecutable { .. })));
    }

    #[test]
    fn test_load_checks_ipam_plugin() {
        let plugins = TempDir::new().unwrap();
        let configs = TempDir::new().unwrap();
        write_plugin(plugins.path(), "bridge");
        fs::write(
            configs.path().join("net1.json"),
            r#"{"name":"net1","type":"bridge","ipam":{"type":"host-local"}}"#,
        )
        .unwrap();

        let result = load_networks(plugins.path(), configs.path());

        assert!(matches!(result, Err(Error::PluginNotFound { .. })));
    }
}
