//! The CNI network isolator lifecycle core.
//!
//! One [`NetworkCniIsolator`] instance serves the whole agent. Per
//! container, the state machine is implicit in the presence of an entry
//! in the container table and of on-disk checkpoint artifacts:
//!
//! ```text
//!   (absent) ──prepare──▶ PREPARED
//!   PREPARED ──isolate──▶ ISOLATING ──(attach per network)──▶ ISOLATED
//!   ISOLATED ──cleanup──▶ CLEANING  ──(detach per network)──▶ (absent)
//!   any      ──recover──▶ reconstructed, possibly straight to cleanup
//! ```
//!
//! Hooks are serialized through one async mutex over the container
//! table, so calls for distinct containers begin their side effects in
//! arrival order and in-memory state is never observed mid-transition.
//! Within one `isolate` or `cleanup`, the per-network plugin
//! invocations run concurrently and the hook resolves only when all of
//! them have terminated: no `ADD` is in flight when `DEL`s begin, and
//! no `DEL` is in flight when cleanup finalizes. Failures from the
//! fan-out are aggregated, never short-circuited.
//!
//! A container that names no CNI network never enters the table; the
//! isolator is transparent and the container shares the host network.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::future::join_all;
use nix::sched::CloneFlags;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::{self, CniFlags, NetworkConfigInfo, RecoveryPolicy};
use crate::constants::IFNAME_PREFIX;
use crate::error::{Error, Result};
use crate::isolator::{
    ContainerConfig, ContainerState, ContainerType, Isolator, LaunchInfo, NetworkInfo,
};
use crate::mount;
use crate::plugin::{self, CniCommand, PluginEnv};
use crate::spec::{self, CniNetworkInfo};

/// Namespaces requested for every container that joins a CNI network.
const CONTAINER_NAMESPACES: CloneFlags = CloneFlags::CLONE_NEWNET
    .union(CloneFlags::CLONE_NEWNS)
    .union(CloneFlags::CLONE_NEWUTS);

// =============================================================================
// Container Table
// =============================================================================

/// One container × network association.
#[derive(Debug, Clone)]
pub struct NetworkAttachment {
    /// Name of the joined network.
    pub network_name: String,
    /// Interface name inside the container namespace.
    pub if_name: String,
    /// Parsed plugin result, once the `ADD` has succeeded and been
    /// checkpointed. Absent for attachments recovered from a crash
    /// that predates the checkpoint write.
    pub result: Option<CniNetworkInfo>,
}

/// Per-container bookkeeping: network name → attachment.
#[derive(Debug, Default)]
struct ContainerInfo {
    attachments: HashMap<String, NetworkAttachment>,
}

/// The non-passive half of the isolator: where checkpoints live and
/// where plugins are found.
#[derive(Debug)]
struct Active {
    store: CheckpointStore,
    plugin_dir: PathBuf,
}

// =============================================================================
// Isolator
// =============================================================================

/// The CNI network isolator.
///
/// Constructed once at agent startup; see [`NetworkCniIsolator::new`].
pub struct NetworkCniIsolator {
    /// Loaded network configurations, frozen after startup.
    configs: HashMap<String, NetworkConfigInfo>,
    /// Checkpoint store and plugin directory; `None` in passive mode.
    active: Option<Active>,
    /// How recovery treats corrupt checkpointed plugin results.
    recovery_policy: RecoveryPolicy,
    /// The container table. The mutex is held across each lifecycle
    /// hook, serializing them like an actor mailbox.
    infos: Mutex<HashMap<String, ContainerInfo>>,
}

impl NetworkCniIsolator {
    /// Creates the isolator from agent flags.
    ///
    /// With neither directory flag set the isolator is passive:
    /// host-network containers pass through untouched and any named
    /// network is rejected in `prepare`. Otherwise this validates the
    /// directories, loads every network configuration, creates the
    /// checkpoint root, and makes it a shared mount in its own peer
    /// group.
    ///
    /// # Errors
    ///
    /// Returns an error on any startup problem: missing root
    /// privileges, missing or invalid directories, unparseable
    /// configuration, missing or non-executable plugins, duplicate
    /// network names, or mount failures. All abort agent startup.
    pub fn new(flags: &CniFlags) -> Result<Self> {
        if flags.network_cni_plugins_dir.is_none() && flags.network_cni_config_dir.is_none() {
            info!("No CNI plugin or network configuration directories given; only host-network containers are supported");
            return Ok(Self {
                configs: HashMap::new(),
                active: None,
                recovery_policy: flags.recovery_policy,
                infos: Mutex::new(HashMap::new()),
            });
        }

        if !nix::unistd::geteuid().is_root() {
            return Err(Error::PermissionDenied);
        }

        let plugins_dir = flags
            .network_cni_plugins_dir
            .as_deref()
            .ok_or(Error::MissingFlag("network_cni_plugins_dir"))?;
        let config_dir = flags
            .network_cni_config_dir
            .as_deref()
            .ok_or(Error::MissingFlag("network_cni_config_dir"))?;

        let configs = config::load_networks(plugins_dir, config_dir)?;

        let store = CheckpointStore::new(&flags.network_cni_root_dir)?;
        mount::ensure_shared_root(store.root_dir())?;

        let plugin_dir = plugins_dir
            .canonicalize()
            .map_err(|e| Error::CanonicalizeFailed {
                path: plugins_dir.to_path_buf(),
                reason: e.to_string(),
            })?;

        info!(
            "Loaded {} CNI network(s) from '{}'",
            configs.len(),
            config_dir.display()
        );

        Ok(Self {
            configs,
            active: Some(Active { store, plugin_dir }),
            recovery_policy: flags.recovery_policy,
            infos: Mutex::new(HashMap::new()),
        })
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// IDs of the containers currently tracked.
    pub async fn containers(&self) -> Vec<String> {
        let infos = self.infos.lock().await;
        let mut ids: Vec<String> = infos.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The attachments of one container, ordered by interface name, or
    /// `None` if the container is not tracked.
    pub async fn attachments(&self, container_id: &str) -> Option<Vec<NetworkAttachment>> {
        let infos = self.infos.lock().await;
        infos.get(container_id).map(|info| {
            let mut attachments: Vec<NetworkAttachment> =
                info.attachments.values().cloned().collect();
            attachments.sort_by(|a, b| a.if_name.cmp(&b.if_name));
            attachments
        })
    }

    /// Renders the agent-facing [`NetworkInfo`] records for one
    /// container, carrying the plugin-assigned addresses.
    pub async fn network_infos(&self, container_id: &str) -> Option<Vec<NetworkInfo>> {
        self.attachments(container_id).await.map(|attachments| {
            attachments
                .into_iter()
                .map(|attachment| {
                    let mut ip_addresses = Vec::new();
                    if let Some(result) = &attachment.result {
                        if let Some(ip4) = &result.ip4 {
                            ip_addresses.push(ip4.ip.clone());
                        }
                        if let Some(ip6) = &result.ip6 {
                            ip_addresses.push(ip6.ip.clone());
                        }
                    }
                    NetworkInfo {
                        name: Some(attachment.network_name),
                        ip_addresses,
                    }
                })
                .collect()
        })
    }

    // =========================================================================
    // Attach / Detach (per-network plugin drives)
    // =========================================================================

    /// Runs one `ADD` against the named network and checkpoints its
    /// result.
    async fn attach(
        &self,
        container_id: &str,
        network: &str,
        if_name: &str,
        ns_handle: &Path,
        active: &Active,
    ) -> Result<CniNetworkInfo> {
        let network_config = self
            .configs
            .get(network)
            .ok_or_else(|| Error::UnknownNetwork(network.to_string()))?;

        active
            .store
            .create_interface_dir(container_id, network, if_name)?;

        let env = PluginEnv {
            command: CniCommand::Add,
            container_id: container_id.to_string(),
            plugin_dir: active.plugin_dir.clone(),
            if_name: if_name.to_string(),
            netns: ns_handle.to_path_buf(),
        };

        let plugin_name = &network_config.config.plugin;
        let plugin_path = active.plugin_dir.join(plugin_name);
        let output =
            plugin::run_plugin(&plugin_path, plugin_name, &network_config.bytes, &env).await?;

        match output.status {
            Some(0) => {}
            Some(_) => {
                return Err(Error::AttachFailed {
                    plugin: plugin_name.clone(),
                    container: container_id.to_string(),
                    network: network.to_string(),
                    output: output.stdout,
                })
            }
            None => {
                return Err(Error::PluginReapFailed {
                    plugin: plugin_name.clone(),
                })
            }
        }

        let result = spec::parse_network_info(output.stdout.as_bytes()).map_err(|e| {
            Error::ResultParseFailed {
                plugin: plugin_name.clone(),
                reason: e.to_string(),
            }
        })?;

        if let Some(ip4) = &result.ip4 {
            info!(
                "Got assigned IPv4 address '{}' from CNI network '{}' for container {}",
                ip4.ip, network, container_id
            );
        }
        if let Some(ip6) = &result.ip6 {
            info!(
                "Got assigned IPv6 address '{}' from CNI network '{}' for container {}",
                ip6.ip, network, container_id
            );
        }

        active
            .store
            .write_info(container_id, network, if_name, output.stdout.as_bytes())?;

        Ok(result)
    }

    /// Runs one `DEL` against the named network and, on success,
    /// removes the interface checkpoint.
    ///
    /// `CNI_NETNS` points at the bind-mounted handle, never at a
    /// `/proc/<pid>` path: the container process may be long gone.
    async fn detach(
        &self,
        container_id: &str,
        network: &str,
        if_name: &str,
        active: &Active,
    ) -> Result<()> {
        let network_config = self
            .configs
            .get(network)
            .ok_or_else(|| Error::UnknownNetwork(network.to_string()))?;

        let env = PluginEnv {
            command: CniCommand::Del,
            container_id: container_id.to_string(),
            plugin_dir: active.plugin_dir.clone(),
            if_name: if_name.to_string(),
            netns: active.store.namespace_handle(container_id),
        };

        let plugin_name = &network_config.config.plugin;
        let plugin_path = active.plugin_dir.join(plugin_name);
        let output =
            plugin::run_plugin(&plugin_path, plugin_name, &network_config.bytes, &env).await?;

        match output.status {
            Some(0) => active.store.remove_interface(container_id, network, if_name),
            Some(_) => Err(Error::DetachFailed {
                plugin: plugin_name.clone(),
                container: container_id.to_string(),
                network: network.to_string(),
                output: output.stdout,
            }),
            None => Err(Error::PluginReapFailed {
                plugin: plugin_name.clone(),
            }),
        }
    }

    // =========================================================================
    // Cleanup / Recovery Internals
    // =========================================================================

    /// The body of `cleanup`, callable while the table lock is already
    /// held (recovery synthesizes cleanups for unknown orphans).
    async fn cleanup_locked(
        &self,
        infos: &mut HashMap<String, ContainerInfo>,
        container_id: &str,
    ) -> Result<()> {
        let Some(info) = infos.get(container_id) else {
            return Ok(());
        };
        let Some(active) = &self.active else {
            return Ok(());
        };

        let attachments: Vec<(String, String)> = info
            .attachments
            .values()
            .map(|a| (a.network_name.clone(), a.if_name.clone()))
            .collect();

        let detaches = join_all(attachments.iter().map(|(network, if_name)| {
            self.detach(container_id, network, if_name, active)
        }))
        .await;

        let messages: Vec<String> = detaches
            .into_iter()
            .filter_map(|detach| detach.err().map(|e| e.to_string()))
            .collect();

        // A failed detach leaves the table entry in place: the agent
        // may retry cleanup and the remaining interfaces still need
        // their DEL.
        if !messages.is_empty() {
            return Err(Error::Aggregate(messages));
        }

        mount::unbind_namespace(&active.store.namespace_handle(container_id))?;
        active.store.remove_container(container_id)?;
        infos.remove(container_id);

        Ok(())
    }

    /// Rebuilds one container's table entry from its checkpoint
    /// directory.
    ///
    /// Inserts an entry only when cleanup might still be required: a
    /// container without a checkpoint directory either never reached
    /// `isolate`, finished cleanup already, or joined the host network,
    /// and needs no bookkeeping. An entry is inserted even when no
    /// attachment could be reconstructed, so that the leftover
    /// directory and namespace handle still get removed.
    fn recover_container(
        &self,
        infos: &mut HashMap<String, ContainerInfo>,
        container_id: &str,
        active: &Active,
    ) -> Result<()> {
        if !active.store.container_exists(container_id) {
            return Ok(());
        }

        let mut attachments = HashMap::new();
        for network in active.store.list_networks(container_id)? {
            if !self.configs.contains_key(&network) {
                return Err(Error::UnknownNetwork(network));
            }

            let interfaces = active.store.list_interfaces(container_id, &network)?;

            // A crash between interface-directory removal in detach and
            // container-directory removal in cleanup leaves a network
            // directory with no interfaces.
            if interfaces.is_empty() {
                continue;
            }

            if interfaces.len() != 1 {
                return Err(Error::TooManyInterfaces(network));
            }

            let if_name = interfaces.into_iter().next().unwrap_or_default();
            let info_path = active.store.network_info_path(container_id, &network, &if_name);

            let result = match active.store.read_info(container_id, &network, &if_name) {
                Ok(None) => {
                    // Crash before the ADD result was checkpointed; the
                    // DEL path does not need it.
                    warn!(
                        "The checkpointed CNI plugin output '{}' for container {} does not exist",
                        info_path.display(),
                        container_id
                    );
                    None
                }
                Ok(Some(bytes)) => match spec::parse_network_info(&bytes) {
                    Ok(parsed) => Some(parsed),
                    Err(e) => match self.recovery_policy {
                        RecoveryPolicy::Strict => {
                            return Err(Error::CheckpointCorrupt {
                                path: info_path,
                                reason: e.to_string(),
                            })
                        }
                        RecoveryPolicy::Lenient => {
                            warn!(
                                "Ignoring corrupt CNI plugin output '{}' for container {}: {}",
                                info_path.display(),
                                container_id,
                                e
                            );
                            None
                        }
                    },
                },
                Err(e) => match self.recovery_policy {
                    RecoveryPolicy::Strict => return Err(e),
                    RecoveryPolicy::Lenient => {
                        warn!(
                            "Ignoring unreadable CNI plugin output '{}' for container {}: {}",
                            info_path.display(),
                            container_id,
                            e
                        );
                        None
                    }
                },
            };

            attachments.insert(
                network.clone(),
                NetworkAttachment {
                    network_name: network,
                    if_name,
                    result,
                },
            );
        }

        infos.insert(container_id.to_string(), ContainerInfo { attachments });

        Ok(())
    }
}

// =============================================================================
// Isolator Hooks
// =============================================================================

#[async_trait]
impl Isolator for NetworkCniIsolator {
    async fn recover(&self, states: &[ContainerState], orphans: &HashSet<String>) -> Result<()> {
        let mut infos = self.infos.lock().await;

        let Some(active) = &self.active else {
            return Ok(());
        };

        for state in states {
            self.recover_container(&mut infos, &state.container_id, active)
                .map_err(|e| Error::RecoveryFailed {
                    container: state.container_id.clone(),
                    reason: e.to_string(),
                })?;
        }

        for container_id in active.store.list_containers()? {
            if infos.contains_key(&container_id) {
                continue;
            }

            self.recover_container(&mut infos, &container_id, active)
                .map_err(|e| Error::RecoveryFailed {
                    container: container_id.clone(),
                    reason: e.to_string(),
                })?;

            // Known orphans are cleaned up by the agent through the
            // normal cleanup path.
            if orphans.contains(&container_id) {
                continue;
            }

            info!("Removing unknown orphaned container {}", container_id);

            if let Err(e) = self.cleanup_locked(&mut infos, &container_id).await {
                warn!(
                    "Failed to clean up unknown orphaned container {}: {}",
                    container_id, e
                );
            }
        }

        Ok(())
    }

    async fn prepare(
        &self,
        container_id: &str,
        container_config: &ContainerConfig,
    ) -> Result<Option<LaunchInfo>> {
        let mut infos = self.infos.lock().await;

        if infos.contains_key(container_id) {
            return Err(Error::AlreadyPrepared);
        }

        let Some(container) = &container_config.container else {
            return Ok(None);
        };

        if container.container_type != ContainerType::Mesos {
            return Err(Error::UnsupportedContainerType);
        }

        let mut attachments = HashMap::new();
        let mut if_index = 0;
        for request in &container.network_infos {
            let Some(name) = &request.name else {
                continue;
            };

            if !self.configs.contains_key(name) {
                return Err(Error::UnknownNetwork(name.clone()));
            }

            if attachments.contains_key(name) {
                return Err(Error::DuplicateNetworkRequest(name.clone()));
            }

            attachments.insert(
                name.clone(),
                NetworkAttachment {
                    network_name: name.clone(),
                    if_name: format!("{IFNAME_PREFIX}{if_index}"),
                    result: None,
                },
            );
            if_index += 1;
        }

        if attachments.is_empty() {
            return Ok(None);
        }

        infos.insert(container_id.to_string(), ContainerInfo { attachments });

        Ok(Some(LaunchInfo {
            namespaces: CONTAINER_NAMESPACES,
        }))
    }

    async fn isolate(&self, container_id: &str, pid: u32) -> Result<()> {
        let mut infos = self.infos.lock().await;

        // No entry means host networking; nothing to isolate.
        let attachments: Vec<(String, String)> = match infos.get(container_id) {
            Some(info) => info
                .attachments
                .values()
                .map(|a| (a.network_name.clone(), a.if_name.clone()))
                .collect(),
            None => return Ok(()),
        };
        let Some(active) = &self.active else {
            return Ok(());
        };

        active.store.create_container_dir(container_id)?;

        // Pin the container's network namespace under the checkpoint
        // root; the handle is what keeps the namespace alive for DEL
        // after the container process exits.
        let ns_handle = active.store.namespace_handle(container_id);
        mount::bind_namespace(&ns_handle, pid)?;

        let ns = &ns_handle;
        let attaches = join_all(attachments.iter().map(|(network, if_name)| async move {
            let result = self
                .attach(container_id, network, if_name, ns, active)
                .await;
            (network.clone(), result)
        }))
        .await;

        // Record every successful attach, then fail with the joined
        // messages if any network failed. No DEL is issued here: the
        // agent's destruction path calls cleanup, which owns DEL, and
        // since every ADD has terminated by now none can still be in
        // flight when it does.
        let mut messages = Vec::new();
        for (network, result) in attaches {
            match result {
                Ok(parsed) => {
                    if let Some(info) = infos.get_mut(container_id) {
                        if let Some(attachment) = info.attachments.get_mut(&network) {
                            attachment.result = Some(parsed);
                        }
                    }
                }
                Err(e) => messages.push(e.to_string()),
            }
        }

        if messages.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate(messages))
        }
    }

    async fn cleanup(&self, container_id: &str) -> Result<()> {
        let mut infos = self.infos.lock().await;
        self.cleanup_locked(&mut infos, container_id).await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolator::ContainerSpec;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Builds an isolator over temp directories without the privileged
    /// startup path (no root requirement, no mount calls).
    fn isolator(root: &Path, plugins: &Path, networks: &[(&str, &str)]) -> NetworkCniIsolator {
        let mut configs = HashMap::new();
        for (name, plugin) in networks {
            let bytes = format!(r#"{{"name":"{name}","type":"{plugin}"}}"#).into_bytes();
            let config = spec::parse_network_config(&bytes).unwrap();
            configs.insert(
                (*name).to_string(),
                NetworkConfigInfo {
                    config,
                    path: plugins.join(format!("{name}.json")),
                    bytes,
                },
            );
        }

        NetworkCniIsolator {
            configs,
            active: Some(Active {
                store: CheckpointStore::new(root).unwrap(),
                plugin_dir: plugins.to_path_buf(),
            }),
            recovery_policy: RecoveryPolicy::Strict,
            infos: Mutex::new(HashMap::new()),
        }
    }

    fn write_plugin(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn config_with(networks: &[&str]) -> ContainerConfig {
        ContainerConfig {
            container: Some(ContainerSpec {
                container_type: ContainerType::Mesos,
                network_infos: networks.iter().map(|n| NetworkInfo::named(*n)).collect(),
            }),
        }
    }

    #[tokio::test]
    async fn test_prepare_assigns_interfaces_in_request_order() {
        let root = TempDir::new().unwrap();
        let plugins = TempDir::new().unwrap();
        let isolator = isolator(
            root.path(),
            plugins.path(),
            &[("net1", "mock"), ("net2", "mock")],
        );

        let launch = isolator
            .prepare("c1", &config_with(&["net2", "net1"]))
            .await
            .unwrap()
            .expect("launch info expected");

        assert!(launch.namespaces.contains(CloneFlags::CLONE_NEWNET));
        assert!(launch.namespaces.contains(CloneFlags::CLONE_NEWNS));
        assert!(launch.namespaces.contains(CloneFlags::CLONE_NEWUTS));

        let attachments = isolator.attachments("c1").await.unwrap();
        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[0].if_name, "eth0");
        assert_eq!(attachments[0].network_name, "net2");
        assert_eq!(attachments[1].if_name, "eth1");
        assert_eq!(attachments[1].network_name, "net1");
        assert!(attachments.iter().all(|a| a.result.is_none()));
    }

    #[tokio::test]
    async fn test_prepare_without_container_spec_is_not_applicable() {
        let root = TempDir::new().unwrap();
        let plugins = TempDir::new().unwrap();
        let isolator = isolator(root.path(), plugins.path(), &[("net1", "mock")]);

        let launch = isolator
            .prepare("c1", &ContainerConfig::default())
            .await
            .unwrap();

        assert!(launch.is_none());
        assert!(isolator.containers().await.is_empty());
    }

    #[tokio::test]
    async fn test_prepare_host_network_is_not_applicable() {
        let root = TempDir::new().unwrap();
        let plugins = TempDir::new().unwrap();
        let isolator = isolator(root.path(), plugins.path(), &[("net1", "mock")]);

        // Requests without a network name mean host networking.
        let config = ContainerConfig {
            container: Some(ContainerSpec {
                container_type: ContainerType::Mesos,
                network_infos: vec![NetworkInfo::default()],
            }),
        };

        assert!(isolator.prepare("c1", &config).await.unwrap().is_none());
        assert!(isolator.containers().await.is_empty());
    }

    #[tokio::test]
    async fn test_prepare_rejects_docker_containers() {
        let root = TempDir::new().unwrap();
        let plugins = TempDir::new().unwrap();
        let isolator = isolator(root.path(), plugins.path(), &[("net1", "mock")]);

        let config = ContainerConfig {
            container: Some(ContainerSpec {
                container_type: ContainerType::Docker,
                network_infos: vec![NetworkInfo::named("net1")],
            }),
        };

        assert!(matches!(
            isolator.prepare("c1", &config).await,
            Err(Error::UnsupportedContainerType)
        ));
    }

    #[tokio::test]
    async fn test_prepare_rejects_unknown_network_without_state() {
        let root = TempDir::new().unwrap();
        let plugins = TempDir::new().unwrap();
        let isolator = isolator(root.path(), plugins.path(), &[("net1", "mock")]);

        let result = isolator.prepare("c1", &config_with(&["bogus"])).await;

        assert!(matches!(result, Err(Error::UnknownNetwork(name)) if name == "bogus"));
        assert!(isolator.containers().await.is_empty());
        assert!(!root.path().join("c1").exists());
    }

    #[tokio::test]
    async fn test_prepare_rejects_duplicate_network_without_state() {
        let root = TempDir::new().unwrap();
        let plugins = TempDir::new().unwrap();
        let isolator = isolator(root.path(), plugins.path(), &[("net1", "mock")]);

        let result = isolator.prepare("c1", &config_with(&["net1", "net1"])).await;

        assert!(matches!(result, Err(Error::DuplicateNetworkRequest(_))));
        assert!(isolator.containers().await.is_empty());
    }

    #[tokio::test]
    async fn test_prepare_twice_fails() {
        let root = TempDir::new().unwrap();
        let plugins = TempDir::new().unwrap();
        let isolator = isolator(root.path(), plugins.path(), &[("net1", "mock")]);

        isolator
            .prepare("c1", &config_with(&["net1"]))
            .await
            .unwrap();

        assert!(matches!(
            isolator.prepare("c1", &config_with(&["net1"])).await,
            Err(Error::AlreadyPrepared)
        ));
    }

    #[tokio::test]
    async fn test_isolate_and_cleanup_are_noops_for_untracked_containers() {
        let root = TempDir::new().unwrap();
        let plugins = TempDir::new().unwrap();
        let isolator = isolator(root.path(), plugins.path(), &[("net1", "mock")]);

        isolator.isolate("ghost", 1234).await.unwrap();
        isolator.cleanup("ghost").await.unwrap();

        assert!(isolator.containers().await.is_empty());
    }

    #[tokio::test]
    async fn test_recover_rebuilds_attachment_from_checkpoint() {
        let root = TempDir::new().unwrap();
        let plugins = TempDir::new().unwrap();
        write_plugin(plugins.path(), "mock", "exit 0\n");
        let isolator = isolator(root.path(), plugins.path(), &[("net1", "mock")]);

        let store = CheckpointStore::new(root.path()).unwrap();
        store
            .write_info("c1", "net1", "eth0", br#"{"ip4":{"ip":"10.0.0.5/24"}}"#)
            .unwrap();

        isolator
            .recover(&[ContainerState::new("c1")], &HashSet::new())
            .await
            .unwrap();

        let attachments = isolator.attachments("c1").await.unwrap();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].if_name, "eth0");
        assert_eq!(
            attachments[0].result.as_ref().unwrap().ip4.as_ref().unwrap().ip,
            "10.0.0.5/24"
        );
    }

    #[tokio::test]
    async fn test_recover_without_checkpointed_result() {
        // Crash between the plugin ADD and the checkpoint write: the
        // interface directory exists but the info file does not.
        let root = TempDir::new().unwrap();
        let plugins = TempDir::new().unwrap();
        write_plugin(plugins.path(), "mock", "exit 0\n");
        let isolator = isolator(root.path(), plugins.path(), &[("net1", "mock")]);

        let store = CheckpointStore::new(root.path()).unwrap();
        store.create_interface_dir("c1", "net1", "eth0").unwrap();

        isolator
            .recover(&[ContainerState::new("c1")], &HashSet::new())
            .await
            .unwrap();

        let attachments = isolator.attachments("c1").await.unwrap();
        assert_eq!(attachments.len(), 1);
        assert!(attachments[0].result.is_none());

        // The DEL path does not need the parsed result.
        isolator.cleanup("c1").await.unwrap();
        assert!(!root.path().join("c1").exists());
        assert!(isolator.containers().await.is_empty());
    }

    #[tokio::test]
    async fn test_recover_tolerates_network_dir_without_interfaces() {
        // Crash between interface-directory removal in detach and
        // container-directory removal in cleanup.
        let root = TempDir::new().unwrap();
        let plugins = TempDir::new().unwrap();
        write_plugin(plugins.path(), "mock", "exit 0\n");
        let isolator = isolator(root.path(), plugins.path(), &[("net1", "mock")]);

        fs::create_dir_all(root.path().join("c1").join("net1")).unwrap();

        isolator
            .recover(&[ContainerState::new("c1")], &HashSet::new())
            .await
            .unwrap();

        // The empty entry still exists so cleanup removes the leftovers.
        assert_eq!(isolator.containers().await, vec!["c1"]);
        assert!(isolator.attachments("c1").await.unwrap().is_empty());

        isolator.cleanup("c1").await.unwrap();
        assert!(!root.path().join("c1").exists());
    }

    #[tokio::test]
    async fn test_recover_rejects_multiple_interfaces() {
        let root = TempDir::new().unwrap();
        let plugins = TempDir::new().unwrap();
        let isolator = isolator(root.path(), plugins.path(), &[("net1", "mock")]);

        let store = CheckpointStore::new(root.path()).unwrap();
        store.create_interface_dir("c1", "net1", "eth0").unwrap();
        store.create_interface_dir("c1", "net1", "eth1").unwrap();

        let result = isolator
            .recover(&[ContainerState::new("c1")], &HashSet::new())
            .await;

        assert!(matches!(result, Err(Error::RecoveryFailed { .. })));
    }

    #[tokio::test]
    async fn test_recover_rejects_unknown_network_directory() {
        let root = TempDir::new().unwrap();
        let plugins = TempDir::new().unwrap();
        let isolator = isolator(root.path(), plugins.path(), &[("net1", "mock")]);

        let store = CheckpointStore::new(root.path()).unwrap();
        store.create_interface_dir("c1", "forgotten", "eth0").unwrap();

        let result = isolator
            .recover(&[ContainerState::new("c1")], &HashSet::new())
            .await;

        assert!(matches!(result, Err(Error::RecoveryFailed { .. })));
    }

    #[tokio::test]
    async fn test_recover_corrupt_checkpoint_is_strict_by_default() {
        let root = TempDir::new().unwrap();
        let plugins = TempDir::new().unwrap();
        let isolator = isolator(root.path(), plugins.path(), &[("net1", "mock")]);

        let store = CheckpointStore::new(root.path()).unwrap();
        store
            .write_info("c1", "net1", "eth0", br#"{"ip4":{"ip":"10."#)
            .unwrap();

        let result = isolator
            .recover(&[ContainerState::new("c1")], &HashSet::new())
            .await;

        assert!(matches!(result, Err(Error::RecoveryFailed { .. })));
    }

    #[tokio::test]
    async fn test_recover_corrupt_checkpoint_lenient_policy() {
        let root = TempDir::new().unwrap();
        let plugins = TempDir::new().unwrap();
        write_plugin(plugins.path(), "mock", "exit 0\n");
        let mut isolator = isolator(root.path(), plugins.path(), &[("net1", "mock")]);
        isolator.recovery_policy = RecoveryPolicy::Lenient;

        let store = CheckpointStore::new(root.path()).unwrap();
        store
            .write_info("c1", "net1", "eth0", br#"{"ip4":{"ip":"10."#)
            .unwrap();

        isolator
            .recover(&[ContainerState::new("c1")], &HashSet::new())
            .await
            .unwrap();

        let attachments = isolator.attachments("c1").await.unwrap();
        assert_eq!(attachments.len(), 1);
        assert!(attachments[0].result.is_none());
    }

    #[tokio::test]
    async fn test_recover_cleans_up_unknown_orphans() {
        let root = TempDir::new().unwrap();
        let plugins = TempDir::new().unwrap();
        write_plugin(plugins.path(), "mock", "exit 0\n");
        let isolator = isolator(root.path(), plugins.path(), &[("net1", "mock")]);

        let store = CheckpointStore::new(root.path()).unwrap();
        store
            .write_info("c2", "net1", "eth0", br#"{"ip4":{"ip":"10.0.0.7/24"}}"#)
            .unwrap();

        // c2 is neither a known container nor a known orphan.
        isolator.recover(&[], &HashSet::new()).await.unwrap();

        assert!(!root.path().join("c2").exists());
        assert!(isolator.containers().await.is_empty());
    }

    #[tokio::test]
    async fn test_recover_leaves_known_orphans_to_the_agent() {
        let root = TempDir::new().unwrap();
        let plugins = TempDir::new().unwrap();
        write_plugin(plugins.path(), "mock", "exit 0\n");
        let isolator = isolator(root.path(), plugins.path(), &[("net1", "mock")]);

        let store = CheckpointStore::new(root.path()).unwrap();
        store
            .write_info("c2", "net1", "eth0", br#"{"ip4":{"ip":"10.0.0.7/24"}}"#)
            .unwrap();

        let orphans: HashSet<String> = ["c2".to_string()].into();
        isolator.recover(&[], &orphans).await.unwrap();

        // Recovered, not cleaned: the agent will call cleanup itself.
        assert_eq!(isolator.containers().await, vec!["c2"]);
        assert!(root.path().join("c2").exists());

        isolator.cleanup("c2").await.unwrap();
        assert!(!root.path().join("c2").exists());
    }

    #[tokio::test]
    async fn test_recover_twice_is_idempotent() {
        let root = TempDir::new().unwrap();
        let plugins = TempDir::new().unwrap();
        write_plugin(plugins.path(), "mock", "exit 0\n");
        let isolator = isolator(root.path(), plugins.path(), &[("net1", "mock")]);

        let store = CheckpointStore::new(root.path()).unwrap();
        store
            .write_info("c1", "net1", "eth0", br#"{"ip4":{"ip":"10.0.0.5/24"}}"#)
            .unwrap();

        let states = [ContainerState::new("c1")];
        isolator.recover(&states, &HashSet::new()).await.unwrap();
        let first = isolator.attachments("c1").await.unwrap();

        isolator.recover(&states, &HashSet::new()).await.unwrap();
        let second = isolator.attachments("c1").await.unwrap();

        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].if_name, second[0].if_name);
        assert_eq!(first[0].result, second[0].result);
    }

    #[tokio::test]
    async fn test_cleanup_failure_keeps_state_for_retry() {
        let root = TempDir::new().unwrap();
        let plugins = TempDir::new().unwrap();
        // DEL fails on the first run, then a marker flips it to succeed.
        let marker = root.path().join("del-attempted");
        write_plugin(
            plugins.path(),
            "mock",
            &format!(
                "if [ -e {m} ]; then exit 0; fi\ntouch {m}\necho '{{\"msg\":\"device busy\"}}'\nexit 1\n",
                m = marker.display()
            ),
        );
        let isolator = isolator(root.path(), plugins.path(), &[("net1", "mock")]);

        let store = CheckpointStore::new(root.path()).unwrap();
        store
            .write_info("c1", "net1", "eth0", br#"{"ip4":{"ip":"10.0.0.5/24"}}"#)
            .unwrap();
        isolator
            .recover(&[ContainerState::new("c1")], &HashSet::new())
            .await
            .unwrap();

        let failed = isolator.cleanup("c1").await;
        assert!(failed.unwrap_err().to_string().contains("device busy"));
        assert_eq!(isolator.containers().await, vec!["c1"]);
        assert!(root.path().join("c1").exists());

        // The retry progresses to completion.
        isolator.cleanup("c1").await.unwrap();
        assert!(isolator.containers().await.is_empty());
        assert!(!root.path().join("c1").exists());
    }

    #[tokio::test]
    async fn test_network_infos_surface_assigned_addresses() {
        let root = TempDir::new().unwrap();
        let plugins = TempDir::new().unwrap();
        write_plugin(plugins.path(), "mock", "exit 0\n");
        let isolator = isolator(root.path(), plugins.path(), &[("net1", "mock")]);

        let store = CheckpointStore::new(root.path()).unwrap();
        store
            .write_info(
                "c1",
                "net1",
                "eth0",
                br#"{"ip4":{"ip":"10.0.0.5/24"},"ip6":{"ip":"fd00::5/64"}}"#,
            )
            .unwrap();
        isolator
            .recover(&[ContainerState::new("c1")], &HashSet::new())
            .await
            .unwrap();

        let infos = isolator.network_infos("c1").await.unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name.as_deref(), Some("net1"));
        assert_eq!(infos[0].ip_addresses, vec!["10.0.0.5/24", "fd00::5/64"]);
    }
}
