//! Isolator interface - the agent-facing lifecycle hook surface.
//!
//! The container-execution agent drives every isolator through the same
//! set of hooks:
//!
//! ```text
//! recover(states, orphans)            agent restart
//! prepare(id, config) → LaunchInfo?   before the container is forked
//! isolate(id, pid)                    container exists, user code not yet run
//! cleanup(id)                         container destruction
//! watch / update / usage / status     inert for this isolator
//! ```
//!
//! This module defines the trait and the records that cross it; the CNI
//! implementation lives in [`crate::cni`].

use async_trait::async_trait;
use nix::sched::CloneFlags;
use std::collections::HashSet;

use crate::error::Result;

// =============================================================================
// Agent-Facing Records
// =============================================================================

/// The kind of containerizer a container was launched with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerType {
    /// The agent's native containerizer. The only type CNI networks are
    /// supported for.
    Mesos,
    /// An external Docker containerizer.
    Docker,
}

/// A network a container asks to join, and - after a successful attach -
/// the addresses it was assigned there.
///
/// An entry without a `name` requests host networking and is ignored by
/// this isolator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Name of a configured CNI network.
    pub name: Option<String>,
    /// Addresses assigned by the network's plugin.
    pub ip_addresses: Vec<String>,
}

impl NetworkInfo {
    /// A request to join the named network.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ip_addresses: Vec::new(),
        }
    }
}

/// The container description handed to `prepare`.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// The container specification, if the executor carries one.
    pub container: Option<ContainerSpec>,
}

/// The container specification inside a [`ContainerConfig`].
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Containerizer type.
    pub container_type: ContainerType,
    /// Networks the container asks to join, in request order.
    pub network_infos: Vec<NetworkInfo>,
}

/// Launch adjustments an isolator requests from the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchInfo {
    /// Namespaces the container must be cloned into.
    pub namespaces: CloneFlags,
}

/// A known container the agent reports during recovery.
#[derive(Debug, Clone)]
pub struct ContainerState {
    /// ID of the container.
    pub container_id: String,
}

impl ContainerState {
    /// A state record for the given container.
    #[must_use]
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
        }
    }
}

// =============================================================================
// Inert Hook Records
// =============================================================================

/// A resource limitation reported by `watch`. This isolator never
/// reports one.
#[derive(Debug, Clone, Default)]
pub struct ContainerLimitation {}

/// Resource statistics reported by `usage`. This isolator contributes
/// none.
#[derive(Debug, Clone, Default)]
pub struct ResourceStatistics {}

/// Container status reported by `status`. This isolator contributes
/// none.
#[derive(Debug, Clone, Default)]
pub struct ContainerStatus {}

// =============================================================================
// Isolator Trait
// =============================================================================

/// Per-container lifecycle hooks the agent delegates to an isolator.
///
/// Hooks for one container are called strictly in
/// `prepare < isolate < cleanup` order; `recover` replaces `prepare`
/// and `isolate` after an agent restart.
#[async_trait]
pub trait Isolator: Send + Sync {
    /// Rebuilds in-memory state after an agent restart.
    ///
    /// `states` lists the containers the agent still knows; `orphans`
    /// are containers the agent knows it must clean up through its
    /// normal path. Anything else found on disk is cleaned up here.
    async fn recover(&self, states: &[ContainerState], orphans: &HashSet<String>) -> Result<()>;

    /// Validates the container's network requests and claims launch
    /// adjustments.
    ///
    /// Returns `None` when the isolator has nothing to contribute (no
    /// container spec, or host networking).
    async fn prepare(
        &self,
        container_id: &str,
        container_config: &ContainerConfig,
    ) -> Result<Option<LaunchInfo>>;

    /// Attaches the container to its networks.
    ///
    /// Called after the container process exists in its new namespaces
    /// and before it runs user code.
    async fn isolate(&self, container_id: &str, pid: u32) -> Result<()>;

    /// Detaches the container from its networks and releases all
    /// bookkeeping.
    async fn cleanup(&self, container_id: &str) -> Result<()>;

    // =========================================================================
    // Inert Hooks
    // =========================================================================

    /// Watches for resource limitations. Never resolves for this
    /// isolator.
    async fn watch(&self, container_id: &str) -> Result<Option<ContainerLimitation>> {
        let _ = container_id;
        Ok(None)
    }

    /// Applies a resource update. Nothing to do for networks.
    async fn update(&self, container_id: &str) -> Result<()> {
        let _ = container_id;
        Ok(())
    }

    /// Reports resource statistics. Networks contribute none.
    async fn usage(&self, container_id: &str) -> Result<ResourceStatistics> {
        let _ = container_id;
        Ok(ResourceStatistics::default())
    }

    /// Reports container status. Networks contribute none.
    async fn status(&self, container_id: &str) -> Result<ContainerStatus> {
        let _ = container_id;
        Ok(ContainerStatus::default())
    }
}
