//! Constants for the CNI network isolator.
//!
//! Paths, file names, and environment defaults are defined here to
//! keep the on-disk layout and the plugin contract in one place.

// =============================================================================
// Checkpoint Layout
// =============================================================================

/// Default root of the on-disk checkpoint hierarchy.
///
/// Each container the isolator manages gets a `<ROOT_DIR>/<container-id>/`
/// subtree holding its network-namespace handle and per-network plugin
/// results.
pub const ROOT_DIR: &str = "/var/run/mesos/isolators/network/cni";

/// Name of the bind-mounted network-namespace handle inside a container
/// directory.
pub const NS_HANDLE_FILE: &str = "ns";

/// Directory component holding the checkpointed plugin result inside an
/// interface directory.
pub const NETWORK_INFO_DIR: &str = "network";

/// File name of the checkpointed plugin result.
pub const NETWORK_INFO_FILE: &str = "info";

// =============================================================================
// Interface Naming
// =============================================================================

/// Prefix for interface names assigned inside container namespaces.
///
/// Interfaces are named `eth0`, `eth1`, ... in the order the container
/// requested its networks.
pub const IFNAME_PREFIX: &str = "eth";

// =============================================================================
// Plugin Environment
// =============================================================================

/// Fallback `PATH` handed to CNI plugins when the agent itself has none.
///
/// Plugins routinely shell out to `iptables`, `ip`, and friends, so they
/// need a usable search path even when the agent was started without one.
pub const DEFAULT_PLUGIN_PATH: &str =
    "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
