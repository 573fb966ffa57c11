//! # cni-isolator
//!
//! **Container network isolation via CNI plugins**
//!
//! This crate attaches Linux containers to software-defined networks
//! through externally-supplied Container Network Interface (CNI)
//! plugins. It is the network isolator module of a container-execution
//! agent: the agent delegates per-container prepare / isolate / cleanup
//! lifecycle hooks here, and this crate drives the plugins, pins
//! network namespaces, and checkpoints every attachment so a restarted
//! agent can pick up exactly where it crashed.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │  agent                                                             │
//! │     │ prepare / isolate / cleanup / recover                        │
//! │     ▼                                                              │
//! │  ┌──────────────────────────────────────────────────────────────┐  │
//! │  │  NetworkCniIsolator (lifecycle core)                         │  │
//! │  │  - container table: id → {network → attachment}              │  │
//! │  │  - hooks serialized; per-network fan-out awaits all          │  │
//! │  └───────┬──────────────┬───────────────┬──────────────────────┘  │
//! │          │              │               │                         │
//! │          ▼              ▼               ▼                         │
//! │  ┌──────────────┐ ┌───────────┐ ┌─────────────────────┐           │
//! │  │ plugin runner│ │ checkpoint│ │ mount manager       │           │
//! │  │ env + stdin/ │ │ store     │ │ shared root,        │           │
//! │  │ stdout pipes │ │ <root>/<id>│ │ net-ns bind mounts │           │
//! │  └──────┬───────┘ └───────────┘ └─────────────────────┘           │
//! │         │ CNI_COMMAND=ADD|DEL                                     │
//! │         ▼                                                         │
//! │  plugin executables (bridge, ipvlan, ... — opaque to this crate)  │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! ```text
//!   (absent) ──prepare──▶ PREPARED ──isolate──▶ ISOLATED ──cleanup──▶ (absent)
//!                                       │
//!           agent restart ──recover─────┴──▶ reconstructed from checkpoints
//! ```
//!
//! - **prepare** validates the requested networks, assigns `eth0`,
//!   `eth1`, ... in request order, and asks the agent for new network,
//!   mount, and UTS namespaces.
//! - **isolate** pins the container's network namespace with a bind
//!   mount, then runs one plugin `ADD` per network concurrently and
//!   checkpoints each result.
//! - **cleanup** runs the matching `DEL`s against the pinned namespace
//!   handle (the container process may already be gone), releases the
//!   handle, and removes the checkpoint directory.
//! - **recover** rebuilds the container table from the checkpoint
//!   hierarchy after an agent crash, tolerating every partial-write
//!   state the crash could have left, and disposes of containers the
//!   agent no longer knows.
//!
//! Containers that name no CNI network never touch this crate's state:
//! they share the host network and the isolator stays transparent.
//!
//! # Example
//!
//! ```rust,ignore
//! use cni_isolator::{CniFlags, Isolator, NetworkCniIsolator};
//!
//! let isolator = NetworkCniIsolator::new(&CniFlags::new(
//!     "/opt/cni/bin",
//!     "/etc/cni/net.d",
//! ))?;
//!
//! // On agent restart, before any other hook:
//! isolator.recover(&known_states, &orphan_ids).await?;
//!
//! // Per container launch:
//! let launch = isolator.prepare(&container_id, &container_config).await?;
//! isolator.isolate(&container_id, pid).await?;
//!
//! // Per container destruction:
//! isolator.cleanup(&container_id).await?;
//! ```

// =============================================================================
// Modules
// =============================================================================

pub mod checkpoint;
pub mod cni;
pub mod config;
pub mod constants;
pub mod error;
pub mod isolator;
pub mod mount;
pub mod plugin;
pub mod spec;

// =============================================================================
// Re-exports
// =============================================================================

pub use checkpoint::CheckpointStore;
pub use cni::{NetworkAttachment, NetworkCniIsolator};
pub use config::{CniFlags, NetworkConfigInfo, RecoveryPolicy};
pub use error::{Error, Result};
pub use isolator::{
    ContainerConfig, ContainerSpec, ContainerState, ContainerType, Isolator, LaunchInfo,
    NetworkInfo,
};
pub use spec::{CniNetworkInfo, NetworkConfig};
