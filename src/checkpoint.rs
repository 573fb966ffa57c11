//! On-disk checkpoint hierarchy.
//!
//! The isolator checkpoints every successful plugin `ADD` so that a
//! restarted agent can reconstruct its container table and finish
//! pending cleanups. The layout, rooted at the checkpoint root:
//!
//! ```text
//! <root>/<container-id>/
//!     ns                                  # bind-mounted net-ns handle
//!     <network-name>/
//!         <if-name>/
//!             network/info                # raw plugin stdout
//! ```
//!
//! All operations are plain filesystem calls; atomicity is whatever the
//! underlying filesystem provides. Recovery therefore tolerates any
//! prefix of the write sequence: a container directory without an
//! interface directory, an interface directory without an `info` file,
//! and so on.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::constants::{NETWORK_INFO_DIR, NETWORK_INFO_FILE, NS_HANDLE_FILE};
use crate::error::{Error, Result};

/// The checkpoint hierarchy for one isolator instance.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    /// Canonicalized root of the hierarchy.
    root_dir: PathBuf,
}

impl CheckpointStore {
    /// Opens (creating if necessary) the checkpoint hierarchy rooted at
    /// `root_dir` and canonicalizes the path.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be created or canonicalized.
    pub fn new(root_dir: impl Into<PathBuf>) -> Result<Self> {
        let root_dir = root_dir.into();

        fs::create_dir_all(&root_dir).map_err(|e| Error::RootDirSetupFailed {
            path: root_dir.clone(),
            reason: e.to_string(),
        })?;

        let root_dir = root_dir
            .canonicalize()
            .map_err(|e| Error::RootDirSetupFailed {
                path: root_dir.clone(),
                reason: e.to_string(),
            })?;

        debug!("Checkpoint store rooted at '{}'", root_dir.display());

        Ok(Self { root_dir })
    }

    /// Returns the canonicalized root directory.
    #[must_use]
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    // =========================================================================
    // Path Helpers
    // =========================================================================

    /// `<root>/<container-id>`
    #[must_use]
    pub fn container_dir(&self, container_id: &str) -> PathBuf {
        self.root_dir.join(container_id)
    }

    /// `<root>/<container-id>/ns` — the network-namespace handle.
    #[must_use]
    pub fn namespace_handle(&self, container_id: &str) -> PathBuf {
        self.container_dir(container_id).join(NS_HANDLE_FILE)
    }

    /// `<root>/<container-id>/<network>/<interface>`
    #[must_use]
    pub fn interface_dir(&self, container_id: &str, network: &str, interface: &str) -> PathBuf {
        self.container_dir(container_id).join(network).join(interface)
    }

    /// `<root>/<container-id>/<network>/<interface>/network/info`
    #[must_use]
    pub fn network_info_path(
        &self,
        container_id: &str,
        network: &str,
        interface: &str,
    ) -> PathBuf {
        self.interface_dir(container_id, network, interface)
            .join(NETWORK_INFO_DIR)
            .join(NETWORK_INFO_FILE)
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Creates the container directory (idempotent).
    pub fn create_container_dir(&self, container_id: &str) -> Result<()> {
        let dir = self.container_dir(container_id);
        fs::create_dir_all(&dir).map_err(|e| Error::CreateDirFailed {
            path: dir,
            reason: e.to_string(),
        })
    }

    /// Creates an interface directory (idempotent).
    pub fn create_interface_dir(
        &self,
        container_id: &str,
        network: &str,
        interface: &str,
    ) -> Result<()> {
        let dir = self.interface_dir(container_id, network, interface);
        fs::create_dir_all(&dir).map_err(|e| Error::CreateDirFailed {
            path: dir,
            reason: e.to_string(),
        })
    }

    /// Checkpoints the raw stdout of a successful plugin `ADD`.
    pub fn write_info(
        &self,
        container_id: &str,
        network: &str,
        interface: &str,
        output: &[u8],
    ) -> Result<()> {
        let path = self.network_info_path(container_id, network, interface);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::CreateDirFailed {
                path: parent.to_path_buf(),
                reason: e.to_string(),
            })?;
        }

        fs::write(&path, output).map_err(|e| Error::CheckpointWriteFailed {
            output: String::from_utf8_lossy(output).into_owned(),
            reason: e.to_string(),
        })
    }

    /// Reads back a checkpointed plugin result, or `None` if the file
    /// was never written (crash before the checkpoint).
    pub fn read_info(
        &self,
        container_id: &str,
        network: &str,
        interface: &str,
    ) -> Result<Option<Vec<u8>>> {
        let path = self.network_info_path(container_id, network, interface);

        if !path.exists() {
            return Ok(None);
        }

        fs::read(&path)
            .map(Some)
            .map_err(|e| Error::CheckpointReadFailed {
                path,
                reason: e.to_string(),
            })
    }

    /// Removes an interface directory and everything under it.
    /// Idempotent: a directory that is already gone is not an error.
    pub fn remove_interface(
        &self,
        container_id: &str,
        network: &str,
        interface: &str,
    ) -> Result<()> {
        remove_tree(&self.interface_dir(container_id, network, interface))
    }

    /// Removes a container directory and everything under it.
    /// Idempotent: a directory that is already gone is not an error.
    ///
    /// The namespace handle must be unmounted first.
    pub fn remove_container(&self, container_id: &str) -> Result<()> {
        remove_tree(&self.container_dir(container_id))
    }

    // =========================================================================
    // Enumeration
    // =========================================================================

    /// Returns true if the container has a checkpoint directory.
    #[must_use]
    pub fn container_exists(&self, container_id: &str) -> bool {
        self.container_dir(container_id).exists()
    }

    /// Lists the container IDs present under the root.
    pub fn list_containers(&self) -> Result<Vec<String>> {
        list_dir_names(&self.root_dir, false)
    }

    /// Lists the networks checkpointed for a container.
    ///
    /// Only directories count: the `ns` handle file lives beside the
    /// network directories and is not a network.
    pub fn list_networks(&self, container_id: &str) -> Result<Vec<String>> {
        list_dir_names(&self.container_dir(container_id), true)
    }

    /// Lists the interfaces checkpointed for one network of a container.
    pub fn list_interfaces(&self, container_id: &str, network: &str) -> Result<Vec<String>> {
        list_dir_names(&self.container_dir(container_id).join(network), true)
    }
}

/// Removes a directory tree, tolerating one that never existed.
fn remove_tree(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::CheckpointRemoveFailed {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

/// Lists the entry names of `dir`, optionally restricted to directories.
fn list_dir_names(dir: &Path, dirs_only: bool) -> Result<Vec<String>> {
    let entries = fs::read_dir(dir).map_err(|e| Error::ListDirFailed {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::ListDirFailed {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        })?;

        if dirs_only && !entry.path().is_dir() {
            continue;
        }

        names.push(entry.file_name().to_string_lossy().into_owned());
    }

    names.sort();
    Ok(names)
}

// =============================================================================
// Tests
// =============================================================================
