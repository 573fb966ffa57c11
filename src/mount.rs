//! Mount-propagation setup and namespace-handle bind mounts.
//!
//! The per-container namespace handles live under the checkpoint root,
//! and the containers themselves pivot-root into mount namespaces that
//! must keep seeing those handles. At startup the root is therefore
//! turned into a shared mount in its own peer group: new handle mounts
//! propagate to peer namespaces, while teardown in a container does not
//! leak back into the parent namespace.
//!
//! The setup step reads and diffs `/proc/self/mountinfo` instead of
//! re-issuing mounts unconditionally. Re-binding a live directory under
//! active containers is destructive, so mounts are only issued when the
//! table says the root is not yet a shared mount in its own peer group.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount, MsFlags};
use tracing::info;

use crate::error::{Error, Result};

// =============================================================================
// Mount Table
// =============================================================================

/// One entry of `/proc/self/mountinfo`.
#[derive(Debug, Clone)]
pub struct MountEntry {
    /// Unique mount ID.
    pub id: u32,
    /// Mount ID of the parent mount.
    pub parent: u32,
    /// Mount point, relative to the process root.
    pub target: PathBuf,
    /// Peer group when the mount is shared.
    pub shared: Option<u32>,
}

/// The process mount table.
#[derive(Debug, Clone)]
pub struct MountTable {
    /// Entries in the order the kernel reported them.
    pub entries: Vec<MountEntry>,
}

impl MountTable {
    /// Reads the mount table of the current process.
    ///
    /// # Errors
    ///
    /// Returns an error if `/proc/self/mountinfo` cannot be read or a
    /// line does not follow the documented format.
    pub fn read() -> Result<Self> {
        let contents = fs::read_to_string("/proc/self/mountinfo")
            .map_err(|e| Error::MountTableUnavailable(e.to_string()))?;
        Self::parse(&contents)
    }

    /// Parses mountinfo-formatted text.
    pub fn parse(contents: &str) -> Result<Self> {
        let mut entries = Vec::new();

        for line in contents.lines() {
            if line.is_empty() {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 7 {
                return Err(Error::MountTableUnavailable(format!(
                    "malformed mountinfo line: '{line}'"
                )));
            }

            let id = fields[0]
                .parse()
                .map_err(|_| Error::MountTableUnavailable(format!("bad mount id in '{line}'")))?;
            let parent = fields[1]
                .parse()
                .map_err(|_| Error::MountTableUnavailable(format!("bad parent id in '{line}'")))?;

            // Optional fields sit between the mount options and the "-"
            // separator; "shared:N" carries the peer group.
            let mut shared = None;
            for field in &fields[6..] {
                if *field == "-" {
                    break;
                }
                if let Some(peer) = field.strip_prefix("shared:") {
                    shared = peer.parse().ok();
                }
            }

            entries.push(MountEntry {
                id,
                parent,
                target: PathBuf::from(unescape(fields[4])),
                shared,
            });
        }

        Ok(Self { entries })
    }

    /// Finds the entry mounted exactly at `target`.
    #[must_use]
    pub fn find_target(&self, target: &Path) -> Option<&MountEntry> {
        self.entries.iter().find(|e| e.target == target)
    }

    /// Finds the entry with the given mount ID.
    #[must_use]
    pub fn find_id(&self, id: u32) -> Option<&MountEntry> {
        self.entries.iter().find(|e| e.id == id)
    }
}

/// Decodes the octal escapes mountinfo uses for whitespace in paths.
fn unescape(path: &str) -> String {
    path.replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

// =============================================================================
// Shared-Root Setup
// =============================================================================

/// Makes `root` a shared mount in its own peer group.
///
/// Idempotent one-shot startup step:
/// - not a mount point yet → self bind mount, then make-slave, then
///   make-shared;
/// - a mount point but not shared (agent crashed mid-setup) → re-issue
///   make-slave + make-shared;
/// - shared but in the same peer group as its parent → re-issue
///   make-slave + make-shared to split the peer group;
/// - shared in its own peer group → nothing to do.
///
/// # Errors
///
/// Returns an error if the mount table cannot be read or a mount call
/// fails.
pub fn ensure_shared_root(root: &Path) -> Result<()> {
    let table = MountTable::read()?;

    info!("Making '{}' a shared mount", root.display());

    match table.find_target(root) {
        None => {
            mount(Some(root), root, None::<&str>, MsFlags::MS_BIND, None::<&str>).map_err(
                |e| Error::MakeSharedFailed {
                    path: root.to_path_buf(),
                    reason: e.to_string(),
                },
            )?;
            reissue_slave_shared(root)
        }
        Some(entry) if entry.shared.is_none() => reissue_slave_shared(root),
        Some(entry) => {
            match table.find_id(entry.parent) {
                Some(parent) if parent.shared == entry.shared => reissue_slave_shared(root),
                _ => Ok(()),
            }
        }
    }
}

/// Issues the make-slave + make-shared pair on `root`.
fn reissue_slave_shared(root: &Path) -> Result<()> {
    for flag in [MsFlags::MS_SLAVE, MsFlags::MS_SHARED] {
        mount(None::<&str>, root, None::<&str>, flag, None::<&str>).map_err(|e| {
            Error::MakeSharedFailed {
                path: root.to_path_buf(),
                reason: e.to_string(),
            }
        })?;
    }
    Ok(())
}

// =============================================================================
// Namespace Handles
// =============================================================================

/// Pins the network namespace of `pid` by bind-mounting
/// `/proc/<pid>/ns/net` onto `handle`.
///
/// The handle keeps the namespace alive after the container process
/// exits, so `DEL` invocations can still enter it.
///
/// # Errors
///
/// Returns an error if the sentinel file cannot be created or the bind
/// mount fails.
pub fn bind_namespace(handle: &Path, pid: u32) -> Result<()> {
    let source = PathBuf::from(format!("/proc/{pid}/ns/net"));

    fs::File::create(handle)
        .and_then(|mut f| f.flush())
        .map_err(|e| Error::CreateMountPointFailed {
            path: handle.to_path_buf(),
            reason: e.to_string(),
        })?;

    mount(
        Some(&source),
        handle,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| Error::BindMountFailed {
        mount_source: source.clone(),
        target: handle.to_path_buf(),
        reason: e.to_string(),
    })?;

    info!(
        "Bind mounted '{}' to '{}'",
        source.display(),
        handle.display()
    );

    Ok(())
}

/// Releases a namespace handle if it exists.
///
/// # Errors
///
/// Returns an error if the unmount fails.
pub fn unbind_namespace(handle: &Path) -> Result<()> {
    if !handle.exists() {
        return Ok(());
    }

    umount(handle).map_err(|e| Error::UnmountFailed {
        path: handle.to_path_buf(),
        reason: e.to_string(),
    })
}

// =============================================================================
// Tests
// =============================================================================
