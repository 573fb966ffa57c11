//! Error types for the CNI network isolator.

use std::path::PathBuf;

/// Result type alias for isolator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the CNI network isolator.
///
/// Startup and configuration errors abort agent startup; validation,
/// setup, and plugin errors fail the affected container's hook only;
/// recovery errors fail the agent's recovery and require operator
/// intervention.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Startup / Configuration Errors
    // =========================================================================
    /// The isolator was started without root privileges.
    #[error("the CNI network isolator requires root permissions")]
    PermissionDenied,

    /// One of the two CNI directory flags was left unset.
    #[error("missing required '--{0}' flag")]
    MissingFlag(&'static str),

    /// A required configuration directory does not exist.
    #[error("the CNI {kind} directory '{path}' does not exist")]
    DirectoryMissing { kind: &'static str, path: PathBuf },

    /// A configured directory could not be canonicalized.
    #[error("failed to determine canonical path of CNI plugin directory '{path}': {reason}")]
    CanonicalizeFailed { path: PathBuf, reason: String },

    /// The plugin directory exists but contains no entries.
    #[error("the CNI plugin directory '{path}' is empty")]
    PluginDirEmpty { path: PathBuf },

    /// A network configuration file could not be read.
    #[error("failed to read CNI network configuration file '{path}': {reason}")]
    ConfigReadFailed { path: PathBuf, reason: String },

    /// A network configuration file could not be parsed.
    #[error("failed to parse CNI network configuration file '{path}': {reason}")]
    ConfigParseFailed { path: PathBuf, reason: String },

    /// Two configuration files declare the same network name.
    #[error("multiple CNI network configuration files have same name: {0}")]
    DuplicateNetworkName(String),

    /// A plugin referenced by a configuration file does not exist.
    #[error("failed to find CNI plugin '{plugin}' used by CNI network configuration file '{config}'")]
    PluginNotFound { plugin: PathBuf, config: PathBuf },

    /// A plugin referenced by a configuration file has no execute bit.
    #[error("the CNI plugin '{plugin}' used by CNI network configuration file '{config}' is not executable")]
    PluginNotExecutable { plugin: PathBuf, config: PathBuf },

    /// A non-empty configuration directory yielded no valid networks.
    #[error("unable to find any valid CNI network configuration files under '{path}'")]
    NoNetworkConfigs { path: PathBuf },

    /// The checkpoint root could not be created or canonicalized.
    #[error("failed to set up CNI checkpoint root directory at '{path}': {reason}")]
    RootDirSetupFailed { path: PathBuf, reason: String },

    /// The process mount table could not be read or parsed.
    #[error("failed to read mount table: {0}")]
    MountTableUnavailable(String),

    /// Making the checkpoint root a shared mount failed.
    #[error("failed to self bind mount '{path}' and make it a shared mount: {reason}")]
    MakeSharedFailed { path: PathBuf, reason: String },

    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// `prepare` was called twice for the same container.
    #[error("container has already been prepared")]
    AlreadyPrepared,

    /// The container is not of a type this isolator supports.
    #[error("can only prepare CNI networks for a MESOS container")]
    UnsupportedContainerType,

    /// A requested network name is not in the loaded configuration map.
    #[error("unknown CNI network '{0}'")]
    UnknownNetwork(String),

    /// The same network was requested more than once by one container.
    #[error("attempted to join CNI network '{0}' multiple times")]
    DuplicateNetworkRequest(String),

    // =========================================================================
    // Setup Errors
    // =========================================================================
    /// A checkpoint directory could not be created.
    #[error("failed to create directory '{path}': {reason}")]
    CreateDirFailed { path: PathBuf, reason: String },

    /// The namespace-handle sentinel file could not be created.
    #[error("failed to create the bind mount point '{path}': {reason}")]
    CreateMountPointFailed { path: PathBuf, reason: String },

    /// A bind mount failed.
    #[error("failed to mount the network namespace handle from '{mount_source}' to '{target}': {reason}")]
    BindMountFailed {
        mount_source: PathBuf,
        target: PathBuf,
        reason: String,
    },

    /// Unmounting the namespace handle failed.
    #[error("failed to unmount the network namespace handle '{path}': {reason}")]
    UnmountFailed { path: PathBuf, reason: String },

    // =========================================================================
    // Plugin Errors
    // =========================================================================
    /// The plugin binary could not be spawned.
    #[error("failed to execute the CNI plugin '{plugin}': {reason}")]
    PluginSpawnFailed { plugin: String, reason: String },

    /// The plugin subprocess could not be reaped or produced no exit code.
    #[error("failed to reap the CNI plugin '{plugin}' subprocess")]
    PluginReapFailed { plugin: String },

    /// An ADD invocation exited non-zero.
    #[error("the CNI plugin '{plugin}' failed to attach container {container} to CNI network '{network}': {output}")]
    AttachFailed {
        plugin: String,
        container: String,
        network: String,
        output: String,
    },

    /// A DEL invocation exited non-zero.
    #[error("the CNI plugin '{plugin}' failed to detach container {container} from network '{network}': {output}")]
    DetachFailed {
        plugin: String,
        container: String,
        network: String,
        output: String,
    },

    /// Plugin stdout did not parse as a CNI result.
    #[error("failed to parse the output of the CNI plugin '{plugin}': {reason}")]
    ResultParseFailed { plugin: String, reason: String },

    // =========================================================================
    // Checkpoint / Recovery Errors
    // =========================================================================
    /// Writing a plugin result to the checkpoint hierarchy failed.
    #[error("failed to checkpoint the output of CNI plugin '{output}': {reason}")]
    CheckpointWriteFailed { output: String, reason: String },

    /// Listing a directory failed.
    #[error("failed to list '{path}': {reason}")]
    ListDirFailed { path: PathBuf, reason: String },

    /// Removing part of the checkpoint hierarchy failed.
    #[error("failed to remove '{path}': {reason}")]
    CheckpointRemoveFailed { path: PathBuf, reason: String },

    /// A checkpointed plugin result could not be read back.
    #[error("failed to read CNI network information file '{path}': {reason}")]
    CheckpointReadFailed { path: PathBuf, reason: String },

    /// A checkpointed plugin result is structurally invalid.
    #[error("failed to parse CNI network information file '{path}': {reason}")]
    CheckpointCorrupt { path: PathBuf, reason: String },

    /// Recovery found more than one interface attached to one network.
    #[error("more than one interfaces detected for network '{0}'")]
    TooManyInterfaces(String),

    /// Recovery of one container's state failed.
    #[error("failed to recover CNI network information for container {container}: {reason}")]
    RecoveryFailed { container: String, reason: String },

    // =========================================================================
    // Aggregated Errors
    // =========================================================================
    /// Joined failures from a per-network fan-out (attach or detach).
    #[error("{}", .0.join("\n"))]
    Aggregate(Vec<String>),
}
