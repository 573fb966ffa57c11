//! CNI wire formats.
//!
//! Two JSON documents cross the plugin boundary:
//!
//! - the **network configuration** the operator drops into the config
//!   directory (and that we replay to the plugin on stdin), and
//! - the **network information** a plugin prints on stdout after a
//!   successful `ADD`.
//!
//! Both are parsed tolerantly: unknown fields are preserved only in the
//! raw bytes the isolator checkpoints, never dropped on the floor by a
//! round trip. The parsed forms carry just the fields the isolator and
//! its callers consume; everything else stays opaque.

use serde::{Deserialize, Serialize};

// =============================================================================
// Parse Error
// =============================================================================

/// Error parsing a CNI JSON document.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The document is not valid JSON or misses a required field.
    #[error("{0}")]
    Json(#[from] serde_json::Error),

    /// A required field is present but empty.
    #[error("required field '{0}' is empty")]
    EmptyField(&'static str),
}

// =============================================================================
// Network Configuration
// =============================================================================

/// A CNI network configuration file.
///
/// Only `name`, `type`, and `ipam.type` are interpreted by the isolator;
/// the rest of the document belongs to the plugin.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Schema version of the configuration.
    #[serde(rename = "cniVersion", default)]
    pub cni_version: Option<String>,
    /// Network name, unique across the configuration directory.
    pub name: String,
    /// Name of the plugin executable implementing this network.
    #[serde(rename = "type")]
    pub plugin: String,
    /// IP address management delegation, if any.
    #[serde(default)]
    pub ipam: Option<Ipam>,
}

/// The `ipam` section of a network configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Ipam {
    /// Name of the IPAM plugin executable.
    #[serde(rename = "type")]
    pub plugin: String,
}

/// Parses a CNI network configuration document.
///
/// # Errors
///
/// Returns an error if the document is not valid JSON, or if `name` or
/// `type` is missing or empty.
pub fn parse_network_config(bytes: &[u8]) -> Result<NetworkConfig, ParseError> {
    let config: NetworkConfig = serde_json::from_slice(bytes)?;

    if config.name.is_empty() {
        return Err(ParseError::EmptyField("name"));
    }
    if config.plugin.is_empty() {
        return Err(ParseError::EmptyField("type"));
    }

    Ok(config)
}

// =============================================================================
// Network Information (plugin ADD result)
// =============================================================================

/// The result a CNI plugin prints on stdout after a successful `ADD`.
///
/// A successful parse is authoritative: a result without any assigned IP
/// is accepted as-is, and interpretation of routes and DNS is left to
/// higher layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniNetworkInfo {
    /// Schema version of the result.
    #[serde(rename = "cniVersion", default, skip_serializing_if = "Option::is_none")]
    pub cni_version: Option<String>,
    /// IPv4 assignment, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip4: Option<IpConfig>,
    /// IPv6 assignment, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip6: Option<IpConfig>,
    /// DNS configuration, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<Dns>,
}

/// One address-family assignment inside a plugin result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConfig {
    /// Assigned address in CIDR notation (e.g. `10.0.0.5/24`).
    pub ip: String,
    /// Gateway address, if the plugin set one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    /// Routes to install for this address family.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
}

/// A route inside an address-family assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Destination in CIDR notation.
    pub dst: String,
    /// Next hop, if not the default gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

/// The `dns` section of a plugin result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dns {
    /// Nameserver addresses.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    /// Local domain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Search domains.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
    /// Resolver options.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// Parses the stdout of a successful plugin `ADD`.
///
/// # Errors
///
/// Returns an error if the document is not valid JSON.
pub fn parse_network_info(bytes: &[u8]) -> Result<CniNetworkInfo, ParseError> {
    Ok(serde_json::from_slice(bytes)?)
}

// =============================================================================
// Tests
// =============================================================================
