use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::Result as CniResult;

/// Annotation key naming the vxlan network a container should join
pub const NETWORK_ANNOTATION: &str = "vxlan.cni.io/NetworkName";

/// Annotation key carrying an explicitly requested address
pub const ADDRESS_ANNOTATION: &str = "vxlan.cni.io/RequestedAddress";

/// Network configuration delivered on stdin, the standard CNI config
/// extended with our vxlan attributes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// CNI specification version
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    /// Name of the network configuration
    #[serde(default)]
    pub name: String,
    /// Type of CNI plugin
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    /// IPAM delegate configuration
    #[serde(default)]
    pub ipam: Option<IpamConf>,
    /// Network to join when nothing more specific applies
    #[serde(rename = "defaultNetwork", default)]
    pub default_network: Option<String>,
    /// Fall back to the orchestrator namespace as the network name
    #[serde(rename = "networkFromNamespace", default)]
    pub network_from_namespace: bool,
    /// Configured overlay networks
    #[serde(default)]
    pub vxlans: Vec<NetworkSpec>,
    /// Result of the previous ADD, supplied by the orchestrator on DEL/CHECK
    #[serde(rename = "prevResult", default)]
    pub prev_result: Option<CniResult>,
    /// Request arguments merged by the caller (annotation values land here)
    #[serde(default)]
    pub args: Option<RequestArgs>,
}

/// Request-scoped arguments; the annotation source's two keys arrive
/// pre-merged into `annotations`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestArgs {
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

/// IPAM delegate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpamConf {
    /// Name of the IPAM executable, resolved via `CNI_PATH`
    #[serde(rename = "type")]
    pub plugin_type: String,
}

/// One overlay broadcast domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// VXLAN network identifier
    pub id: u32,
    /// Network name, the unique key
    pub name: String,
    /// Subnet defining the overlay's address space and implicit gateway
    pub cidr: String,
    /// Addresses reserved from the start of the range
    #[serde(rename = "excludeFirst", default)]
    pub exclude_first: u32,
    /// Addresses reserved from the end of the range
    #[serde(rename = "excludeLast", default)]
    pub exclude_last: u32,
    /// Tunable vxlan link options, an open string-keyed set
    #[serde(default)]
    pub options: HashMap<String, String>,
    /// Interface MTU
    #[serde(default)]
    pub mtu: Option<u32>,
}

impl Config {
    /// Parse a Config from the stdin bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("failed to parse network configuration")
    }

    /// Find the configured network with the given name
    pub fn network(&self, name: &str) -> Option<&NetworkSpec> {
        self.vxlans.iter().find(|v| v.name == name)
    }
}
