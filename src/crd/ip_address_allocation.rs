//! IPAddressAllocation Custom Resource Definition
//!
//! Reserves a block of addresses inside the namespace VPC. The backend picks
//! the addresses; they are reported back in `status.allocationIPs`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, IpAddressVisibility};
use super::HasConditions;

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "crd.netsync.io",
    version = "v1alpha1",
    kind = "IPAddressAllocation",
    namespaced,
    status = "IPAddressAllocationStatus",
    shortname = "ipalloc",
    printcolumn = r#"{"name":"IPs","type":"string","jsonPath":".status.allocationIPs"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IPAddressAllocationSpec {
    /// Which block the addresses are taken from
    #[serde(default)]
    pub ip_address_block_visibility: IpAddressVisibility,

    /// Number of addresses to reserve, a power of two
    #[serde(default = "default_allocation_size")]
    pub allocation_size: u32,
}

fn default_allocation_size() -> u32 {
    1
}

/// Status subresource for IPAddressAllocation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IPAddressAllocationStatus {
    /// Allocated addresses in CIDR notation
    #[serde(default, rename = "allocationIPs", skip_serializing_if = "String::is_empty")]
    pub allocation_ips: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl IPAddressAllocation {
    pub fn allocation_ips(&self) -> Option<&str> {
        self.status
            .as_ref()
            .map(|s| s.allocation_ips.as_str())
            .filter(|ips| !ips.is_empty())
    }
}

impl HasConditions for IPAddressAllocation {
    fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }
}
