//! AddressBinding Custom Resource Definition
//!
//! Pins the address of a VM network interface, either to an
//! IPAddressAllocation in the same namespace or to a dynamic VPC address.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use super::HasConditions;

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "crd.netsync.io",
    version = "v1alpha1",
    kind = "AddressBinding",
    namespaced,
    status = "AddressBindingStatus",
    printcolumn = r#"{"name":"VM","type":"string","jsonPath":".spec.vmName"}"#,
    printcolumn = r#"{"name":"IP","type":"string","jsonPath":".status.ipAddress"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AddressBindingSpec {
    /// Name of the virtual machine owning the interface
    pub vm_name: String,

    /// Interface on the virtual machine
    pub interface_name: String,

    /// IPAddressAllocation providing the address; dynamic when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address_allocation_name: Option<String>,
}

/// Status subresource for AddressBinding
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddressBindingStatus {
    /// Address bound to the interface
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip_address: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl HasConditions for AddressBinding {
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
