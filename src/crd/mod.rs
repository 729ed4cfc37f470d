//! Custom Resource Definitions for netsync
//!
//! This module defines the Kubernetes CRDs describing desired network state.

mod address_binding;
mod ip_address_allocation;
mod network_info;
mod security_policy;
mod types;
mod vpc_network_configuration;

pub use address_binding::{AddressBinding, AddressBindingSpec, AddressBindingStatus};
pub use ip_address_allocation::{
    IPAddressAllocation, IPAddressAllocationSpec, IPAddressAllocationStatus,
};
pub use network_info::{NetworkInfo, NetworkInfoSpec, NetworkInfoStatus};
pub use security_policy::{
    IpBlock, PortValue, Protocol, RuleAction, RuleDirection, SecurityPolicy, SecurityPolicyPeer,
    SecurityPolicyPort, SecurityPolicyRule, SecurityPolicySpec, SecurityPolicyStatus,
    SecurityPolicyTarget,
};
pub use types::*;
pub use vpc_network_configuration::{
    bound_config_name, shared_vpc_owner, VPCNetworkConfiguration, VPCNetworkConfigurationSpec,
    DEFAULT_NETWORK_CONFIG_ANNOTATION, NETWORK_CONFIG_ANNOTATION, SHARED_VPC_NAMESPACE_ANNOTATION,
};

pub(crate) use vpc_network_configuration::is_annotated_true;

/// Access to the condition list carried in a resource's status
pub trait HasConditions {
    fn conditions(&self) -> &[Condition];

    /// Mutable conditions, creating an empty status when there is none
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;

    fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions().iter().find(|c| c.type_ == type_)
    }
}
