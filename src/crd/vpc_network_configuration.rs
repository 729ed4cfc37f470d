//! VPCNetworkConfiguration Custom Resource Definition
//!
//! Cluster-scoped, shared network layout referenced by namespaces. It has no
//! remote counterpart of its own; changing it re-queues every NetworkInfo in
//! the namespaces bound to it.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Namespace annotation naming the VPCNetworkConfiguration to use
pub const NETWORK_CONFIG_ANNOTATION: &str = "netsync.io/vpc-network-config";

/// Annotation marking the configuration used by unannotated namespaces
pub const DEFAULT_NETWORK_CONFIG_ANNOTATION: &str = "netsync.io/default-network-config";

/// Namespace annotation naming the namespace whose VPC this one shares
pub const SHARED_VPC_NAMESPACE_ANNOTATION: &str = "netsync.io/shared-vpc-namespace";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "crd.netsync.io",
    version = "v1alpha1",
    kind = "VPCNetworkConfiguration",
    shortname = "vpcnetconfig",
    printcolumn = r#"{"name":"Project","type":"string","jsonPath":".spec.project"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VPCNetworkConfigurationSpec {
    /// Backend project the VPCs are created in; falls back to the operator default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,

    /// Path of the gateway the VPCs attach to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_path: Option<String>,

    /// Edge cluster hosting the VPC service gateway
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_cluster_path: Option<String>,

    /// Private CIDRs handed to every VPC, one IP block each
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub private_ipv4_cidrs: Vec<String>,

    /// Default subnet size for subnets created in the VPC
    #[serde(default = "default_subnet_size")]
    pub default_subnet_size: u32,

    /// Whether VPCs get a load balancer endpoint
    #[serde(default)]
    pub load_balancer_enabled: bool,
}

fn default_subnet_size() -> u32 {
    32
}

impl VPCNetworkConfiguration {
    /// Whether this configuration applies to namespaces without an explicit binding
    pub fn is_default(&self) -> bool {
        is_annotated_true(self.annotations(), DEFAULT_NETWORK_CONFIG_ANNOTATION)
    }
}

/// Name of the configuration a namespace selects explicitly, if any
pub fn bound_config_name(namespace_annotations: &BTreeMap<String, String>) -> Option<&str> {
    namespace_annotations
        .get(NETWORK_CONFIG_ANNOTATION)
        .map(String::as_str)
        .filter(|n| !n.is_empty())
}

/// Namespace owning the VPC a namespace shares, if it shares another's
pub fn shared_vpc_owner<'a>(namespace: &str, namespace_annotations: &'a BTreeMap<String, String>) -> Option<&'a str> {
    namespace_annotations
        .get(SHARED_VPC_NAMESPACE_ANNOTATION)
        .map(String::as_str)
        .filter(|owner| !owner.is_empty() && *owner != namespace)
}

pub(crate) fn is_annotated_true(annotations: &BTreeMap<String, String>, key: &str) -> bool {
    annotations
        .get(key)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}
