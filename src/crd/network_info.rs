//! NetworkInfo Custom Resource Definition
//!
//! A NetworkInfo is the per-namespace handle for the namespace VPC. Its spec
//! is intentionally thin: the network layout comes from the
//! VPCNetworkConfiguration the namespace is bound to.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, VpcState};
use super::HasConditions;

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "crd.netsync.io",
    version = "v1alpha1",
    kind = "NetworkInfo",
    namespaced,
    status = "NetworkInfoStatus",
    shortname = "ni",
    printcolumn = r#"{"name":"VPC","type":"string","jsonPath":".status.vpcs[0].vpcPath"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfoSpec {
    /// Overrides the namespace annotation naming the VPCNetworkConfiguration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_configuration: Option<String>,
}

/// Status subresource for NetworkInfo
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfoStatus {
    /// Realized VPCs, at most one today
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vpcs: Vec<VpcState>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl NetworkInfo {
    /// Path of the realized VPC, if reconciled at least once
    pub fn vpc_path(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.vpcs.first())
            .map(|v| v.vpc_path.as_str())
            .filter(|p| !p.is_empty())
    }
}

impl HasConditions for NetworkInfo {
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
