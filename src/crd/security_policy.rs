//! SecurityPolicy Custom Resource Definition
//!
//! A SecurityPolicy describes distributed firewall rules for the pods of a
//! namespace. It is realized on the backend as one security policy plus the
//! groups its rules reference.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, LabelSelector};
use super::HasConditions;

/// The SecurityPolicy CRD
///
/// # Example
///
/// ```yaml
/// apiVersion: crd.netsync.io/v1alpha1
/// kind: SecurityPolicy
/// metadata:
///   name: db-isolation
///   namespace: shop
/// spec:
///   priority: 10
///   appliedTo:
///     - podSelector:
///         matchLabels:
///           role: db
///   rules:
///     - direction: In
///       action: Allow
///       sources:
///         - podSelector:
///             matchLabels:
///               role: web
///       ports:
///         - protocol: TCP
///           port: postgres
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "crd.netsync.io",
    version = "v1alpha1",
    kind = "SecurityPolicy",
    namespaced,
    status = "SecurityPolicyStatus",
    shortname = "scp",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicySpec {
    /// Pods the policy applies to when a rule does not narrow it further
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied_to: Vec<SecurityPolicyTarget>,

    /// Lower numbers are evaluated first
    #[serde(default)]
    pub priority: i32,

    /// Firewall rules, evaluated in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<SecurityPolicyRule>,
}

/// Selects the workloads a policy or rule is enforced on
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicyTarget {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<LabelSelector>,
}

/// A single firewall rule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicyRule {
    /// Optional rule name, defaults to the rule index
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub action: RuleAction,

    pub direction: RuleDirection,

    /// Overrides the policy-level appliedTo for this rule
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied_to: Vec<SecurityPolicyTarget>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SecurityPolicyPeer>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destinations: Vec<SecurityPolicyPeer>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<SecurityPolicyPort>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RuleAction {
    #[default]
    Allow,
    Drop,
    Reject,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RuleDirection {
    #[default]
    In,
    Out,
}

/// Source or destination of a rule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicyPeer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<LabelSelector>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_blocks: Vec<IpBlock>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct IpBlock {
    pub cidr: String,
}

/// Port matched by a rule
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicyPort {
    #[serde(default)]
    pub protocol: Protocol,

    /// Port number or container port name
    pub port: PortValue,

    /// Upper bound of a numeric port range
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_port: Option<i32>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum Protocol {
    #[default]
    TCP,
    UDP,
    SCTP,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::TCP => write!(f, "TCP"),
            Protocol::UDP => write!(f, "UDP"),
            Protocol::SCTP => write!(f, "SCTP"),
        }
    }
}

/// Numeric port or named container port
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(untagged)]
pub enum PortValue {
    Number(i32),
    Name(String),
}

impl SecurityPolicySpec {
    /// Targets a rule is enforced on: its own appliedTo, else the policy's
    pub fn effective_targets<'a>(&'a self, rule: &'a SecurityPolicyRule) -> &'a [SecurityPolicyTarget] {
        if rule.applied_to.is_empty() {
            &self.applied_to
        } else {
            &rule.applied_to
        }
    }

    /// Whether a pod with `labels` in the policy namespace resolves the named
    /// ports of `rule`: enforced targets do for inbound rules, destinations
    /// for outbound ones
    pub fn resolves_ports_on(&self, rule: &SecurityPolicyRule, labels: &BTreeMap<String, String>) -> bool {
        match rule.direction {
            RuleDirection::In => {
                let targets = self.effective_targets(rule);
                targets.is_empty()
                    || targets
                        .iter()
                        .any(|t| t.pod_selector.as_ref().map_or(true, |s| s.matches(labels)))
            }
            RuleDirection::Out => {
                rule.destinations.is_empty()
                    || rule.destinations.iter().any(|peer| match &peer.pod_selector {
                        Some(selector) => selector.matches(labels),
                        None => peer.namespace_selector.is_some(),
                    })
            }
        }
    }

    /// Whether any rule references a port by container port name
    pub fn uses_named_ports(&self) -> bool {
        self.rules.iter().any(SecurityPolicyRule::uses_named_ports)
    }
}

impl SecurityPolicyRule {
    pub fn uses_named_ports(&self) -> bool {
        self.ports.iter().any(|p| matches!(p.port, PortValue::Name(_)))
    }
}

/// Status subresource for SecurityPolicy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicyStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl HasConditions for SecurityPolicy {
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
