//! NetworkPolicy controller
//!
//! A Kubernetes NetworkPolicy is translated into two backend security
//! policies: an allow policy holding its rules and an isolation policy that
//! drops everything else for the selected pods, evaluated after the allow
//! policy. NetworkPolicy has no status, so the outcome is reported through
//! the [`ERROR_ANNOTATION`] annotation.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::networking::v1::{NetworkPolicy, NetworkPolicyPeer, NetworkPolicyPort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
use serde::Serialize;
use tracing::debug;

use super::engine::{Context, KindController};
use super::finalizers::NETWORK_POLICY_FINALIZER;
use super::gc::{self, GcReport};
use super::runner::{spawn_reflector, watcher_config};
use super::security_policy::{sync_policy_objects, PolicyBuilder};
use super::status::OutcomeRecord;
use super::triggers::{network_policies_for_pod, PodLabelCache};
use crate::backend::{delete_owned, ownership_tags, BackendVersion, RemoteKind, TAG_SCOPE_UID};
use crate::crd::{
    Condition, IpBlock, LabelSelector, PortValue, Protocol, RuleAction, RuleDirection,
    SecurityPolicyPeer, SecurityPolicyPort, SecurityPolicyRule, SecurityPolicySpec,
    SecurityPolicyTarget,
};
use crate::error::{Error, Result};
use crate::store::ResourceStore;

pub const RES_TYPE: &str = "networkpolicy";

/// Annotation carrying the error code of the last failed reconcile
pub const ERROR_ANNOTATION: &str = "netsync.io/error";

pub const CODE_VALIDATION_FAILED: &str = "NETWORK_POLICY_VALIDATION_FAILED";
pub const CODE_UPDATE_FAILED: &str = "NETWORK_POLICY_UPDATE_FAILED";
pub const CODE_UPDATE_PENDING: &str = "NETWORK_POLICY_UPDATE_PENDING";

const MIN_BACKEND_VERSION: BackendVersion = BackendVersion::new(3, 2, 0);
const REMOTE_KINDS: &[RemoteKind] = &[RemoteKind::SecurityPolicy, RemoteKind::Group];

const ALLOW_PRIORITY: i32 = 2000;
const ISOLATION_PRIORITY: i32 = 2001;

const POLICY_TYPE_INGRESS: &str = "Ingress";
const POLICY_TYPE_EGRESS: &str = "Egress";

/// Error code for a failed outcome caused by `cause`
pub fn error_code(cause: Option<&Error>) -> &'static str {
    match cause {
        Some(Error::Rejected(_)) => CODE_VALIDATION_FAILED,
        Some(Error::Backend { status, .. }) if (400..500).contains(status) => CODE_UPDATE_FAILED,
        _ => CODE_UPDATE_PENDING,
    }
}

impl OutcomeRecord for NetworkPolicy {
    const IN_STATUS: bool = false;

    fn record(&mut self, condition: Condition, cause: Option<&Error>) -> bool {
        let annotations = self.annotations_mut();
        if condition.is_true() {
            return annotations.remove(ERROR_ANNOTATION).is_some();
        }
        let code = error_code(cause);
        annotations
            .insert(ERROR_ANNOTATION.to_string(), code.to_string())
            .as_deref()
            != Some(code)
    }
}

/// Convert a Kubernetes label selector into the netsync one
fn selector<S: Serialize>(selector: &S) -> Result<Option<LabelSelector>> {
    let value = serde_json::to_value(selector)?;
    serde_json::from_value(value).map_err(|e| Error::Rejected(format!("unsupported label selector: {}", e)))
}

fn peer(peer: &NetworkPolicyPeer) -> Result<SecurityPolicyPeer> {
    let ip_blocks = match &peer.ip_block {
        Some(block) if block.except.as_ref().is_some_and(|e| !e.is_empty()) => {
            return Err(Error::Rejected(format!(
                "ipBlock {} with except is not supported",
                block.cidr
            )));
        }
        Some(block) => vec![IpBlock {
            cidr: block.cidr.clone(),
        }],
        None => Vec::new(),
    };
    Ok(SecurityPolicyPeer {
        pod_selector: selector(&peer.pod_selector)?,
        namespace_selector: selector(&peer.namespace_selector)?,
        ip_blocks,
    })
}

fn port(port: &NetworkPolicyPort) -> Result<SecurityPolicyPort> {
    let protocol = match port.protocol.as_deref() {
        None | Some("TCP") => Protocol::TCP,
        Some("UDP") => Protocol::UDP,
        Some("SCTP") => Protocol::SCTP,
        Some(other) => return Err(Error::Rejected(format!("unknown protocol {}", other))),
    };
    let (value, end_port) = match &port.port {
        Some(IntOrString::Int(number)) => (PortValue::Number(*number), port.end_port),
        Some(IntOrString::String(name)) if port.end_port.is_some() => {
            return Err(Error::Rejected(format!("named port {} cannot have an endPort", name)));
        }
        Some(IntOrString::String(name)) => (PortValue::Name(name.clone()), None),
        // No port means every port of the protocol
        None => (PortValue::Number(1), Some(65535)),
    };
    Ok(SecurityPolicyPort {
        protocol,
        port: value,
        end_port,
    })
}

fn allow_rule(
    direction: RuleDirection,
    peers: Option<&Vec<NetworkPolicyPeer>>,
    ports: Option<&Vec<NetworkPolicyPort>>,
) -> Result<SecurityPolicyRule> {
    let peers = peers
        .into_iter()
        .flatten()
        .map(peer)
        .collect::<Result<Vec<_>>>()?;
    let ports = ports
        .into_iter()
        .flatten()
        .map(port)
        .collect::<Result<Vec<_>>>()?;

    let mut rule = SecurityPolicyRule {
        action: RuleAction::Allow,
        direction,
        ports,
        ..Default::default()
    };
    match direction {
        RuleDirection::In => rule.sources = peers,
        RuleDirection::Out => rule.destinations = peers,
    }
    Ok(rule)
}

fn targets(policy: &NetworkPolicy) -> Result<Vec<SecurityPolicyTarget>> {
    let pod_selector = match &policy.spec {
        Some(spec) => selector(&spec.pod_selector)?,
        None => None,
    };
    // An absent selector selects every pod of the namespace
    Ok(vec![SecurityPolicyTarget {
        pod_selector: Some(pod_selector.unwrap_or_default()),
    }])
}

/// Rules of the allow policy realizing `policy`
pub fn allow_spec(policy: &NetworkPolicy) -> Result<SecurityPolicySpec> {
    let mut rules = Vec::new();
    if let Some(spec) = &policy.spec {
        for ingress in spec.ingress.iter().flatten() {
            rules.push(allow_rule(RuleDirection::In, ingress.from.as_ref(), ingress.ports.as_ref())?);
        }
        for egress in spec.egress.iter().flatten() {
            rules.push(allow_rule(RuleDirection::Out, egress.to.as_ref(), egress.ports.as_ref())?);
        }
    }
    Ok(SecurityPolicySpec {
        applied_to: targets(policy)?,
        priority: ALLOW_PRIORITY,
        rules,
    })
}

/// Directions `policy` isolates the selected pods in
fn isolated_directions(policy: &NetworkPolicy) -> Vec<RuleDirection> {
    let Some(spec) = &policy.spec else {
        return vec![RuleDirection::In];
    };
    match &spec.policy_types {
        Some(types) if !types.is_empty() => types
            .iter()
            .filter_map(|t| match t.as_str() {
                POLICY_TYPE_INGRESS => Some(RuleDirection::In),
                POLICY_TYPE_EGRESS => Some(RuleDirection::Out),
                _ => None,
            })
            .collect(),
        _ => {
            let mut directions = vec![RuleDirection::In];
            if spec.egress.as_ref().is_some_and(|e| !e.is_empty()) {
                directions.push(RuleDirection::Out);
            }
            directions
        }
    }
}

/// Rules of the isolation policy realizing `policy`
pub fn isolation_spec(policy: &NetworkPolicy) -> Result<SecurityPolicySpec> {
    let rules = isolated_directions(policy)
        .into_iter()
        .map(|direction| SecurityPolicyRule {
            action: RuleAction::Drop,
            direction,
            ..Default::default()
        })
        .collect();
    Ok(SecurityPolicySpec {
        applied_to: targets(policy)?,
        priority: ISOLATION_PRIORITY,
        rules,
    })
}

pub struct NetworkPolicyController {
    ctx: Context<NetworkPolicy>,
    pods: Arc<dyn ResourceStore<Pod>>,
    pod_labels: Arc<PodLabelCache>,
}

impl NetworkPolicyController {
    pub fn new(ctx: Context<NetworkPolicy>, pods: Arc<dyn ResourceStore<Pod>>) -> Self {
        Self {
            ctx,
            pods,
            pod_labels: Arc::new(PodLabelCache::new()),
        }
    }

    fn builder(&self, policy: &NetworkPolicy, uid: &str, part: &str) -> PolicyBuilder {
        PolicyBuilder {
            domain_path: format!("/infra/domains/{}", self.ctx.settings.domain),
            name: format!("np_{}_{}", uid, part),
            rule_prefix: format!("{}_{}", uid, part),
            namespace: policy.namespace().unwrap_or_default(),
            display_name: policy.name_any(),
            tags: ownership_tags(&self.ctx.settings.cluster, RES_TYPE, policy),
        }
    }
}

fn uid_of(policy: &NetworkPolicy) -> Result<String> {
    policy
        .uid()
        .ok_or_else(|| Error::Rejected(format!("NetworkPolicy {} has no uid", policy.name_any())))
}

#[async_trait]
impl KindController for NetworkPolicyController {
    type Resource = NetworkPolicy;
    const RES_TYPE: &'static str = RES_TYPE;
    const FINALIZER: &'static str = NETWORK_POLICY_FINALIZER;

    fn context(&self) -> &Context<NetworkPolicy> {
        &self.ctx
    }

    fn required_version(&self) -> Option<BackendVersion> {
        Some(MIN_BACKEND_VERSION)
    }

    async fn create_or_update(&self, policy: &mut NetworkPolicy) -> Result<bool> {
        let uid = uid_of(policy)?;
        let allow = allow_spec(policy)?;
        let isolation = isolation_spec(policy)?;

        let namespace = policy.namespace().unwrap_or_default();
        let pods = if allow.uses_named_ports() {
            self.pods.list(Some(&namespace)).await?
        } else {
            Vec::new()
        };

        let mut desired = self.builder(policy, &uid, "allow").desired_objects(&allow, &pods);
        desired.extend(self.builder(policy, &uid, "isolation").desired_objects(&isolation, &[]));
        let written = sync_policy_objects(self.ctx.remote.as_ref(), RES_TYPE, &uid, &desired).await?;

        debug!("NetworkPolicy {}/{}: {} remote write(s)", namespace, policy.name_any(), written);
        Ok(false)
    }

    async fn delete(&self, policy: &NetworkPolicy) -> Result<()> {
        let Some(uid) = policy.uid() else {
            return Ok(());
        };
        // A policy that never converted still owns its policy and scope paths
        let allow = allow_spec(policy).unwrap_or_default();
        let isolation = isolation_spec(policy).unwrap_or_default();
        let mut known = self.builder(policy, &uid, "allow").known_objects(&allow);
        known.extend(self.builder(policy, &uid, "isolation").known_objects(&isolation));
        delete_owned(self.ctx.remote.as_ref(), RES_TYPE, REMOTE_KINDS, TAG_SCOPE_UID, &uid, known).await?;
        Ok(())
    }

    async fn garbage_collect(&self) -> Result<GcReport> {
        let store = self.ctx.store.clone();
        gc::sweep(
            self.ctx.remote.as_ref(),
            &self.ctx.metrics,
            RES_TYPE,
            REMOTE_KINDS,
            TAG_SCOPE_UID,
            || async move {
                let live = store.list(None).await?;
                Ok(live.iter().filter_map(|p| p.uid()).collect::<HashSet<_>>())
            },
        )
        .await
    }

    fn watch_related(&self, controller: Controller<NetworkPolicy>, client: &Client) -> Controller<NetworkPolicy> {
        let policies = controller.store();
        let live_pods = spawn_reflector(Api::<Pod>::all(client.clone()));
        let pod_labels = self.pod_labels.clone();
        controller.watches(Api::<Pod>::all(client.clone()), watcher_config(), move |pod| {
            let previous = pod_labels.observe_against(&pod, &live_pods.state());
            network_policies_for_pod(&pod, previous.as_ref(), &policies.state())
        })
    }
}
