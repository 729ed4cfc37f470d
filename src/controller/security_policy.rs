//! SecurityPolicy controller
//!
//! A policy becomes one backend security policy plus one group per selector
//! it uses (policy scope, rule scope, rule sources and destinations). Named
//! ports are resolved against the container ports of the pods a rule applies
//! to; a rule whose ports all fail to resolve matches nothing and is left out.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::engine::{Context, KindController};
use super::finalizers::SECURITY_POLICY_FINALIZER;
use super::gc::{self, GcReport};
use super::runner::{spawn_reflector, watcher_config};
use super::triggers::{security_policies_for_pod, PodLabelCache};
use crate::backend::{
    delete_in_order, delete_owned, ensure_remote, find_tracked, ownership_tags, BackendVersion,
    RemoteKind, RemoteObject, RemoteStore, Tag, TAG_SCOPE_UID,
};
use crate::crd::{
    is_annotated_true, LabelSelector, PortValue, RuleAction, RuleDirection, SecurityPolicy,
    SecurityPolicyPeer, SecurityPolicyPort, SecurityPolicyRule, SecurityPolicySpec,
    SecurityPolicyTarget,
};
use crate::error::{Error, Result};
use crate::store::ResourceStore;

pub const RES_TYPE: &str = "securitypolicy";

/// Namespace annotation marking namespaces reserved for the platform
pub const SYSTEM_NAMESPACE_ANNOTATION: &str = "netsync.io/system-namespace";

const MIN_BACKEND_VERSION: BackendVersion = BackendVersion::new(3, 2, 0);
const REMOTE_KINDS: &[RemoteKind] = &[RemoteKind::SecurityPolicy, RemoteKind::Group];

pub struct SecurityPolicyController {
    ctx: Context<SecurityPolicy>,
    namespaces: Arc<dyn ResourceStore<Namespace>>,
    pods: Arc<dyn ResourceStore<Pod>>,
    pod_labels: Arc<PodLabelCache>,
}

impl SecurityPolicyController {
    pub fn new(
        ctx: Context<SecurityPolicy>,
        namespaces: Arc<dyn ResourceStore<Namespace>>,
        pods: Arc<dyn ResourceStore<Pod>>,
    ) -> Self {
        Self {
            ctx,
            namespaces,
            pods,
            pod_labels: Arc::new(PodLabelCache::new()),
        }
    }

    async fn in_system_namespace(&self, namespace: &str) -> Result<bool> {
        let ns = self.namespaces.get(None, namespace).await?;
        Ok(ns.is_some_and(|ns| is_annotated_true(ns.annotations(), SYSTEM_NAMESPACE_ANNOTATION)))
    }

    fn builder(&self, policy: &SecurityPolicy, uid: &str) -> PolicyBuilder {
        PolicyBuilder {
            domain_path: format!("/infra/domains/{}", self.ctx.settings.domain),
            name: format!("sp_{}", uid),
            rule_prefix: uid.to_string(),
            namespace: policy.namespace().unwrap_or_default(),
            display_name: policy.name_any(),
            tags: ownership_tags(&self.ctx.settings.cluster, RES_TYPE, policy),
        }
    }
}

/// Builds the backend security policy and groups realizing one rule set.
///
/// Shared by every kind that is realized as a security policy.
pub(super) struct PolicyBuilder {
    pub domain_path: String,
    /// Id of the policy; group ids are derived from it
    pub name: String,
    /// Prefix of the rule ids
    pub rule_prefix: String,
    /// Namespace pod selectors without a namespace selector are scoped to
    pub namespace: String,
    pub display_name: String,
    pub tags: Vec<Tag>,
}

impl PolicyBuilder {
    pub fn policy_path(&self) -> String {
        format!("{}/security-policies/{}", self.domain_path, self.name)
    }

    pub fn group_path(&self, suffix: &str) -> String {
        format!("{}/groups/{}_{}", self.domain_path, self.name, suffix)
    }

    fn remote(&self, kind: RemoteKind, path: String, body: Value) -> RemoteObject {
        RemoteObject {
            kind,
            id: path.rsplit('/').next().unwrap_or_default().to_string(),
            path,
            display_name: Some(self.display_name.clone()),
            tags: self.tags.clone(),
            body,
        }
    }

    /// Group for pod targets in the namespace; `None` when the targets
    /// select every pod
    fn target_group(&self, suffix: &str, targets: &[SecurityPolicyTarget]) -> Option<RemoteObject> {
        let selectors: Vec<&LabelSelector> =
            targets.iter().filter_map(|t| t.pod_selector.as_ref()).collect();
        if selectors.is_empty() {
            return None;
        }

        let expression: Vec<Value> = selectors
            .iter()
            .map(|s| json!({"namespace": self.namespace, "pod_selector": selector_expression(s)}))
            .collect();

        Some(self.remote(
            RemoteKind::Group,
            self.group_path(suffix),
            json!({"expression": expression}),
        ))
    }

    fn peer_group(&self, suffix: &str, peers: &[SecurityPolicyPeer]) -> Option<RemoteObject> {
        if peers.is_empty() {
            return None;
        }

        let expression: Vec<Value> = peers
            .iter()
            .map(|peer| {
                let mut member = serde_json::Map::new();
                if let Some(selector) = &peer.pod_selector {
                    member.insert("pod_selector".into(), selector_expression(selector));
                }
                match &peer.namespace_selector {
                    Some(selector) => {
                        member.insert("namespace_selector".into(), selector_expression(selector));
                    }
                    None if peer.pod_selector.is_some() => {
                        member.insert("namespace".into(), Value::String(self.namespace.clone()));
                    }
                    None => {}
                }
                if !peer.ip_blocks.is_empty() {
                    let cidrs: Vec<&str> = peer.ip_blocks.iter().map(|b| b.cidr.as_str()).collect();
                    member.insert("ip_addresses".into(), json!(cidrs));
                }
                Value::Object(member)
            })
            .collect();

        Some(self.remote(
            RemoteKind::Group,
            self.group_path(suffix),
            json!({"expression": expression}),
        ))
    }

    /// Numeric ports of `rule`, with named ports resolved against the
    /// container ports of the pods that own them
    fn resolve_ports(&self, spec: &SecurityPolicySpec, rule: &SecurityPolicyRule, pods: &[Pod]) -> Vec<Value> {
        let selected: Vec<&Pod> = pods
            .iter()
            .filter(|pod| spec.resolves_ports_on(rule, pod.labels()))
            .collect();

        let mut entries = Vec::new();
        for port in &rule.ports {
            match &port.port {
                PortValue::Number(number) => entries.push(port_entry(port, *number, port.end_port)),
                PortValue::Name(name) => {
                    let resolved = named_port_numbers(&selected, name, &port.protocol.to_string());
                    if resolved.is_empty() {
                        debug!(
                            "Named port {} of {} matches no container port, dropping it",
                            name, self.display_name
                        );
                    }
                    entries.extend(resolved.into_iter().map(|n| port_entry(port, n, None)));
                }
            }
        }
        entries
    }

    /// Desired remote objects: the policy first, then its groups
    pub fn desired_objects(&self, spec: &SecurityPolicySpec, pods: &[Pod]) -> Vec<RemoteObject> {
        let mut groups = Vec::new();
        let scope = self.target_group("scope", &spec.applied_to);
        let scope_paths: Vec<String> = scope.iter().map(|g| g.path.clone()).collect();
        groups.extend(scope);

        let mut rules = Vec::new();
        for (idx, rule) in spec.rules.iter().enumerate() {
            let ports = self.resolve_ports(spec, rule, pods);
            if !rule.ports.is_empty() && ports.is_empty() {
                continue;
            }

            let rule_scope = if rule.applied_to.is_empty() {
                None
            } else {
                self.target_group(&format!("{}_scope", idx), &rule.applied_to)
            };
            let sources = self.peer_group(&format!("{}_src", idx), &rule.sources);
            let destinations = self.peer_group(&format!("{}_dst", idx), &rule.destinations);

            let paths = |group: &Option<RemoteObject>| -> Vec<String> {
                match group {
                    Some(g) => vec![g.path.clone()],
                    None => vec!["ANY".to_string()],
                }
            };
            let rule_scope_paths = match &rule_scope {
                Some(g) => vec![g.path.clone()],
                None => scope_paths.clone(),
            };

            let services = if ports.is_empty() {
                json!(["ANY"])
            } else {
                json!([])
            };
            rules.push(json!({
                "id": format!("{}_{}", self.rule_prefix, idx),
                "display_name": rule.name.clone().unwrap_or_else(|| format!("rule-{}", idx)),
                "sequence_number": idx,
                "action": action_name(rule.action),
                "direction": direction_name(rule.direction),
                "scope": rule_scope_paths,
                "source_groups": paths(&sources),
                "destination_groups": paths(&destinations),
                "services": services,
                "service_entries": ports,
            }));

            groups.extend(rule_scope);
            groups.extend(sources);
            groups.extend(destinations);
        }

        let body = json!({
            "sequence_number": spec.priority,
            "scope": scope_paths,
            "rules": rules,
        });
        let mut objects = vec![self.remote(RemoteKind::SecurityPolicy, self.policy_path(), body)];
        objects.extend(groups);
        objects
    }

    /// Every path `spec` can realize, whether or not it was written
    pub fn known_objects(&self, spec: &SecurityPolicySpec) -> Vec<RemoteObject> {
        let mut objects = vec![
            RemoteObject::at(RemoteKind::SecurityPolicy, self.policy_path()),
            RemoteObject::at(RemoteKind::Group, self.group_path("scope")),
        ];
        for idx in 0..spec.rules.len() {
            for part in ["scope", "src", "dst"] {
                let suffix = format!("{}_{}", idx, part);
                objects.push(RemoteObject::at(RemoteKind::Group, self.group_path(&suffix)));
            }
        }
        objects
    }
}

/// Write `desired` groups first, then drop tracked groups of `uid` that are
/// no longer wanted. Returns the number of writes.
pub(super) async fn sync_policy_objects(
    remote: &dyn RemoteStore,
    res_type: &str,
    uid: &str,
    desired: &[RemoteObject],
) -> Result<usize> {
    // Groups must exist before the policies that reference them
    let mut written = 0;
    for object in desired.iter().rev() {
        let (_, wrote) = ensure_remote(remote, object).await?;
        written += usize::from(wrote);
    }

    let wanted: HashSet<&str> = desired.iter().map(|o| o.path.as_str()).collect();
    let stale: Vec<RemoteObject> = find_tracked(remote, res_type, &[RemoteKind::Group], TAG_SCOPE_UID, uid)
        .await?
        .into_iter()
        .filter(|o| !wanted.contains(o.path.as_str()))
        .collect();
    if !stale.is_empty() {
        info!("Removing {} stale group(s) of {} {}", stale.len(), res_type, uid);
        delete_in_order(remote, stale).await?;
    }
    Ok(written)
}

fn selector_expression(selector: &LabelSelector) -> Value {
    let expressions: Vec<Value> = selector
        .match_expressions
        .iter()
        .map(|req| {
            json!({
                "key": req.key,
                "operator": format!("{:?}", req.operator),
                "values": req.values,
            })
        })
        .collect();
    json!({"match_labels": selector.match_labels, "match_expressions": expressions})
}

fn port_entry(port: &SecurityPolicyPort, number: i32, end: Option<i32>) -> Value {
    let range = match end {
        Some(end) if end > number => format!("{}-{}", number, end),
        _ => number.to_string(),
    };
    json!({
        "resource_type": "L4PortSetServiceEntry",
        "l4_protocol": port.protocol.to_string(),
        "destination_ports": [range],
    })
}

fn named_port_numbers(pods: &[&Pod], name: &str, protocol: &str) -> BTreeSet<i32> {
    pods.iter()
        .filter_map(|pod| pod.spec.as_ref())
        .flat_map(|spec| spec.containers.iter())
        .flat_map(|c| c.ports.iter().flatten())
        .filter(|p| p.name.as_deref() == Some(name))
        .filter(|p| p.protocol.as_deref().unwrap_or("TCP") == protocol)
        .map(|p| p.container_port)
        .collect()
}

fn action_name(action: RuleAction) -> &'static str {
    match action {
        RuleAction::Allow => "ALLOW",
        RuleAction::Drop => "DROP",
        RuleAction::Reject => "REJECT",
    }
}

fn direction_name(direction: RuleDirection) -> &'static str {
    match direction {
        RuleDirection::In => "IN",
        RuleDirection::Out => "OUT",
    }
}

fn uid_of(policy: &SecurityPolicy) -> Result<String> {
    policy
        .uid()
        .ok_or_else(|| Error::Rejected(format!("SecurityPolicy {} has no uid", policy.name_any())))
}

#[async_trait]
impl KindController for SecurityPolicyController {
    type Resource = SecurityPolicy;
    const RES_TYPE: &'static str = RES_TYPE;
    const FINALIZER: &'static str = SECURITY_POLICY_FINALIZER;

    fn context(&self) -> &Context<SecurityPolicy> {
        &self.ctx
    }

    fn required_version(&self) -> Option<BackendVersion> {
        Some(MIN_BACKEND_VERSION)
    }

    async fn create_or_update(&self, policy: &mut SecurityPolicy) -> Result<bool> {
        let namespace = policy.namespace().unwrap_or_default();
        if self.in_system_namespace(&namespace).await? {
            return Err(Error::Rejected(format!(
                "SecurityPolicy is not allowed in system namespace {}",
                namespace
            )));
        }

        let uid = uid_of(policy)?;
        let pods = if policy.spec.uses_named_ports() {
            self.pods.list(Some(&namespace)).await?
        } else {
            Vec::new()
        };

        let desired = self.builder(policy, &uid).desired_objects(&policy.spec, &pods);
        let written = sync_policy_objects(self.ctx.remote.as_ref(), RES_TYPE, &uid, &desired).await?;

        debug!("SecurityPolicy {}/{}: {} remote write(s)", namespace, policy.name_any(), written);
        Ok(false)
    }

    async fn delete(&self, policy: &SecurityPolicy) -> Result<()> {
        let Some(uid) = policy.uid() else {
            return Ok(());
        };
        let known = self.builder(policy, &uid).known_objects(&policy.spec);
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

    fn watch_related(&self, controller: Controller<SecurityPolicy>, client: &Client) -> Controller<SecurityPolicy> {
        let policies = controller.store();
        let live_pods = spawn_reflector(Api::<Pod>::all(client.clone()));
        let pod_labels = self.pod_labels.clone();
        controller.watches(Api::<Pod>::all(client.clone()), watcher_config(), move |pod| {
            let previous = pod_labels.observe_against(&pod, &live_pods.state());
            security_policies_for_pod(&pod, previous.as_ref(), &policies.state())
        })
    }
}
