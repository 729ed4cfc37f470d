//! Mapping of related-object events to primary resources
//!
//! Used as `Controller::watches` mappers: each function receives the changed
//! related object plus a snapshot of the relevant caches and returns the
//! primaries to re-queue, without duplicates.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};
use tokio::time::Instant;
use tracing::debug;

use super::network_policy::allow_spec;
use crate::crd::{
    bound_config_name, shared_vpc_owner, AddressBinding, IPAddressAllocation, NetworkInfo, SecurityPolicy,
    SecurityPolicySpec, VPCNetworkConfiguration,
};

fn dedup<K>(mut refs: Vec<ObjectRef<K>>) -> Vec<ObjectRef<K>>
where
    K: Resource<DynamicType = ()>,
{
    let mut seen = HashSet::new();
    refs.retain(|r| seen.insert(r.clone()));
    refs
}

/// Name of the network configuration `network_info` resolves to.
///
/// The NetworkInfo spec wins over the namespace annotation; with neither,
/// the default configuration applies and `None` is returned.
pub fn configured_network(network_info: &NetworkInfo, namespace: Option<&Namespace>) -> Option<String> {
    if let Some(name) = network_info.spec.network_configuration.as_deref() {
        return Some(name.to_string());
    }
    namespace
        .and_then(|ns| bound_config_name(ns.annotations()))
        .map(str::to_string)
}

/// NetworkInfos whose namespace is bound, explicitly or by default, to `config`
pub fn network_infos_for_config(
    config: &VPCNetworkConfiguration,
    namespaces: &[Arc<Namespace>],
    network_infos: &[Arc<NetworkInfo>],
) -> Vec<ObjectRef<NetworkInfo>> {
    let config_name = config.name_any();
    let is_default = config.is_default();

    let refs: Vec<ObjectRef<NetworkInfo>> = network_infos
        .iter()
        .filter(|ni| {
            let ns_name = ni.namespace();
            let namespace = namespaces
                .iter()
                .find(|ns| Some(ns.name_any()) == ns_name)
                .map(|ns| &**ns);
            match configured_network(ni, namespace) {
                Some(bound) => bound == config_name,
                None => is_default,
            }
        })
        .map(|ni| ObjectRef::from_obj(&**ni))
        .collect();

    let refs = dedup(refs);
    debug!(
        "VPCNetworkConfiguration {} change affects {} NetworkInfo(s)",
        config_name,
        refs.len()
    );
    refs
}

/// NetworkInfos of namespaces sharing the VPC of the namespace `owner` lives in
pub fn network_infos_sharing_vpc_of(
    owner: &NetworkInfo,
    namespaces: &[Arc<Namespace>],
    network_infos: &[Arc<NetworkInfo>],
) -> Vec<ObjectRef<NetworkInfo>> {
    let Some(owner_ns) = owner.namespace() else {
        return Vec::new();
    };
    let sharing: HashSet<String> = namespaces
        .iter()
        .filter(|ns| shared_vpc_owner(&ns.name_any(), ns.annotations()) == Some(owner_ns.as_str()))
        .map(|ns| ns.name_any())
        .collect();
    if sharing.is_empty() {
        return Vec::new();
    }

    let refs: Vec<ObjectRef<NetworkInfo>> = network_infos
        .iter()
        .filter(|ni| ni.namespace().is_some_and(|ns| sharing.contains(&ns)))
        .map(|ni| ObjectRef::from_obj(&**ni))
        .collect();
    dedup(refs)
}

/// How long an entry of a pod missing from the live set is kept
pub const POD_LABEL_GRACE: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct SeenLabels {
    labels: BTreeMap<String, String>,
    seen: Instant,
}

/// Last-seen labels per pod uid, so a label removal still re-queues the
/// policies that used to select the pod.
///
/// Entries are dropped when the pod is seen terminating. A delete missed
/// across a watch restart is caught by [`PodLabelCache::retain_live`].
#[derive(Debug)]
pub struct PodLabelCache {
    labels: DashMap<String, SeenLabels>,
    grace: Duration,
}

impl Default for PodLabelCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PodLabelCache {
    pub fn new() -> Self {
        Self::with_grace(POD_LABEL_GRACE)
    }

    pub fn with_grace(grace: Duration) -> Self {
        Self {
            labels: DashMap::new(),
            grace,
        }
    }

    /// Record the pod's current labels and return the previously seen ones
    pub fn observe(&self, pod: &Pod) -> Option<BTreeMap<String, String>> {
        let uid = pod.uid()?;
        if pod.meta().deletion_timestamp.is_some() {
            return self.labels.remove(&uid).map(|(_, seen)| seen.labels);
        }
        let entry = SeenLabels {
            labels: pod.labels().clone(),
            seen: Instant::now(),
        };
        self.labels.insert(uid, entry).map(|seen| seen.labels)
    }

    /// [`observe`](Self::observe), pruning first when the cache holds more
    /// pods than `live`
    pub fn observe_against(&self, pod: &Pod, live: &[Arc<Pod>]) -> Option<BTreeMap<String, String>> {
        let previous = self.observe(pod);
        if self.len() > live.len() {
            let uids: HashSet<String> = live.iter().filter_map(|p| p.uid()).collect();
            self.retain_live(&uids);
        }
        previous
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Drop entries of pods outside `live` that were last seen more than the
    /// grace period ago. Returns the number of entries dropped.
    ///
    /// The grace period covers pods observed before the live set caught up.
    pub fn retain_live(&self, live: &HashSet<String>) -> usize {
        let before = self.labels.len();
        let now = Instant::now();
        self.labels
            .retain(|uid, seen| live.contains(uid) || now.duration_since(seen.seen) < self.grace);
        let dropped = before.saturating_sub(self.labels.len());
        if dropped > 0 {
            debug!("Dropped labels of {} vanished pod(s)", dropped);
        }
        dropped
    }
}

/// SecurityPolicies in the pod's namespace whose named-port rules select the
/// pod, by its current or previous labels
pub fn security_policies_for_pod(
    pod: &Pod,
    previous_labels: Option<&BTreeMap<String, String>>,
    policies: &[Arc<SecurityPolicy>],
) -> Vec<ObjectRef<SecurityPolicy>> {
    let Some(namespace) = pod.namespace() else {
        return Vec::new();
    };
    let current = pod.labels();

    let selects = |spec: &SecurityPolicySpec| {
        named_ports_resolve_on(spec, current) || previous_labels.is_some_and(|prev| named_ports_resolve_on(spec, prev))
    };

    let refs: Vec<ObjectRef<SecurityPolicy>> = policies
        .iter()
        .filter(|p| p.namespace().as_deref() == Some(namespace.as_str()))
        .filter(|p| selects(&p.spec))
        .map(|p| ObjectRef::from_obj(&**p))
        .collect();

    dedup(refs)
}

/// NetworkPolicies in the pod's namespace whose named ports resolve on the
/// pod, by its current or previous labels
pub fn network_policies_for_pod(
    pod: &Pod,
    previous_labels: Option<&BTreeMap<String, String>>,
    policies: &[Arc<NetworkPolicy>],
) -> Vec<ObjectRef<NetworkPolicy>> {
    let Some(namespace) = pod.namespace() else {
        return Vec::new();
    };
    let current = pod.labels();

    let refs: Vec<ObjectRef<NetworkPolicy>> = policies
        .iter()
        .filter(|p| p.namespace().as_deref() == Some(namespace.as_str()))
        .filter(|p| {
            // Policies that fail to convert are reported by their own reconcile
            allow_spec(p).is_ok_and(|spec| {
                named_ports_resolve_on(&spec, current)
                    || previous_labels.is_some_and(|prev| named_ports_resolve_on(&spec, prev))
            })
        })
        .map(|p| ObjectRef::from_obj(&**p))
        .collect();

    dedup(refs)
}

fn named_ports_resolve_on(spec: &SecurityPolicySpec, labels: &BTreeMap<String, String>) -> bool {
    spec.rules
        .iter()
        .filter(|rule| rule.uses_named_ports())
        .any(|rule| spec.resolves_ports_on(rule, labels))
}

/// AddressBindings in the allocation's namespace that reference it by name
pub fn address_bindings_for_allocation(
    allocation: &IPAddressAllocation,
    bindings: &[Arc<AddressBinding>],
) -> Vec<ObjectRef<AddressBinding>> {
    let name = allocation.name_any();
    let namespace = allocation.namespace();

    let refs: Vec<ObjectRef<AddressBinding>> = bindings
        .iter()
        .filter(|b| b.namespace() == namespace)
        .filter(|b| b.spec.ip_address_allocation_name.as_deref() == Some(name.as_str()))
        .map(|b| ObjectRef::from_obj(&**b))
        .collect();

    dedup(refs)
}
