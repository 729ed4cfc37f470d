//! NetworkInfo controller
//!
//! Realizes the namespace VPC described by the VPCNetworkConfiguration the
//! namespace is bound to: one private IP block per configured CIDR, then the
//! VPC referencing them. The realized VPC state is reported in
//! `status.vpcs`.
//!
//! A namespace annotated with [`SHARED_VPC_NAMESPACE_ANNOTATION`] uses the
//! VPC of the named namespace instead: its NetworkInfo reports that VPC and
//! never creates or deletes backend objects.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::engine::{Context, KindController};
use super::finalizers::NETWORK_INFO_FINALIZER;
use super::gc::{self, GcReport};
use super::runner::{spawn_reflector, watcher_config};
use super::triggers::{configured_network, network_infos_for_config, network_infos_sharing_vpc_of};
use crate::backend::{
    delete_in_order, delete_owned, ensure_remote, find_tracked, ownership_tags, RemoteKind,
    RemoteObject, TAG_SCOPE_NAMESPACE,
};
use crate::crd::{shared_vpc_owner, NetworkInfo, VPCNetworkConfiguration, VpcState};
use crate::error::{Error, Result};
use crate::store::ResourceStore;

pub const RES_TYPE: &str = "networkinfo";

const REMOTE_KINDS: &[RemoteKind] = &[RemoteKind::Vpc, RemoteKind::IpBlock];

pub struct NetworkInfoController {
    ctx: Context<NetworkInfo>,
    namespaces: Arc<dyn ResourceStore<Namespace>>,
    configs: Arc<dyn ResourceStore<VPCNetworkConfiguration>>,
}

impl NetworkInfoController {
    pub fn new(
        ctx: Context<NetworkInfo>,
        namespaces: Arc<dyn ResourceStore<Namespace>>,
        configs: Arc<dyn ResourceStore<VPCNetworkConfiguration>>,
    ) -> Self {
        Self {
            ctx,
            namespaces,
            configs,
        }
    }

    /// The configuration `network_info` is bound to, explicitly or by default
    async fn network_config(&self, network_info: &NetworkInfo) -> Result<VPCNetworkConfiguration> {
        let ns_name = network_info.namespace().unwrap_or_default();
        let namespace = self.namespaces.get(None, &ns_name).await?;

        match configured_network(network_info, namespace.as_ref()) {
            Some(name) => self.configs.get(None, &name).await?.ok_or_else(|| {
                Error::DependencyNotReady(format!("VPCNetworkConfiguration {} not found", name))
            }),
            None => self
                .configs
                .list(None)
                .await?
                .into_iter()
                .find(|c| c.is_default())
                .ok_or_else(|| {
                    Error::DependencyNotReady(format!(
                        "no network configuration bound to namespace {} and no default",
                        ns_name
                    ))
                }),
        }
    }

    /// Namespace whose VPC `namespace` shares, if any
    async fn shared_owner(&self, namespace: &str) -> Result<Option<String>> {
        let ns = self.namespaces.get(None, namespace).await?;
        Ok(ns.and_then(|ns| shared_vpc_owner(namespace, ns.annotations()).map(str::to_string)))
    }

    /// VPC state reported by the NetworkInfo of the owning namespace
    async fn shared_vpcs(&self, owner: &str) -> Result<Vec<VpcState>> {
        self.ctx
            .store
            .list(Some(owner))
            .await?
            .into_iter()
            .filter_map(|ni| ni.status)
            .map(|status| status.vpcs)
            .find(|vpcs| !vpcs.is_empty())
            .ok_or_else(|| Error::DependencyNotReady(format!("VPC of namespace {} is not realized", owner)))
    }

    fn remote(&self, network_info: &NetworkInfo, kind: RemoteKind, path: String, body: Value) -> RemoteObject {
        RemoteObject {
            kind,
            id: path.rsplit('/').next().unwrap_or_default().to_string(),
            path,
            display_name: network_info.namespace(),
            tags: ownership_tags(&self.ctx.settings.cluster, RES_TYPE, network_info),
            body,
        }
    }

    fn ip_block(&self, network_info: &NetworkInfo, project: &str, namespace: &str, cidr: &str) -> RemoteObject {
        let path = ip_block_path(project, namespace, cidr);
        self.remote(
            network_info,
            RemoteKind::IpBlock,
            path,
            json!({"cidr": cidr, "visibility": "PRIVATE"}),
        )
    }

    fn vpc(
        &self,
        network_info: &NetworkInfo,
        project: &str,
        namespace: &str,
        config: &VPCNetworkConfiguration,
        block_paths: Vec<String>,
    ) -> RemoteObject {
        let mut body = Map::new();
        body.insert("private_ips".into(), json!(config.spec.private_ipv4_cidrs));
        body.insert("ip_address_blocks".into(), json!(block_paths));
        body.insert("default_subnet_size".into(), json!(config.spec.default_subnet_size));
        body.insert(
            "load_balancer_vpc_endpoint".into(),
            json!({"enabled": config.spec.load_balancer_enabled}),
        );
        if let Some(gateway) = &config.spec.gateway_path {
            body.insert("tier0_gateway_path".into(), json!(gateway));
        }
        if let Some(edge_cluster) = &config.spec.edge_cluster_path {
            body.insert("edge_cluster_path".into(), json!(edge_cluster));
        }

        let path = vpc_path(project, namespace);
        self.remote(network_info, RemoteKind::Vpc, path, Value::Object(body))
    }
}

fn vpc_path(project: &str, namespace: &str) -> String {
    format!("{}/vpcs/vpc_{}", project, namespace)
}

fn ip_block_path(project: &str, namespace: &str, cidr: &str) -> String {
    format!("{}/infra/ip-blocks/ipb_{}_{}", project, namespace, sanitize_cidr(cidr))
}

/// VPC and IP blocks of `namespace` recorded in the status of `network_info`.
///
/// A reported VPC of another namespace is shared and not included.
fn reported_objects(network_info: &NetworkInfo, namespace: &str) -> Vec<RemoteObject> {
    let Some(status) = &network_info.status else {
        return Vec::new();
    };
    let mut objects = Vec::new();
    for vpc in &status.vpcs {
        let Some((project, _)) = vpc.vpc_path.split_once("/vpcs/") else {
            continue;
        };
        if vpc.vpc_path != vpc_path(project, namespace) {
            continue;
        }
        objects.push(RemoteObject::at(RemoteKind::Vpc, vpc.vpc_path.clone()));
        objects.extend(
            vpc.private_ipv4_cidrs
                .iter()
                .map(|cidr| RemoteObject::at(RemoteKind::IpBlock, ip_block_path(project, namespace, cidr))),
        );
    }
    objects
}

/// `10.0.0.0/16` -> `10.0.0.0_16`, usable as a path segment
fn sanitize_cidr(cidr: &str) -> String {
    cidr.replace(['/', ':'], "_")
}

/// Read the derived state from a realized VPC.
///
/// A VPC with auto-SNAT enabled must report its default SNAT address; the
/// load balancer subnet is only read when the endpoint reports itself enabled.
fn vpc_state(vpc: &RemoteObject, private_ipv4_cidrs: &[String]) -> Result<VpcState> {
    let default_snat_ip = match vpc.body_bool("/service_gateway/auto_snat") {
        Some(true) => vpc
            .body_str("/service_gateway/default_snat_ip")
            .ok_or_else(|| {
                Error::ContractViolation(format!(
                    "VPC {} has auto-SNAT enabled but no default SNAT IP",
                    vpc.path
                ))
            })?
            .to_string(),
        _ => String::new(),
    };

    let load_balancer_ip_addresses = match vpc.body_bool("/load_balancer_vpc_endpoint/enabled") {
        Some(true) => vpc
            .body_str("/load_balancer_vpc_endpoint/subnet_cidr")
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    };

    Ok(VpcState {
        name: vpc.id.clone(),
        vpc_path: vpc.path.clone(),
        default_snat_ip,
        load_balancer_ip_addresses,
        private_ipv4_cidrs: private_ipv4_cidrs.to_vec(),
    })
}

#[async_trait]
impl KindController for NetworkInfoController {
    type Resource = NetworkInfo;
    const RES_TYPE: &'static str = RES_TYPE;
    const FINALIZER: &'static str = NETWORK_INFO_FINALIZER;

    fn context(&self) -> &Context<NetworkInfo> {
        &self.ctx
    }

    async fn create_or_update(&self, network_info: &mut NetworkInfo) -> Result<bool> {
        let namespace = network_info.namespace().unwrap_or_default();
        if let Some(owner) = self.shared_owner(&namespace).await? {
            let vpcs = self.shared_vpcs(&owner).await?;
            debug!("NetworkInfo {} shares the VPC of namespace {}", namespace, owner);
            let status = network_info.status.get_or_insert_with(Default::default);
            let changed = status.vpcs != vpcs;
            if changed {
                status.vpcs = vpcs;
            }
            return Ok(changed);
        }

        let config = self.network_config(network_info).await?;
        let project = config
            .spec
            .project
            .clone()
            .unwrap_or_else(|| self.ctx.settings.project.clone());
        debug!(
            "NetworkInfo {} uses configuration {} in {}",
            namespace,
            config.name_any(),
            project
        );

        let remote = self.ctx.remote.as_ref();

        let mut block_paths = Vec::new();
        for cidr in &config.spec.private_ipv4_cidrs {
            let block = self.ip_block(network_info, &project, &namespace, cidr);
            ensure_remote(remote, &block).await?;
            block_paths.push(block.path);
        }

        let desired = self.vpc(network_info, &project, &namespace, &config, block_paths.clone());
        let (vpc, _) = ensure_remote(remote, &desired).await?;

        let wanted: HashSet<&str> = block_paths.iter().map(String::as_str).collect();
        let stale: Vec<RemoteObject> =
            find_tracked(remote, RES_TYPE, &[RemoteKind::IpBlock], TAG_SCOPE_NAMESPACE, &namespace)
                .await?
                .into_iter()
                .filter(|o| !wanted.contains(o.path.as_str()))
                .collect();
        if !stale.is_empty() {
            info!("Removing {} stale IP block(s) of namespace {}", stale.len(), namespace);
            delete_in_order(remote, stale).await?;
        }

        let state = vpc_state(&vpc, &config.spec.private_ipv4_cidrs)?;
        let vpcs = vec![state];
        let status = network_info.status.get_or_insert_with(Default::default);
        let changed = status.vpcs != vpcs;
        if changed {
            status.vpcs = vpcs;
        }
        Ok(changed)
    }

    async fn delete(&self, network_info: &NetworkInfo) -> Result<()> {
        let Some(namespace) = network_info.namespace() else {
            return Ok(());
        };
        if let Some(owner) = self.shared_owner(&namespace).await? {
            debug!("NetworkInfo {} shares the VPC of {}, nothing to delete", namespace, owner);
            return Ok(());
        }
        let known = reported_objects(network_info, &namespace);
        delete_owned(
            self.ctx.remote.as_ref(),
            RES_TYPE,
            REMOTE_KINDS,
            TAG_SCOPE_NAMESPACE,
            &namespace,
            known,
        )
        .await?;
        Ok(())
    }

    async fn garbage_collect(&self) -> Result<GcReport> {
        let namespaces = self.namespaces.clone();
        gc::sweep(
            self.ctx.remote.as_ref(),
            &self.ctx.metrics,
            RES_TYPE,
            REMOTE_KINDS,
            TAG_SCOPE_NAMESPACE,
            || async move {
                Ok(namespaces
                    .list(None)
                    .await?
                    .iter()
                    .map(|ns| ns.name_any())
                    .collect::<HashSet<_>>())
            },
        )
        .await
    }

    fn watch_related(&self, controller: Controller<NetworkInfo>, client: &Client) -> Controller<NetworkInfo> {
        let network_infos = controller.store();
        let namespaces = spawn_reflector(Api::<Namespace>::all(client.clone()));
        let by_namespace = controller.store();
        let sharing = controller.store();
        let sharing_namespaces = namespaces.clone();

        controller
            .watches(
                Api::<VPCNetworkConfiguration>::all(client.clone()),
                watcher_config(),
                move |config| network_infos_for_config(&config, &namespaces.state(), &network_infos.state()),
            )
            .watches(Api::<Namespace>::all(client.clone()), watcher_config(), move |ns| {
                let name = ns.name_any();
                by_namespace
                    .state()
                    .iter()
                    .filter(|ni| ni.namespace().as_deref() == Some(name.as_str()))
                    .map(|ni| ObjectRef::from_obj(&**ni))
                    .collect::<Vec<_>>()
            })
            .watches(Api::<NetworkInfo>::all(client.clone()), watcher_config(), move |owner| {
                network_infos_sharing_vpc_of(&owner, &sharing_namespaces.state(), &sharing.state())
            })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::controller::engine::{reconcile, ControllerSettings, ObjectKey, Outcome};
    use crate::controller::metrics::ControllerMetrics;
    use crate::crd::{
        HasConditions, NetworkInfoSpec, VPCNetworkConfigurationSpec, DEFAULT_NETWORK_CONFIG_ANNOTATION,
        NETWORK_CONFIG_ANNOTATION, SHARED_VPC_NAMESPACE_ANNOTATION,
    };
    use crate::testing::{mark_deleted, placed, MemoryStore};

    struct Harness {
        infos: Arc<MemoryStore<NetworkInfo>>,
        namespaces: Arc<MemoryStore<Namespace>>,
        configs: Arc<MemoryStore<VPCNetworkConfiguration>>,
        backend: Arc<MemoryBackend>,
        ctrl: Arc<NetworkInfoController>,
    }

    fn harness(namespaces: Vec<Namespace>, configs: Vec<VPCNetworkConfiguration>) -> Harness {
        let infos = Arc::new(MemoryStore::new());
        let namespaces = Arc::new(MemoryStore::with(namespaces));
        let configs = Arc::new(MemoryStore::with(configs));
        let backend = Arc::new(MemoryBackend::new());
        let ctx = Context::new(
            RES_TYPE,
            infos.clone(),
            backend.clone(),
            ControllerMetrics::new(),
            ControllerSettings::default(),
            CancellationToken::new(),
        );
        let ctrl = Arc::new(NetworkInfoController::new(ctx, namespaces.clone(), configs.clone()));
        Harness {
            infos,
            namespaces,
            configs,
            backend,
            ctrl,
        }
    }

    fn namespace(name: &str, config: Option<&str>) -> Namespace {
        let mut ns = Namespace::default();
        ns.metadata.name = Some(name.to_string());
        if let Some(config) = config {
            ns.metadata.annotations = Some(BTreeMap::from([(
                NETWORK_CONFIG_ANNOTATION.to_string(),
                config.to_string(),
            )]));
        }
        ns
    }

    fn sharing_namespace(name: &str, owner: &str) -> Namespace {
        let mut ns = namespace(name, None);
        ns.metadata.annotations = Some(BTreeMap::from([(
            SHARED_VPC_NAMESPACE_ANNOTATION.to_string(),
            owner.to_string(),
        )]));
        ns
    }

    fn config(name: &str, default: bool, cidrs: &[&str], lb: bool) -> VPCNetworkConfiguration {
        let spec = VPCNetworkConfigurationSpec {
            project: Some("/orgs/default/projects/p1".to_string()),
            private_ipv4_cidrs: cidrs.iter().map(|c| c.to_string()).collect(),
            default_subnet_size: 32,
            load_balancer_enabled: lb,
            ..Default::default()
        };
        let mut config = VPCNetworkConfiguration::new(name, spec);
        if default {
            config.metadata.annotations = Some(BTreeMap::from([(
                DEFAULT_NETWORK_CONFIG_ANNOTATION.to_string(),
                "true".to_string(),
            )]));
        }
        config
    }

    fn network_info(ns: &str) -> NetworkInfo {
        placed(NetworkInfo::new(ns, NetworkInfoSpec::default()), ns, &format!("uid-{}", ns))
    }

    fn key(ns: &str) -> ObjectKey {
        ObjectKey::new(Some(ns), ns)
    }

    fn vpc_state_of(h: &Harness, ns: &str) -> VpcState {
        h.infos.current(ns, ns).unwrap().status.unwrap().vpcs[0].clone()
    }

    #[tokio::test]
    async fn test_creates_blocks_then_vpc_and_reports_state() {
        let h = harness(
            vec![namespace("shop", None)],
            vec![config("default", true, &["10.0.0.0/16"], false)],
        );
        h.infos.insert(network_info("shop"));

        assert_eq!(reconcile(&h.ctrl, &key("shop")).await, Outcome::Normal);

        let block = "/orgs/default/projects/p1/infra/ip-blocks/ipb_shop_10.0.0.0_16";
        assert!(h.backend.contains(block));
        let vpc = &h.backend.objects_of(RemoteKind::Vpc)[0];
        assert_eq!(vpc.path, "/orgs/default/projects/p1/vpcs/vpc_shop");
        assert_eq!(vpc.body["ip_address_blocks"][0], block);

        let state = vpc_state_of(&h, "shop");
        assert_eq!(state.vpc_path, vpc.path);
        assert_eq!(state.private_ipv4_cidrs, vec!["10.0.0.0/16".to_string()]);
        assert!(state.default_snat_ip.is_empty());
        assert!(state.load_balancer_ip_addresses.is_empty());
    }

    #[tokio::test]
    async fn test_namespace_annotation_selects_configuration() {
        let h = harness(
            vec![namespace("shop", Some("dedicated"))],
            vec![
                config("default", true, &["10.0.0.0/16"], false),
                config("dedicated", false, &["172.16.0.0/24"], false),
            ],
        );
        h.infos.insert(network_info("shop"));

        reconcile(&h.ctrl, &key("shop")).await;

        assert_eq!(
            vpc_state_of(&h, "shop").private_ipv4_cidrs,
            vec!["172.16.0.0/24".to_string()]
        );
    }

    #[tokio::test]
    async fn test_missing_configuration_is_transient() {
        let h = harness(vec![namespace("shop", Some("absent"))], vec![]);
        h.infos.insert(network_info("shop"));

        assert_eq!(reconcile(&h.ctrl, &key("shop")).await, Outcome::Requeue);

        assert_eq!(h.backend.write_calls(), 0);
        let stored = h.infos.current("shop", "shop").unwrap();
        assert_eq!(stored.condition("Ready").unwrap().reason, "SyncFailed");
    }

    #[tokio::test]
    async fn test_snat_and_load_balancer_state_are_read_from_realized_vpc() {
        let h = harness(
            vec![namespace("shop", None)],
            vec![config("default", true, &[], true)],
        );
        h.infos.insert(network_info("shop"));
        h.backend.set_realizer(|obj| {
            if obj.kind == RemoteKind::Vpc {
                obj.body["service_gateway"] = json!({"auto_snat": true, "default_snat_ip": "192.0.2.10"});
                obj.body["load_balancer_vpc_endpoint"]["subnet_cidr"] = json!("100.64.0.0/24");
            }
        });

        assert_eq!(reconcile(&h.ctrl, &key("shop")).await, Outcome::Normal);

        let state = vpc_state_of(&h, "shop");
        assert_eq!(state.default_snat_ip, "192.0.2.10");
        assert_eq!(state.load_balancer_ip_addresses, "100.64.0.0/24");

        // Realized fields do not make the next pass rewrite the VPC
        let writes = h.backend.write_calls();
        reconcile(&h.ctrl, &key("shop")).await;
        assert_eq!(h.backend.write_calls(), writes);
    }

    #[tokio::test]
    async fn test_disabled_endpoint_reported_as_null_is_not_rewritten() {
        let h = harness(
            vec![namespace("shop", None)],
            vec![config("default", true, &["10.0.0.0/16"], false)],
        );
        h.infos.insert(network_info("shop"));
        h.backend.set_realizer(|obj| {
            if obj.kind == RemoteKind::Vpc {
                obj.body["load_balancer_vpc_endpoint"]["enabled"] = Value::Null;
            }
        });

        assert_eq!(reconcile(&h.ctrl, &key("shop")).await, Outcome::Normal);
        let writes = h.backend.write_calls();

        assert_eq!(reconcile(&h.ctrl, &key("shop")).await, Outcome::Normal);
        assert_eq!(reconcile(&h.ctrl, &key("shop")).await, Outcome::Normal);
        assert_eq!(h.backend.write_calls(), writes);
    }

    #[tokio::test]
    async fn test_auto_snat_without_address_is_a_contract_violation() {
        let h = harness(
            vec![namespace("shop", None)],
            vec![config("default", true, &[], false)],
        );
        h.infos.insert(network_info("shop"));
        h.backend.set_realizer(|obj| {
            if obj.kind == RemoteKind::Vpc {
                obj.body["service_gateway"] = json!({"auto_snat": true});
            }
        });

        assert_eq!(reconcile(&h.ctrl, &key("shop")).await, Outcome::Requeue);

        let stored = h.infos.current("shop", "shop").unwrap();
        let ready = stored.condition("Ready").unwrap();
        assert!(!ready.is_true());
        assert!(ready.message.contains("default SNAT IP"));
    }

    #[test]
    fn test_disabled_endpoint_subnet_is_ignored() {
        let vpc = RemoteObject {
            kind: RemoteKind::Vpc,
            id: "vpc_shop".to_string(),
            path: "/vpcs/vpc_shop".to_string(),
            display_name: None,
            tags: vec![],
            body: json!({"load_balancer_vpc_endpoint": {"subnet_cidr": "100.64.0.0/24"}}),
        };

        let state = vpc_state(&vpc, &[]).unwrap();
        assert!(state.load_balancer_ip_addresses.is_empty());
    }

    #[tokio::test]
    async fn test_removed_cidr_deletes_stale_block() {
        let h = harness(
            vec![namespace("shop", None)],
            vec![config("default", true, &["10.0.0.0/16", "10.1.0.0/16"], false)],
        );
        h.infos.insert(network_info("shop"));
        reconcile(&h.ctrl, &key("shop")).await;
        assert_eq!(h.backend.objects_of(RemoteKind::IpBlock).len(), 2);

        h.configs.update("", "default", |c| c.spec.private_ipv4_cidrs.truncate(1));
        reconcile(&h.ctrl, &key("shop")).await;

        assert_eq!(h.backend.objects_of(RemoteKind::IpBlock).len(), 1);
        assert!(h.backend.deleted_paths()[0].ends_with("ipb_shop_10.1.0.0_16"));
    }

    #[tokio::test]
    async fn test_delete_removes_vpc_before_blocks() {
        let h = harness(
            vec![namespace("shop", None)],
            vec![config("default", true, &["10.0.0.0/16"], false)],
        );
        h.infos.insert(network_info("shop"));
        reconcile(&h.ctrl, &key("shop")).await;
        h.infos.update("shop", "shop", |ni| *ni = mark_deleted(ni.clone()));

        assert_eq!(reconcile(&h.ctrl, &key("shop")).await, Outcome::Normal);

        let deleted = h.backend.deleted_paths();
        assert_eq!(deleted.len(), 2);
        assert!(deleted[0].contains("/vpcs/"));
        assert!(deleted[1].contains("/ip-blocks/"));
        assert!(h.infos.current("shop", "shop").is_none());
    }

    #[tokio::test]
    async fn test_delete_uses_reported_paths_when_search_misses_them() {
        let mut deleting = network_info("shop");
        crate::controller::finalizers::add_finalizer(&mut deleting, NETWORK_INFO_FINALIZER);
        deleting.status = Some(crate::crd::NetworkInfoStatus {
            vpcs: vec![VpcState {
                name: "vpc_shop".to_string(),
                vpc_path: "/orgs/default/projects/p1/vpcs/vpc_shop".to_string(),
                private_ipv4_cidrs: vec!["10.0.0.0/16".to_string()],
                ..Default::default()
            }],
            conditions: vec![],
        });
        let infos = Arc::new(MemoryStore::with([mark_deleted(deleting)]));

        let mut remote = crate::backend::MockRemoteStore::new();
        remote.expect_list_tracked().returning(|_| Ok(Vec::new()));
        let mut seq = mockall::Sequence::new();
        remote
            .expect_delete()
            .withf(|kind, path| *kind == RemoteKind::Vpc && path == "/orgs/default/projects/p1/vpcs/vpc_shop")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        remote
            .expect_delete()
            .withf(|kind, path| {
                *kind == RemoteKind::IpBlock
                    && path == "/orgs/default/projects/p1/infra/ip-blocks/ipb_shop_10.0.0.0_16"
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let ctx = Context::new(
            RES_TYPE,
            infos.clone(),
            Arc::new(remote),
            ControllerMetrics::new(),
            ControllerSettings::default(),
            CancellationToken::new(),
        );
        let ctrl = Arc::new(NetworkInfoController::new(
            ctx,
            Arc::new(MemoryStore::with([namespace("shop", None)])),
            Arc::new(MemoryStore::new()),
        ));

        assert_eq!(reconcile(&ctrl, &key("shop")).await, Outcome::Normal);
        assert!(infos.current("shop", "shop").is_none());
    }

    #[tokio::test]
    async fn test_gc_keeps_vpcs_of_live_namespaces() {
        let h = harness(
            vec![namespace("nsA", None), namespace("nsB", None)],
            vec![config("default", true, &["10.0.0.0/16"], false)],
        );
        h.infos.insert(network_info("nsA"));
        h.infos.insert(network_info("nsB"));
        reconcile(&h.ctrl, &key("nsA")).await;
        reconcile(&h.ctrl, &key("nsB")).await;

        h.namespaces.remove("", "nsA");
        let report = h.ctrl.garbage_collect().await.unwrap();

        assert_eq!(report.orphaned, 1);
        assert_eq!(report.deleted, 2);
        assert!(h.backend.contains("/orgs/default/projects/p1/vpcs/vpc_nsB"));
        assert!(!h.backend.contains("/orgs/default/projects/p1/vpcs/vpc_nsA"));
    }

    fn shared_harness() -> Harness {
        let h = harness(
            vec![namespace("platform", None), sharing_namespace("team", "platform")],
            vec![config("default", true, &["10.0.0.0/16"], false)],
        );
        h.infos.insert(network_info("platform"));
        h.infos.insert(network_info("team"));
        h
    }

    #[tokio::test]
    async fn test_sharing_namespace_reports_owner_vpc() {
        let h = shared_harness();
        assert_eq!(reconcile(&h.ctrl, &key("platform")).await, Outcome::Normal);
        let writes = h.backend.write_calls();

        assert_eq!(reconcile(&h.ctrl, &key("team")).await, Outcome::Normal);

        assert_eq!(h.backend.write_calls(), writes);
        assert_eq!(h.backend.objects_of(RemoteKind::Vpc).len(), 1);
        assert_eq!(vpc_state_of(&h, "team"), vpc_state_of(&h, "platform"));
    }

    #[tokio::test]
    async fn test_sharing_namespace_waits_for_owner_vpc() {
        let h = shared_harness();

        assert_eq!(reconcile(&h.ctrl, &key("team")).await, Outcome::Requeue);

        assert_eq!(h.backend.write_calls(), 0);
        let stored = h.infos.current("team", "team").unwrap();
        assert!(stored.condition("Ready").unwrap().message.contains("platform"));
    }

    #[tokio::test]
    async fn test_sharing_namespace_delete_keeps_owner_vpc() {
        let h = shared_harness();
        reconcile(&h.ctrl, &key("platform")).await;
        reconcile(&h.ctrl, &key("team")).await;
        h.infos.update("team", "team", |ni| *ni = mark_deleted(ni.clone()));

        assert_eq!(reconcile(&h.ctrl, &key("team")).await, Outcome::Normal);

        assert!(h.backend.deleted_paths().is_empty());
        assert!(h.backend.contains("/orgs/default/projects/p1/vpcs/vpc_platform"));
        assert!(h.infos.current("team", "team").is_none());
    }

    #[tokio::test]
    async fn test_reported_vpc_of_other_namespace_is_never_deleted() {
        let h = shared_harness();
        reconcile(&h.ctrl, &key("platform")).await;
        reconcile(&h.ctrl, &key("team")).await;
        // The annotation is gone by the time the NetworkInfo is deleted
        h.namespaces.insert(namespace("team", None));
        h.infos.update("team", "team", |ni| *ni = mark_deleted(ni.clone()));

        assert_eq!(reconcile(&h.ctrl, &key("team")).await, Outcome::Normal);

        assert!(h.backend.deleted_paths().is_empty());
        assert_eq!(h.backend.objects_of(RemoteKind::Vpc).len(), 1);
    }
}
