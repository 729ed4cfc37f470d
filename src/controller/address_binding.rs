//! AddressBinding controller
//!
//! Binds a VM interface to an address. With `ipAddressAllocationName` set the
//! address comes from that allocation's `allocationIPs`; otherwise the VPC
//! assigns one and the realized binding reports it.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
use serde_json::{json, Map, Value};
use tracing::debug;

use super::engine::{Context, KindController};
use super::finalizers::ADDRESS_BINDING_FINALIZER;
use super::gc::{self, GcReport};
use super::ip_address_allocation::{namespace_vpc, watch_network_infos};
use super::runner::watcher_config;
use super::triggers::address_bindings_for_allocation;
use crate::backend::{
    delete_owned, ensure_remote, ownership_tags, BackendVersion, RemoteKind, RemoteObject,
    TAG_SCOPE_UID,
};
use crate::crd::{AddressBinding, IPAddressAllocation, NetworkInfo};
use crate::error::{Error, Result};
use crate::store::ResourceStore;

pub const RES_TYPE: &str = "addressbinding";

const MIN_BACKEND_VERSION: BackendVersion = BackendVersion::new(4, 2, 0);
const REMOTE_KINDS: &[RemoteKind] = &[RemoteKind::AddressBinding];

fn binding_path(vpc: &str, uid: &str) -> String {
    format!("{}/address-bindings/ab_{}", vpc, uid)
}

pub struct AddressBindingController {
    ctx: Context<AddressBinding>,
    network_infos: Arc<dyn ResourceStore<NetworkInfo>>,
    allocations: Arc<dyn ResourceStore<IPAddressAllocation>>,
}

impl AddressBindingController {
    pub fn new(
        ctx: Context<AddressBinding>,
        network_infos: Arc<dyn ResourceStore<NetworkInfo>>,
        allocations: Arc<dyn ResourceStore<IPAddressAllocation>>,
    ) -> Self {
        Self {
            ctx,
            network_infos,
            allocations,
        }
    }

    /// Address taken from the referenced allocation, `None` for dynamic assignment
    async fn allocated_ip(&self, binding: &AddressBinding) -> Result<Option<String>> {
        let Some(name) = binding.spec.ip_address_allocation_name.as_deref() else {
            return Ok(None);
        };
        let namespace = binding.namespace();
        let allocation = self.allocations.get(namespace.as_deref(), name).await?;
        let ips = allocation
            .as_ref()
            .and_then(|a| a.allocation_ips())
            .ok_or_else(|| {
                Error::DependencyNotReady(format!("IPAddressAllocation {} has no addresses yet", name))
            })?;

        // allocationIPs is a CIDR or a single address; the first address is bound
        Ok(Some(ips.split('/').next().unwrap_or(ips).to_string()))
    }
}

#[async_trait]
impl KindController for AddressBindingController {
    type Resource = AddressBinding;
    const RES_TYPE: &'static str = RES_TYPE;
    const FINALIZER: &'static str = ADDRESS_BINDING_FINALIZER;

    fn context(&self) -> &Context<AddressBinding> {
        &self.ctx
    }

    fn required_version(&self) -> Option<BackendVersion> {
        Some(MIN_BACKEND_VERSION)
    }

    async fn create_or_update(&self, binding: &mut AddressBinding) -> Result<bool> {
        let namespace = binding.namespace().unwrap_or_default();
        let uid = binding
            .uid()
            .ok_or_else(|| Error::Rejected(format!("AddressBinding {} has no uid", binding.name_any())))?;
        let vpc = namespace_vpc(self.network_infos.as_ref(), &namespace).await?;
        let ip = self.allocated_ip(binding).await?;

        let mut body = Map::new();
        body.insert("vm_name".into(), json!(binding.spec.vm_name));
        body.insert("interface_name".into(), json!(binding.spec.interface_name));
        if let Some(ip) = &ip {
            body.insert("ip_address".into(), json!(ip));
        }

        let desired = RemoteObject {
            kind: RemoteKind::AddressBinding,
            id: format!("ab_{}", uid),
            path: binding_path(&vpc, &uid),
            display_name: Some(binding.name_any()),
            tags: ownership_tags(&self.ctx.settings.cluster, RES_TYPE, binding),
            body: Value::Object(body),
        };

        let (realized, _) = ensure_remote(self.ctx.remote.as_ref(), &desired).await?;
        let bound = realized.body_str("/ip_address").ok_or_else(|| {
            Error::DependencyNotReady(format!("address binding {} has no address assigned yet", realized.path))
        })?;
        debug!("AddressBinding {}/{} bound to {}", namespace, binding.name_any(), bound);

        let status = binding.status.get_or_insert_with(Default::default);
        let changed = status.ip_address != bound;
        if changed {
            status.ip_address = bound.to_string();
        }
        Ok(changed)
    }

    async fn delete(&self, binding: &AddressBinding) -> Result<()> {
        let Some(uid) = binding.uid() else {
            return Ok(());
        };
        let namespace = binding.namespace().unwrap_or_default();
        let known: Vec<RemoteObject> = namespace_vpc(self.network_infos.as_ref(), &namespace)
            .await
            .ok()
            .map(|vpc| RemoteObject::at(RemoteKind::AddressBinding, binding_path(&vpc, &uid)))
            .into_iter()
            .collect();
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
                Ok(store
                    .list(None)
                    .await?
                    .iter()
                    .filter_map(|b| b.uid())
                    .collect::<HashSet<_>>())
            },
        )
        .await
    }

    fn watch_related(&self, controller: Controller<AddressBinding>, client: &Client) -> Controller<AddressBinding> {
        let bindings = controller.store();
        let controller = controller.watches(
            Api::<IPAddressAllocation>::all(client.clone()),
            watcher_config(),
            move |allocation| address_bindings_for_allocation(&allocation, &bindings.state()),
        );
        watch_network_infos(controller, client)
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::controller::engine::{reconcile, ControllerSettings, ObjectKey, Outcome};
    use crate::controller::metrics::ControllerMetrics;
    use crate::crd::{
        AddressBindingSpec, HasConditions, IPAddressAllocationStatus, NetworkInfoSpec,
        NetworkInfoStatus, VpcState,
    };
    use crate::testing::{mark_deleted, placed, MemoryStore};

    const VPC: &str = "/orgs/default/projects/default/vpcs/vpc_shop";

    struct Harness {
        bindings: Arc<MemoryStore<AddressBinding>>,
        allocations: Arc<MemoryStore<IPAddressAllocation>>,
        backend: Arc<MemoryBackend>,
        ctrl: Arc<AddressBindingController>,
    }

    fn harness(allocation_name: Option<&str>) -> Harness {
        let bindings = Arc::new(MemoryStore::with([binding(allocation_name)]));
        let network_infos = Arc::new(MemoryStore::with([realized_network_info()]));
        let allocations = Arc::new(MemoryStore::new());
        let backend = Arc::new(MemoryBackend::new());
        let ctx = Context::new(
            RES_TYPE,
            bindings.clone(),
            backend.clone(),
            ControllerMetrics::new(),
            ControllerSettings::default(),
            CancellationToken::new(),
        );
        let ctrl = Arc::new(AddressBindingController::new(ctx, network_infos, allocations.clone()));
        Harness {
            bindings,
            allocations,
            backend,
            ctrl,
        }
    }

    fn binding(allocation_name: Option<&str>) -> AddressBinding {
        let spec = AddressBindingSpec {
            vm_name: "vm-1".to_string(),
            interface_name: "eth0".to_string(),
            ip_address_allocation_name: allocation_name.map(str::to_string),
        };
        placed(AddressBinding::new("vm-1-eth0", spec), "shop", "b1")
    }

    fn realized_network_info() -> NetworkInfo {
        let mut ni = placed(NetworkInfo::new("shop", NetworkInfoSpec::default()), "shop", "n1");
        ni.status = Some(NetworkInfoStatus {
            vpcs: vec![VpcState {
                name: "vpc_shop".to_string(),
                vpc_path: VPC.to_string(),
                ..Default::default()
            }],
            conditions: vec![],
        });
        ni
    }

    fn allocation_with_ips(ips: &str) -> IPAddressAllocation {
        let mut allocation = placed(IPAddressAllocation::new("pool", Default::default()), "shop", "a1");
        allocation.status = Some(IPAddressAllocationStatus {
            allocation_ips: ips.to_string(),
            conditions: vec![],
        });
        allocation
    }

    fn key() -> ObjectKey {
        ObjectKey::new(Some("shop"), "vm-1-eth0")
    }

    fn bound_ip(h: &Harness) -> String {
        h.bindings
            .current("shop", "vm-1-eth0")
            .unwrap()
            .status
            .unwrap()
            .ip_address
    }

    #[tokio::test]
    async fn test_binding_uses_allocation_address() {
        let h = harness(Some("pool"));
        h.allocations.insert(allocation_with_ips("10.0.0.16/32"));

        assert_eq!(reconcile(&h.ctrl, &key()).await, Outcome::Normal);

        let remote = &h.backend.objects_of(RemoteKind::AddressBinding)[0];
        assert_eq!(remote.path, format!("{}/address-bindings/ab_b1", VPC));
        assert_eq!(remote.body["ip_address"], "10.0.0.16");
        assert_eq!(remote.body["vm_name"], "vm-1");
        assert_eq!(bound_ip(&h), "10.0.0.16");
    }

    #[tokio::test]
    async fn test_allocation_without_addresses_is_transient() {
        let h = harness(Some("pool"));
        h.allocations.insert(allocation_with_ips(""));

        assert_eq!(reconcile(&h.ctrl, &key()).await, Outcome::Requeue);

        assert_eq!(h.backend.write_calls(), 0);
        let stored = h.bindings.current("shop", "vm-1-eth0").unwrap();
        assert!(stored.condition("Ready").unwrap().message.contains("pool"));
    }

    #[tokio::test]
    async fn test_dynamic_assignment_reports_realized_address() {
        let h = harness(None);
        h.backend.set_realizer(|obj| {
            obj.body["ip_address"] = json!("10.0.0.42");
        });

        assert_eq!(reconcile(&h.ctrl, &key()).await, Outcome::Normal);

        let remote = &h.backend.objects_of(RemoteKind::AddressBinding)[0];
        assert_eq!(remote.body["ip_address"], "10.0.0.42");
        assert_eq!(bound_ip(&h), "10.0.0.42");
    }

    #[tokio::test]
    async fn test_backend_below_4_2_is_gated() {
        let h = harness(None);
        h.backend.set_version(BackendVersion::new(4, 1, 3));

        assert!(matches!(reconcile(&h.ctrl, &key()).await, Outcome::RequeueAfter(_)));

        let stored = h.bindings.current("shop", "vm-1-eth0").unwrap();
        assert_eq!(stored.condition("Ready").unwrap().reason, "UnsupportedBackend");
        assert_eq!(h.backend.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_delete_reaches_binding_missing_from_search() {
        let mut deleting = binding(None);
        crate::controller::finalizers::add_finalizer(&mut deleting, ADDRESS_BINDING_FINALIZER);
        let bindings = Arc::new(MemoryStore::with([mark_deleted(deleting)]));

        let mut remote = crate::backend::MockRemoteStore::new();
        remote
            .expect_version()
            .returning(|| Ok(BackendVersion::new(4, 2, 0)));
        remote.expect_list_tracked().returning(|_| Ok(Vec::new()));
        remote
            .expect_delete()
            .withf(|kind, path| {
                *kind == RemoteKind::AddressBinding && path == format!("{}/address-bindings/ab_b1", VPC)
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let ctx = Context::new(
            RES_TYPE,
            bindings.clone(),
            Arc::new(remote),
            ControllerMetrics::new(),
            ControllerSettings::default(),
            CancellationToken::new(),
        );
        let ctrl = Arc::new(AddressBindingController::new(
            ctx,
            Arc::new(MemoryStore::with([realized_network_info()])),
            Arc::new(MemoryStore::new()),
        ));

        assert_eq!(reconcile(&ctrl, &key()).await, Outcome::Normal);
        assert!(bindings.current("shop", "vm-1-eth0").is_none());
    }

    #[tokio::test]
    async fn test_delete_removes_binding() {
        let h = harness(Some("pool"));
        h.allocations.insert(allocation_with_ips("10.0.0.16/32"));
        reconcile(&h.ctrl, &key()).await;
        h.bindings.update("shop", "vm-1-eth0", |b| *b = mark_deleted(b.clone()));

        assert_eq!(reconcile(&h.ctrl, &key()).await, Outcome::Normal);

        assert_eq!(h.backend.deleted_paths(), vec![format!("{}/address-bindings/ab_b1", VPC)]);
        assert!(h.bindings.current("shop", "vm-1-eth0").is_none());
    }
}
