//! IPAddressAllocation controller

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::debug;

use super::engine::{Context, KindController};
use super::finalizers::IP_ADDRESS_ALLOCATION_FINALIZER;
use super::gc::{self, GcReport};
use super::runner::watcher_config;
use crate::backend::{delete_owned, ensure_remote, ownership_tags, RemoteKind, RemoteObject, TAG_SCOPE_UID};
use crate::crd::{IPAddressAllocation, NetworkInfo};
use crate::error::{Error, Result};
use crate::store::ResourceStore;

pub const RES_TYPE: &str = "ipaddressallocation";

const REMOTE_KINDS: &[RemoteKind] = &[RemoteKind::IpAddressAllocation];

/// Path of the VPC realized for `namespace`, taken from its NetworkInfo status
pub(super) async fn namespace_vpc(
    network_infos: &dyn ResourceStore<NetworkInfo>,
    namespace: &str,
) -> Result<String> {
    network_infos
        .list(Some(namespace))
        .await?
        .iter()
        .find_map(|ni| ni.vpc_path().map(str::to_string))
        .ok_or_else(|| Error::DependencyNotReady(format!("no VPC realized for namespace {}", namespace)))
}

/// NetworkInfo changes re-queue every resource of `K` in the same namespace
pub(super) fn watch_network_infos<K>(controller: Controller<K>, client: &Client) -> Controller<K>
where
    K: crate::store::Managed,
{
    let primaries = controller.store();
    controller.watches(Api::<NetworkInfo>::all(client.clone()), watcher_config(), move |ni| {
        let namespace = ni.namespace();
        primaries
            .state()
            .iter()
            .filter(|obj| obj.namespace() == namespace)
            .map(|obj| ObjectRef::from_obj(&**obj))
            .collect::<Vec<_>>()
    })
}

fn allocation_path(vpc: &str, uid: &str) -> String {
    format!("{}/ip-address-allocations/ipa_{}", vpc, uid)
}

pub struct IPAddressAllocationController {
    ctx: Context<IPAddressAllocation>,
    network_infos: Arc<dyn ResourceStore<NetworkInfo>>,
}

impl IPAddressAllocationController {
    pub fn new(ctx: Context<IPAddressAllocation>, network_infos: Arc<dyn ResourceStore<NetworkInfo>>) -> Self {
        Self { ctx, network_infos }
    }
}

#[async_trait]
impl KindController for IPAddressAllocationController {
    type Resource = IPAddressAllocation;
    const RES_TYPE: &'static str = RES_TYPE;
    const FINALIZER: &'static str = IP_ADDRESS_ALLOCATION_FINALIZER;

    fn context(&self) -> &Context<IPAddressAllocation> {
        &self.ctx
    }

    async fn create_or_update(&self, allocation: &mut IPAddressAllocation) -> Result<bool> {
        let namespace = allocation.namespace().unwrap_or_default();
        let uid = allocation
            .uid()
            .ok_or_else(|| Error::Rejected(format!("IPAddressAllocation {} has no uid", allocation.name_any())))?;
        let vpc = namespace_vpc(self.network_infos.as_ref(), &namespace).await?;

        let path = allocation_path(&vpc, &uid);
        let desired = RemoteObject {
            kind: RemoteKind::IpAddressAllocation,
            id: format!("ipa_{}", uid),
            path,
            display_name: Some(allocation.name_any()),
            tags: ownership_tags(&self.ctx.settings.cluster, RES_TYPE, allocation),
            body: json!({
                "allocation_size": allocation.spec.allocation_size,
                "ip_address_block_visibility": allocation.spec.ip_address_block_visibility.to_string(),
            }),
        };

        let (realized, _) = ensure_remote(self.ctx.remote.as_ref(), &desired).await?;
        let ips = realized.body_str("/allocation_ips").ok_or_else(|| {
            Error::ContractViolation(format!(
                "IP address allocation {} reports no allocation_ips",
                realized.path
            ))
        })?;
        debug!("IPAddressAllocation {}/{} holds {}", namespace, allocation.name_any(), ips);

        let status = allocation.status.get_or_insert_with(Default::default);
        let changed = status.allocation_ips != ips;
        if changed {
            status.allocation_ips = ips.to_string();
        }
        Ok(changed)
    }

    async fn delete(&self, allocation: &IPAddressAllocation) -> Result<()> {
        let Some(uid) = allocation.uid() else {
            return Ok(());
        };
        // The namespace VPC may already be gone; the tag search still applies
        let namespace = allocation.namespace().unwrap_or_default();
        let known: Vec<RemoteObject> = namespace_vpc(self.network_infos.as_ref(), &namespace)
            .await
            .ok()
            .map(|vpc| RemoteObject::at(RemoteKind::IpAddressAllocation, allocation_path(&vpc, &uid)))
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
                    .filter_map(|a| a.uid())
                    .collect::<HashSet<_>>())
            },
        )
        .await
    }

    fn watch_related(
        &self,
        controller: Controller<IPAddressAllocation>,
        client: &Client,
    ) -> Controller<IPAddressAllocation> {
        watch_network_infos(controller, client)
    }
}
