//! netsync-operator binary: runs the enabled controllers and the metrics server

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use netsync_operator::backend::rest::RestBackend;
use netsync_operator::backend::RemoteStore;
use netsync_operator::config::{ControllerKind, OperatorConfig};
use netsync_operator::controller::metrics::CONTROLLER_METRICS;
use netsync_operator::controller::runner;
use netsync_operator::controller::{
    AddressBindingController, Context, ControllerSettings, IPAddressAllocationController,
    KindController, NetworkInfoController, NetworkPolicyController, SecurityPolicyController,
};
use netsync_operator::crd::{
    AddressBinding, IPAddressAllocation, NetworkInfo, SecurityPolicy, VPCNetworkConfiguration,
};
use netsync_operator::rest_api::{run_server, ServerState};
use netsync_operator::store::{KubeStore, Managed, ResourceStore};

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "netsync_operator=info,kube=warn,tower_http=warn".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Builds controller contexts that share the client, backend and settings
struct Wiring {
    client: Client,
    backend: Arc<dyn RemoteStore>,
    settings: ControllerSettings,
    shutdown: CancellationToken,
}

impl Wiring {
    fn context<K>(&self, res_type: &'static str, store: Arc<dyn ResourceStore<K>>) -> Context<K>
    where
        K: Managed,
    {
        Context::new(
            res_type,
            store,
            self.backend.clone(),
            CONTROLLER_METRICS.clone(),
            self.settings.clone(),
            self.shutdown.child_token(),
        )
    }

    fn spawn<C: KindController>(&self, ctrl: C, api: Api<C::Resource>) -> BoxFuture<'static, ()> {
        runner::run(Arc::new(ctrl), self.client.clone(), api).boxed()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OperatorConfig::parse();
    init_tracing(config.log_json);
    config.validate()?;

    info!(
        "Starting netsync-operator for cluster {} against {}",
        config.cluster, config.backend_url
    );

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let backend = RestBackend::new(config.rest_backend_config()).context("failed to create backend client")?;

    let wiring = Wiring {
        client: client.clone(),
        backend: Arc::new(backend),
        settings: config.controller_settings(),
        shutdown: CancellationToken::new(),
    };

    let namespaces: Arc<dyn ResourceStore<Namespace>> = Arc::new(KubeStore::cluster(client.clone()));
    let network_infos: Arc<dyn ResourceStore<NetworkInfo>> = Arc::new(KubeStore::namespaced(client.clone()));
    let allocations: Arc<dyn ResourceStore<IPAddressAllocation>> =
        Arc::new(KubeStore::namespaced(client.clone()));

    let mut controllers: Vec<BoxFuture<'static, ()>> = Vec::new();

    if config.is_enabled(ControllerKind::SecurityPolicy) {
        let store: Arc<dyn ResourceStore<SecurityPolicy>> = Arc::new(KubeStore::namespaced(client.clone()));
        let pods: Arc<dyn ResourceStore<Pod>> = Arc::new(KubeStore::namespaced(client.clone()));
        let ctx = wiring.context(SecurityPolicyController::RES_TYPE, store);
        let ctrl = SecurityPolicyController::new(ctx, namespaces.clone(), pods);
        controllers.push(wiring.spawn(ctrl, Api::all(client.clone())));
    }

    if config.is_enabled(ControllerKind::NetworkInfo) {
        let configs: Arc<dyn ResourceStore<VPCNetworkConfiguration>> = Arc::new(KubeStore::cluster(client.clone()));
        let ctx = wiring.context(NetworkInfoController::RES_TYPE, network_infos.clone());
        let ctrl = NetworkInfoController::new(ctx, namespaces.clone(), configs);
        controllers.push(wiring.spawn(ctrl, Api::all(client.clone())));
    }

    if config.is_enabled(ControllerKind::IpAddressAllocation) {
        let ctx = wiring.context(IPAddressAllocationController::RES_TYPE, allocations.clone());
        let ctrl = IPAddressAllocationController::new(ctx, network_infos.clone());
        controllers.push(wiring.spawn(ctrl, Api::all(client.clone())));
    }

    if config.is_enabled(ControllerKind::AddressBinding) {
        let store: Arc<dyn ResourceStore<AddressBinding>> = Arc::new(KubeStore::namespaced(client.clone()));
        let ctx = wiring.context(AddressBindingController::RES_TYPE, store);
        let ctrl = AddressBindingController::new(ctx, network_infos.clone(), allocations.clone());
        controllers.push(wiring.spawn(ctrl, Api::all(client.clone())));
    }

    if config.is_enabled(ControllerKind::NetworkPolicy) {
        let store: Arc<dyn ResourceStore<NetworkPolicy>> = Arc::new(KubeStore::namespaced(client.clone()));
        let pods: Arc<dyn ResourceStore<Pod>> = Arc::new(KubeStore::namespaced(client.clone()));
        let ctx = wiring.context(NetworkPolicyController::RES_TYPE, store);
        let ctrl = NetworkPolicyController::new(ctx, pods);
        controllers.push(wiring.spawn(ctrl, Api::all(client.clone())));
    }

    if controllers.is_empty() {
        anyhow::bail!("no controllers enabled");
    }

    let server_state = ServerState::new();
    let server_shutdown = wiring.shutdown.child_token();
    let server = tokio::spawn(run_server(config.metrics_addr, server_state.clone(), server_shutdown));

    info!("Running {} controller(s)", controllers.len());
    server_state.set_ready(true);
    join_all(controllers).await;

    info!("Controllers stopped, shutting down");
    wiring.shutdown.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Metrics server failed: {}", e),
        Err(e) => error!("Metrics server task panicked: {}", e),
    }

    Ok(())
}
