//! Wiring of a [`KindController`] into a kube-rs `Controller`

use std::fmt::Debug;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::controller::{Action, Config as ControllerConfig};
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use super::engine::{self, KindController, ObjectKey, Outcome};
use crate::error::{Error, Result};

/// Watcher timeout (seconds), kept below the client read timeout so idle
/// watches are closed by the API server first
pub const WATCH_TIMEOUT_SECS: u32 = 25;

pub fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Run the controller for one kind until shutdown.
///
/// Stops the kind's garbage collector when the controller exits.
pub async fn run<C: KindController>(ctrl: Arc<C>, client: Client, api: Api<C::Resource>) {
    let settings = &ctrl.context().settings;
    info!(
        "Starting {} controller (concurrency {})",
        C::RES_TYPE,
        settings.concurrency
    );

    let controller = Controller::new(api, watcher_config())
        .with_config(ControllerConfig::default().concurrency(settings.concurrency));
    let controller = ctrl.watch_related(controller, &client);

    controller
        .shutdown_on_signal()
        .run(reconcile::<C>, error_policy::<C>, ctrl.clone())
        .for_each(log_reconcile_result(C::RES_TYPE))
        .await;

    ctrl.context().shutdown.cancel();
    info!("{} controller stopped", C::RES_TYPE);
}

async fn reconcile<C: KindController>(obj: Arc<C::Resource>, ctrl: Arc<C>) -> Result<Action> {
    let key = ObjectKey::of(obj.as_ref());
    let requeues = &ctrl.context().requeues;

    let action = match engine::reconcile(&ctrl, &key).await {
        Outcome::Normal => {
            requeues.reset(&key);
            Action::await_change()
        }
        Outcome::Requeue => Action::requeue(requeues.next_delay(&key)),
        Outcome::RequeueAfter(delay) => Action::requeue(delay),
    };
    Ok(action)
}

/// Required by `Controller::run`; [`reconcile`] maps every failure to an
/// [`Outcome`] and never returns an error
fn error_policy<C: KindController>(obj: Arc<C::Resource>, error: &Error, ctrl: Arc<C>) -> Action {
    let key = ObjectKey::of(obj.as_ref());
    error!("Reconciliation error for {} {}: {:?}", C::RES_TYPE, key, error);
    Action::requeue(ctrl.context().requeues.next_delay(&key))
}

fn log_reconcile_result<T: Debug, E: Debug>(
    res_type: &'static str,
) -> impl Fn(std::result::Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(obj) => debug!("{} reconciled: {:?}", res_type, obj),
            Err(e) => error!("{} reconcile error: {:?}", res_type, e),
        }
        std::future::ready(())
    }
}

/// Start a background reflector for `api` and return its read handle
pub fn spawn_reflector<K>(api: Api<K>) -> Store<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let (reader, writer) = reflector::store();
    let stream = reflector::reflector(writer, watcher::watcher(api, watcher_config()))
        .default_backoff()
        .touched_objects()
        .for_each(|_| std::future::ready(()));
    tokio::spawn(stream);
    reader
}
