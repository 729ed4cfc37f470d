//! Generic reconcile state machine
//!
//! Every resource kind goes through the same steps: fetch, capability gate,
//! then either the create/update path (finalizer first, then remote
//! objects, then status) or the delete path (remote objects first, then the
//! finalizer). Kinds plug in through [`KindController`]; all errors are
//! turned into conditions and an [`Outcome`] here, nothing escapes.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::Controller;
use kube::{Client, Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::backoff::RequeueTracker;
use super::finalizers::{add_finalizer, has_finalizer, is_being_deleted, remove_finalizer};
use super::gc::{self, GcReport};
use super::metrics::{ControllerMetric, ControllerMetrics};
use super::status::StatusReporter;
use super::supervisor::StartOnce;
use crate::backend::{BackendVersion, RemoteStore};
use crate::crd::Condition;
use crate::error::{Error, Result};
use crate::store::{Managed, ResourceStore};

/// Result of one reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Converged (or terminally failed); wait for the next change
    Normal,
    /// Transient failure; retry with per-key back-off
    Requeue,
    /// Retry after a fixed delay
    RequeueAfter(Duration),
}

/// Namespace and name of a resource
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }
}

impl<K: Resource> From<&ObjectRef<K>> for ObjectKey {
    fn from(r: &ObjectRef<K>) -> Self {
        Self {
            namespace: r.namespace.clone(),
            name: r.name.clone(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Tunables shared by all controllers
#[derive(Clone, Debug)]
pub struct ControllerSettings {
    /// Written into the ownership tag of every remote object
    pub cluster: String,
    /// Backend project VPCs are created in when the configuration names none
    pub project: String,
    /// Domain holding security policies
    pub domain: String,
    pub gc_interval: Duration,
    /// Upper bound for the backend work of one reconcile
    pub backend_timeout: Duration,
    /// Requeue delay when the backend is too old for a kind
    pub gate_cooldown: Duration,
    pub concurrency: u16,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            cluster: "netsync".to_string(),
            project: "/orgs/default/projects/default".to_string(),
            domain: "default".to_string(),
            gc_interval: Duration::from_secs(600),
            backend_timeout: Duration::from_secs(60),
            gate_cooldown: Duration::from_secs(300),
            concurrency: 4,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
        }
    }
}

/// State shared by the reconcile workers and the collector of one kind
pub struct Context<K> {
    pub store: Arc<dyn ResourceStore<K>>,
    pub remote: Arc<dyn RemoteStore>,
    pub reporter: StatusReporter<K>,
    pub metrics: ControllerMetrics,
    pub settings: ControllerSettings,
    pub collector: StartOnce,
    pub shutdown: CancellationToken,
    pub requeues: RequeueTracker,
}

impl<K: Managed> Context<K> {
    pub fn new(
        res_type: &'static str,
        store: Arc<dyn ResourceStore<K>>,
        remote: Arc<dyn RemoteStore>,
        metrics: ControllerMetrics,
        settings: ControllerSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            reporter: StatusReporter::new(store.clone(), metrics.clone(), res_type),
            requeues: RequeueTracker::new(settings.backoff_base, settings.backoff_max),
            store,
            remote,
            metrics,
            settings,
            collector: StartOnce::new(),
            shutdown,
        }
    }
}

/// Per-kind behaviour plugged into [`reconcile`]
#[async_trait]
pub trait KindController: Send + Sync + 'static {
    type Resource: Managed;

    /// Resource type label for metrics and the ownership tag
    const RES_TYPE: &'static str;
    const FINALIZER: &'static str;

    fn context(&self) -> &Context<Self::Resource>;

    /// Minimum backend version, if the kind needs one
    fn required_version(&self) -> Option<BackendVersion> {
        None
    }

    /// Converge remote objects to `obj`.
    ///
    /// Derived status fields may be written into `obj`; return true when
    /// they changed so the engine persists them.
    async fn create_or_update(&self, obj: &mut Self::Resource) -> Result<bool>;

    /// Delete every remote object owned by `obj`, referencing objects first
    async fn delete(&self, obj: &Self::Resource) -> Result<()>;

    /// One garbage collection pass
    async fn garbage_collect(&self) -> Result<GcReport>;

    /// Register watches on related kinds that should re-queue primaries
    fn watch_related(
        &self,
        controller: Controller<Self::Resource>,
        _client: &Client,
    ) -> Controller<Self::Resource> {
        controller
    }
}

/// Bound a backend future by `limit`; elapsing is a transient failure
pub async fn bounded<T>(limit: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(limit)),
    }
}

fn ensure_collector<C: KindController>(ctrl: &Arc<C>) {
    let ctx = ctrl.context();
    ctx.collector.start_once(|| {
        tokio::spawn(gc::run_collector(
            ctrl.clone(),
            ctx.settings.gc_interval,
            ctx.shutdown.clone(),
        ));
    });
}

/// Reconcile one resource. Idempotent.
#[instrument(skip(ctrl, key), fields(res_type = C::RES_TYPE, key = %key))]
pub async fn reconcile<C: KindController>(ctrl: &Arc<C>, key: &ObjectKey) -> Outcome {
    let ctx = ctrl.context();
    ctx.metrics.inc(ControllerMetric::Sync, C::RES_TYPE);
    ensure_collector(ctrl);

    let mut obj = match ctx.store.get(key.namespace.as_deref(), &key.name).await {
        Ok(Some(obj)) => obj,
        Ok(None) => {
            debug!("{} {} not found, nothing to do", C::RES_TYPE, key);
            return Outcome::Normal;
        }
        Err(e) => {
            warn!("Failed to fetch {} {}: {}", C::RES_TYPE, key, e);
            return Outcome::Requeue;
        }
    };

    if let Some(required) = ctrl.required_version() {
        match bounded(ctx.settings.backend_timeout, ctx.remote.version()).await {
            Ok(version) if version < required => {
                let error = Error::Unsupported(format!(
                    "{} requires backend {} or newer, found {}",
                    C::RES_TYPE,
                    required,
                    version
                ));
                warn!("{}", error);
                let condition =
                    Condition::ready(false, super::status::REASON_UNSUPPORTED, &error.status_message());
                if let Err(e) = ctx.reporter.merge_condition(&mut obj, condition, Some(&error)).await {
                    warn!("Failed to record version gate on {}: {}", key, e);
                }
                return Outcome::RequeueAfter(ctx.settings.gate_cooldown);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Failed to query backend version: {}", e);
                return Outcome::Requeue;
            }
        }
    }

    if is_being_deleted(&obj) {
        delete_path(ctrl, key, obj).await
    } else {
        apply_path(ctrl, key, obj).await
    }
}

async fn apply_path<C: KindController>(ctrl: &Arc<C>, key: &ObjectKey, mut obj: C::Resource) -> Outcome {
    let ctx = ctrl.context();
    info!("Reconciling {} {}", C::RES_TYPE, key);
    ctx.metrics.inc(ControllerMetric::Update, C::RES_TYPE);

    // The finalizer must be stored before anything exists remotely
    let mut with_finalizer = obj.clone();
    if add_finalizer(&mut with_finalizer, C::FINALIZER) {
        match ctx.store.replace(&with_finalizer).await {
            Ok(stored) => obj = stored,
            Err(e) => {
                warn!("Failed to add finalizer to {} {}: {}", C::RES_TYPE, key, e);
                ctx.reporter.update_fail(&mut obj, &e).await;
                return Outcome::Requeue;
            }
        }
    }

    let mut desired = obj.clone();
    match bounded(ctx.settings.backend_timeout, ctrl.create_or_update(&mut desired)).await {
        Ok(derived_changed) => match ctx.reporter.update_success(&mut desired, derived_changed).await {
            Ok(()) => {
                debug!("{} {} is in sync", C::RES_TYPE, key);
                Outcome::Normal
            }
            Err(e) => {
                warn!("Failed to update status of {} {}: {}", C::RES_TYPE, key, e);
                Outcome::Requeue
            }
        },
        Err(e) if !e.is_retriable() => {
            warn!("{} {} rejected: {}", C::RES_TYPE, key, e);
            ctx.reporter.update_fail(&mut obj, &e).await;
            Outcome::Normal
        }
        Err(e) => {
            warn!("Failed to realize {} {}: {}", C::RES_TYPE, key, e);
            ctx.reporter.update_fail(&mut obj, &e).await;
            Outcome::Requeue
        }
    }
}

async fn delete_path<C: KindController>(ctrl: &Arc<C>, key: &ObjectKey, mut obj: C::Resource) -> Outcome {
    let ctx = ctrl.context();

    if !has_finalizer(&obj, C::FINALIZER) {
        debug!("{} {} is being deleted and holds no finalizer", C::RES_TYPE, key);
        return Outcome::Normal;
    }

    info!("Deleting {} {}", C::RES_TYPE, key);
    ctx.metrics.inc(ControllerMetric::Delete, C::RES_TYPE);

    if let Err(e) = bounded(ctx.settings.backend_timeout, ctrl.delete(&obj)).await {
        warn!("Failed to delete remote objects of {} {}: {}", C::RES_TYPE, key, e);
        ctx.reporter.delete_fail(&mut obj, &e).await;
        return Outcome::Requeue;
    }

    let mut released = obj.clone();
    remove_finalizer(&mut released, C::FINALIZER);
    match ctx.store.replace(&released).await {
        Ok(_) => {
            ctx.reporter.delete_success();
            info!("Deleted {} {}", C::RES_TYPE, key);
            Outcome::Normal
        }
        Err(e) if e.is_not_found() => {
            ctx.reporter.delete_success();
            Outcome::Normal
        }
        Err(e) => {
            warn!("Failed to remove finalizer from {} {}: {}", C::RES_TYPE, key, e);
            ctx.reporter.delete_fail(&mut obj, &e).await;
            Outcome::Requeue
        }
    }
}
