//! Garbage collection of orphaned remote objects
//!
//! A resource removed while the operator was down (or whose finalizer was
//! stripped by hand) leaves its remote objects behind. Each controller runs
//! one collector that periodically diffs the objects it owns on the backend
//! against the live resources and deletes the difference.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::KindController;
use super::metrics::{ControllerMetric, ControllerMetrics};
use crate::backend::{delete_in_order, RemoteKind, RemoteObject, RemoteStore};
use crate::error::Result;

/// Outcome of one collection pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Remote objects owned by the controller
    pub tracked: usize,
    /// Identities with no live resource
    pub orphaned: usize,
    /// Remote objects deleted
    pub deleted: usize,
    /// Orphaned identities whose teardown failed
    pub failed: usize,
}

/// Group objects by the value of their `scope` tag.
///
/// Objects without that tag cannot be correlated and are left alone.
pub fn group_by_tag(objects: Vec<RemoteObject>, scope: &str) -> BTreeMap<String, Vec<RemoteObject>> {
    let mut groups: BTreeMap<String, Vec<RemoteObject>> = BTreeMap::new();
    for object in objects {
        let Some(identity) = object.tag(scope).map(str::to_string) else {
            debug!("{} {} has no {} tag, skipping", object.kind, object.path, scope);
            continue;
        };
        groups.entry(identity).or_default().push(object);
    }
    groups
}

/// One collection pass.
///
/// `live_identities` is only invoked when the backend reports at least one
/// tracked object.
pub async fn sweep<F, Fut>(
    remote: &dyn RemoteStore,
    metrics: &ControllerMetrics,
    res_type: &str,
    kinds: &[RemoteKind],
    identity_scope: &str,
    live_identities: F,
) -> Result<GcReport>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<HashSet<String>>>,
{
    let mut tracked = Vec::new();
    for kind in kinds {
        let owned = remote
            .list_tracked(*kind)
            .await?
            .into_iter()
            .filter(|o| o.is_owned_by(res_type));
        tracked.extend(owned);
    }

    let mut report = GcReport {
        tracked: tracked.len(),
        ..Default::default()
    };
    let groups = group_by_tag(tracked, identity_scope);
    if groups.is_empty() {
        return Ok(report);
    }

    let live = live_identities().await?;
    for (identity, objects) in groups {
        if live.contains(&identity) {
            continue;
        }

        report.orphaned += 1;
        metrics.inc(ControllerMetric::Delete, res_type);
        info!(
            "Deleting {} orphaned {} object(s) for {}",
            objects.len(),
            res_type,
            identity
        );

        match delete_in_order(remote, objects).await {
            Ok(deleted) => {
                report.deleted += deleted;
                metrics.inc(ControllerMetric::DeleteSuccess, res_type);
            }
            Err(e) => {
                report.failed += 1;
                metrics.inc(ControllerMetric::DeleteFail, res_type);
                warn!("Failed to delete orphaned {} {}: {}", res_type, identity, e);
            }
        }
    }

    Ok(report)
}

/// Run `ctrl`'s collector every `interval` until `token` is cancelled
pub async fn run_collector<C: KindController>(ctrl: Arc<C>, interval: Duration, token: CancellationToken) {
    info!("Starting {} garbage collector (interval {:?})", C::RES_TYPE, interval);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("{} garbage collector stopped", C::RES_TYPE);
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        match ctrl.garbage_collect().await {
            Ok(report) if report.orphaned > 0 => info!(
                "{} garbage collection removed {} object(s), {} failure(s)",
                C::RES_TYPE,
                report.deleted,
                report.failed
            ),
            Ok(report) => debug!(
                "{} garbage collection found nothing to do ({} tracked)",
                C::RES_TYPE,
                report.tracked
            ),
            Err(e) => warn!("{} garbage collection failed: {}", C::RES_TYPE, e),
        }
    }
}
