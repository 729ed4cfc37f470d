//! Status condition merging and outcome reporting
//!
//! Conditions are merged field by field and the status subresource is only
//! written when something observable changed, so a steady-state resync does
//! not produce watch events that would trigger another reconcile.

use std::sync::Arc;

use kube::ResourceExt;
use tracing::{debug, warn};

use super::metrics::{ControllerMetric, ControllerMetrics};
use crate::crd::{
    AddressBinding, Condition, HasConditions, IPAddressAllocation, NetworkInfo, SecurityPolicy,
};
use crate::error::{Error, Result};
use crate::store::{Managed, ResourceStore};

pub const REASON_SYNCED: &str = "Synced";
pub const REASON_SYNC_FAILED: &str = "SyncFailed";
pub const REASON_DELETE_FAILED: &str = "DeleteFailed";
pub const REASON_REJECTED: &str = "Rejected";
pub const REASON_UNSUPPORTED: &str = "UnsupportedBackend";

/// Merge `condition` into the list in place.
///
/// Returns false when a condition of the same type with the same content is
/// already present. The transition time is kept unless the status flips.
pub fn apply_condition(conditions: &mut Vec<Condition>, mut condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) if existing.same_content(&condition) => false,
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
            true
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

/// Where a resource records the outcome of its last reconcile
pub trait OutcomeRecord {
    /// Whether the record lives in the status subresource; otherwise it is
    /// part of the object metadata and written with a full replace
    const IN_STATUS: bool = true;

    /// Merge the Ready condition of an outcome into the object.
    ///
    /// `cause` is the error behind a failed outcome. Returns false when the
    /// object already records the same outcome.
    fn record(&mut self, condition: Condition, cause: Option<&Error>) -> bool;
}

macro_rules! record_in_conditions {
    ($($kind:ty),+) => {
        $(
            impl OutcomeRecord for $kind {
                fn record(&mut self, condition: Condition, _cause: Option<&Error>) -> bool {
                    apply_condition(self.conditions_mut(), condition)
                }
            }
        )+
    };
}

record_in_conditions!(SecurityPolicy, NetworkInfo, IPAddressAllocation, AddressBinding);

/// Writes conditions for one resource kind and counts outcomes
pub struct StatusReporter<K> {
    store: Arc<dyn ResourceStore<K>>,
    metrics: ControllerMetrics,
    res_type: &'static str,
}

impl<K: Managed> StatusReporter<K> {
    pub fn new(store: Arc<dyn ResourceStore<K>>, metrics: ControllerMetrics, res_type: &'static str) -> Self {
        Self {
            store,
            metrics,
            res_type,
        }
    }

    /// Merge a condition and persist it if it changed.
    ///
    /// Returns whether a write happened. On success `obj` is replaced with
    /// the stored version.
    pub async fn merge_condition(&self, obj: &mut K, condition: Condition, cause: Option<&Error>) -> Result<bool> {
        if !obj.record(condition, cause) {
            debug!("Status of {} {} unchanged", self.res_type, obj.name_any());
            return Ok(false);
        }
        *obj = self.persist(obj).await?;
        Ok(true)
    }

    async fn persist(&self, obj: &K) -> Result<K> {
        if K::IN_STATUS {
            self.store.replace_status(obj).await
        } else {
            self.store.replace(obj).await
        }
    }

    /// Record a successful create/update.
    ///
    /// `derived_changed` forces a write when the kind changed derived status
    /// fields on `obj` even if the Ready condition is unchanged.
    pub async fn update_success(&self, obj: &mut K, derived_changed: bool) -> Result<()> {
        let condition = Condition::ready(true, REASON_SYNCED, "Resource is realized on the backend");
        let changed = obj.record(condition, None);

        if changed || derived_changed {
            match self.persist(obj).await {
                Ok(stored) => *obj = stored,
                Err(e) => {
                    self.metrics.inc(ControllerMetric::UpdateFail, self.res_type);
                    return Err(e);
                }
            }
        }

        self.metrics.inc(ControllerMetric::UpdateSuccess, self.res_type);
        Ok(())
    }

    /// Record a failed create/update. Status write errors are only logged.
    pub async fn update_fail(&self, obj: &mut K, error: &Error) {
        let reason = match error {
            Error::Rejected(_) => REASON_REJECTED,
            Error::Unsupported(_) => REASON_UNSUPPORTED,
            _ => REASON_SYNC_FAILED,
        };
        self.record_failure(obj, reason, error).await;
        self.metrics.inc(ControllerMetric::UpdateFail, self.res_type);
    }

    /// Record a failed delete. The resource still exists, so the failure is
    /// also reported on its status.
    pub async fn delete_fail(&self, obj: &mut K, error: &Error) {
        self.record_failure(obj, REASON_DELETE_FAILED, error).await;
        self.metrics.inc(ControllerMetric::DeleteFail, self.res_type);
    }

    pub fn delete_success(&self) {
        self.metrics.inc(ControllerMetric::DeleteSuccess, self.res_type);
    }

    async fn record_failure(&self, obj: &mut K, reason: &str, error: &Error) {
        let condition = Condition::ready(false, reason, &error.status_message());
        if let Err(e) = self.merge_condition(obj, condition, Some(error)).await {
            warn!(
                "Failed to record {} on {} {}: {}",
                reason,
                self.res_type,
                obj.name_any(),
                e
            );
        }
    }
}
