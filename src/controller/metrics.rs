//! Prometheus metrics for the netsync operator
//!
//! Every controller counts its reconcile outcomes in the same seven counter
//! families, labelled by resource type.

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

/// Labels for the controller outcome counters
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResTypeLabels {
    pub res_type: String,
}

/// Outcome counted by a controller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerMetric {
    Sync,
    Update,
    UpdateSuccess,
    UpdateFail,
    Delete,
    DeleteSuccess,
    DeleteFail,
}

/// Counter families shared by all controllers
///
/// Cloning is cheap and clones share the underlying counters.
#[derive(Clone, Debug, Default)]
pub struct ControllerMetrics {
    sync: Family<ResTypeLabels, Counter>,
    update: Family<ResTypeLabels, Counter>,
    update_success: Family<ResTypeLabels, Counter>,
    update_fail: Family<ResTypeLabels, Counter>,
    delete: Family<ResTypeLabels, Counter>,
    delete_success: Family<ResTypeLabels, Counter>,
    delete_fail: Family<ResTypeLabels, Counter>,
}

impl ControllerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn family(&self, metric: ControllerMetric) -> &Family<ResTypeLabels, Counter> {
        match metric {
            ControllerMetric::Sync => &self.sync,
            ControllerMetric::Update => &self.update,
            ControllerMetric::UpdateSuccess => &self.update_success,
            ControllerMetric::UpdateFail => &self.update_fail,
            ControllerMetric::Delete => &self.delete,
            ControllerMetric::DeleteSuccess => &self.delete_success,
            ControllerMetric::DeleteFail => &self.delete_fail,
        }
    }

    fn labels(res_type: &str) -> ResTypeLabels {
        ResTypeLabels {
            res_type: res_type.to_string(),
        }
    }

    /// Increment one counter for a resource type
    pub fn inc(&self, metric: ControllerMetric, res_type: &str) {
        self.family(metric).get_or_create(&Self::labels(res_type)).inc();
    }

    /// Current value of a counter
    pub fn get(&self, metric: ControllerMetric, res_type: &str) -> u64 {
        self.family(metric).get_or_create(&Self::labels(res_type)).get()
    }

    fn register(&self, registry: &mut Registry) {
        let families = [
            ("netsync_controller_sync", "Reconcile requests handled", &self.sync),
            ("netsync_controller_update", "Create or update attempts", &self.update),
            (
                "netsync_controller_update_success",
                "Successful creates or updates",
                &self.update_success,
            ),
            (
                "netsync_controller_update_fail",
                "Failed creates or updates",
                &self.update_fail,
            ),
            ("netsync_controller_delete", "Delete attempts", &self.delete),
            (
                "netsync_controller_delete_success",
                "Successful deletes",
                &self.delete_success,
            ),
            ("netsync_controller_delete_fail", "Failed deletes", &self.delete_fail),
        ];

        // Counters get the `_total` suffix from the encoder
        for (name, help, family) in families {
            registry.register(name, help, family.clone());
        }
    }
}

/// Process-wide counters, exported through [`REGISTRY`]
pub static CONTROLLER_METRICS: Lazy<ControllerMetrics> = Lazy::new(ControllerMetrics::new);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();
    CONTROLLER_METRICS.register(&mut registry);
    registry
});
