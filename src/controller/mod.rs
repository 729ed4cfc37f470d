//! Controllers keeping network resources in sync with the backend
//!
//! [`engine`] holds the reconcile state machine shared by all kinds; each
//! kind module implements [`KindController`] for one custom resource.

mod address_binding;
mod backoff;
pub mod engine;
mod finalizers;
pub mod gc;
mod ip_address_allocation;
pub mod metrics;
mod network_info;
mod network_policy;
pub mod runner;
mod security_policy;
pub mod status;
mod supervisor;
pub mod triggers;

pub use address_binding::AddressBindingController;
pub use backoff::{calculate_backoff, RequeueTracker};
pub use engine::{reconcile, Context, ControllerSettings, KindController, ObjectKey, Outcome};
pub use finalizers::{
    ADDRESS_BINDING_FINALIZER, IP_ADDRESS_ALLOCATION_FINALIZER, NETWORK_INFO_FINALIZER,
    NETWORK_POLICY_FINALIZER, SECURITY_POLICY_FINALIZER,
};
pub use gc::GcReport;
pub use ip_address_allocation::IPAddressAllocationController;
pub use metrics::{ControllerMetric, ControllerMetrics};
pub use network_info::NetworkInfoController;
pub use network_policy::{NetworkPolicyController, ERROR_ANNOTATION};
pub use security_policy::{SecurityPolicyController, SYSTEM_NAMESPACE_ANNOTATION};
pub use supervisor::StartOnce;
