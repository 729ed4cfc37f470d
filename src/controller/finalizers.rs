//! Finalizer tokens and helpers
//!
//! A resource carries its controller's finalizer from before the first remote
//! object is created until every remote object it owns is gone.

use kube::Resource;

pub const SECURITY_POLICY_FINALIZER: &str = "securitypolicy.crd.netsync.io/finalizer";
pub const NETWORK_INFO_FINALIZER: &str = "networkinfo.crd.netsync.io/finalizer";
pub const IP_ADDRESS_ALLOCATION_FINALIZER: &str = "ipaddressallocation.crd.netsync.io/finalizer";
pub const ADDRESS_BINDING_FINALIZER: &str = "addressbinding.crd.netsync.io/finalizer";
pub const NETWORK_POLICY_FINALIZER: &str = "networkpolicy.crd.netsync.io/finalizer";

pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// Add the finalizer; returns false when it was already present
pub fn add_finalizer<K: Resource>(obj: &mut K, finalizer: &str) -> bool {
    if has_finalizer(obj, finalizer) {
        return false;
    }
    obj.meta_mut()
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(finalizer.to_string());
    true
}

/// Remove the finalizer; returns false when it was not present
pub fn remove_finalizer<K: Resource>(obj: &mut K, finalizer: &str) -> bool {
    let Some(finalizers) = obj.meta_mut().finalizers.as_mut() else {
        return false;
    };
    let before = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    before != finalizers.len()
}

pub fn is_being_deleted<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}
