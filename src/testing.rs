//! Test doubles and fixtures shared by the controller tests

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::ErrorResponse;
use kube::{Resource, ResourceExt};

use crate::error::{Error, Result};
use crate::store::ResourceStore;

pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: reason.to_string(),
        reason: reason.to_string(),
        code,
    }))
}

/// Give a fixture object a namespace and uid
pub(crate) fn placed<K: Resource>(mut obj: K, namespace: &str, uid: &str) -> K {
    obj.meta_mut().namespace = Some(namespace.to_string());
    obj.meta_mut().uid = Some(uid.to_string());
    obj
}

/// Set the deletion marker the way the API server does on delete
pub(crate) fn mark_deleted<K: Resource>(mut obj: K) -> K {
    obj.meta_mut().deletion_timestamp = Some(Time(chrono::Utc::now()));
    obj
}

type Key = (String, String);

fn key_of<K: Resource>(obj: &K) -> Key {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

/// In-memory [`ResourceStore`] with API-server-like finalizer handling:
/// a replaced object carrying a deletion marker and no finalizers is removed.
pub(crate) struct MemoryStore<K> {
    objects: Mutex<BTreeMap<Key, K>>,
    replaces: AtomicUsize,
    status_writes: AtomicUsize,
    fail_get: AtomicBool,
    fail_replace: AtomicBool,
    fail_status: AtomicBool,
}

impl<K> MemoryStore<K>
where
    K: Resource + Clone,
{
    pub(crate) fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            replaces: AtomicUsize::new(0),
            status_writes: AtomicUsize::new(0),
            fail_get: AtomicBool::new(false),
            fail_replace: AtomicBool::new(false),
            fail_status: AtomicBool::new(false),
        }
    }

    pub(crate) fn with(objects: impl IntoIterator<Item = K>) -> Self {
        let store = Self::new();
        for obj in objects {
            store.insert(obj);
        }
        store
    }

    pub(crate) fn insert(&self, obj: K) {
        self.objects.lock().unwrap().insert(key_of(&obj), obj);
    }

    pub(crate) fn remove(&self, namespace: &str, name: &str) {
        self.objects
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub(crate) fn current(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Apply `f` to a stored object, e.g. to simulate a user edit
    pub(crate) fn update(&self, namespace: &str, name: &str, f: impl FnOnce(&mut K)) {
        if let Some(obj) = self
            .objects
            .lock()
            .unwrap()
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            f(obj);
        }
    }

    pub(crate) fn replace_calls(&self) -> usize {
        self.replaces.load(Ordering::SeqCst)
    }

    pub(crate) fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_get(&self, fail: bool) {
        self.fail_get.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_replace(&self, fail: bool) {
        self.fail_replace.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_status(&self, fail: bool) {
        self.fail_status.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl<K> ResourceStore<K> for MemoryStore<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(api_error(500, "InternalError"));
        }
        let key = (namespace.unwrap_or_default().to_string(), name.to_string());
        Ok(self.objects.lock().unwrap().get(&key).cloned())
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        self.replaces.fetch_add(1, Ordering::SeqCst);
        if self.fail_replace.load(Ordering::SeqCst) {
            return Err(api_error(409, "Conflict"));
        }

        let key = key_of(obj);
        let mut objects = self.objects.lock().unwrap();
        if !objects.contains_key(&key) {
            return Err(api_error(404, "NotFound"));
        }
        if obj.meta().deletion_timestamp.is_some() && obj.finalizers().is_empty() {
            objects.remove(&key);
        } else {
            objects.insert(key, obj.clone());
        }
        Ok(obj.clone())
    }

    async fn replace_status(&self, obj: &K) -> Result<K> {
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(api_error(409, "Conflict"));
        }

        let key = key_of(obj);
        let mut objects = self.objects.lock().unwrap();
        if !objects.contains_key(&key) {
            return Err(api_error(404, "NotFound"));
        }
        objects.insert(key, obj.clone());
        Ok(obj.clone())
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((ns, _), _)| namespace.map_or(true, |want| ns == want))
            .map(|(_, obj)| obj.clone())
            .collect())
    }
}
