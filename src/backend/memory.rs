//! In-memory [`RemoteStore`] used by the controller tests

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{BackendVersion, RemoteKind, RemoteObject, RemoteStore};
use crate::error::{Error, Result};

type Realizer = Arc<dyn Fn(&mut RemoteObject) + Send + Sync>;

pub(crate) struct MemoryBackend {
    objects: Mutex<BTreeMap<String, RemoteObject>>,
    deleted: Mutex<Vec<String>>,
    version: Mutex<BackendVersion>,
    realizer: Mutex<Option<Realizer>>,
    write_delay: Mutex<Option<Duration>>,
    writes: AtomicUsize,
    deletes: AtomicUsize,
    lists: AtomicUsize,
    fail_writes: AtomicBool,
    fail_deletes: AtomicBool,
    fail_version: AtomicBool,
}

impl MemoryBackend {
    pub(crate) fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            deleted: Mutex::new(Vec::new()),
            version: Mutex::new(BackendVersion::new(9, 9, 9)),
            realizer: Mutex::new(None),
            write_delay: Mutex::new(None),
            writes: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            lists: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            fail_version: AtomicBool::new(false),
        }
    }

    /// Seed an object without counting it as a write
    pub(crate) fn insert(&self, object: RemoteObject) {
        self.objects
            .lock()
            .unwrap()
            .insert(object.path.clone(), object);
    }

    pub(crate) fn objects(&self) -> Vec<RemoteObject> {
        self.objects.lock().unwrap().values().cloned().collect()
    }

    pub(crate) fn objects_of(&self, kind: RemoteKind) -> Vec<RemoteObject> {
        self.objects()
            .into_iter()
            .filter(|o| o.kind == kind)
            .collect()
    }

    pub(crate) fn contains(&self, path: &str) -> bool {
        self.objects.lock().unwrap().contains_key(path)
    }

    pub(crate) fn deleted_paths(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub(crate) fn write_calls(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub(crate) fn delete_calls(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    pub(crate) fn set_version(&self, version: BackendVersion) {
        *self.version.lock().unwrap() = version;
    }

    /// Hook that fills in backend-assigned fields on every write
    pub(crate) fn set_realizer(&self, f: impl Fn(&mut RemoteObject) + Send + Sync + 'static) {
        *self.realizer.lock().unwrap() = Some(Arc::new(f));
    }

    pub(crate) fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_version(&self, fail: bool) {
        self.fail_version.store(fail, Ordering::SeqCst);
    }

    fn unavailable() -> Error {
        Error::Backend {
            status: 503,
            message: "backend unavailable".to_string(),
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryBackend {
    async fn create_or_update(&self, object: &RemoteObject) -> Result<RemoteObject> {
        let delay = *self.write_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }

        let mut realized = object.clone();
        let realizer = self.realizer.lock().unwrap().clone();
        if let Some(realizer) = realizer {
            realizer(&mut realized);
        }
        self.insert(realized.clone());
        Ok(realized)
    }

    async fn get(&self, _kind: RemoteKind, path: &str) -> Result<Option<RemoteObject>> {
        Ok(self.objects.lock().unwrap().get(path).cloned())
    }

    async fn delete(&self, _kind: RemoteKind, path: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }

        if self.objects.lock().unwrap().remove(path).is_some() {
            self.deleted.lock().unwrap().push(path.to_string());
        }
        Ok(())
    }

    async fn list_tracked(&self, kind: RemoteKind) -> Result<Vec<RemoteObject>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        Ok(self.objects_of(kind))
    }

    async fn version(&self) -> Result<BackendVersion> {
        if self.fail_version.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        Ok(*self.version.lock().unwrap())
    }
}
