//! In-memory cluster used by the controller tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use kube::core::{DynamicObject, ErrorResponse};
use kubesync_core::ObjectKey;
use kubesync_kubehub::ResourceClient;
use serde_json::json;

pub(crate) fn widget(ns: &str, name: &str, generation: i64) -> DynamicObject {
    serde_json::from_value(json!({
        "apiVersion": "example.org/v1",
        "kind": "Widget",
        "metadata": { "name": name, "namespace": ns, "uid": format!("uid-{name}"), "generation": generation, "resourceVersion": "1" },
        "spec": { "size": generation },
    }))
    .unwrap()
}

fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse { status: "Failure".into(), message: reason.to_lowercase(), reason: reason.into(), code })
}

/// Stores objects by key and mimics the update semantics of the API server: regular updates
/// keep the stored status, status updates keep everything else, and an object that is being
/// deleted disappears once its last finalizer is removed.
#[derive(Default)]
pub(crate) struct FakeClient {
    objects: Mutex<BTreeMap<ObjectKey, DynamicObject>>,
    conflicts: AtomicUsize,
    failing_gets: AtomicUsize,
    version: AtomicU64,
    writes: Mutex<Vec<&'static str>>,
}

impl FakeClient {
    pub(crate) fn with(obj: DynamicObject) -> Self {
        let client = Self { version: AtomicU64::new(1), ..Default::default() };
        client.insert(obj);
        client
    }

    pub(crate) fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, obj: DynamicObject) {
        let key = ObjectKey::from_object(&obj).unwrap();
        self.objects.lock().unwrap().insert(key, obj);
    }

    pub(crate) fn stored(&self, key: &ObjectKey) -> Option<DynamicObject> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    /// The next `n` writes fail with a version conflict.
    pub(crate) fn inject_conflicts(&self, n: usize) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    /// The next `n` reads fail with a server error.
    pub(crate) fn fail_gets(&self, n: usize) {
        self.failing_gets.store(n, Ordering::SeqCst);
    }

    pub(crate) fn remove(&self, key: &ObjectKey) {
        self.objects.lock().unwrap().remove(key);
    }

    /// Successful writes, in order.
    pub(crate) fn writes(&self) -> Vec<&'static str> {
        self.writes.lock().unwrap().clone()
    }

    fn write(&self, kind: &'static str, obj: &DynamicObject, merge: impl FnOnce(&DynamicObject, &DynamicObject) -> DynamicObject) -> Result<DynamicObject, kube::Error> {
        if self.conflicts.load(Ordering::SeqCst) > 0 {
            self.conflicts.fetch_sub(1, Ordering::SeqCst);
            return Err(api_error(409, "Conflict"));
        }
        let key = ObjectKey::from_object(obj).unwrap();
        let mut objects = self.objects.lock().unwrap();
        let Some(stored) = objects.get(&key) else { return Err(api_error(404, "NotFound")) };
        let mut next = merge(stored, obj);
        let rv = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        next.metadata.resource_version = Some(rv.to_string());
        let gone = next.metadata.deletion_timestamp.is_some() && next.metadata.finalizers.as_ref().map_or(true, |f| f.is_empty());
        if gone {
            objects.remove(&key);
        } else {
            objects.insert(key, next.clone());
        }
        self.writes.lock().unwrap().push(kind);
        Ok(next)
    }
}

fn with_status_of(target: &DynamicObject, source: &DynamicObject) -> DynamicObject {
    let mut out = target.clone();
    match source.data.get("status") {
        Some(status) => out.data["status"] = status.clone(),
        None => {
            if let Some(map) = out.data.as_object_mut() {
                map.remove("status");
            }
        }
    }
    out
}

#[async_trait::async_trait]
impl ResourceClient for FakeClient {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, kube::Error> {
        if self.failing_gets.load(Ordering::SeqCst) > 0 {
            self.failing_gets.fetch_sub(1, Ordering::SeqCst);
            return Err(api_error(500, "InternalError"));
        }
        Ok(self.stored(key))
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, kube::Error> {
        self.write("update", obj, |stored, new| with_status_of(new, stored))
    }

    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, kube::Error> {
        self.write("update_status", obj, |stored, new| with_status_of(stored, new))
    }
}
