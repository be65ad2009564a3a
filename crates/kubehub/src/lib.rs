//! KubeSync kubehub: kube client construction, discovery and the filtered watch pump that
//! feeds object keys to the controllers.

#![forbid(unsafe_code)]

use std::hash::{Hash, Hasher};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use kube::{
    api::{Api, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Config,
};
use kubesync_core::{gvk_string, ObjectKey};
use metrics::counter;
use rustc_hash::{FxHashMap, FxHasher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Client from an explicit kubeconfig file, or from the default discovery (env, in-cluster).
pub async fn client_from(kubeconfig: Option<&Path>) -> Result<Client> {
    match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
            let cfg = Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default()).await.context("building client config")?;
            Client::try_from(cfg).context("creating kube client")
        }
        None => Client::try_default().await.context("creating kube client"),
    }
}

/// Resolves a GVK to its API resource and whether it is namespaced.
pub async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn api_for(client: Client, ar: &ApiResource, namespaced: bool, namespace: Option<&str>) -> Api<DynamicObject> {
    match namespace {
        Some(ns) if namespaced => Api::namespaced_with(client, ns, ar),
        _ => Api::all_with(client, ar),
    }
}

pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Reads and writes single objects of one resource type.
#[async_trait::async_trait]
pub trait ResourceClient: Send + Sync {
    /// `Ok(None)` if the object does not exist.
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, kube::Error>;

    /// Replaces the object; the `resourceVersion` of `obj` guards against lost updates.
    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, kube::Error>;

    /// Replaces the status subresource.
    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, kube::Error>;
}

#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
    ar: ApiResource,
    namespaced: bool,
}

impl KubeResourceClient {
    pub fn new(client: Client, ar: ApiResource, namespaced: bool) -> Self {
        Self { client, ar, namespaced }
    }

    /// Discovers the API resource for `gvk`.
    pub async fn discover(client: Client, gvk: &GroupVersionKind) -> Result<Self> {
        let (ar, namespaced) = find_api_resource(client.clone(), gvk).await?;
        Ok(Self::new(client, ar, namespaced))
    }

    pub fn api_resource(&self) -> &ApiResource {
        &self.ar
    }

    pub fn namespaced(&self) -> bool {
        self.namespaced
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        api_for(self.client.clone(), &self.ar, self.namespaced, namespace)
    }

    fn name_of(obj: &DynamicObject) -> Result<&str, kube::Error> {
        obj.metadata.name.as_deref().ok_or_else(|| kube::Error::Service("object without metadata.name".into()))
    }
}

#[async_trait::async_trait]
impl ResourceClient for KubeResourceClient {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, kube::Error> {
        self.api(key.namespace.as_deref()).get_opt(&key.name).await
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, kube::Error> {
        let name = Self::name_of(obj)?;
        self.api(obj.metadata.namespace.as_deref()).replace(name, &PostParams::default(), obj).await
    }

    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, kube::Error> {
        let name = Self::name_of(obj)?;
        let body = serde_json::to_vec(obj).map_err(kube::Error::SerdeError)?;
        self.api(obj.metadata.namespace.as_deref()).replace_status(name, &PostParams::default(), body).await
    }
}

/// Drops watch events that cannot require a reconcile.
///
/// Tracks a fingerprint over generation, labels, owner references and, when finalizing,
/// the deletion timestamp. Annotation and status changes (including the controller's own
/// state writes) leave the fingerprint unchanged.
#[derive(Debug, Default)]
pub struct TriggerFilter {
    finalize: bool,
    seen: FxHashMap<ObjectKey, u64>,
}

impl TriggerFilter {
    pub fn new(finalize: bool) -> Self {
        Self { finalize, seen: FxHashMap::default() }
    }

    pub fn fingerprint(&self, obj: &DynamicObject) -> u64 {
        let meta = &obj.metadata;
        let mut h = FxHasher::default();
        meta.generation.hash(&mut h);
        meta.labels.hash(&mut h);
        // OwnerReference is not Hash; its JSON form is stable.
        serde_json::to_string(&meta.owner_references).unwrap_or_default().hash(&mut h);
        if self.finalize {
            meta.deletion_timestamp.as_ref().map(|t| t.0.timestamp()).hash(&mut h);
        }
        h.finish()
    }

    /// Returns the key if the object is new or its fingerprint changed.
    pub fn applied(&mut self, obj: &DynamicObject) -> Option<ObjectKey> {
        let key = ObjectKey::from_object(obj)?;
        let fp = self.fingerprint(obj);
        match self.seen.insert(key.clone(), fp) {
            Some(prev) if prev == fp => None,
            _ => Some(key),
        }
    }

    pub fn deleted(&mut self, obj: &DynamicObject) -> Option<ObjectKey> {
        let key = ObjectKey::from_object(obj)?;
        self.seen.remove(&key);
        Some(key)
    }

    /// Handles a relist: changed and new objects plus objects that vanished meanwhile.
    pub fn restarted(&mut self, objs: &[DynamicObject]) -> Vec<ObjectKey> {
        let mut out: Vec<ObjectKey> = objs.iter().filter_map(|o| self.applied(o)).collect();
        let present: rustc_hash::FxHashSet<ObjectKey> = objs.iter().filter_map(ObjectKey::from_object).collect();
        let vanished: Vec<ObjectKey> = self.seen.keys().filter(|k| !present.contains(*k)).cloned().collect();
        for key in vanished {
            self.seen.remove(&key);
            out.push(key);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// What to watch and how to filter it.
#[derive(Debug, Clone)]
pub struct WatchTarget {
    pub ar: ApiResource,
    pub namespaced: bool,
    pub namespace: Option<String>,
    pub finalize: bool,
}

/// List+watch the target and send the keys of objects that need a reconcile.
/// Returns when the receiver is gone.
pub async fn watch_resources(client: Client, target: WatchTarget, tx: mpsc::Sender<ObjectKey>) -> Result<()> {
    let gvk = GroupVersionKind::gvk(&target.ar.group, &target.ar.version, &target.ar.kind);
    let gvk_key = gvk_string(&gvk);
    let api = api_for(client, &target.ar, target.namespaced, target.namespace.as_deref());
    let mut filter = TriggerFilter::new(target.finalize);

    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(gvk = %gvk_key, ns = ?target.namespace, "watcher started");
    while let Some(ev) = stream.next().await {
        let keys = match ev {
            Ok(Event::Applied(o)) => filter.applied(&o).into_iter().collect(),
            Ok(Event::Deleted(o)) => filter.deleted(&o).into_iter().collect(),
            Ok(Event::Restarted(list)) => {
                debug!(gvk = %gvk_key, count = list.len(), "watch restart");
                filter.restarted(&list)
            }
            Err(e) => {
                warn!(gvk = %gvk_key, error = %e, "watch error");
                continue;
            }
        };
        counter!("watch_events_total", 1u64, "gvk" => gvk_key.clone());
        if keys.is_empty() {
            counter!("watch_events_filtered_total", 1u64, "gvk" => gvk_key.clone());
            continue;
        }
        for key in keys {
            if tx.send(key).await.is_err() {
                debug!(gvk = %gvk_key, "event receiver closed");
                return Ok(());
            }
        }
    }
    warn!(gvk = %gvk_key, "watcher stream ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn widget(generation: i64, labels: serde_json::Value, status: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "example.org/v1",
            "kind": "Widget",
            "metadata": { "name": "w", "namespace": "team", "generation": generation, "labels": labels },
            "status": { "phase": status },
        }))
        .unwrap()
    }

    #[test]
    fn status_and_annotation_changes_are_filtered() {
        let mut f = TriggerFilter::new(true);
        let first = widget(1, json!({ "a": "1" }), "Progressing");
        assert_eq!(f.applied(&first), Some(ObjectKey::new(Some("team"), "w")));

        let status_only = widget(1, json!({ "a": "1" }), "Finished");
        assert_eq!(f.applied(&status_only), None);

        let mut annotated = status_only.clone();
        annotated.metadata.annotations = Some([("state.kubesync.io/phase".to_string(), "Finished".to_string())].into());
        assert_eq!(f.applied(&annotated), None);

        assert!(f.applied(&widget(2, json!({ "a": "1" }), "Finished")).is_some());
        assert!(f.applied(&widget(2, json!({ "a": "2" }), "Finished")).is_some());
    }

    #[test]
    fn deletion_timestamp_only_counts_when_finalizing() {
        let obj = widget(1, json!({}), "");
        let mut deleting = obj.clone();
        deleting.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(k8s_openapi::chrono::Utc::now()));

        let mut finalizing = TriggerFilter::new(true);
        finalizing.applied(&obj);
        assert!(finalizing.applied(&deleting).is_some());

        let mut plain = TriggerFilter::new(false);
        plain.applied(&obj);
        assert!(plain.applied(&deleting).is_none());
    }

    #[test]
    fn deleted_and_vanished_objects_pass() {
        let mut f = TriggerFilter::new(false);
        let a = widget(1, json!({}), "");
        let mut b = a.clone();
        b.metadata.name = Some("other".into());
        f.applied(&a);
        f.applied(&b);
        assert_eq!(f.deleted(&a), Some(ObjectKey::new(Some("team"), "w")));
        assert_eq!(f.len(), 1);

        f.applied(&a);
        let keys = f.restarted(&[a.clone()]);
        assert_eq!(keys, vec![ObjectKey::new(Some("team"), "other")]);
        assert_eq!(f.len(), 1);
    }
}
