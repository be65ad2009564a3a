//! Per-resource sync state machine.
//!
//! A pass either mirrors the object into every bound storage (update path) or removes it
//! from them (delete path). Progress is projected onto the object through the configured
//! [`StateDisplay`]; storages are visited in order and the first failure ends the pass.

use std::sync::Arc;
use std::time::Instant;

use kube::core::{DynamicObject, GroupVersionKind, ObjectMeta};
use kubesync_config::{KubeSyncConfig, StateType, StorageType, SyncConfig};
use kubesync_core::{add_finalizer, gvk_string, has_finalizer, remove_finalizer, type_meta, ErrorList, ObjectKey, ResourceKey, Transformer};
use kubesync_kubehub::{is_not_found, ResourceClient};
use kubesync_persist::{PersistContext, PersistError, Persister};
use kubesync_state::{AnnotationStateDisplay, ChangedSections, FieldValue, Phase, Section, StateDisplay, StatusStateDisplay, SyncState, Verbosity};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, info_span, Instrument};

use crate::update::{update_with_retry, RETRY_LIMIT};
use crate::ReconcileError;

/// Persister chains by storage name.
pub type PersisterSet = FxHashMap<String, Arc<dyn Persister>>;

/// One storage reference of a sync config, resolved to its persister.
#[derive(Clone)]
pub struct StorageBinding {
    pub name: String,
    pub storage_type: StorageType,
    pub sub_path: String,
    pub persister: Arc<dyn Persister>,
}

impl StorageBinding {
    fn key(&self, obj: &ObjectKey, gvk: &GroupVersionKind) -> ResourceKey {
        ResourceKey::new(obj.name.clone(), obj.namespace.as_deref(), gvk.clone(), self.sub_path.clone())
    }

    fn context(&self) -> PersistContext {
        PersistContext::new(info_span!("storage", storage = %self.name))
    }

    /// Runs a persister call on the blocking pool.
    async fn call<T, F>(&self, f: F) -> Result<T, StorageCallError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Persister, &PersistContext) -> Result<T, PersistError> + Send + 'static,
    {
        let persister = Arc::clone(&self.persister);
        let cx = self.context();
        let out = tokio::task::spawn_blocking(move || f(persister.as_ref(), &cx)).await??;
        Ok(out)
    }
}

#[derive(Debug, thiserror::Error)]
enum StorageCallError {
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error("persister task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Reconciles objects of one resource type against the storages of one sync config.
pub struct Reconciler {
    id: String,
    gvk: GroupVersionKind,
    client: Arc<dyn ResourceClient>,
    storages: Vec<StorageBinding>,
    state_display: Option<Arc<dyn StateDisplay>>,
    transformer: Arc<dyn Transformer>,
    finalize: bool,
    retry_limit: usize,
}

impl Reconciler {
    /// Resolves the storage references and state display of a completed sync config.
    pub fn new(
        cfg: &KubeSyncConfig,
        sync: &SyncConfig,
        persisters: &PersisterSet,
        client: Arc<dyn ResourceClient>,
        transformer: Arc<dyn Transformer>,
    ) -> Result<Self, ReconcileError> {
        let invalid = |reason: String| ReconcileError::InvalidSyncConfig { id: sync.id.clone(), reason };
        let gvk = sync.gvk().ok_or_else(|| invalid("missing resource".into()))?;
        let state_display = state_display_for(sync).map_err(invalid)?;

        let mut storages = Vec::with_capacity(sync.storage_refs.len());
        for (idx, r) in sync.storage_refs.iter().enumerate() {
            let (Some(persister), Some(def)) = (persisters.get(&r.name), cfg.storage(&r.name)) else {
                return Err(invalid(format!("unable to find storage definition '{}', which is referenced at index {idx}", r.name)));
            };
            storages.push(StorageBinding { name: r.name.clone(), storage_type: def.storage_type, sub_path: r.sub_path.clone(), persister: Arc::clone(persister) });
        }

        Ok(Self {
            id: sync.id.clone(),
            gvk,
            client,
            storages,
            state_display,
            transformer,
            finalize: sync.finalize(),
            retry_limit: RETRY_LIMIT,
        })
    }

    /// Assembles a reconciler from already resolved parts.
    pub fn from_parts(
        id: impl Into<String>,
        gvk: GroupVersionKind,
        client: Arc<dyn ResourceClient>,
        storages: Vec<StorageBinding>,
        state_display: Option<Arc<dyn StateDisplay>>,
        transformer: Arc<dyn Transformer>,
        finalize: bool,
    ) -> Self {
        Self { id: id.into(), gvk, client, storages, state_display, transformer, finalize, retry_limit: RETRY_LIMIT }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn gvk(&self) -> &GroupVersionKind {
        &self.gvk
    }

    pub fn storages(&self) -> &[StorageBinding] {
        &self.storages
    }

    pub fn state_display(&self) -> Option<&dyn StateDisplay> {
        self.state_display.as_deref()
    }

    pub fn finalize(&self) -> bool {
        self.finalize
    }

    /// `name<type>` of every bound storage, for logs.
    pub fn describe_storages(&self) -> String {
        let names: Vec<String> = self.storages.iter().map(|s| format!("{}<{}>", s.name, s.storage_type)).collect();
        format!("[{}]", names.join(", "))
    }

    /// Runs one pass for the object behind `key`.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<(), ReconcileError> {
        let span = info_span!("reconcile", id = %self.id, resource = %key);
        let started = Instant::now();
        let res = self.reconcile_inner(key).instrument(span).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        histogram!("reconcile_ms", elapsed_ms, "id" => self.id.clone());
        counter!("reconcile_total", 1u64, "id" => self.id.clone());
        if res.is_err() {
            counter!("reconcile_error_total", 1u64, "id" => self.id.clone());
        }
        res
    }

    async fn reconcile_inner(&self, key: &ObjectKey) -> Result<(), ReconcileError> {
        info!("starting reconcile");
        let mut obj = match self.client.get(key).await {
            Ok(Some(obj)) => obj,
            Ok(None) => return self.handle_delete(key, self.stub(key)).await,
            Err(e) if is_not_found(&e) => return self.handle_delete(key, self.stub(key)).await,
            Err(e) => return Err(ReconcileError::Fetch(e)),
        };
        if obj.types.is_none() {
            obj.types = Some(type_meta(&self.gvk));
        }
        if obj.metadata.deletion_timestamp.is_some() {
            return self.handle_delete(key, obj).await;
        }
        self.handle_create_or_update(key, obj).await
    }

    /// Placeholder for an object that is gone from the cluster.
    fn stub(&self, key: &ObjectKey) -> DynamicObject {
        DynamicObject {
            types: Some(type_meta(&self.gvk)),
            metadata: ObjectMeta { name: Some(key.name.clone()), namespace: key.namespace.clone(), ..Default::default() },
            data: serde_json::Value::Object(Default::default()),
        }
    }

    async fn handle_create_or_update(&self, key: &ObjectKey, mut obj: DynamicObject) -> Result<(), ReconcileError> {
        info!("handling creation or update");

        if self.finalize && !has_finalizer(&obj) {
            let res = update_with_retry(self.client.as_ref(), &mut obj, |o| Ok(metadata_changed(add_finalizer(o))), self.retry_limit).await;
            if let Err(e) = res {
                error!(error = %e, "error adding finalizer");
                return Err(self.fail(&mut obj, Phase::Error, format!("error adding finalizer: {e}"), true).await);
            }
        }

        self.write_state(&mut obj, &[FieldValue::Phase(Phase::Progressing), FieldValue::Detail(String::new())]).await?;

        for storage in &self.storages {
            let rk = storage.key(key, &self.gvk);
            let old = match storage.call(move |p, cx| p.get(cx, &rk)).await {
                Ok(old) => old,
                Err(e) => return Err(self.storage_failure(&mut obj, storage, "error while reading old resource", e).await),
            };
            let new = match self.transformer.transform_and_serialize(&obj) {
                Ok(new) => new,
                Err(e) => return Err(self.storage_failure(&mut obj, storage, "error while transforming resource", e).await),
            };
            if old.as_ref().map(|a| a.as_bytes()) == Some(new.as_slice()) {
                debug!(storage = %storage.name, "no relevant fields have changed, updating the resource is not necessary");
                continue;
            }

            let target = obj.clone();
            let transformer = Arc::clone(&self.transformer);
            let sub_path = storage.sub_path.clone();
            let res = storage.call(move |p, cx| p.persist(cx, &target, transformer.as_ref(), &sub_path)).await;
            match res {
                Ok(persisted) => debug!(storage = %storage.name, changed = persisted.changed, "resource persisted"),
                Err(e) => return Err(self.storage_failure(&mut obj, storage, "error while persisting resource", e).await),
            }
        }

        let generation = obj.metadata.generation.unwrap_or(0);
        self.write_state(
            &mut obj,
            &[FieldValue::Generation(generation), FieldValue::Phase(Phase::Finished), FieldValue::Detail(String::new())],
        )
        .await?;
        info!(generation, "resource synced");
        Ok(())
    }

    async fn handle_delete(&self, key: &ObjectKey, mut obj: DynamicObject) -> Result<(), ReconcileError> {
        info!("handling deletion");
        // Without a finalizer the object may vanish before a state write lands.
        let finalized = has_finalizer(&obj);

        if finalized {
            self.write_state(&mut obj, &[FieldValue::Phase(Phase::Deleting), FieldValue::Detail(String::new())]).await?;
        }

        for storage in &self.storages {
            let rk = storage.key(key, &self.gvk);
            let probe = rk.clone();
            let exists = match storage.call(move |p, cx| p.exists(cx, &probe)).await {
                Ok(exists) => exists,
                Err(e) => {
                    error!(storage = %storage.name, error = %e, "error while checking for data existence");
                    let msg = format!("error while checking for data existence: {e}");
                    return Err(self.fail(&mut obj, Phase::ErrorDeleting, msg, finalized).await);
                }
            };
            if !exists {
                // Ends the whole pass, also for the remaining storages.
                debug!(storage = %storage.name, "no data found for current resource, skipping deletion");
                return Ok(());
            }
            if let Err(e) = storage.call(move |p, cx| p.delete(cx, &rk)).await {
                error!(storage = %storage.name, error = %e, "error while deleting data");
                let msg = format!("error while deleting data: {e}");
                return Err(self.fail(&mut obj, Phase::ErrorDeleting, msg, finalized).await);
            }
        }

        if finalized {
            let res = update_with_retry(self.client.as_ref(), &mut obj, |o| Ok(metadata_changed(remove_finalizer(o))), self.retry_limit).await;
            if let Err(e) = res {
                error!(error = %e, "error removing finalizer");
                return Err(self.fail(&mut obj, Phase::Error, format!("error removing finalizer: {e}"), true).await);
            }
        }
        info!("resource removed from storages");
        Ok(())
    }

    async fn storage_failure(&self, obj: &mut DynamicObject, storage: &StorageBinding, what: &str, err: impl std::fmt::Display) -> ReconcileError {
        error!(storage = %storage.name, error = %err, "{}", what);
        self.fail(obj, Phase::Error, format!("[{}] {what}: {err}", storage.name), true).await
    }

    /// Builds the error of a failed pass and, if `report` is set, projects it onto the object.
    async fn fail(&self, obj: &mut DynamicObject, phase: Phase, msg: String, report: bool) -> ReconcileError {
        let mut errs = ErrorList::new();
        errs.push(msg);
        if report {
            let detail = errs.to_string();
            errs.push_result(self.write_state(obj, &[FieldValue::Phase(phase), FieldValue::Detail(detail)]).await);
        }
        ReconcileError::Failed(errs)
    }

    /// Writes those of `values` the display's verbosity includes. No-op without a display.
    async fn write_state(&self, obj: &mut DynamicObject, values: &[FieldValue]) -> Result<(), ReconcileError> {
        let Some(state_display) = self.state_display.as_deref() else { return Ok(()) };
        let verbosity = state_display.verbosity();
        let mut state = SyncState::new(verbosity);
        let mut fields = Vec::with_capacity(values.len());
        for value in values.iter().filter(|v| verbosity.includes(v.field())) {
            fields.push(value.field());
            state.set(value.clone());
        }
        debug!(
            state_display = state_display.kind(),
            verbosity = %verbosity,
            phase = %state.phase,
            generation = state.last_synced_generation,
            "updating resource state"
        );
        update_with_retry(
            self.client.as_ref(),
            obj,
            |o| state_display.write(o, &state, &fields).map_err(|source| ReconcileError::State { kind: state_display.kind(), source }),
            self.retry_limit,
        )
        .await
    }
}

fn metadata_changed(changed: bool) -> ChangedSections {
    let mut out = ChangedSections::new();
    if changed {
        out.insert(Section::Metadata);
    }
    out
}

fn state_display_for(sync: &SyncConfig) -> Result<Option<Arc<dyn StateDisplay>>, String> {
    let Some(cfg) = sync.state.as_ref() else { return Ok(None) };
    let verbosity = cfg.verbosity.unwrap_or(Verbosity::Phase);
    Ok(match cfg.state_type {
        StateType::None => None,
        StateType::Annotation => Some(Arc::new(AnnotationStateDisplay::new(verbosity))),
        StateType::Status => {
            let status = cfg.status_config.as_ref().ok_or_else(|| "missing status state configuration for state type 'status'".to_string())?;
            Some(Arc::new(StatusStateDisplay::new(&status.generation_path, &status.phase_path, &status.detail_path, verbosity)))
        }
    })
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("id", &self.id)
            .field("gvk", &gvk_string(&self.gvk))
            .field("storages", &self.describe_storages())
            .field("state_display", &self.state_display.as_ref().map(|d| d.kind()))
            .field("finalize", &self.finalize)
            .finish()
    }
}
