//! KubeSync core types: resource identity, reserved names and the transformer contract.

#![forbid(unsafe_code)]

use std::fmt;

use kube::core::{DynamicObject, GroupVersionKind, TypeMeta};
use serde::{Deserialize, Serialize};

mod errors;
mod json_path;
pub mod transform;

pub use errors::ErrorList;
pub use json_path::parse_simple_json_path;
pub use transform::{BasicTransformer, TransformError, Transformer};

/// Annotation holding the last generation that was synced to every storage.
pub const ANNOTATION_LAST_SYNCED_GENERATION: &str = "state.kubesync.io/lastSyncedGeneration";
/// Annotation holding the current sync phase.
pub const ANNOTATION_PHASE: &str = "state.kubesync.io/phase";
/// Annotation holding error details of the last sync attempt.
pub const ANNOTATION_DETAIL: &str = "state.kubesync.io/detail";
/// Finalizer that blocks deletion until the resource was removed from all storages.
pub const FINALIZER: &str = "finalizer.kubesync.io";

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("object is missing apiVersion/kind")]
    MissingTypeMeta,
    #[error("object is missing metadata.name")]
    MissingName,
    #[error("invalid apiVersion '{0}'")]
    InvalidApiVersion(String),
}

/// Cluster identity of a watched object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self { namespace: normalize_namespace(namespace), name: name.into() }
    }

    pub fn from_object(obj: &DynamicObject) -> Option<Self> {
        let name = obj.metadata.name.as_deref()?;
        Some(Self::new(obj.metadata.namespace.as_deref(), name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Identity of a persisted artifact inside one storage backend.
///
/// `sub_path` is the storage-relative directory of the sync binding that owns the artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceKey {
    pub name: String,
    pub namespace: Option<String>,
    pub gvk: GroupVersionKind,
    pub sub_path: String,
}

impl ResourceKey {
    pub fn new(name: impl Into<String>, namespace: Option<&str>, gvk: GroupVersionKind, sub_path: impl Into<String>) -> Self {
        Self { name: name.into(), namespace: normalize_namespace(namespace), gvk, sub_path: sub_path.into() }
    }

    pub fn for_object(obj: &DynamicObject, sub_path: &str) -> Result<Self, CoreError> {
        let name = obj.metadata.name.as_deref().ok_or(CoreError::MissingName)?;
        let gvk = gvk_of(obj)?;
        Ok(Self::new(name, obj.metadata.namespace.as_deref(), gvk, sub_path))
    }

    pub fn object_key(&self) -> ObjectKey {
        ObjectKey { namespace: self.namespace.clone(), name: self.name.clone() }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", gvk_string(&self.gvk), self.object_key())
    }
}

fn normalize_namespace(namespace: Option<&str>) -> Option<String> {
    namespace.filter(|ns| !ns.is_empty()).map(str::to_string)
}

/// `<lowercase kind>.<version>.<group>`, without a trailing dot for the core group.
pub fn gvk_string(gvk: &GroupVersionKind) -> String {
    let raw = format!("{}.{}.{}", gvk.kind.to_lowercase(), gvk.version, gvk.group);
    match raw.strip_suffix('.') {
        Some(trimmed) => trimmed.to_string(),
        None => raw,
    }
}

pub fn api_version(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        gvk.version.clone()
    } else {
        format!("{}/{}", gvk.group, gvk.version)
    }
}

pub fn type_meta(gvk: &GroupVersionKind) -> TypeMeta {
    TypeMeta { api_version: api_version(gvk), kind: gvk.kind.clone() }
}

/// Reads the group/version/kind from the object's type information.
pub fn gvk_of(obj: &DynamicObject) -> Result<GroupVersionKind, CoreError> {
    let types = obj.types.as_ref().ok_or(CoreError::MissingTypeMeta)?;
    if types.kind.is_empty() {
        return Err(CoreError::MissingTypeMeta);
    }
    let (group, version) = match types.api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", types.api_version.as_str()),
    };
    if version.is_empty() || version.contains('/') {
        return Err(CoreError::InvalidApiVersion(types.api_version.clone()));
    }
    Ok(GroupVersionKind { group: group.to_string(), version: version.to_string(), kind: types.kind.clone() })
}

pub fn has_finalizer(obj: &DynamicObject) -> bool {
    obj.metadata.finalizers.as_ref().map(|f| f.iter().any(|x| x == FINALIZER)).unwrap_or(false)
}

/// Adds the sync finalizer; returns false if it was already present.
pub fn add_finalizer(obj: &mut DynamicObject) -> bool {
    if has_finalizer(obj) {
        return false;
    }
    obj.metadata.finalizers.get_or_insert_with(Vec::new).push(FINALIZER.to_string());
    true
}

/// Removes the sync finalizer; returns false if it was not present.
pub fn remove_finalizer(obj: &mut DynamicObject) -> bool {
    let Some(finalizers) = obj.metadata.finalizers.as_mut() else { return false };
    let before = finalizers.len();
    finalizers.retain(|f| f != FINALIZER);
    finalizers.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gvk(group: &str, version: &str, kind: &str) -> GroupVersionKind {
        GroupVersionKind { group: group.into(), version: version.into(), kind: kind.into() }
    }

    fn object(api_version: &str, kind: &str, ns: Option<&str>, name: &str) -> DynamicObject {
        let mut obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": api_version,
            "kind": kind,
            "metadata": { "name": name }
        }))
        .unwrap();
        obj.metadata.namespace = ns.map(str::to_string);
        obj
    }

    #[test]
    fn gvk_string_drops_trailing_dot_for_core_group() {
        assert_eq!(gvk_string(&gvk("", "v1", "ConfigMap")), "configmap.v1");
        assert_eq!(gvk_string(&gvk("apps", "v1", "Deployment")), "deployment.v1.apps");
    }

    #[test]
    fn gvk_of_parses_core_and_grouped_api_versions() {
        let core = object("v1", "Secret", Some("default"), "a");
        assert_eq!(gvk_of(&core).unwrap(), gvk("", "v1", "Secret"));
        let grouped = object("cert-manager.io/v1", "Certificate", None, "b");
        assert_eq!(gvk_of(&grouped).unwrap(), gvk("cert-manager.io", "v1", "Certificate"));
        let broken = object("a/b/c", "Thing", None, "c");
        assert!(matches!(gvk_of(&broken), Err(CoreError::InvalidApiVersion(_))));
    }

    #[test]
    fn resource_key_normalizes_empty_namespace() {
        let key = ResourceKey::new("cm", Some(""), gvk("", "v1", "ConfigMap"), "");
        assert_eq!(key.namespace, None);
        assert_eq!(key.to_string(), "configmap.v1 cm");
        let key = ResourceKey::new("cm", Some("team"), gvk("", "v1", "ConfigMap"), "");
        assert_eq!(key.to_string(), "configmap.v1 team/cm");
    }

    #[test]
    fn finalizer_helpers_are_idempotent() {
        let mut obj = object("v1", "ConfigMap", Some("default"), "cm");
        assert!(!has_finalizer(&obj));
        assert!(add_finalizer(&mut obj));
        assert!(!add_finalizer(&mut obj));
        assert_eq!(obj.metadata.finalizers.as_ref().map(Vec::len), Some(1));
        assert!(remove_finalizer(&mut obj));
        assert!(!remove_finalizer(&mut obj));
        assert!(!has_finalizer(&obj));
    }
}
