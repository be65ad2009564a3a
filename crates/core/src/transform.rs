//! Reduction of a cluster object to the stable form that is stored and diffed.

use kube::core::DynamicObject;
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("error converting object to json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("error while marshalling object to yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("object has no metadata")]
    MissingMetadata,
}

/// Turns an object into its canonical, persistable representation.
///
/// Implementations must be pure: the same input always yields byte-identical output.
pub trait Transformer: Send + Sync {
    fn transform(&self, obj: &DynamicObject) -> Result<Value, TransformError>;

    fn transform_and_serialize(&self, obj: &DynamicObject) -> Result<Vec<u8>, TransformError> {
        let value = self.transform(obj)?;
        Ok(serde_yaml::to_string(&value)?.into_bytes())
    }
}

/// Keeps `apiVersion`, `kind` and the object's content, reduces `metadata` to a fixed
/// set of non-volatile fields and drops `status`.
#[derive(Debug, Clone)]
pub struct BasicTransformer {
    metadata_fields: Vec<String>,
}

pub const DEFAULT_METADATA_FIELDS: [&str; 6] = ["name", "generateName", "namespace", "uid", "labels", "ownerReferences"];

impl Default for BasicTransformer {
    fn default() -> Self {
        Self { metadata_fields: DEFAULT_METADATA_FIELDS.iter().map(|s| s.to_string()).collect() }
    }
}

impl BasicTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the retained metadata fields.
    pub fn with_metadata_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { metadata_fields: fields.into_iter().map(Into::into).collect() }
    }
}

impl Transformer for BasicTransformer {
    fn transform(&self, obj: &DynamicObject) -> Result<Value, TransformError> {
        let mut raw = serde_json::to_value(obj)?;
        let root = raw.as_object_mut().ok_or(TransformError::MissingMetadata)?;
        let old_meta = match root.remove("metadata") {
            Some(Value::Object(m)) => m,
            _ => return Err(TransformError::MissingMetadata),
        };
        let mut meta = Map::new();
        for field in &self.metadata_fields {
            match old_meta.get(field) {
                Some(Value::Null) | None => {}
                Some(v) => {
                    meta.insert(field.clone(), v.clone());
                }
            }
        }
        root.insert("metadata".into(), Value::Object(meta));
        root.remove("status");
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "cm",
                "namespace": "default",
                "uid": "1234",
                "resourceVersion": "42",
                "generation": 3,
                "labels": { "app": "demo" },
                "annotations": { "note": "volatile" },
                "managedFields": [{ "manager": "kubectl" }],
            },
            "data": { "k": "v" },
            "status": { "phase": "Ready" },
        }))
        .unwrap()
    }

    #[test]
    fn basic_transform_prunes_volatile_fields() {
        let out = BasicTransformer::new().transform(&sample()).unwrap();
        assert_eq!(out["apiVersion"], "v1");
        assert_eq!(out["kind"], "ConfigMap");
        assert_eq!(out["data"]["k"], "v");
        assert!(out.get("status").is_none());
        let meta = out["metadata"].as_object().unwrap();
        let mut keys: Vec<_> = meta.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["labels", "name", "namespace", "uid"]);
    }

    #[test]
    fn serialization_ignores_status_and_bookkeeping_changes() {
        let t = BasicTransformer::new();
        let a = t.transform_and_serialize(&sample()).unwrap();
        let mut changed = sample();
        changed.metadata.resource_version = Some("43".into());
        changed.data["status"] = json!({ "phase": "Failed" });
        let b = t.transform_and_serialize(&changed).unwrap();
        assert_eq!(a, b);
        assert!(String::from_utf8(a).unwrap().contains("name: cm"));
    }

    #[test]
    fn custom_metadata_fields() {
        let out = BasicTransformer::with_metadata_fields(["name"]).transform(&sample()).unwrap();
        assert_eq!(out["metadata"], json!({ "name": "cm" }));
    }
}
