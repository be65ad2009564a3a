use kube::core::DynamicObject;
use kubesync_core::{ANNOTATION_DETAIL, ANNOTATION_LAST_SYNCED_GENERATION, ANNOTATION_PHASE};

use crate::{ChangedSections, FieldValue, Section, StateDisplay, StateError, StateField, SyncState, Verbosity};

/// Stores the state in three fixed annotations on the object.
#[derive(Debug, Clone)]
pub struct AnnotationStateDisplay {
    verbosity: Verbosity,
}

impl AnnotationStateDisplay {
    pub fn new(verbosity: Verbosity) -> Self {
        Self { verbosity }
    }

    pub fn annotation_key(field: StateField) -> &'static str {
        match field {
            StateField::LastSyncedGeneration => ANNOTATION_LAST_SYNCED_GENERATION,
            StateField::Phase => ANNOTATION_PHASE,
            StateField::Detail => ANNOTATION_DETAIL,
        }
    }
}

impl StateDisplay for AnnotationStateDisplay {
    fn kind(&self) -> &'static str {
        "annotation"
    }

    fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    fn read(&self, obj: &DynamicObject) -> Result<SyncState, StateError> {
        let Some(annotations) = obj.metadata.annotations.as_ref() else {
            return Err(StateError::missing(self.verbosity, vec![]));
        };
        let mut state = SyncState::new(self.verbosity);
        let mut missing = Vec::new();
        for field in self.verbosity.fields() {
            match annotations.get(Self::annotation_key(field)) {
                Some(raw) => state.set(FieldValue::from_annotation(field, raw)?),
                None => missing.push(field),
            }
        }
        if !missing.is_empty() {
            return Err(StateError::missing(self.verbosity, missing));
        }
        Ok(state)
    }

    fn write(&self, obj: &mut DynamicObject, state: &SyncState, fields: &[StateField]) -> Result<ChangedSections, StateError> {
        let mut changed = ChangedSections::new();
        for field in fields.iter().copied().filter(|f| state.verbosity.includes(*f)) {
            let key = Self::annotation_key(field);
            let value = state.get(field).to_annotation();
            let annotations = obj.metadata.annotations.get_or_insert_with(Default::default);
            if annotations.get(key) == Some(&value) {
                continue;
            }
            annotations.insert(key.to_string(), value);
            changed.insert(Section::Metadata);
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Phase;
    use serde_json::json;

    fn object(annotations: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "cm", "namespace": "default", "generation": 2, "annotations": annotations },
        }))
        .unwrap()
    }

    #[test]
    fn read_requires_fields_of_verbosity() {
        let display = AnnotationStateDisplay::new(Verbosity::Detail);
        let obj = object(json!({ ANNOTATION_LAST_SYNCED_GENERATION: "2" }));
        match display.read(&obj) {
            Err(StateError::MissingState { fields, .. }) => assert_eq!(fields, vec![StateField::Phase, StateField::Detail]),
            other => panic!("unexpected: {other:?}"),
        }
        let lower = AnnotationStateDisplay::new(Verbosity::Generation);
        assert_eq!(lower.read(&obj).unwrap().last_synced_generation, 2);
    }

    #[test]
    fn read_without_annotations_reports_missing_state() {
        let mut obj = object(json!({}));
        obj.metadata.annotations = None;
        let err = AnnotationStateDisplay::new(Verbosity::Phase).read(&obj).unwrap_err();
        assert_eq!(err.to_string(), "state verbosity is 'phase', but the state is missing");
    }

    #[test]
    fn read_rejects_unparsable_generation() {
        let obj = object(json!({ ANNOTATION_LAST_SYNCED_GENERATION: "two" }));
        let err = AnnotationStateDisplay::new(Verbosity::Generation).read(&obj).unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[test]
    fn write_is_filtered_and_idempotent() {
        let display = AnnotationStateDisplay::new(Verbosity::Phase);
        let mut obj = object(json!({ "other": "kept" }));
        let state = SyncState::new(Verbosity::Phase)
            .with(FieldValue::Generation(2))
            .with(FieldValue::Phase(Phase::Finished))
            .with(FieldValue::Detail("ignored".into()));

        let changed = display.write(&mut obj, &state, &StateField::ALL).unwrap();
        assert_eq!(changed, ChangedSections::from([Section::Metadata]));
        let ann = obj.metadata.annotations.clone().unwrap();
        assert_eq!(ann.get(ANNOTATION_PHASE).map(String::as_str), Some("Finished"));
        assert_eq!(ann.get(ANNOTATION_LAST_SYNCED_GENERATION).map(String::as_str), Some("2"));
        assert!(!ann.contains_key(ANNOTATION_DETAIL));
        assert_eq!(ann.get("other").map(String::as_str), Some("kept"));

        let again = display.write(&mut obj, &state, &StateField::ALL).unwrap();
        assert!(again.is_empty());
        assert_eq!(display.read(&obj).unwrap().phase, Phase::Finished);
    }

    #[test]
    fn detail_verbosity_roundtrip_keeps_all_fields() {
        let display = AnnotationStateDisplay::new(Verbosity::Detail);
        let mut obj = object(json!({}));
        let state = SyncState::new(Verbosity::Detail)
            .with(FieldValue::Generation(9))
            .with(FieldValue::Phase(Phase::Error))
            .with(FieldValue::Detail("[repo] push failed".into()));
        display.write(&mut obj, &state, &StateField::ALL).unwrap();
        assert_eq!(display.read(&obj).unwrap(), state);
    }
}
