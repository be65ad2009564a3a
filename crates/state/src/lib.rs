//! KubeSync sync state: a small record (generation, phase, detail) projected onto the
//! synced resource, either as annotations or at configurable paths in its status.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};

mod annotation;
mod errors;
mod status;

pub use annotation::AnnotationStateDisplay;
pub use errors::StateError;
pub use status::StatusStateDisplay;

/// Ordered detail level of the projected state: `generation < phase < detail`.
///
/// Each level includes every field of the levels below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Generation,
    Phase,
    Detail,
}

impl Verbosity {
    pub fn includes(self, field: StateField) -> bool {
        self >= field.min_verbosity()
    }

    /// Fields written and required at this verbosity.
    pub fn fields(self) -> Vec<StateField> {
        StateField::ALL.into_iter().filter(|f| self.includes(*f)).collect()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verbosity::Generation => "generation",
            Verbosity::Phase => "phase",
            Verbosity::Detail => "detail",
        }
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verbosity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generation" => Ok(Verbosity::Generation),
            "phase" => Ok(Verbosity::Phase),
            "detail" => Ok(Verbosity::Detail),
            other => Err(format!("unknown state verbosity '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Undefined,
    Progressing,
    Finished,
    Error,
    Deleting,
    ErrorDeleting,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Undefined => "Undefined",
            Phase::Progressing => "Progressing",
            Phase::Finished => "Finished",
            Phase::Error => "Error",
            Phase::Deleting => "Deleting",
            Phase::ErrorDeleting => "ErrorDeleting",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Undefined" => Phase::Undefined,
            "Progressing" => Phase::Progressing,
            "Finished" => Phase::Finished,
            "Error" => Phase::Error,
            "Deleting" => Phase::Deleting,
            "ErrorDeleting" => Phase::ErrorDeleting,
            _ => return Err(()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StateField {
    LastSyncedGeneration,
    Phase,
    Detail,
}

impl StateField {
    pub const ALL: [StateField; 3] = [StateField::LastSyncedGeneration, StateField::Phase, StateField::Detail];

    pub fn name(self) -> &'static str {
        match self {
            StateField::LastSyncedGeneration => "lastSyncedGeneration",
            StateField::Phase => "phase",
            StateField::Detail => "detail",
        }
    }

    fn min_verbosity(self) -> Verbosity {
        match self {
            StateField::LastSyncedGeneration => Verbosity::Generation,
            StateField::Phase => Verbosity::Phase,
            StateField::Detail => Verbosity::Detail,
        }
    }
}

impl fmt::Display for StateField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Typed value of one state field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Generation(i64),
    Phase(Phase),
    Detail(String),
}

impl FieldValue {
    pub fn field(&self) -> StateField {
        match self {
            FieldValue::Generation(_) => StateField::LastSyncedGeneration,
            FieldValue::Phase(_) => StateField::Phase,
            FieldValue::Detail(_) => StateField::Detail,
        }
    }

    /// Status representation: generation as integer, everything else as string.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Generation(g) => serde_json::Value::from(*g),
            FieldValue::Phase(p) => serde_json::Value::from(p.as_str()),
            FieldValue::Detail(d) => serde_json::Value::from(d.as_str()),
        }
    }

    /// Annotation representation, always a string.
    pub fn to_annotation(&self) -> String {
        match self {
            FieldValue::Generation(g) => g.to_string(),
            FieldValue::Phase(p) => p.as_str().to_string(),
            FieldValue::Detail(d) => d.clone(),
        }
    }

    pub fn from_annotation(field: StateField, raw: &str) -> Result<Self, StateError> {
        match field {
            StateField::LastSyncedGeneration => raw
                .parse::<i64>()
                .map(FieldValue::Generation)
                .map_err(|e| StateError::invalid(field, raw, Some(e.to_string()))),
            StateField::Phase => raw.parse::<Phase>().map(FieldValue::Phase).map_err(|_| StateError::invalid(field, raw, None)),
            StateField::Detail => Ok(FieldValue::Detail(raw.to_string())),
        }
    }

    pub fn from_json(field: StateField, raw: &serde_json::Value) -> Result<Self, StateError> {
        let invalid = || StateError::invalid(field, raw, None);
        match field {
            StateField::LastSyncedGeneration => raw.as_i64().map(FieldValue::Generation).ok_or_else(invalid),
            StateField::Phase => raw
                .as_str()
                .and_then(|s| s.parse::<Phase>().ok())
                .map(FieldValue::Phase)
                .ok_or_else(invalid),
            StateField::Detail => raw.as_str().map(|s| FieldValue::Detail(s.to_string())).ok_or_else(invalid),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncState {
    pub verbosity: Verbosity,
    pub phase: Phase,
    pub last_synced_generation: i64,
    pub detail: String,
}

impl SyncState {
    pub fn new(verbosity: Verbosity) -> Self {
        Self { verbosity, phase: Phase::Undefined, last_synced_generation: 0, detail: String::new() }
    }

    pub fn get(&self, field: StateField) -> FieldValue {
        match field {
            StateField::LastSyncedGeneration => FieldValue::Generation(self.last_synced_generation),
            StateField::Phase => FieldValue::Phase(self.phase),
            StateField::Detail => FieldValue::Detail(self.detail.clone()),
        }
    }

    pub fn set(&mut self, value: FieldValue) {
        match value {
            FieldValue::Generation(g) => self.last_synced_generation = g,
            FieldValue::Phase(p) => self.phase = p,
            FieldValue::Detail(d) => self.detail = d,
        }
    }

    pub fn with(mut self, value: FieldValue) -> Self {
        self.set(value);
        self
    }

    pub fn is_final(&self) -> bool {
        self.phase == Phase::Finished
    }
}

/// Top-level part of an object touched by a state write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Section {
    Metadata,
    Status,
}

impl Section {
    pub fn as_str(self) -> &'static str {
        match self {
            Section::Metadata => "metadata",
            Section::Status => "status",
        }
    }
}

pub type ChangedSections = BTreeSet<Section>;

/// Encoding of a [`SyncState`] on a cluster object.
pub trait StateDisplay: Send + Sync {
    /// Short name of the encoding, used in logs and error messages.
    fn kind(&self) -> &'static str;

    fn verbosity(&self) -> Verbosity;

    /// Fails with [`StateError::MissingState`] if a field required by the verbosity is absent.
    fn read(&self, obj: &DynamicObject) -> Result<SyncState, StateError>;

    /// Writes those of `fields` which the state's verbosity includes and whose stored value
    /// differs. Returns the sections that were modified.
    fn write(&self, obj: &mut DynamicObject, state: &SyncState, fields: &[StateField]) -> Result<ChangedSections, StateError>;
}

/// Where [`is_synced`] takes the state from.
pub enum StateSource<'a> {
    Display(&'a dyn StateDisplay),
    State(&'a SyncState),
}

/// True iff the last synced generation equals the object's current generation.
pub fn is_synced(obj: &DynamicObject, source: StateSource<'_>) -> Result<bool, StateError> {
    let generation = obj.metadata.generation.unwrap_or(0);
    let synced = match source {
        StateSource::Display(display) => display.read(obj)?.last_synced_generation == generation,
        StateSource::State(state) => state.last_synced_generation == generation,
    };
    Ok(synced)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_levels_are_nested() {
        assert_eq!(Verbosity::Generation.fields(), vec![StateField::LastSyncedGeneration]);
        assert_eq!(Verbosity::Phase.fields(), vec![StateField::LastSyncedGeneration, StateField::Phase]);
        assert_eq!(Verbosity::Detail.fields(), StateField::ALL.to_vec());
        for lower in [Verbosity::Generation, Verbosity::Phase, Verbosity::Detail] {
            for higher in [Verbosity::Generation, Verbosity::Phase, Verbosity::Detail] {
                if lower <= higher {
                    assert!(lower.fields().iter().all(|f| higher.includes(*f)));
                }
            }
        }
    }

    #[test]
    fn field_values_roundtrip_through_both_encodings() {
        let values = [FieldValue::Generation(7), FieldValue::Phase(Phase::ErrorDeleting), FieldValue::Detail("boom".into())];
        for v in values {
            let field = v.field();
            assert_eq!(FieldValue::from_annotation(field, &v.to_annotation()).unwrap(), v);
            assert_eq!(FieldValue::from_json(field, &v.to_json()).unwrap(), v);
        }
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = FieldValue::from_annotation(StateField::LastSyncedGeneration, "seven").unwrap_err();
        assert!(err.is_invalid_state());
        assert!(err.to_string().starts_with("invalid value 'seven' for state field 'lastSyncedGeneration'"));
        assert!(FieldValue::from_annotation(StateField::Phase, "Sleeping").unwrap_err().is_invalid_state());
        assert!(FieldValue::from_json(StateField::LastSyncedGeneration, &serde_json::json!("3")).is_err());
    }

    #[test]
    fn is_synced_compares_generation() {
        let mut obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "a", "generation": 4 }
        }))
        .unwrap();
        let state = SyncState::new(Verbosity::Generation).with(FieldValue::Generation(4));
        assert!(is_synced(&obj, StateSource::State(&state)).unwrap());
        obj.metadata.generation = Some(5);
        assert!(!is_synced(&obj, StateSource::State(&state)).unwrap());
    }
}
