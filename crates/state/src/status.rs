use kube::core::DynamicObject;
use kubesync_core::parse_simple_json_path;
use serde_json::{Map, Value};

use crate::{ChangedSections, FieldValue, Section, StateDisplay, StateError, StateField, SyncState, Verbosity};

/// Stores the state at configurable field paths below `status`.
///
/// Paths use the dot notation of [`parse_simple_json_path`]. A field with an empty path is
/// never written and reads as missing.
#[derive(Debug, Clone)]
pub struct StatusStateDisplay {
    verbosity: Verbosity,
    generation_path: Vec<String>,
    phase_path: Vec<String>,
    detail_path: Vec<String>,
}

enum Lookup<'a> {
    Found(&'a Value),
    Missing,
    NotAnObject(String),
}

impl StatusStateDisplay {
    pub fn new(generation_path: &str, phase_path: &str, detail_path: &str, verbosity: Verbosity) -> Self {
        Self {
            verbosity,
            generation_path: parse_simple_json_path(generation_path),
            phase_path: parse_simple_json_path(phase_path),
            detail_path: parse_simple_json_path(detail_path),
        }
    }

    fn path(&self, field: StateField) -> &[String] {
        match field {
            StateField::LastSyncedGeneration => &self.generation_path,
            StateField::Phase => &self.phase_path,
            StateField::Detail => &self.detail_path,
        }
    }
}

fn lookup<'a>(status: &'a Map<String, Value>, path: &[String]) -> Lookup<'a> {
    let Some((last, parents)) = path.split_last() else { return Lookup::Missing };
    let mut cur = status;
    for (idx, seg) in parents.iter().enumerate() {
        match cur.get(seg) {
            None | Some(Value::Null) => return Lookup::Missing,
            Some(Value::Object(m)) => cur = m,
            Some(_) => return Lookup::NotAnObject(path[..=idx].join(".")),
        }
    }
    match cur.get(last) {
        None | Some(Value::Null) => Lookup::Missing,
        Some(v) => Lookup::Found(v),
    }
}

fn set_nested(status: &mut Map<String, Value>, path: &[String], value: Value) -> Result<(), String> {
    let Some((last, parents)) = path.split_last() else { return Ok(()) };
    let mut cur = status;
    for (idx, seg) in parents.iter().enumerate() {
        let entry = cur.entry(seg.clone()).or_insert_with(|| Value::Object(Map::new()));
        if entry.is_null() {
            *entry = Value::Object(Map::new());
        }
        cur = match entry {
            Value::Object(m) => m,
            _ => return Err(format!("value at '{}' is not a map", path[..=idx].join("."))),
        };
    }
    cur.insert(last.clone(), value);
    Ok(())
}

impl StateDisplay for StatusStateDisplay {
    fn kind(&self) -> &'static str {
        "status"
    }

    fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    fn read(&self, obj: &DynamicObject) -> Result<SyncState, StateError> {
        let status = match obj.data.get("status") {
            None | Some(Value::Null) => return Err(StateError::missing(self.verbosity, vec![])),
            Some(Value::Object(m)) => m,
            Some(_) => return Err(StateError::ReadFailed("status is not a map".into())),
        };
        let mut state = SyncState::new(self.verbosity);
        let mut missing = Vec::new();
        for field in self.verbosity.fields() {
            match lookup(status, self.path(field)) {
                Lookup::Found(raw) => state.set(FieldValue::from_json(field, raw)?),
                Lookup::Missing => missing.push(field),
                Lookup::NotAnObject(at) => {
                    return Err(StateError::ReadFailed(format!("field '{field}': value at '{at}' is not a map")));
                }
            }
        }
        if !missing.is_empty() {
            return Err(StateError::missing(self.verbosity, missing));
        }
        Ok(state)
    }

    fn write(&self, obj: &mut DynamicObject, state: &SyncState, fields: &[StateField]) -> Result<ChangedSections, StateError> {
        let root = obj
            .data
            .as_object_mut()
            .ok_or_else(|| StateError::Internal("object content is not a map".into()))?;
        let mut status = match root.get("status") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(m)) => m.clone(),
            Some(_) => return Err(StateError::WriteFailed("status is not a map".into())),
        };
        let mut changed = false;
        for field in fields.iter().copied().filter(|f| state.verbosity.includes(*f)) {
            let path = self.path(field);
            if path.is_empty() {
                continue;
            }
            let new_value = state.get(field).to_json();
            match lookup(&status, path) {
                Lookup::Found(old) if *old == new_value => continue,
                Lookup::NotAnObject(at) => {
                    return Err(StateError::ReadFailed(format!(
                        "error reading field '{field}' from resource before writing state: value at '{at}' is not a map"
                    )));
                }
                _ => {}
            }
            set_nested(&mut status, path, new_value).map_err(StateError::WriteFailed)?;
            changed = true;
        }
        if !changed {
            return Ok(ChangedSections::new());
        }
        root.insert("status".into(), Value::Object(status));
        Ok(ChangedSections::from([Section::Status]))
    }
}
