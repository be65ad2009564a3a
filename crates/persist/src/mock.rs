//! Mock persister: keeps artifacts in memory and, in test mode, verifies calls against a
//! queue of expectations.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use kube::core::DynamicObject;
use kubesync_config::{FileSystemConfiguration, DEFAULT_IN_MEMORY_ROOT};
use kubesync_core::{gvk_string, CoreError, ResourceKey, Transformer};
use tracing::debug;

use crate::{Artifact, FileSystemPersister, PersistContext, Persisted, Persister, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Exists,
    Get,
    Persist,
    Delete,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallKind::Exists => "Exists",
            CallKind::Get => "Get",
            CallKind::Persist => "Persist",
            CallKind::Delete => "Delete",
        })
    }
}

/// Result a call is expected to produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockedReturn {
    Exists(bool),
    Get(Option<Artifact>),
    Persist { changed: bool },
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MockedCall {
    pub kind: CallKind,
    pub key: ResourceKey,
    pub expected_return: Option<MockedReturn>,
}

impl MockedCall {
    fn new(kind: CallKind, key: ResourceKey) -> Self {
        Self { kind, key, expected_return: None }
    }

    pub fn exists(key: ResourceKey) -> Self {
        Self::new(CallKind::Exists, key)
    }

    pub fn get(key: ResourceKey) -> Self {
        Self::new(CallKind::Get, key)
    }

    pub fn persist(obj: &DynamicObject, sub_path: &str) -> Result<Self, CoreError> {
        Ok(Self::new(CallKind::Persist, ResourceKey::for_object(obj, sub_path)?))
    }

    pub fn delete(key: ResourceKey) -> Self {
        Self::new(CallKind::Delete, key)
    }

    pub fn returning(mut self, ret: MockedReturn) -> Self {
        self.expected_return = Some(ret);
        self
    }
}

impl fmt::Display for MockedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}, subPath '{}')", self.kind, self.key, self.key.sub_path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallDiff {
    pub argument: &'static str,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MockError {
    #[error("mock persister is not in test mode")]
    NotInTestMode,
    #[error("got call {actual}, but didn't expect any call")]
    NoCallExpected { actual: String },
    #[error("{}", diff_message(.diffs))]
    UnexpectedCall { diffs: Vec<CallDiff> },
    #[error("unexpected result of {call}: expected {expected}, actual {actual}")]
    UnexpectedReturn { call: CallKind, expected: String, actual: String },
    #[error("mock persister lock poisoned")]
    Poisoned,
}

fn diff_message(diffs: &[CallDiff]) -> String {
    let mut out = String::from("the following arguments differ in the expected versus the actual call:");
    for d in diffs {
        out.push_str(&format!("\n  {}:\n    expected: {}\n    actual: {}", d.argument, d.expected, d.actual));
    }
    out
}

fn compare_calls(expected: &MockedCall, actual: &MockedCall) -> Result<(), MockError> {
    if expected.kind != actual.kind {
        let diffs = vec![CallDiff { argument: "call", expected: expected.kind.to_string(), actual: actual.kind.to_string() }];
        return Err(MockError::UnexpectedCall { diffs });
    }
    let (e, a) = (&expected.key, &actual.key);
    let mut diffs = Vec::new();
    let mut check = |argument: &'static str, expected: String, actual: String| {
        if expected != actual {
            diffs.push(CallDiff { argument, expected, actual });
        }
    };
    check("name", e.name.clone(), a.name.clone());
    check("namespace", e.namespace.clone().unwrap_or_default(), a.namespace.clone().unwrap_or_default());
    check("subPath", e.sub_path.clone(), a.sub_path.clone());
    check("gvk", gvk_string(&e.gvk), gvk_string(&a.gvk));
    if diffs.is_empty() {
        Ok(())
    } else {
        Err(MockError::UnexpectedCall { diffs })
    }
}

fn check_return(call: CallKind, expected: Option<MockedReturn>, actual: MockedReturn) -> Result<(), MockError> {
    match expected {
        Some(expected) if expected != actual => {
            Err(MockError::UnexpectedReturn { call, expected: format!("{expected:?}"), actual: format!("{actual:?}") })
        }
        _ => Ok(()),
    }
}

/// Stores artifacts in an in-memory filesystem.
///
/// Created in test mode, every call must match the next queued [`MockedCall`]; its expected
/// return, if any, is compared with the actual result.
pub struct MockPersister {
    store: FileSystemPersister,
    expected: Option<Mutex<VecDeque<MockedCall>>>,
}

impl MockPersister {
    pub fn new(fs_cfg: &FileSystemConfiguration) -> Self {
        let mut cfg = fs_cfg.clone();
        cfg.in_memory = Some(true);
        if cfg.root_path.is_empty() {
            cfg.root_path = DEFAULT_IN_MEMORY_ROOT.to_string();
        }
        let store = FileSystemPersister::with_fs(std::sync::Arc::new(crate::MemFs::new()), cfg.root_path.clone(), &cfg);
        Self { store, expected: None }
    }

    pub fn test_mode(fs_cfg: &FileSystemConfiguration) -> Self {
        Self { expected: Some(Mutex::new(VecDeque::new())), ..Self::new(fs_cfg) }
    }

    pub fn expect_call(&self, call: MockedCall) -> Result<(), MockError> {
        let queue = self.expected.as_ref().ok_or(MockError::NotInTestMode)?;
        queue.lock().map_err(|_| MockError::Poisoned)?.push_back(call);
        Ok(())
    }

    pub fn is_expecting_calls(&self) -> bool {
        match &self.expected {
            Some(queue) => queue.lock().map(|q| !q.is_empty()).unwrap_or(false),
            None => false,
        }
    }

    /// Drops all pending expectations and returns them.
    pub fn clear_expected_calls(&self) -> Vec<MockedCall> {
        match &self.expected {
            Some(queue) => queue.lock().map(|mut q| q.drain(..).collect()).unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Pops the next expectation and matches it against `actual`.
    fn verify_call(&self, actual: MockedCall) -> Result<Option<MockedReturn>, MockError> {
        let Some(queue) = &self.expected else { return Ok(None) };
        let next = queue.lock().map_err(|_| MockError::Poisoned)?.pop_front();
        let Some(expected) = next else {
            return Err(MockError::NoCallExpected { actual: actual.to_string() });
        };
        compare_calls(&expected, &actual)?;
        Ok(expected.expected_return)
    }
}

impl Persister for MockPersister {
    fn exists(&self, cx: &PersistContext, key: &ResourceKey) -> Result<bool> {
        let expected = self.verify_call(MockedCall::exists(key.clone()))?;
        let exists = self.store.exists(cx, key)?;
        debug!(parent: cx.span(), exists, "checking if data exists");
        check_return(CallKind::Exists, expected, MockedReturn::Exists(exists))?;
        Ok(exists)
    }

    fn get(&self, cx: &PersistContext, key: &ResourceKey) -> Result<Option<Artifact>> {
        let expected = self.verify_call(MockedCall::get(key.clone()))?;
        let data = self.store.get(cx, key)?;
        match data.as_ref().and_then(Artifact::as_str) {
            Some(text) => debug!(parent: cx.span(), exists = true, data = text, "getting data"),
            None => debug!(parent: cx.span(), exists = data.is_some(), "getting data"),
        }
        check_return(CallKind::Get, expected, MockedReturn::Get(data.clone()))?;
        Ok(data)
    }

    fn persist(&self, cx: &PersistContext, obj: &DynamicObject, transformer: &dyn Transformer, sub_path: &str) -> Result<Persisted> {
        let expected = self.verify_call(MockedCall::persist(obj, sub_path)?)?;
        let persisted = self.store.persist(cx, obj, transformer, sub_path)?;
        debug!(parent: cx.span(), changed = persisted.changed, "persisting resource if changed");
        check_return(CallKind::Persist, expected, MockedReturn::Persist { changed: persisted.changed })?;
        Ok(persisted)
    }

    fn delete(&self, cx: &PersistContext, key: &ResourceKey) -> Result<()> {
        let expected = self.verify_call(MockedCall::delete(key.clone()))?;
        self.store.delete(cx, key)?;
        debug!(parent: cx.span(), "deleting resource");
        check_return(CallKind::Delete, expected, MockedReturn::Delete)?;
        Ok(())
    }

    fn internal_persister(&self) -> Option<&dyn Persister> {
        Some(&self.store)
    }

    fn describe(&self) -> &'static str {
        "mock"
    }
}
