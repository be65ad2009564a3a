//! Logging decorator for persisters.

use std::fmt::Display;

use kube::core::DynamicObject;
use kubesync_core::{ResourceKey, Transformer};
use tracing::{debug, info};

use crate::{Artifact, PersistContext, Persisted, Persister, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    #[default]
    Debug,
    Info,
}

macro_rules! log_at {
    ($level:expr, $($arg:tt)+) => {
        match $level {
            LogLevel::Debug => debug!($($arg)+),
            LogLevel::Info => info!($($arg)+),
        }
    };
}

/// Logs a record before and after every call of the wrapped persister.
///
/// Results pass through untouched.
pub struct LoggingPersister {
    inner: Box<dyn Persister>,
    storage: String,
    level: LogLevel,
}

impl LoggingPersister {
    pub fn new(inner: Box<dyn Persister>, storage: impl Into<String>, level: LogLevel) -> Self {
        Self { inner, storage: storage.into(), level }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    fn call<T>(&self, cx: &PersistContext, method: &'static str, resource: &dyn Display, f: impl FnOnce() -> Result<T>) -> Result<T> {
        log_at!(self.level, parent: cx.span(), storage = %self.storage, method, resource = %resource, "call started");
        let res = f();
        match &res {
            Ok(_) => log_at!(self.level, parent: cx.span(), storage = %self.storage, method, resource = %resource, error = false, "call finished"),
            Err(e) => log_at!(self.level, parent: cx.span(), storage = %self.storage, method, resource = %resource, error = %e, "call finished"),
        }
        res
    }
}

impl Persister for LoggingPersister {
    fn exists(&self, cx: &PersistContext, key: &ResourceKey) -> Result<bool> {
        self.call(cx, "exists", key, || self.inner.exists(cx, key))
    }

    fn get(&self, cx: &PersistContext, key: &ResourceKey) -> Result<Option<Artifact>> {
        self.call(cx, "get", key, || self.inner.get(cx, key))
    }

    fn persist(&self, cx: &PersistContext, obj: &DynamicObject, transformer: &dyn Transformer, sub_path: &str) -> Result<Persisted> {
        let name = obj.metadata.name.as_deref().unwrap_or_default();
        let res = self.call(cx, "persist", &name, || self.inner.persist(cx, obj, transformer, sub_path));
        if let Ok(p) = &res {
            log_at!(self.level, parent: cx.span(), storage = %self.storage, changed = p.changed, "persist result");
        }
        res
    }

    fn delete(&self, cx: &PersistContext, key: &ResourceKey) -> Result<()> {
        self.call(cx, "delete", key, || self.inner.delete(cx, key))
    }

    fn internal_persister(&self) -> Option<&dyn Persister> {
        Some(self.inner.as_ref())
    }

    fn describe(&self) -> &'static str {
        "logging"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FileSystemPersister, MockError, MockPersister, PersistError};
    use kubesync_config::FileSystemConfiguration;
    use kubesync_core::BasicTransformer;

    #[test]
    fn results_pass_through() {
        let fs = FileSystemPersister::new(&FileSystemConfiguration { root_path: "/data".into(), in_memory: Some(true), ..Default::default() }).unwrap();
        let p = LoggingPersister::new(Box::new(fs), "disk", LogLevel::Info);
        let cx = PersistContext::new(tracing::info_span!("test"));
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": "team" },
        }))
        .unwrap();
        let key = ResourceKey::for_object(&obj, "").unwrap();

        assert!(!p.exists(&cx, &key).unwrap());
        assert!(p.persist(&cx, &obj, &BasicTransformer::new(), "").unwrap().changed);
        assert!(p.exists(&cx, &key).unwrap());
        assert!(p.get(&cx, &key).unwrap().is_some());
        p.delete(&cx, &key).unwrap();
        assert_eq!(p.get(&cx, &key).unwrap(), None);
        assert_eq!(p.internal_persister().map(|i| i.describe()), Some("filesystem"));
    }

    #[test]
    fn errors_pass_through() {
        let mock = MockPersister::test_mode(&FileSystemConfiguration::default());
        let p = LoggingPersister::new(Box::new(mock), "strict", LogLevel::Debug);
        let cx = PersistContext::none();
        let key = ResourceKey::new("cm", Some("team"), kube::core::GroupVersionKind::gvk("", "v1", "ConfigMap"), "");

        let err = p.exists(&cx, &key).unwrap_err();
        match &err {
            PersistError::Mock(MockError::NoCallExpected { actual }) => assert!(actual.contains("Exists")),
            other => panic!("unexpected: {other:?}"),
        }
        let direct = p.internal_persister().unwrap().exists(&cx, &key).unwrap_err();
        assert_eq!(err.to_string(), direct.to_string());
    }
}
