//! KubeSync persistence: storage backends that hold the canonical form of synced objects.
//!
//! Every backend implements [`Persister`]. Decorators (logging, mock) wrap an inner persister
//! and expose it through [`Persister::internal_persister`].

#![forbid(unsafe_code)]

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use kube::core::DynamicObject;
use kubesync_config::{StorageDefinition, StorageType};
use kubesync_core::{CoreError, ResourceKey, TransformError, Transformer};
use tracing::Span;

pub mod filesystem;
pub mod fs;
pub mod git;
pub mod logging;
pub mod mock;
mod repo;

pub use filesystem::FileSystemPersister;
pub use fs::{FileSystem, HostFs, MemFs};
pub use git::GitPersister;
pub use logging::{LogLevel, LoggingPersister};
pub use mock::{CallKind, MockError, MockPersister, MockedCall, MockedReturn};
pub use repo::{GitAuth, GitError, GitRepo, RepoSession, COMMIT_AUTHOR_EMAIL, COMMIT_AUTHOR_NAME};

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("error while trying to {op} {}: {source}", .path.display())]
    Io { op: &'static str, path: PathBuf, source: std::io::Error },
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Mock(#[from] MockError),
    #[error("root path {} does not exist", .0.display())]
    RootMissing(PathBuf),
    #[error("invalid storage definition '{name}': {reason}")]
    InvalidDefinition { name: String, reason: String },
}

impl PersistError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> PersistError {
        let path = path.into();
        move |source| PersistError::Io { op, path, source }
    }
}

pub type Result<T, E = PersistError> = std::result::Result<T, E>;

/// Per-call context handed through the persister chain.
///
/// Carries the span the caller wants persister records attached to. Calls may run on
/// blocking threads, so the span travels explicitly instead of being read from the
/// thread's current span.
#[derive(Debug, Clone)]
pub struct PersistContext {
    span: Span,
}

impl PersistContext {
    pub fn new(span: Span) -> Self {
        Self { span }
    }

    pub fn none() -> Self {
        Self { span: Span::none() }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        self.span.in_scope(f)
    }
}

impl Default for PersistContext {
    fn default() -> Self {
        Self::none()
    }
}

/// Serialized canonical form of an object as held by a storage.
#[derive(Clone, PartialEq, Eq)]
pub struct Artifact(Vec<u8>);

impl Artifact {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(s) => f.debug_tuple("Artifact").field(&s).finish(),
            None => f.debug_tuple("Artifact").field(&self.0.len()).finish(),
        }
    }
}

impl From<Vec<u8>> for Artifact {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// Outcome of [`Persister::persist`]. `changed == false` means the stored artifact was
/// already byte-identical and nothing was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Persisted {
    pub artifact: Artifact,
    pub changed: bool,
}

/// A storage backend for canonical object artifacts.
pub trait Persister: Send + Sync {
    fn exists(&self, cx: &PersistContext, key: &ResourceKey) -> Result<bool>;

    /// `Ok(None)` signals absence.
    fn get(&self, cx: &PersistContext, key: &ResourceKey) -> Result<Option<Artifact>>;

    /// Idempotent: writes only if the transformed artifact differs from the stored one.
    fn persist(&self, cx: &PersistContext, obj: &DynamicObject, transformer: &dyn Transformer, sub_path: &str) -> Result<Persisted>;

    /// Deleting an absent artifact is not an error.
    fn delete(&self, cx: &PersistContext, key: &ResourceKey) -> Result<()>;

    /// The next wrapped persister of a decorator chain; `None` for the innermost one.
    fn internal_persister(&self) -> Option<&dyn Persister>;

    fn describe(&self) -> &'static str;
}

/// Walks the decorator chain down to the innermost persister.
pub fn innermost(persister: &dyn Persister) -> &dyn Persister {
    let mut cur = persister;
    while let Some(inner) = cur.internal_persister() {
        cur = inner;
    }
    cur
}

/// Names of the layers from outermost to innermost, e.g. `["logging", "git", "filesystem"]`.
pub fn chain(persister: &dyn Persister) -> Vec<&'static str> {
    let mut out = vec![persister.describe()];
    let mut cur = persister;
    while let Some(inner) = cur.internal_persister() {
        out.push(inner.describe());
        cur = inner;
    }
    out
}

/// Builds the persister chain for a completed storage definition.
///
/// Filesystem and git backends are wrapped in the logging decorator at debug level; mock
/// backends log at the level their configuration asks for. Git repositories are initialized
/// here, so this may touch the network.
pub fn build_persister(def: &StorageDefinition) -> Result<Arc<dyn Persister>> {
    let invalid = |reason: &str| PersistError::InvalidDefinition { name: def.name.clone(), reason: reason.to_string() };
    let fs_cfg = def.filesystem_config.clone().unwrap_or_default();
    let persister: Box<dyn Persister> = match def.storage_type {
        StorageType::Filesystem => {
            let fs = FileSystemPersister::new(&fs_cfg)?;
            Box::new(LoggingPersister::new(Box::new(fs), &def.name, LogLevel::Debug))
        }
        StorageType::Git => {
            let git_cfg = def.git_config.as_ref().ok_or_else(|| invalid("missing gitConfig"))?;
            let git = GitPersister::new(git_cfg, &fs_cfg)?;
            Box::new(LoggingPersister::new(Box::new(git), &def.name, LogLevel::Debug))
        }
        StorageType::Mock => {
            let on_info = def.mock_config.as_ref().map(|m| m.log_persister_calls_on_info_level).unwrap_or(false);
            let level = if on_info { LogLevel::Info } else { LogLevel::Debug };
            let mock = MockPersister::new(&fs_cfg);
            Box::new(LoggingPersister::new(Box::new(mock), &def.name, level))
        }
    };
    Ok(Arc::from(persister))
}
