//! Persister writing one file per object below a root directory.
//!
//! Layout: `<root>/<subPath>/[<namespacePrefix><namespace>/]<kind>.<version>.<group><sep><name><ext>`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use kube::core::DynamicObject;
use kubesync_config::FileSystemConfiguration;
use kubesync_core::{gvk_string, ResourceKey, Transformer};
use metrics::{counter, histogram};
use tracing::debug;

use crate::fs::{FileSystem, HostFs, MemFs};
use crate::{Artifact, PersistContext, PersistError, Persisted, Persister, Result};

#[derive(Debug, Clone)]
pub struct FileSystemPersister {
    fs: Arc<dyn FileSystem>,
    root: PathBuf,
    namespace_prefix: String,
    name_separator: String,
    file_extension: String,
}

impl FileSystemPersister {
    /// Host filesystem unless `inMemory` is set. A host root must already exist.
    pub fn new(cfg: &FileSystemConfiguration) -> Result<Self> {
        let root = PathBuf::from(&cfg.root_path);
        if cfg.in_memory() {
            let fs = MemFs::new();
            fs.create_dir_all(&root).map_err(PersistError::io("create", &root))?;
            return Ok(Self::with_fs(Arc::new(fs), root, cfg));
        }
        if !HostFs.exists(&root).map_err(PersistError::io("stat", &root))? {
            return Err(PersistError::RootMissing(root));
        }
        Ok(Self::with_fs(Arc::new(HostFs), root, cfg))
    }

    /// Uses `fs` and `root` as given; the layout options come from `cfg`.
    pub fn with_fs(fs: Arc<dyn FileSystem>, root: impl Into<PathBuf>, cfg: &FileSystemConfiguration) -> Self {
        Self {
            fs,
            root: root.into(),
            namespace_prefix: cfg.namespace_prefix().to_string(),
            name_separator: cfg.name_separator().to_string(),
            file_extension: cfg.file_extension(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn filesystem(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    fn base_dir(&self, sub_path: &str) -> PathBuf {
        self.root.join(sub_path.trim_start_matches('/'))
    }

    /// Directory that holds the artifact of `key`.
    pub fn dir_for(&self, key: &ResourceKey) -> PathBuf {
        let base = self.base_dir(&key.sub_path);
        match &key.namespace {
            Some(ns) => base.join(format!("{}{}", self.namespace_prefix, ns)),
            None => base,
        }
    }

    pub fn path_for(&self, key: &ResourceKey) -> PathBuf {
        let file = format!("{}{}{}{}", gvk_string(&key.gvk), self.name_separator, key.name, self.file_extension);
        self.dir_for(key).join(file)
    }
}

impl Persister for FileSystemPersister {
    fn exists(&self, _cx: &PersistContext, key: &ResourceKey) -> Result<bool> {
        let path = self.path_for(key);
        self.fs.exists(&path).map_err(PersistError::io("stat", &path))
    }

    fn get(&self, _cx: &PersistContext, key: &ResourceKey) -> Result<Option<Artifact>> {
        let path = self.path_for(key);
        let data = self.fs.read(&path).map_err(PersistError::io("read", &path))?;
        Ok(data.map(Artifact::new))
    }

    fn persist(&self, cx: &PersistContext, obj: &DynamicObject, transformer: &dyn Transformer, sub_path: &str) -> Result<Persisted> {
        let started = Instant::now();
        let key = ResourceKey::for_object(obj, sub_path)?;
        let path = self.path_for(&key);
        let existing = self.fs.read(&path).map_err(PersistError::io("read", &path))?;
        let artifact = transformer.transform_and_serialize(obj)?;
        if existing.as_deref() == Some(artifact.as_slice()) {
            debug!(parent: cx.span(), path = %path.display(), "artifact unchanged");
            return Ok(Persisted { artifact: Artifact::new(artifact), changed: false });
        }
        self.fs.write(&path, &artifact).map_err(PersistError::io("write", &path))?;
        counter!("persist_write_total", 1u64);
        histogram!("persist_op_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => "write");
        debug!(parent: cx.span(), path = %path.display(), bytes = artifact.len(), "artifact written");
        Ok(Persisted { artifact: Artifact::new(artifact), changed: true })
    }

    fn delete(&self, cx: &PersistContext, key: &ResourceKey) -> Result<()> {
        let started = Instant::now();
        let path = self.path_for(key);
        if !self.fs.remove_file(&path).map_err(PersistError::io("remove", &path))? {
            return Ok(());
        }
        counter!("persist_delete_total", 1u64);
        // Only namespace directories are pruned; the base directory stays.
        if key.namespace.is_some() {
            let dir = self.dir_for(key);
            if self.fs.is_empty_dir(&dir).map_err(PersistError::io("list", &dir))? {
                self.fs.remove_dir(&dir).map_err(PersistError::io("remove", &dir))?;
                debug!(parent: cx.span(), dir = %dir.display(), "removed empty namespace directory");
            }
        }
        histogram!("persist_op_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => "delete");
        Ok(())
    }

    fn internal_persister(&self) -> Option<&dyn Persister> {
        None
    }

    fn describe(&self) -> &'static str {
        "filesystem"
    }
}
