//! Filesystem seam: the host filesystem or a process-local in-memory tree.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub trait FileSystem: Send + Sync + fmt::Debug {
    fn exists(&self, path: &Path) -> io::Result<bool>;

    /// `Ok(None)` if there is no file at `path`.
    fn read(&self, path: &Path) -> io::Result<Option<Vec<u8>>>;

    /// Writes the file, creating missing parent directories.
    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    /// Returns false if there was no file to remove.
    fn remove_file(&self, path: &Path) -> io::Result<bool>;

    /// False if `path` is not a directory or has entries.
    fn is_empty_dir(&self, path: &Path) -> io::Result<bool>;

    fn remove_dir(&self, path: &Path) -> io::Result<()>;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HostFs;

impl FileSystem for HostFs {
    fn exists(&self, path: &Path) -> io::Result<bool> {
        path.try_exists()
    }

    fn read(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        match std::fs::read(path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, data)
    }

    fn remove_file(&self, path: &Path) -> io::Result<bool> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn is_empty_dir(&self, path: &Path) -> io::Result<bool> {
        match std::fs::read_dir(path) {
            Ok(mut entries) => Ok(entries.next().is_none()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }
}

#[derive(Debug, Default)]
struct MemTree {
    files: BTreeMap<PathBuf, Vec<u8>>,
    dirs: BTreeSet<PathBuf>,
}

impl MemTree {
    fn add_ancestors(&mut self, path: &Path) {
        for dir in path.ancestors() {
            if dir.as_os_str().is_empty() || !self.dirs.insert(dir.to_path_buf()) {
                break;
            }
        }
    }

    fn has_children(&self, dir: &Path) -> bool {
        self.files.keys().chain(self.dirs.iter()).any(|p| p.parent() == Some(dir))
    }
}

/// In-memory filesystem. Directories are tracked explicitly so emptiness checks behave
/// like the host filesystem.
#[derive(Debug, Default)]
pub struct MemFs {
    tree: Mutex<MemTree>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    fn tree(&self) -> io::Result<MutexGuard<'_, MemTree>> {
        self.tree.lock().map_err(|_| io::Error::new(io::ErrorKind::Other, "in-memory filesystem lock poisoned"))
    }
}

impl FileSystem for MemFs {
    fn exists(&self, path: &Path) -> io::Result<bool> {
        let tree = self.tree()?;
        Ok(tree.files.contains_key(path) || tree.dirs.contains(path))
    }

    fn read(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        Ok(self.tree()?.files.get(path).cloned())
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut tree = self.tree()?;
        if tree.dirs.contains(path) {
            return Err(io::Error::new(io::ErrorKind::Other, format!("{} is a directory", path.display())));
        }
        if let Some(parent) = path.parent() {
            tree.add_ancestors(parent);
        }
        tree.files.insert(path.to_path_buf(), data.to_vec());
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> io::Result<bool> {
        Ok(self.tree()?.files.remove(path).is_some())
    }

    fn is_empty_dir(&self, path: &Path) -> io::Result<bool> {
        let tree = self.tree()?;
        Ok(tree.dirs.contains(path) && !tree.has_children(path))
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        let mut tree = self.tree()?;
        if !tree.dirs.contains(path) {
            return Err(io::Error::new(io::ErrorKind::NotFound, format!("{} not found", path.display())));
        }
        if tree.has_children(path) {
            return Err(io::Error::new(io::ErrorKind::Other, format!("{} is not empty", path.display())));
        }
        tree.dirs.remove(path);
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.tree()?.add_ancestors(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memfs_tracks_directories() {
        let fs = MemFs::new();
        fs.write(Path::new("/data/ns_a/x.yaml"), b"a").unwrap();
        fs.write(Path::new("/data/ns_a/y.yaml"), b"b").unwrap();
        assert!(fs.exists(Path::new("/data/ns_a")).unwrap());
        assert!(!fs.is_empty_dir(Path::new("/data/ns_a")).unwrap());
        assert!(fs.remove_dir(Path::new("/data/ns_a")).is_err());

        assert!(fs.remove_file(Path::new("/data/ns_a/x.yaml")).unwrap());
        assert!(!fs.remove_file(Path::new("/data/ns_a/x.yaml")).unwrap());
        assert!(fs.remove_file(Path::new("/data/ns_a/y.yaml")).unwrap());
        assert!(fs.is_empty_dir(Path::new("/data/ns_a")).unwrap());
        fs.remove_dir(Path::new("/data/ns_a")).unwrap();
        assert!(!fs.exists(Path::new("/data/ns_a")).unwrap());
        assert!(fs.exists(Path::new("/data")).unwrap());
    }

    #[test]
    fn hostfs_read_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let fs = HostFs;
        let path = dir.path().join("a/b/c.yaml");
        assert_eq!(fs.read(&path).unwrap(), None);
        fs.write(&path, b"kind: X\n").unwrap();
        assert_eq!(fs.read(&path).unwrap().as_deref(), Some(&b"kind: X\n"[..]));
        assert!(fs.remove_file(&path).unwrap());
        assert!(fs.is_empty_dir(&dir.path().join("a/b")).unwrap());
    }
}
