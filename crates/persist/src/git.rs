//! Persister that keeps artifacts in a git repository.
//!
//! Files are written by a [`FileSystemPersister`] bound to the repository's working tree.
//! Every call holds the repository lock for its whole duration, so the working tree is
//! never touched by two calls at once.

use std::path::PathBuf;
use std::sync::Arc;

use kube::core::DynamicObject;
use kubesync_config::{FileSystemConfiguration, GitConfiguration};
use kubesync_core::{ResourceKey, Transformer};
use tempfile::TempDir;
use tracing::debug;

use crate::fs::HostFs;
use crate::repo::{GitAuth, GitRepo, RepoSession};
use crate::{Artifact, FileSystemPersister, PersistContext, PersistError, Persisted, Persister, Result};

pub struct GitPersister {
    fs: FileSystemPersister,
    repo: Arc<GitRepo>,
    expect_remote_changes: bool,
    // Working tree of an in-memory repository; removed on drop.
    _scratch: Option<TempDir>,
}

impl GitPersister {
    /// Prepares the working tree and initializes the repository.
    ///
    /// An in-memory repository lives below a temporary directory owned by the persister, at
    /// `rootPath` relative to it; otherwise `rootPath` is the working tree.
    pub fn new(git: &GitConfiguration, fs_cfg: &FileSystemConfiguration) -> Result<Self> {
        let (scratch, root) = if fs_cfg.in_memory() {
            let dir = tempfile::Builder::new()
                .prefix("kubesync-git-")
                .tempdir()
                .map_err(PersistError::io("create", std::env::temp_dir()))?;
            let root = dir.path().join(fs_cfg.root_path.trim_start_matches('/'));
            (Some(dir), root)
        } else {
            (None, PathBuf::from(&fs_cfg.root_path))
        };
        let auth = GitAuth::from_config(git.auth.as_ref())?;
        let repo = Arc::new(GitRepo::new(&git.url, &git.branch, &root, auth));
        repo.initialize()?;
        let fs = FileSystemPersister::with_fs(Arc::new(HostFs), root, fs_cfg);
        Ok(Self { fs, repo, expect_remote_changes: !git.exclusive, _scratch: scratch })
    }

    pub fn repo(&self) -> &Arc<GitRepo> {
        &self.repo
    }

    pub fn working_tree(&self) -> &FileSystemPersister {
        &self.fs
    }

    /// Locks the repository and, unless exclusive, pulls remote changes first. Commits left
    /// behind by an earlier failed push are pushed before the operation runs.
    fn session(&self, cx: &PersistContext) -> Result<RepoSession<'_>> {
        let mut session = self.repo.lock()?;
        if self.expect_remote_changes {
            debug!(parent: cx.span(), url = %self.repo.url(), "pulling before operation");
            session.pull(false)?;
        }
        if session.has_unpushed() {
            debug!(parent: cx.span(), url = %self.repo.url(), "pushing pending commits");
            session.push()?;
        }
        Ok(session)
    }
}

impl Persister for GitPersister {
    fn exists(&self, cx: &PersistContext, key: &ResourceKey) -> Result<bool> {
        let _session = self.session(cx)?;
        self.fs.exists(cx, key)
    }

    fn get(&self, cx: &PersistContext, key: &ResourceKey) -> Result<Option<Artifact>> {
        let _session = self.session(cx)?;
        self.fs.get(cx, key)
    }

    fn persist(&self, cx: &PersistContext, obj: &DynamicObject, transformer: &dyn Transformer, sub_path: &str) -> Result<Persisted> {
        let mut session = self.session(cx)?;
        let persisted = self.fs.persist(cx, obj, transformer, sub_path)?;
        if persisted.changed {
            let key = ResourceKey::for_object(obj, sub_path)?;
            session.commit_and_push(&format!("update {key}"))?;
            debug!(parent: cx.span(), resource = %key, "pushed update");
        }
        Ok(persisted)
    }

    fn delete(&self, cx: &PersistContext, key: &ResourceKey) -> Result<()> {
        let mut session = self.session(cx)?;
        if !self.fs.exists(cx, key)? {
            return Ok(());
        }
        self.fs.delete(cx, key)?;
        session.commit_and_push(&format!("delete {key}"))?;
        debug!(parent: cx.span(), resource = %key, "pushed deletion");
        Ok(())
    }

    fn internal_persister(&self) -> Option<&dyn Persister> {
        Some(&self.fs)
    }

    fn describe(&self) -> &'static str {
        "git"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Repository;
    use kubesync_core::BasicTransformer;
    use serde_json::json;
    use std::path::Path;

    fn config_map(value: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "settings", "namespace": "team", "uid": "uid-settings" },
            "data": { "value": value },
        }))
        .unwrap()
    }

    fn exclusive(url: &Path) -> GitPersister {
        let git = GitConfiguration { url: url.to_string_lossy().into_owned(), branch: "main".into(), exclusive: true, auth: None };
        let fs = FileSystemConfiguration { root_path: "/data".into(), in_memory: Some(true), ..Default::default() };
        GitPersister::new(&git, &fs).unwrap()
    }

    fn remote_tip(url: &Path) -> git2::Oid {
        let remote = Repository::open_bare(url).unwrap();
        let tip = remote.find_reference("refs/heads/main").unwrap().peel_to_commit().unwrap();
        tip.id()
    }

    fn remote_file(url: &Path, path: &str) -> Option<Vec<u8>> {
        let remote = Repository::open_bare(url).unwrap();
        let tree = remote.find_reference("refs/heads/main").unwrap().peel_to_tree().unwrap();
        let entry = tree.get_path(Path::new(path)).ok()?;
        let blob = entry.to_object(&remote).unwrap().peel_to_blob().unwrap();
        Some(blob.content().to_vec())
    }

    #[test]
    fn unreachable_remote_fails_persist_and_keeps_commit_pending() {
        let root = tempfile::tempdir().unwrap();
        let url = root.path().join("remote.git");
        let away = root.path().join("away.git");
        Repository::init_bare(&url).unwrap();
        let cx = PersistContext::none();
        let t = BasicTransformer::new();

        let p = exclusive(&url);
        assert!(p.persist(&cx, &config_map("v1"), &t, "").unwrap().changed);
        let pushed = remote_tip(&url);

        std::fs::rename(&url, &away).unwrap();
        assert!(p.persist(&cx, &config_map("v2"), &t, "").is_err());
        assert!(p.repo().lock().unwrap().has_unpushed());
        std::fs::rename(&away, &url).unwrap();
        assert_eq!(remote_tip(&url), pushed);

        // The working tree already holds v2, so the next pass only reads.
        let key = ResourceKey::for_object(&config_map("v2"), "").unwrap();
        let current = p.get(&cx, &key).unwrap().unwrap();
        assert!(!p.repo().lock().unwrap().has_unpushed());
        assert_ne!(remote_tip(&url), pushed);
        assert_eq!(remote_file(&url, "ns_team/configmap.v1_settings.yaml").unwrap(), current.as_bytes());
        assert!(!p.persist(&cx, &config_map("v2"), &t, "").unwrap().changed);
    }

    #[test]
    fn pending_commit_blocks_reads_while_remote_is_unreachable() {
        let root = tempfile::tempdir().unwrap();
        let url = root.path().join("remote.git");
        Repository::init_bare(&url).unwrap();
        let cx = PersistContext::none();
        let t = BasicTransformer::new();

        let p = exclusive(&url);
        std::fs::rename(&url, root.path().join("away.git")).unwrap();
        assert!(p.persist(&cx, &config_map("v1"), &t, "").is_err());
        let key = ResourceKey::for_object(&config_map("v1"), "").unwrap();
        assert!(p.get(&cx, &key).is_err());
        assert!(p.repo().lock().unwrap().has_unpushed());
    }

    #[test]
    fn delete_commits_removal() {
        let root = tempfile::tempdir().unwrap();
        let url = root.path().join("remote.git");
        Repository::init_bare(&url).unwrap();
        let cx = PersistContext::none();
        let t = BasicTransformer::new();

        let p = exclusive(&url);
        let obj = config_map("v1");
        p.persist(&cx, &obj, &t, "").unwrap();
        let key = ResourceKey::for_object(&obj, "").unwrap();
        p.delete(&cx, &key).unwrap();

        let remote = Repository::open_bare(&url).unwrap();
        let tip = remote.find_reference("refs/heads/main").unwrap().peel_to_commit().unwrap();
        assert_eq!(tip.message(), Some("delete configmap.v1 team/settings"));
        assert!(remote_file(&url, "ns_team/configmap.v1_settings.yaml").is_none());
        assert!(!p.exists(&cx, &key).unwrap());
    }
}
