use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::{
    FileSystemConfiguration, GitAuthType, GitConfiguration, GitRepoAuth, KubeSyncConfig, ResourceSyncConfig, StateConfiguration,
    StateType, StatusStateConfiguration, StorageDefinition, StorageReference, StorageType, SyncConfig, Verbosity,
};

const NAME_PATTERN: &str = "^[a-zA-Z]([-_]?[a-zA-Z0-9])*$";

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(NAME_PATTERN).unwrap_or_else(|_| unreachable!("static pattern")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldErrorKind {
    Required,
    Invalid,
    Duplicate,
    Forbidden,
    NotSupported,
}

impl FieldErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            FieldErrorKind::Required => "Required value",
            FieldErrorKind::Invalid => "Invalid value",
            FieldErrorKind::Duplicate => "Duplicate value",
            FieldErrorKind::Forbidden => "Forbidden",
            FieldErrorKind::NotSupported => "Unsupported value",
        }
    }
}

/// One problem in the configuration, addressed by its field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub path: String,
    pub kind: FieldErrorKind,
    pub detail: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.path, self.kind.as_str(), self.detail)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<FieldError>);

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldError> {
        self.0.iter()
    }

    /// True if some error is reported for exactly this path.
    pub fn has(&self, path: &str) -> bool {
        self.0.iter().any(|e| e.path == path)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines: Vec<_> = self.0.iter().map(|e| format!("  - {e}")).collect();
        f.write_str(&lines.join("\n"))
    }
}

impl std::error::Error for ValidationErrors {}

#[derive(Clone)]
struct FieldPath(String);

impl FieldPath {
    fn root(name: &str) -> Self {
        Self(name.to_string())
    }

    fn child(&self, name: &str) -> Self {
        Self(format!("{}.{}", self.0, name))
    }

    fn index(&self, idx: usize) -> Self {
        Self(format!("{}[{}]", self.0, idx))
    }
}

struct HostBasePath {
    path: PathBuf,
    storage: String,
}

#[derive(Default)]
struct Validator<'a> {
    errors: Vec<FieldError>,
    storages: Vec<&'a StorageDefinition>,
    host_base_paths: Vec<HostBasePath>,
}

impl<'a> Validator<'a> {
    fn push(&mut self, path: &FieldPath, kind: FieldErrorKind, detail: impl Into<String>) {
        self.errors.push(FieldError { path: path.0.clone(), kind, detail: detail.into() });
    }

    fn storage(&self, name: &str) -> Option<&'a StorageDefinition> {
        self.storages.iter().copied().find(|sd| sd.name == name)
    }

    fn validate_name(&mut self, path: &FieldPath, what: &str, value: &str) {
        if value.is_empty() {
            self.push(path, FieldErrorKind::Required, format!("{what} must not be empty"));
        } else if !name_regex().is_match(value) {
            self.push(path, FieldErrorKind::Invalid, format!("'{value}': {what} must match regex {NAME_PATTERN}"));
        }
    }

    fn storage_definitions(&mut self, defs: &'a [StorageDefinition], path: FieldPath) {
        if defs.is_empty() {
            self.push(&path, FieldErrorKind::Required, "no storage definitions provided");
        }
        let mut git_urls = HashSet::new();
        for (idx, sd) in defs.iter().enumerate() {
            let cur = path.index(idx);
            if self.storage(&sd.name).is_some() {
                self.push(&cur.child("name"), FieldErrorKind::Duplicate, sd.name.clone());
            } else {
                self.storages.push(sd);
            }
            self.validate_name(&cur.child("name"), "storage definition name", &sd.name);
            match sd.storage_type {
                StorageType::Filesystem => self.filesystem_config(sd.filesystem_config.as_ref(), cur.child("filesystemConfig")),
                StorageType::Git => {
                    self.git_config(sd.git_config.as_ref(), cur.child("gitConfig"), &mut git_urls);
                    self.filesystem_config(sd.filesystem_config.as_ref(), cur.child("filesystemConfig"));
                }
                StorageType::Mock => {}
            }
        }
    }

    fn filesystem_config(&mut self, fs: Option<&FileSystemConfiguration>, path: FieldPath) {
        let Some(fs) = fs else {
            self.push(&path, FieldErrorKind::Required, "filesystem configuration must not be empty");
            return;
        };
        if fs.root_path.is_empty() {
            self.push(&path.child("rootPath"), FieldErrorKind::Required, "root path must not be empty");
        }
    }

    fn git_config(&mut self, git: Option<&GitConfiguration>, path: FieldPath, urls: &mut HashSet<String>) {
        let Some(git) = git else {
            self.push(&path, FieldErrorKind::Required, "repo config must not be empty");
            return;
        };
        if git.url.is_empty() {
            self.push(&path.child("url"), FieldErrorKind::Required, "repository url must not be empty");
        } else if !urls.insert(git.url.clone()) {
            self.push(&path.child("url"), FieldErrorKind::Duplicate, git.url.clone());
        }
        self.git_auth(git.auth.as_ref(), path.child("auth"));
    }

    fn git_auth(&mut self, auth: Option<&GitRepoAuth>, path: FieldPath) {
        let Some(auth) = auth else {
            self.push(&path, FieldErrorKind::Required, "git authentication configuration must not be empty");
            return;
        };
        if auth.auth_type.is_empty() {
            self.push(&path.child("type"), FieldErrorKind::Required, "git authentication type must not be empty");
            return;
        }
        match auth.parsed_type() {
            Some(GitAuthType::UsernamePassword) => {
                if auth.username.is_empty() {
                    self.push(&path.child("username"), FieldErrorKind::Required, "username is required for the chosen authentication type");
                }
                if auth.password.is_empty() {
                    self.push(&path.child("password"), FieldErrorKind::Required, "password is required for the chosen authentication type");
                }
                if !auth.private_key.is_empty() {
                    self.push(&path.child("privateKey"), FieldErrorKind::Invalid, "privateKey must not be set for the chosen authentication type");
                }
                if !auth.private_key_file.is_empty() {
                    self.push(&path.child("privateKeyFile"), FieldErrorKind::Invalid, "privateKeyFile must not be set for the chosen authentication type");
                }
            }
            Some(GitAuthType::Ssh) => {
                if auth.private_key.is_empty() == auth.private_key_file.is_empty() {
                    self.push(&path, FieldErrorKind::Invalid, "exactly one of 'privateKey' and 'privateKeyFile' must be set for the chosen authentication type");
                }
                if !auth.username.is_empty() {
                    self.push(&path.child("username"), FieldErrorKind::Invalid, "username must not be set for the chosen authentication type");
                }
            }
            None => self.push(
                &path.child("type"),
                FieldErrorKind::NotSupported,
                format!("'{}', supported values: {}", auth.auth_type, GitAuthType::SUPPORTED.join(", ")),
            ),
        }
    }

    fn sync_configs(&mut self, configs: &'a [SyncConfig], path: FieldPath) {
        if configs.is_empty() {
            self.push(&path, FieldErrorKind::Required, "no sync configs provided");
        }
        let mut ids = HashSet::new();
        for (idx, sc) in configs.iter().enumerate() {
            let cur = path.index(idx);
            if !ids.insert(sc.id.as_str()) {
                self.push(&cur.child("id"), FieldErrorKind::Duplicate, sc.id.clone());
            }
            if let Some(earlier) = configs[..idx].iter().find(|other| conflicts(other, sc)) {
                self.push(
                    &cur,
                    FieldErrorKind::Forbidden,
                    format!("conflicting sync with '{}': same resource, overlapping namespaces and a shared storage reference", earlier.id),
                );
            }
            self.sync_config(sc, cur);
        }
    }

    fn sync_config(&mut self, sc: &'a SyncConfig, path: FieldPath) {
        self.validate_name(&path.child("id"), "ID", &sc.id);
        self.storage_refs(&sc.storage_refs, path.child("storageRefs"));
        self.resource(sc.resource.as_ref(), path.child("resource"));
        self.state(sc.state.as_ref(), path.child("state"));
        if sc.finalize.is_none() {
            self.push(&path.child("finalize"), FieldErrorKind::Required, "finalize is required, the configuration was not completed");
        }
    }

    fn storage_refs(&mut self, refs: &[StorageReference], path: FieldPath) {
        if refs.is_empty() {
            self.push(&path, FieldErrorKind::Required, "storage references must not be empty");
        }
        for (idx, r) in refs.iter().enumerate() {
            let cur = path.index(idx);
            if r.name.is_empty() {
                self.push(&cur.child("name"), FieldErrorKind::Required, "storage reference name must not be empty");
                continue;
            }
            let Some(sd) = self.storage(&r.name) else {
                self.push(&cur.child("name"), FieldErrorKind::Invalid, format!("'{}': storage definition with this name does not exist", r.name));
                continue;
            };
            if sd.storage_type == StorageType::Mock {
                continue;
            }
            let Some(fs) = sd.filesystem_config.as_ref() else { continue };
            if fs.in_memory() {
                continue;
            }
            let base = base_path(&fs.root_path, &r.sub_path);
            let clash = self
                .host_base_paths
                .iter()
                .find(|other| other.storage != sd.name && (base.starts_with(&other.path) || other.path.starts_with(&base)));
            if let Some(other) = clash {
                let detail = format!(
                    "base paths (storage rootPath + reference subPath) must not be nested for storages sharing the host filesystem, '{}' clashes with '{}' of storage '{}'",
                    base.display(),
                    other.path.display(),
                    other.storage
                );
                self.push(&cur, FieldErrorKind::Forbidden, detail);
            }
            self.host_base_paths.push(HostBasePath { path: base, storage: sd.name.clone() });
        }
    }

    fn resource(&mut self, resource: Option<&ResourceSyncConfig>, path: FieldPath) {
        let Some(resource) = resource else {
            self.push(&path, FieldErrorKind::Required, "resource sync config must not be empty");
            return;
        };
        if resource.kind.is_empty() {
            self.push(&path.child("kind"), FieldErrorKind::Required, "resource kind must not be empty");
        }
        if resource.version.is_empty() {
            self.push(&path.child("version"), FieldErrorKind::Required, "resource version must not be empty");
        }
    }

    fn state(&mut self, state: Option<&StateConfiguration>, path: FieldPath) {
        let Some(state) = state else { return };
        if state.state_type == StateType::None {
            return;
        }
        let Some(verbosity) = state.verbosity else {
            self.push(&path.child("verbosity"), FieldErrorKind::Required, "verbosity must be set for the configured state type");
            return;
        };
        if state.state_type == StateType::Status {
            self.status_state(state.status_config.as_ref(), verbosity, path.child("statusConfig"));
        }
    }

    fn status_state(&mut self, cfg: Option<&StatusStateConfiguration>, verbosity: Verbosity, path: FieldPath) {
        let Some(cfg) = cfg else {
            self.push(&path, FieldErrorKind::Required, "status state configuration must not be empty for configured state type");
            return;
        };
        let required = [
            (Verbosity::Detail, "detailPath", &cfg.detail_path, "detail path"),
            (Verbosity::Phase, "phasePath", &cfg.phase_path, "phase path"),
            (Verbosity::Generation, "generationPath", &cfg.generation_path, "generation path"),
        ];
        for (min, key, value, what) in required {
            if verbosity >= min && value.is_empty() {
                self.push(&path.child(key), FieldErrorKind::Required, format!("{what} is required for the configured verbosity"));
            }
        }
    }
}

fn base_path(root: &str, sub_path: &str) -> PathBuf {
    let joined = Path::new(root).join(sub_path.trim_start_matches('/'));
    if joined.as_os_str().is_empty() {
        PathBuf::from("/")
    } else {
        joined
    }
}

fn namespaces_overlap(a: &str, b: &str) -> bool {
    a.is_empty() || b.is_empty() || a == b
}

/// Two bindings conflict if they could write the same object into the same storage location.
fn conflicts(a: &SyncConfig, b: &SyncConfig) -> bool {
    let (Some(ra), Some(rb)) = (a.resource.as_ref(), b.resource.as_ref()) else { return false };
    if ra.gvk() != rb.gvk() || !namespaces_overlap(&ra.namespace, &rb.namespace) {
        return false;
    }
    a.storage_refs.iter().any(|x| b.storage_refs.iter().any(|y| x.name == y.name && x.sub_path == y.sub_path))
}

impl KubeSyncConfig {
    /// Checks the completed configuration and reports every problem found.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut v = Validator::default();
        v.storage_definitions(&self.storage_definitions, FieldPath::root("storageDefinitions"));
        v.sync_configs(&self.sync_configs, FieldPath::root("syncConfigs"));
        if v.errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors(v.errors))
        }
    }
}
