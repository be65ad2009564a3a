//! KubeSync configuration: which resources are synced, into which storages, and how
//! progress is reported back. Loaded from YAML, then completed with defaults and validated.

#![forbid(unsafe_code)]

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use kube::core::GroupVersionKind;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use kubesync_state::Verbosity;

mod validation;

pub use validation::{FieldError, FieldErrorKind, ValidationErrors};

pub const DEFAULT_BRANCH: &str = "master";
pub const DEFAULT_NAMESPACE_PREFIX: &str = "ns_";
pub const DEFAULT_NAME_SEPARATOR: &str = "_";
pub const DEFAULT_FILE_EXTENSION: &str = "yaml";
pub const DEFAULT_IN_MEMORY_ROOT: &str = "/data";
pub const DEFAULT_USERNAME: &str = "anonymous";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("unable to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration:\n{0}")]
    Invalid(ValidationErrors),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeSyncConfig {
    #[serde(default)]
    pub sync_configs: Vec<SyncConfig>,
    #[serde(default)]
    pub storage_definitions: Vec<StorageDefinition>,
}

/// One watched resource type bound to one or more storages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    #[serde(default)]
    pub id: String,
    pub resource: Option<ResourceSyncConfig>,
    #[serde(default)]
    pub storage_refs: Vec<StorageReference>,
    pub state: Option<StateConfiguration>,
    pub finalize: Option<bool>,
}

impl SyncConfig {
    pub fn finalize(&self) -> bool {
        self.finalize.unwrap_or(true)
    }

    pub fn gvk(&self) -> Option<GroupVersionKind> {
        self.resource.as_ref().map(ResourceSyncConfig::gvk)
    }

    /// Watched namespace; `None` means all namespaces.
    pub fn namespace(&self) -> Option<&str> {
        self.resource.as_ref().map(|r| r.namespace.as_str()).filter(|ns| !ns.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSyncConfig {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
}

impl ResourceSyncConfig {
    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind { group: self.group.clone(), version: self.version.clone(), kind: self.kind.clone() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageReference {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub sub_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Filesystem,
    Git,
    Mock,
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StorageType::Filesystem => "filesystem",
            StorageType::Git => "git",
            StorageType::Mock => "mock",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    pub git_config: Option<GitConfiguration>,
    pub filesystem_config: Option<FileSystemConfiguration>,
    pub mock_config: Option<MockConfiguration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitConfiguration {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub branch: String,
    /// Single-writer mode: skip pulls before operations.
    #[serde(default)]
    pub exclusive: bool,
    pub auth: Option<GitRepoAuth>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GitAuthType {
    UsernamePassword,
    Ssh,
}

impl GitAuthType {
    pub const SUPPORTED: [&'static str; 2] = ["username_password", "ssh"];
}

impl FromStr for GitAuthType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "username_password" => Ok(GitAuthType::UsernamePassword),
            "ssh" => Ok(GitAuthType::Ssh),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitRepoAuth {
    /// `username_password` or `ssh`, case-insensitive until completed.
    #[serde(rename = "type", default)]
    pub auth_type: String,
    #[serde(default)]
    pub username: String,
    /// Password or access token; passphrase of the private key for `ssh`.
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub private_key_file: String,
}

impl GitRepoAuth {
    pub fn parsed_type(&self) -> Option<GitAuthType> {
        self.auth_type.parse().ok()
    }
}

impl fmt::Debug for GitRepoAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |s: &str| if s.is_empty() { "" } else { "<redacted>" };
        f.debug_struct("GitRepoAuth")
            .field("auth_type", &self.auth_type)
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("private_key", &redact(&self.private_key))
            .field("private_key_file", &self.private_key_file)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemConfiguration {
    pub namespace_prefix: Option<String>,
    #[serde(rename = "gvrNameSeparator")]
    pub name_separator: Option<String>,
    pub file_extension: Option<String>,
    #[serde(default)]
    pub root_path: String,
    pub in_memory: Option<bool>,
}

impl FileSystemConfiguration {
    pub fn namespace_prefix(&self) -> &str {
        self.namespace_prefix.as_deref().unwrap_or(DEFAULT_NAMESPACE_PREFIX)
    }

    pub fn name_separator(&self) -> &str {
        self.name_separator.as_deref().unwrap_or(DEFAULT_NAME_SEPARATOR)
    }

    /// Extension including the leading dot, or empty.
    pub fn file_extension(&self) -> String {
        let ext = self.file_extension.as_deref().unwrap_or(DEFAULT_FILE_EXTENSION);
        if ext.is_empty() || ext.starts_with('.') {
            ext.to_string()
        } else {
            format!(".{ext}")
        }
    }

    pub fn in_memory(&self) -> bool {
        self.in_memory.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockConfiguration {
    #[serde(default)]
    pub log_persister_calls_on_info_level: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateType {
    #[default]
    None,
    Annotation,
    Status,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateConfiguration {
    #[serde(rename = "type", default)]
    pub state_type: StateType,
    pub verbosity: Option<Verbosity>,
    pub status_config: Option<StatusStateConfiguration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusStateConfiguration {
    #[serde(default)]
    pub generation_path: String,
    #[serde(default)]
    pub phase_path: String,
    #[serde(default)]
    pub detail_path: String,
}

impl KubeSyncConfig {
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        debug!(path = %path.display(), bytes = raw.len(), "config file read");
        Self::from_yaml(&raw)
    }

    /// Loads, completes and validates the configuration file.
    pub fn load_validated(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut cfg = Self::load(path)?;
        cfg.complete();
        cfg.validate().map_err(ConfigError::Invalid)?;
        Ok(cfg)
    }

    pub fn storage(&self, name: &str) -> Option<&StorageDefinition> {
        self.storage_definitions.iter().find(|sd| sd.name == name)
    }

    /// Fills in defaults and normalizes values. Idempotent.
    pub fn complete(&mut self) {
        for sc in &mut self.sync_configs {
            sc.finalize.get_or_insert(true);
            if let Some(state) = sc.state.as_mut() {
                if state.state_type != StateType::None {
                    state.verbosity.get_or_insert(Verbosity::Phase);
                }
            }
        }
        for sd in &mut self.storage_definitions {
            match sd.storage_type {
                StorageType::Git => {
                    if let Some(git) = sd.git_config.as_mut() {
                        if git.branch.is_empty() {
                            git.branch = DEFAULT_BRANCH.to_string();
                        }
                        if let Some(auth) = git.auth.as_mut() {
                            auth.auth_type = auth.auth_type.to_lowercase();
                            if auth.parsed_type() == Some(GitAuthType::UsernamePassword) && auth.username.is_empty() {
                                auth.username = DEFAULT_USERNAME.to_string();
                            }
                        }
                    }
                    let fs = sd.filesystem_config.get_or_insert_with(Default::default);
                    let in_memory = *fs.in_memory.get_or_insert(true);
                    if in_memory && fs.root_path.is_empty() {
                        fs.root_path = DEFAULT_IN_MEMORY_ROOT.to_string();
                    }
                }
                StorageType::Filesystem => {
                    if let Some(fs) = sd.filesystem_config.as_mut() {
                        let in_memory = *fs.in_memory.get_or_insert(false);
                        if in_memory && fs.root_path.is_empty() {
                            fs.root_path = DEFAULT_IN_MEMORY_ROOT.to_string();
                        }
                    }
                }
                StorageType::Mock => {
                    sd.mock_config.get_or_insert_with(Default::default);
                    let fs = sd.filesystem_config.get_or_insert_with(Default::default);
                    fs.in_memory = Some(true);
                    if fs.root_path.is_empty() {
                        fs.root_path = DEFAULT_IN_MEMORY_ROOT.to_string();
                    }
                }
            }
        }
    }
}
