//! Mutex-guarded git repository handle with the pull / commit / push protocol used by the
//! git persister.
//!
//! All operations on one handle serialize through its lock. [`RepoSession`] is the held
//! lock; callers that need several steps without interleaving (write files, commit, push)
//! keep one session for all of them.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use git2::build::CheckoutBuilder;
use git2::{
    Commit, Cred, CredentialType, ErrorClass, ErrorCode, FetchOptions, IndexAddOption, PushOptions, RemoteCallbacks, Repository,
    RepositoryInitOptions, ResetType, Signature,
};
use kubesync_config::{GitAuthType, GitRepoAuth, DEFAULT_BRANCH};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

pub const COMMIT_AUTHOR_NAME: &str = "KubeSync";
pub const COMMIT_AUTHOR_EMAIL: &str = "kubesync@example.org";
const REMOTE: &str = "origin";
const PLACEHOLDER_MESSAGE: &str = "initial commit";
// libgit2 asks again after rejected credentials; stop after a few rounds.
const MAX_CREDENTIAL_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("repository {0} is not initialized")]
    NotInitialized(String),
    #[error(transparent)]
    Git2(#[from] git2::Error),
    #[error("error while trying to {op} {}: {source}", .path.display())]
    Io { op: &'static str, path: PathBuf, source: std::io::Error },
    #[error("push rejected: {message}")]
    PushRejected { message: String },
    #[error("rebase of branch {branch} onto remote changes failed with conflicts")]
    RebaseConflict { branch: String },
    #[error("git repository lock poisoned")]
    Poisoned,
    #[error("invalid git authentication: {0}")]
    InvalidAuth(String),
}

/// Credentials offered to the remote.
#[derive(Clone)]
pub enum GitAuth {
    UserPass { username: String, password: String },
    SshKey { private_key: String, passphrase: Option<String> },
    SshKeyFile { path: PathBuf, passphrase: Option<String> },
    /// Credential helper for http(s), ssh-agent for ssh.
    Ambient,
}

impl std::fmt::Debug for GitAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GitAuth::UserPass { username, .. } => write!(f, "UserPass({username})"),
            GitAuth::SshKey { .. } => f.write_str("SshKey"),
            GitAuth::SshKeyFile { path, .. } => write!(f, "SshKeyFile({})", path.display()),
            GitAuth::Ambient => f.write_str("Ambient"),
        }
    }
}

impl GitAuth {
    pub fn from_config(auth: Option<&GitRepoAuth>) -> Result<Self, GitError> {
        let Some(auth) = auth else { return Ok(GitAuth::Ambient) };
        let passphrase = Some(auth.password.clone()).filter(|p| !p.is_empty());
        match auth.auth_type.to_lowercase().parse::<GitAuthType>() {
            Ok(GitAuthType::UsernamePassword) => Ok(GitAuth::UserPass { username: auth.username.clone(), password: auth.password.clone() }),
            Ok(GitAuthType::Ssh) if !auth.private_key.is_empty() => Ok(GitAuth::SshKey { private_key: auth.private_key.clone(), passphrase }),
            Ok(GitAuthType::Ssh) if !auth.private_key_file.is_empty() => {
                Ok(GitAuth::SshKeyFile { path: PathBuf::from(&auth.private_key_file), passphrase })
            }
            Ok(GitAuthType::Ssh) => Err(GitError::InvalidAuth("ssh authentication needs a private key".into())),
            Err(()) => Err(GitError::InvalidAuth(format!("unsupported type '{}'", auth.auth_type))),
        }
    }

    fn credentials(&self, config: Option<&git2::Config>, url: &str, username_from_url: Option<&str>, allowed: CredentialType) -> Result<Cred, git2::Error> {
        let ssh_user = username_from_url.unwrap_or("git");
        match self {
            GitAuth::UserPass { username, password } if allowed.is_user_pass_plaintext() => Cred::userpass_plaintext(username, password),
            GitAuth::SshKey { .. } | GitAuth::SshKeyFile { .. } if allowed.is_username() => Cred::username(ssh_user),
            GitAuth::SshKey { private_key, passphrase } if allowed.is_ssh_key() || allowed.is_ssh_memory() => {
                Cred::ssh_key_from_memory(ssh_user, None, private_key, passphrase.as_deref())
            }
            GitAuth::SshKeyFile { path, passphrase } if allowed.is_ssh_key() => Cred::ssh_key(ssh_user, None, path, passphrase.as_deref()),
            GitAuth::Ambient => {
                if allowed.is_ssh_key() {
                    if let Some(user) = username_from_url {
                        return Cred::ssh_key_from_agent(user);
                    }
                }
                if allowed.is_user_pass_plaintext() {
                    if let Some(cfg) = config {
                        if let Ok(cred) = Cred::credential_helper(cfg, url, username_from_url) {
                            return Ok(cred);
                        }
                    }
                }
                if allowed.is_username() {
                    return Cred::username(ssh_user);
                }
                Cred::default()
            }
            _ => Err(auth_error("configured credentials do not match the authentication requested by the remote")),
        }
    }
}

fn auth_error(msg: &str) -> git2::Error {
    git2::Error::new(ErrorCode::Auth, ErrorClass::Callback, msg)
}

fn remote_callbacks<'a>(auth: &'a GitAuth, config: Option<git2::Config>) -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();
    let mut attempts = 0u32;
    callbacks.credentials(move |url, username_from_url, allowed| {
        attempts += 1;
        if attempts > MAX_CREDENTIAL_ATTEMPTS {
            return Err(auth_error("credentials rejected by remote"));
        }
        auth.credentials(config.as_ref(), url, username_from_url, allowed)
    });
    callbacks
}

fn signature() -> Result<Signature<'static>, git2::Error> {
    Signature::now(COMMIT_AUTHOR_NAME, COMMIT_AUTHOR_EMAIL)
}

fn is_missing_remote_ref(err: &git2::Error) -> bool {
    err.code() == ErrorCode::NotFound || err.message().contains("couldn't find remote ref")
}

struct RepoState {
    repo: Option<Repository>,
    unpushed: bool,
}

/// One remote repository checked out at `local_path` on a single branch.
pub struct GitRepo {
    url: String,
    branch: String,
    local_path: PathBuf,
    auth: GitAuth,
    state: Mutex<RepoState>,
}

impl std::fmt::Debug for GitRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitRepo")
            .field("url", &self.url)
            .field("branch", &self.branch)
            .field("local_path", &self.local_path)
            .field("auth", &self.auth)
            .finish()
    }
}

impl GitRepo {
    pub fn new(url: impl Into<String>, branch: &str, local_path: impl Into<PathBuf>, auth: GitAuth) -> Self {
        let branch = if branch.is_empty() { DEFAULT_BRANCH } else { branch };
        Self {
            url: url.into(),
            branch: branch.to_string(),
            local_path: local_path.into(),
            auth,
            state: Mutex::new(RepoState { repo: None, unpushed: false }),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    fn local_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }

    fn tracking_ref(&self) -> String {
        format!("refs/remotes/{REMOTE}/{}", self.branch)
    }

    /// Acquires the repository lock.
    pub fn lock(&self) -> Result<RepoSession<'_>, GitError> {
        let guard = self.state.lock().map_err(|_| GitError::Poisoned)?;
        Ok(RepoSession { git: self, guard })
    }

    pub fn is_initialized(&self) -> Result<bool, GitError> {
        Ok(self.lock()?.guard.repo.is_some())
    }

    /// Opens the local clone if one exists, otherwise creates it and registers the remote.
    /// Then checks out the branch and force-pulls once. Initializing twice is a no-op.
    pub fn initialize(&self) -> Result<(), GitError> {
        let started = Instant::now();
        let mut session = self.lock()?;
        if session.guard.repo.is_some() {
            return Ok(());
        }
        let repo = if self.local_path.join(".git").exists() {
            debug!(path = %self.local_path.display(), "opening existing clone");
            Repository::open(&self.local_path)?
        } else {
            self.init_clone()?
        };
        session.guard.repo = Some(repo);
        session.checkout()?;
        session.pull(true)?;
        histogram!("git_op_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => "initialize");
        info!(url = %self.url, branch = %self.branch, path = %self.local_path.display(), "git repository initialized");
        Ok(())
    }

    fn init_clone(&self) -> Result<Repository, GitError> {
        std::fs::create_dir_all(&self.local_path)
            .map_err(|source| GitError::Io { op: "create", path: self.local_path.clone(), source })?;
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head(&self.branch).mkpath(true);
        let repo = Repository::init_opts(&self.local_path, &opts)?;
        let fetch_spec = format!("+{}:{}", self.local_ref(), self.tracking_ref());
        repo.remote_with_fetch(REMOTE, &self.url, &fetch_spec)?;
        debug!(url = %self.url, path = %self.local_path.display(), "created local clone");
        Ok(repo)
    }

    /// Runs a network operation with the configured credentials, retrying once with the
    /// ambient ones if the remote rejects them.
    fn with_auth<T>(&self, mut op: impl FnMut(&GitAuth) -> Result<T, git2::Error>) -> Result<T, git2::Error> {
        match op(&self.auth) {
            Err(e) if e.code() == ErrorCode::Auth && !matches!(self.auth, GitAuth::Ambient) => {
                warn!(url = %self.url, error = %e, "authentication failed, retrying with ambient credentials");
                op(&GitAuth::Ambient)
            }
            res => res,
        }
    }

    /// Fetches the branch; returns whether it exists on the remote.
    fn fetch(&self, repo: &Repository) -> Result<bool, GitError> {
        let started = Instant::now();
        let mut remote = repo.find_remote(REMOTE)?;
        let refspec = format!("+{}:{}", self.local_ref(), self.tracking_ref());
        let res = self.with_auth(|auth| {
            let mut fo = FetchOptions::new();
            fo.remote_callbacks(remote_callbacks(auth, repo.config().ok()));
            remote.fetch(&[refspec.as_str()], Some(&mut fo), None)
        });
        histogram!("git_op_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => "fetch");
        match res {
            Ok(()) => Ok(repo.find_reference(&self.tracking_ref()).is_ok()),
            Err(e) if is_missing_remote_ref(&e) => {
                debug!(url = %self.url, branch = %self.branch, "branch not found on remote");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn pull(&self, force: bool) -> Result<(), GitError> {
        self.lock()?.pull(force)
    }

    pub fn commit(&self, message: &str) -> Result<bool, GitError> {
        self.lock()?.commit(message)
    }

    pub fn push(&self) -> Result<(), GitError> {
        self.lock()?.push()
    }

    pub fn commit_and_push(&self, message: &str) -> Result<(), GitError> {
        self.lock()?.commit_and_push(message)
    }
}

/// Exclusive access to an initialized repository.
pub struct RepoSession<'a> {
    git: &'a GitRepo,
    guard: MutexGuard<'a, RepoState>,
}

impl RepoSession<'_> {
    fn repo(&self) -> Result<&Repository, GitError> {
        self.guard.repo.as_ref().ok_or_else(|| GitError::NotInitialized(self.git.url.clone()))
    }

    /// Checks out the branch, creating it if needed. A repository without any commit gets an
    /// empty placeholder commit first, because a branch needs a commit to point to.
    fn checkout(&mut self) -> Result<(), GitError> {
        let git = self.git;
        let repo = self.repo()?;
        let local_ref = git.local_ref();
        let remote_exists = git.fetch(repo)?;
        if repo.find_reference(&local_ref).is_err() {
            let start = if remote_exists {
                repo.find_reference(&git.tracking_ref())?.peel_to_commit()?
            } else if let Ok(head) = repo.head().and_then(|h| h.peel_to_commit()) {
                head
            } else {
                placeholder_commit(repo)?
            };
            repo.branch(&git.branch, &start, false)?;
            debug!(branch = %git.branch, from_remote = remote_exists, "created local branch");
        }
        let target = repo.revparse_single(&local_ref)?;
        repo.checkout_tree(&target, Some(CheckoutBuilder::new().force()))?;
        repo.set_head(&local_ref)?;
        Ok(())
    }

    /// Integrates remote changes. Missing remote branches and up-to-date branches are not
    /// errors. A diverged branch is rebased onto the remote, or reset to it when `force`.
    pub fn pull(&mut self, force: bool) -> Result<(), GitError> {
        let started = Instant::now();
        let git = self.git;
        let (ahead, behind, discarded) = {
            let repo = self.repo()?;
            if !git.fetch(repo)? {
                return Ok(());
            }
            let remote = repo.find_reference(&git.tracking_ref())?.peel_to_commit()?;
            let Ok(local) = repo.refname_to_id(&git.local_ref()) else {
                repo.branch(&git.branch, &remote, false)?;
                let target = repo.revparse_single(&git.local_ref())?;
                repo.checkout_tree(&target, Some(CheckoutBuilder::new().force()))?;
                repo.set_head(&git.local_ref())?;
                return Ok(());
            };
            if local == remote.id() {
                return Ok(());
            }
            let (ahead, behind) = repo.graph_ahead_behind(local, remote.id())?;
            if behind == 0 {
                return Ok(());
            }
            if ahead == 0 || force {
                repo.reset(remote.as_object(), ResetType::Hard, Some(CheckoutBuilder::new().force()))?;
                (ahead, behind, ahead > 0)
            } else {
                rebase_onto(repo, &remote, &git.branch)?;
                (ahead, behind, false)
            }
        };
        if discarded {
            warn!(branch = %git.branch, ahead, "local commits discarded by forced pull");
            self.guard.unpushed = false;
        }
        histogram!("git_op_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => "pull");
        debug!(branch = %git.branch, ahead, behind, "pulled remote changes");
        Ok(())
    }

    /// Stages every change in the working tree and commits it. Returns false if there was
    /// nothing to commit.
    pub fn commit(&mut self, message: &str) -> Result<bool, GitError> {
        let committed = {
            let repo = self.repo()?;
            let mut index = repo.index()?;
            index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
            index.update_all(["*"].iter(), None)?;
            index.write()?;
            let tree_id = index.write_tree()?;
            let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
            if parent.as_ref().map(Commit::tree_id) == Some(tree_id) {
                false
            } else {
                let tree = repo.find_tree(tree_id)?;
                let sig = signature()?;
                let parents: Vec<&Commit<'_>> = parent.iter().collect();
                repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
                true
            }
        };
        if committed {
            counter!("git_commit_total", 1u64);
            self.guard.unpushed = true;
            debug!(message, "committed");
        }
        Ok(committed)
    }

    /// Pushes local commits. On failure pulls once and retries; a second failure is returned.
    pub fn push(&mut self) -> Result<(), GitError> {
        if !self.guard.unpushed {
            return Ok(());
        }
        let started = Instant::now();
        if let Err(first) = self.try_push() {
            warn!(url = %self.git.url, error = %first, "push failed, pulling before retry");
            counter!("git_push_retry_total", 1u64);
            self.pull(false)?;
            self.try_push()?;
        }
        self.guard.unpushed = false;
        counter!("git_push_total", 1u64);
        histogram!("git_op_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => "push");
        Ok(())
    }

    fn try_push(&self) -> Result<(), GitError> {
        let git = self.git;
        let repo = self.repo()?;
        let mut remote = repo.find_remote(REMOTE)?;
        let refspec = format!("{0}:{0}", git.local_ref());
        let rejection: RefCell<Option<String>> = RefCell::new(None);
        git.with_auth(|auth| {
            let mut callbacks = remote_callbacks(auth, repo.config().ok());
            callbacks.push_update_reference(|_ref_name, status| {
                if let Some(msg) = status {
                    *rejection.borrow_mut() = Some(msg.to_string());
                }
                Ok(())
            });
            let mut po = PushOptions::new();
            po.remote_callbacks(callbacks);
            remote.push(&[refspec.as_str()], Some(&mut po))
        })?;
        match rejection.into_inner() {
            Some(message) => Err(GitError::PushRejected { message }),
            None => Ok(()),
        }
    }

    /// Commits and pushes without releasing the lock in between.
    pub fn commit_and_push(&mut self, message: &str) -> Result<(), GitError> {
        self.commit(message)?;
        self.push()
    }

    pub fn has_unpushed(&self) -> bool {
        self.guard.unpushed
    }
}

fn placeholder_commit(repo: &Repository) -> Result<Commit<'_>, GitError> {
    let tree_id = repo.treebuilder(None)?.write()?;
    let tree = repo.find_tree(tree_id)?;
    let sig = signature()?;
    let oid = repo.commit(None, &sig, &sig, PLACEHOLDER_MESSAGE, &tree, &[])?;
    debug!(%oid, "created placeholder commit");
    Ok(repo.find_commit(oid)?)
}

fn rebase_onto(repo: &Repository, remote: &Commit<'_>, branch: &str) -> Result<(), GitError> {
    let upstream = repo.find_annotated_commit(remote.id())?;
    let mut rebase = repo.rebase(None, Some(&upstream), None, None)?;
    let sig = signature()?;
    while let Some(op) = rebase.next() {
        if let Err(e) = op {
            rebase.abort()?;
            return Err(e.into());
        }
        if repo.index()?.has_conflicts() {
            rebase.abort()?;
            return Err(GitError::RebaseConflict { branch: branch.to_string() });
        }
        match rebase.commit(None, &sig, None) {
            Ok(_) => {}
            Err(e) if e.code() == ErrorCode::Applied => {}
            Err(e) => {
                rebase.abort()?;
                return Err(e.into());
            }
        }
    }
    rebase.finish(Some(&sig))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_remote() -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        Repository::init_bare(dir.path()).unwrap();
        let url = dir.path().to_string_lossy().into_owned();
        (dir, url)
    }

    #[test]
    fn auth_from_config() {
        assert!(matches!(GitAuth::from_config(None).unwrap(), GitAuth::Ambient));
        let token = GitRepoAuth { auth_type: "username_password".into(), username: "bot".into(), password: "t".into(), ..Default::default() };
        assert!(matches!(GitAuth::from_config(Some(&token)).unwrap(), GitAuth::UserPass { .. }));
        let key = GitRepoAuth { auth_type: "ssh".into(), private_key_file: "/k".into(), password: "pp".into(), ..Default::default() };
        match GitAuth::from_config(Some(&key)).unwrap() {
            GitAuth::SshKeyFile { passphrase, .. } => assert_eq!(passphrase.as_deref(), Some("pp")),
            other => panic!("unexpected: {other:?}"),
        }
        let bad = GitRepoAuth { auth_type: "token".into(), ..Default::default() };
        assert!(matches!(GitAuth::from_config(Some(&bad)), Err(GitError::InvalidAuth(_))));
    }

    #[test]
    fn empty_remote_gets_placeholder_branch() {
        let (_remote, url) = bare_remote();
        let local = tempfile::tempdir().unwrap();
        let git = GitRepo::new(&url, "main", local.path().join("wt"), GitAuth::Ambient);
        git.initialize().unwrap();
        git.initialize().unwrap();

        let session = git.lock().unwrap();
        let repo = session.repo().unwrap();
        let head = repo.head().unwrap();
        assert_eq!(head.name(), Some("refs/heads/main"));
        let commit = head.peel_to_commit().unwrap();
        assert_eq!(commit.message(), Some(PLACEHOLDER_MESSAGE));
        assert_eq!(commit.author().email(), Some(COMMIT_AUTHOR_EMAIL));
        assert!(!session.has_unpushed());
    }

    #[test]
    fn commit_reports_empty_changes() {
        let (_remote, url) = bare_remote();
        let local = tempfile::tempdir().unwrap();
        let git = GitRepo::new(&url, "", local.path(), GitAuth::Ambient);
        assert_eq!(git.branch(), DEFAULT_BRANCH);
        git.initialize().unwrap();
        assert!(!git.commit("nothing").unwrap());

        std::fs::write(local.path().join("a.yaml"), "a: 1\n").unwrap();
        assert!(git.commit("add a").unwrap());
        git.push().unwrap();

        let remote = Repository::open_bare(&url).unwrap();
        let tip = remote.find_reference("refs/heads/master").unwrap().peel_to_commit().unwrap();
        assert_eq!(tip.message(), Some("add a"));
        assert_eq!(tip.parent_count(), 1);
    }

    #[test]
    fn operations_require_initialization() {
        let git = GitRepo::new("file:///nowhere", "main", "/nonexistent", GitAuth::Ambient);
        assert!(matches!(git.commit("x"), Err(GitError::NotInitialized(_))));
        assert!(!git.is_initialized().unwrap());
    }
}
