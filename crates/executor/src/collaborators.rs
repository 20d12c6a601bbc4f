//! Narrow collaborator traits for the two out-of-scope subsystems the
//! Executor still has to call into: repository resolution and worktree
//! management. Real implementations live elsewhere; these are the seam
//! plus an in-memory double good enough for tests and the demo.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use ao_domain::error::{Error, Result};
use ao_domain::model::{RepositoryId, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    /// The repository's local path is bind-mounted directly.
    Local,
    /// A dedicated worktree is created per session.
    Worktree,
    /// Requires a clone URL — there is no local path to bind-mount.
    RemoteDocker,
}

#[derive(Debug, Clone)]
pub struct RepositoryInfo {
    pub id: RepositoryId,
    pub local_path: Option<String>,
    pub clone_url: Option<String>,
    pub default_branch: String,
}

#[async_trait]
pub trait RepositoryResolver: Send + Sync {
    async fn resolve(&self, id: &RepositoryId) -> Result<RepositoryInfo>;
}

#[derive(Default)]
pub struct InMemoryRepositoryResolver {
    repos: RwLock<HashMap<RepositoryId, RepositoryInfo>>,
}

impl InMemoryRepositoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, info: RepositoryInfo) {
        self.repos.write().insert(info.id.clone(), info);
    }
}

#[async_trait]
impl RepositoryResolver for InMemoryRepositoryResolver {
    async fn resolve(&self, id: &RepositoryId) -> Result<RepositoryInfo> {
        self.repos
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("repository {id}")))
    }
}

/// The worktree manager: creates, checks, and recreates the session's
/// worktree set. Worktree *mechanics* are out of scope; this trait only
/// exists so the Executor's resume/launch paths have something to call.
#[async_trait]
pub trait WorktreeManager: Send + Sync {
    async fn create(&self, session: &Session, repo: &RepositoryInfo) -> Result<Vec<String>>;
    async fn exists(&self, path: &str) -> bool;
    async fn recreate(&self, session: &Session) -> Result<Vec<String>>;
}

#[derive(Default)]
pub struct InMemoryWorktreeManager {
    /// Paths considered to exist on disk; anything absent from this set
    /// simulates "path missing at resume time".
    present: RwLock<std::collections::HashSet<String>>,
    /// Paths that fail to recreate, simulating unrecoverable worktree
    /// loss.
    unrecoverable: RwLock<std::collections::HashSet<String>>,
}

impl InMemoryWorktreeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_missing(&self, path: &str) {
        self.present.write().remove(path);
    }

    pub fn mark_unrecoverable(&self, path: &str) {
        self.unrecoverable.write().insert(path.to_string());
    }
}

#[async_trait]
impl WorktreeManager for InMemoryWorktreeManager {
    async fn create(&self, session: &Session, _repo: &RepositoryInfo) -> Result<Vec<String>> {
        let path = format!("/worktrees/{}/0", session.id);
        self.present.write().insert(path.clone());
        Ok(vec![path])
    }

    async fn exists(&self, path: &str) -> bool {
        self.present.read().contains(path)
    }

    async fn recreate(&self, session: &Session) -> Result<Vec<String>> {
        let mut recreated = Vec::new();
        for path in &session.worktrees {
            if self.unrecoverable.read().contains(path) {
                return Err(Error::Other(format!("worktree {path} could not be recreated")));
            }
            self.present.write().insert(path.clone());
            recreated.push(path.clone());
        }
        Ok(recreated)
    }
}
