//! The `RepoManager` collaborator: git worktree
//! provisioning, called out from the orchestrator but owned elsewhere
//! in a full deployment. [`FsRepoManager`] is a directory-only stand-in
//! sufficient for tests and single-machine operation — it never shells
//! out to `git`.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::OrchestratorError;

/// Git worktree provisioning, as the orchestrator calls out to it.
/// Implementations own their own concurrency.
#[async_trait]
pub trait RepoManager: Send + Sync {
    /// The working directory a task on `(repo, branch)` should run in.
    async fn worktree_path(&self, repo: &str, branch: &str) -> Result<PathBuf, OrchestratorError>;

    /// Ensure a worktree for `(repo, branch)` exists, creating it from
    /// `base_branch` if not.
    async fn ensure_worktree(
        &self,
        repo: &str,
        branch: &str,
        base_branch: Option<&str>,
    ) -> Result<(), OrchestratorError>;

    /// Whether a bare repository is registered under `repo`.
    async fn bare_repo_exists(&self, repo: &str) -> bool;
}

/// A [`RepoManager`] that lays worktrees out as plain directories under
/// a root (`<root>/<repo>/<branch>`), with no git plumbing at all. Real
/// worktree provisioning (clone, `git worktree add`, branch creation
/// from `base_branch`) is out of scope;
/// `ensure_worktree` here only guarantees the directory exists.
#[derive(Debug, Clone)]
pub struct FsRepoManager {
    root: PathBuf,
}

impl FsRepoManager {
    /// A repo manager rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, repo: &str, branch: &str) -> PathBuf {
        self.root.join(repo).join(branch)
    }
}

#[async_trait]
impl RepoManager for FsRepoManager {
    async fn worktree_path(&self, repo: &str, branch: &str) -> Result<PathBuf, OrchestratorError> {
        Ok(self.path_for(repo, branch))
    }

    async fn ensure_worktree(
        &self,
        repo: &str,
        branch: &str,
        _base_branch: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        let path = self.path_for(repo, branch);
        tokio::fs::create_dir_all(&path).await?;
        Ok(())
    }

    async fn bare_repo_exists(&self, repo: &str) -> bool {
        tokio::fs::metadata(self.root.join(repo)).await.is_ok()
    }
}

/// A [`RepoManager`] for tasks with no repo: every path resolves to a
/// fixed working directory and `ensure_worktree`/`bare_repo_exists` are
/// no-ops. Useful in tests and for single-repo deployments that never
/// set `task.repo`.
#[derive(Debug, Clone)]
pub struct FixedDirRepoManager {
    dir: PathBuf,
}

impl FixedDirRepoManager {
    /// Always resolve to `dir`, regardless of `repo`/`branch`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl RepoManager for FixedDirRepoManager {
    async fn worktree_path(&self, _repo: &str, _branch: &str) -> Result<PathBuf, OrchestratorError> {
        Ok(self.dir.clone())
    }

    async fn ensure_worktree(&self, _repo: &str, _branch: &str, _base_branch: Option<&str>) -> Result<(), OrchestratorError> {
        Ok(())
    }

    async fn bare_repo_exists(&self, _repo: &str) -> bool {
        true
    }
}
