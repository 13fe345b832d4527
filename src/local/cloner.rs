use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;

use crate::git;

/// Git operations a working copy needs.  The cache drives construction
/// through `clone_repo`, `fetch_all_refs` and `worktree_root`; the working
/// copy uses the branch operations afterwards.
#[async_trait]
pub trait RepoCloner: Send + Sync {
    /// Full clone of `url` into the (empty) directory `dest`.
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<()>;

    /// Mirror every upstream ref into the local ref namespace.
    async fn fetch_all_refs(&self, repo: &Path) -> Result<()>;

    /// The worktree root of the clone at `repo`.
    async fn worktree_root(&self, repo: &Path) -> Result<PathBuf>;

    async fn local_branches(&self, repo: &Path) -> Result<Vec<String>>;

    async fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool>;

    async fn checkout(&self, repo: &Path, branch: &str) -> Result<()>;
}

/// [`RepoCloner`] backed by the system `git` binary.
#[derive(Debug, Clone, Default)]
pub struct GitCli {
    env_vars: Vec<(String, String)>,
}

impl GitCli {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extra environment for clone and fetch, e.g. `GIT_SSH_COMMAND` or a
    /// `GIT_CONFIG_*` credential helper.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl RepoCloner for GitCli {
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<()> {
        git::git_clone(url, dest, &self.env_vars).await
    }

    async fn fetch_all_refs(&self, repo: &Path) -> Result<()> {
        git::git_fetch_all_refs(repo, &self.env_vars).await
    }

    async fn worktree_root(&self, repo: &Path) -> Result<PathBuf> {
        git::git_worktree_root(repo).await
    }

    async fn local_branches(&self, repo: &Path) -> Result<Vec<String>> {
        git::git_list_local_branches(repo).await
    }

    async fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool> {
        git::git_branch_exists(repo, branch).await
    }

    async fn checkout(&self, repo: &Path, branch: &str) -> Result<()> {
        git::git_checkout(repo, branch).await
    }
}
