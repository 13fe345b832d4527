use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tempfile::TempDir;
use tracing::{debug, instrument, warn};

use crate::error::CacheError;

use super::cloner::RepoCloner;
use super::repo_client::{LocalRepo, RepoClient};

/// A cached local clone: the clone directory, its worktree, and a repo
/// client bound to it.
///
/// The clone directory is owned by the working copy.  It is removed by
/// [`close`](Self::close), or when the last reference is dropped.
/// `checkout` changes the shared worktree; callers running checks on the
/// same working copy must serialize checkouts themselves.
pub struct LocalWorkingCopy {
    locator: String,
    path: PathBuf,
    worktree: PathBuf,
    dir: Mutex<Option<TempDir>>,
    git: Arc<dyn RepoCloner>,
    repo: LocalRepo,
    client: Box<dyn RepoClient>,
}

impl std::fmt::Debug for LocalWorkingCopy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalWorkingCopy")
            .field("locator", &self.locator)
            .field("path", &self.path)
            .field("worktree", &self.worktree)
            .finish_non_exhaustive()
    }
}

impl LocalWorkingCopy {
    pub(crate) fn new(
        locator: String,
        dir: TempDir,
        worktree: PathBuf,
        git: Arc<dyn RepoCloner>,
        repo: LocalRepo,
        client: Box<dyn RepoClient>,
    ) -> Self {
        Self {
            locator,
            path: dir.path().to_path_buf(),
            worktree,
            dir: Mutex::new(Some(dir)),
            git,
            repo,
            client,
        }
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    /// The clone directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn worktree(&self) -> &Path {
        &self.worktree
    }

    pub fn repo(&self) -> &LocalRepo {
        &self.repo
    }

    /// Repo client bound to the worktree at `HEAD`.
    pub fn repo_client(&self) -> &dyn RepoClient {
        self.client.as_ref()
    }

    fn worktree_error(&self, source: anyhow::Error) -> CacheError {
        CacheError::WorktreeError {
            locator: self.locator.clone(),
            source,
        }
    }

    /// Short names of every local branch.  After construction this is every
    /// upstream branch, since all refs were fetched into `refs/heads/`.
    #[instrument(skip(self), fields(locator = %self.locator))]
    pub async fn list_upstream_branches(&self) -> Result<Vec<String>, CacheError> {
        self.git
            .local_branches(&self.worktree)
            .await
            .map_err(|e| self.worktree_error(e))
    }

    /// Check out local branch `name` in the worktree.
    #[instrument(skip(self), fields(locator = %self.locator))]
    pub async fn checkout(&self, name: &str) -> Result<(), CacheError> {
        let exists = self
            .git
            .branch_exists(&self.worktree, name)
            .await
            .map_err(|e| self.worktree_error(e))?;
        if !exists {
            return Err(CacheError::RefNotFound {
                locator: self.locator.clone(),
                branch: name.to_string(),
            });
        }
        self.git
            .checkout(&self.worktree, name)
            .await
            .map_err(|e| self.worktree_error(e))?;
        debug!(branch = name, "checked out branch");
        Ok(())
    }

    /// Close the repo client and remove the clone directory.  Idempotent;
    /// cleanup failures are logged, not returned.
    #[instrument(skip(self), fields(locator = %self.locator))]
    pub(crate) async fn close(&self) {
        if let Err(e) = self.client.close().await {
            warn!(error = %format!("{e:#}"), "failed to close repo client");
        }

        let dir = self
            .dir
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(dir) = dir else {
            return;
        };
        let path = self.path.clone();
        match tokio::task::spawn_blocking(move || dir.close()).await {
            Ok(Ok(())) => debug!(path = %path.display(), "removed clone directory"),
            Ok(Err(e)) => warn!(path = %path.display(), error = %e, "failed to remove clone directory"),
            Err(e) => warn!(path = %path.display(), error = %e, "clone directory cleanup task failed"),
        }
    }
}
