//! Repository-client adapter over a local directory.
//!
//! File-system-level checks read a working copy through [`RepoClient`]
//! rather than touching the clone directly, so they can run unchanged
//! against other repository sources.

use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{bail, ensure, Context, Result};
use async_trait::async_trait;
use tracing::{debug, instrument};

/// Handle to a repository on the local file system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRepo {
    path: PathBuf,
}

impl LocalRepo {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Predicate over repository-relative paths, used by [`RepoClient::list_files`].
pub type PathFilter = dyn for<'a> Fn(&'a str) -> bool + Send + Sync;

/// Read access to one repository's files.
#[async_trait]
pub trait RepoClient: Send + Sync {
    /// Bind the client to `repo` at `git_ref`.  `depth == 0` means no limit.
    async fn init_repo(&self, repo: &LocalRepo, git_ref: &str, depth: u32) -> Result<()>;

    /// Repository-relative paths (with `/` separators) of every file
    /// accepted by `predicate`, sorted.
    async fn list_files(&self, predicate: &PathFilter) -> Result<Vec<String>>;

    /// Contents of the file at repository-relative `path`.  Paths that
    /// resolve outside the repository, through `..` or a symlink, fail.
    async fn file_content(&self, path: &str) -> Result<Vec<u8>>;

    /// Release the client.  Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Produces repo handles and unbound clients for local directories.
pub trait RepoClientFactory: Send + Sync {
    fn make_repo(&self, path: &Path) -> Result<LocalRepo>;
    fn create_client(&self) -> Box<dyn RepoClient>;
}

// ---------------------------------------------------------------------------
// Local directory implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalDirFactory;

impl RepoClientFactory for LocalDirFactory {
    fn make_repo(&self, path: &Path) -> Result<LocalRepo> {
        ensure!(path.is_absolute(), "{} is not an absolute path", path.display());
        ensure!(path.is_dir(), "{} is not a directory", path.display());
        Ok(LocalRepo {
            path: path.to_path_buf(),
        })
    }

    fn create_client(&self) -> Box<dyn RepoClient> {
        Box::new(LocalDirClient::default())
    }
}

/// Reads files straight from the worktree, so the view always follows the
/// currently checked-out branch.
#[derive(Debug, Default)]
pub struct LocalDirClient {
    root: Mutex<Option<PathBuf>>,
}

impl LocalDirClient {
    fn lock(&self) -> MutexGuard<'_, Option<PathBuf>> {
        self.root.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn root(&self) -> Result<PathBuf> {
        match self.lock().clone() {
            Some(root) => Ok(root),
            None => bail!("repo client is not initialised"),
        }
    }
}

#[async_trait]
impl RepoClient for LocalDirClient {
    #[instrument(skip(self), fields(repo = %repo.path.display()))]
    async fn init_repo(&self, repo: &LocalRepo, git_ref: &str, depth: u32) -> Result<()> {
        // A local directory is read as-is; only HEAD is meaningful.
        ensure!(
            git_ref == "HEAD",
            "local directory clients only support HEAD, got {git_ref}"
        );
        let meta = tokio::fs::metadata(&repo.path)
            .await
            .with_context(|| format!("cannot stat {}", repo.path.display()))?;
        ensure!(meta.is_dir(), "{} is not a directory", repo.path.display());

        *self.lock() = Some(repo.path.clone());
        debug!(depth, "local repo client initialised");
        Ok(())
    }

    async fn list_files(&self, predicate: &PathFilter) -> Result<Vec<String>> {
        let root = self.root()?;
        let mut files = Vec::new();
        let mut pending = vec![root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .with_context(|| format!("failed to read directory {}", dir.display()))?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_name() == ".git" {
                    continue;
                }
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let relative = path
                    .strip_prefix(&root)
                    .context("walked outside the repository root")?;
                let relative = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if predicate(&relative) {
                    files.push(relative);
                }
            }
        }

        files.sort();
        Ok(files)
    }

    async fn file_content(&self, path: &str) -> Result<Vec<u8>> {
        let root = self.root()?;
        let relative = Path::new(path);
        ensure!(
            relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir)),
            "{path} escapes the repository root"
        );

        let root = tokio::fs::canonicalize(&root)
            .await
            .with_context(|| format!("cannot resolve {}", root.display()))?;
        let target = tokio::fs::canonicalize(root.join(relative))
            .await
            .with_context(|| format!("failed to read {path}"))?;
        ensure!(
            target.starts_with(&root),
            "{path} resolves outside the repository root"
        );
        tokio::fs::read(&target)
            .await
            .with_context(|| format!("failed to read {path}"))
    }

    async fn close(&self) -> Result<()> {
        self.lock().take();
        Ok(())
    }
}
