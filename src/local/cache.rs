use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument, warn};

use crate::cache::keyed::{KeyedSlots, Lookup};
use crate::config::Config;
use crate::error::CacheError;
use crate::metrics::{CloneStep, Metrics, StepLabels};

use super::cloner::{GitCli, RepoCloner};
use super::repo_client::{LocalDirFactory, RepoClientFactory};
use super::working_copy::LocalWorkingCopy;

/// Git ref the repo client is bound to after cloning.
const DEFAULT_GIT_REF: &str = "HEAD";

/// Process-wide cache of local working copies keyed by repository locator.
///
/// A working copy is cloned on the first [`get_local`](Self::get_local) for
/// its locator and reused until [`close`](Self::close).
pub struct LocalRepoCache {
    git: Arc<dyn RepoCloner>,
    clients: Arc<dyn RepoClientFactory>,
    clone_root: PathBuf,
    git_host: String,
    entries: KeyedSlots<String, Arc<LocalWorkingCopy>>,
    metrics: Option<Arc<Metrics>>,
}

impl LocalRepoCache {
    pub fn new(
        git: Arc<dyn RepoCloner>,
        clients: Arc<dyn RepoClientFactory>,
        clone_root: PathBuf,
        git_host: impl Into<String>,
    ) -> Self {
        Self {
            git,
            clients,
            clone_root,
            git_host: git_host.into(),
            entries: KeyedSlots::new(),
            metrics: None,
        }
    }

    /// System `git`, local-directory repo clients, clone root and git host
    /// from `config`.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(GitCli::new()),
            Arc::new(LocalDirFactory),
            config.local.clone_root.clone(),
            config.github.git_host.clone(),
        )
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// URL to clone for `locator`.  `owner/name` is expanded against the
    /// configured git host; URLs, scp-style remotes and absolute paths are
    /// used as given.
    pub fn clone_url(&self, locator: &str) -> String {
        let is_short_name = !locator.contains(':')
            && !locator.starts_with('/')
            && !locator.starts_with('.')
            && locator.split('/').filter(|s| !s.is_empty()).count() == 2
            && locator.matches('/').count() == 1;
        if is_short_name {
            format!("https://{}/{}", self.git_host, locator)
        } else {
            locator.to_string()
        }
    }

    fn record_failure(&self, step: CloneStep) {
        if let Some(metrics) = &self.metrics {
            metrics
                .clone_failures
                .get_or_create(&StepLabels { step })
                .inc();
        }
    }

    fn update_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.working_copies.set(self.entries.len() as i64);
        }
    }

    /// Clone, fetch, open and adapt a fresh working copy.  On any failure
    /// the temp dir is dropped, which removes it.
    async fn create(&self, locator: &str) -> Result<Arc<LocalWorkingCopy>, CacheError> {
        let started = Instant::now();
        if let Some(metrics) = &self.metrics {
            metrics.clone_total.inc();
        }

        let step_error = |step: CloneStep, source: anyhow::Error| {
            self.record_failure(step.clone());
            let locator = locator.to_string();
            match step {
                CloneStep::Clone => CacheError::CloneFailed { locator, source },
                CloneStep::Fetch => CacheError::FetchFailed { locator, source },
                CloneStep::Worktree => CacheError::WorktreeError { locator, source },
                CloneStep::Adapter => CacheError::AdapterInitError { locator, source },
            }
        };

        let prefix = locator.replace('/', "-");
        let dir = tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir_in(&self.clone_root)
            .map_err(|e| {
                step_error(
                    CloneStep::Clone,
                    anyhow::Error::new(e).context(format!(
                        "failed to create clone directory under {}",
                        self.clone_root.display()
                    )),
                )
            })?;

        let url = self.clone_url(locator);
        debug!(%url, path = %dir.path().display(), "cloning working copy");

        self.git
            .clone_repo(&url, dir.path())
            .await
            .map_err(|e| step_error(CloneStep::Clone, e))?;
        self.git
            .fetch_all_refs(dir.path())
            .await
            .map_err(|e| step_error(CloneStep::Fetch, e))?;
        let worktree = self
            .git
            .worktree_root(dir.path())
            .await
            .map_err(|e| step_error(CloneStep::Worktree, e))?;

        let repo = self
            .clients
            .make_repo(&worktree)
            .map_err(|e| step_error(CloneStep::Adapter, e))?;
        let client = self.clients.create_client();
        client
            .init_repo(&repo, DEFAULT_GIT_REF, 0)
            .await
            .map_err(|e| step_error(CloneStep::Adapter, e))?;

        if let Some(metrics) = &self.metrics {
            metrics
                .clone_duration_seconds
                .observe(started.elapsed().as_secs_f64());
        }

        Ok(Arc::new(LocalWorkingCopy::new(
            locator.to_string(),
            dir,
            worktree,
            Arc::clone(&self.git),
            repo,
            client,
        )))
    }

    /// The working copy for `locator`, cloning it on first request.
    ///
    /// Concurrent callers for the same locator share a single clone; a failed
    /// construction caches nothing and leaves no directory behind.
    #[instrument(skip(self))]
    pub async fn get_local(&self, locator: &str) -> Result<Arc<LocalWorkingCopy>, CacheError> {
        let key = locator.to_string();
        let (copy, lookup) = self
            .entries
            .get_or_try_init(&key, || self.create(locator))
            .await?;

        match lookup {
            Lookup::Hit => debug!("working copy cache hit"),
            Lookup::Built => {
                info!(path = %copy.path().display(), "cached new working copy");
                self.update_gauge();
            }
        }
        Ok(copy)
    }

    /// Close the repo client for `locator`, forget the entry and remove its
    /// clone directory.  No-op for an unknown locator.
    #[instrument(skip(self))]
    pub async fn close(&self, locator: &str) {
        let Some(copy) = self.entries.remove(&locator.to_string()) else {
            debug!("no working copy to close");
            return;
        };
        copy.close().await;
        if Arc::strong_count(&copy) > 1 {
            warn!("working copy closed while still referenced");
        }
        info!("closed working copy");
        self.update_gauge();
    }

    /// Number of cached working copies.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
