//! Local working-copy cache.
//!
//! [`LocalRepoCache`] keeps one cloned [`LocalWorkingCopy`] per repository
//! locator so file-system-level checks can share a clone instead of each
//! fetching the repository again.  Clones live in uniquely named temporary
//! directories under the configured clone root and are removed on
//! [`LocalRepoCache::close`].

pub mod cache;
pub mod cloner;
pub mod repo_client;
pub mod working_copy;

pub use cache::LocalRepoCache;
pub use cloner::{GitCli, RepoCloner};
pub use repo_client::{
    LocalDirClient, LocalDirFactory, LocalRepo, PathFilter, RepoClient, RepoClientFactory,
};
pub use working_copy::LocalWorkingCopy;
