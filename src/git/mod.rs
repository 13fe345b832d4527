//! Git command wrappers for local working copies.
//!
//! All operations shell out to the `git` binary using `tokio::process::Command`
//! for non-blocking execution.

pub mod commands;

pub use commands::{
    git_branch_exists, git_checkout, git_clone, git_fetch_all_refs, git_list_local_branches,
    git_worktree_root,
};
