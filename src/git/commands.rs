//! Git command wrappers using [`tokio::process::Command`].
//!
//! Every function shells out to the system `git` binary.  Extra environment
//! variables (credential helpers, `GIT_SSH_COMMAND`, ...) are injected via
//! `env_vars`.  Children are spawned with `kill_on_drop`, so dropping the
//! returned future cancels the git process as well.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, instrument};

// ---------------------------------------------------------------------------
// Plumbing
// ---------------------------------------------------------------------------

fn git(repo: Option<&Path>, env_vars: &[(String, String)]) -> Command {
    let mut cmd = Command::new("git");
    if let Some(repo) = repo {
        cmd.arg("-C").arg(repo);
    }
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    for (k, v) in env_vars {
        cmd.env(k, v);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    cmd
}

/// Run `cmd` and fail with git's stderr if it exits non-zero.
async fn run(mut cmd: Command, what: &str) -> Result<Output> {
    debug!("spawning git {what}");
    let output = cmd
        .output()
        .await
        .with_context(|| format!("failed to spawn git {what}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git {what} failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }
    Ok(output)
}

// ---------------------------------------------------------------------------
// Clone
// ---------------------------------------------------------------------------

/// Run `git clone <url> <dest>`, producing a full clone with a worktree.
#[instrument(skip(env_vars), fields(%url, dest = %dest.display()))]
pub async fn git_clone(url: &str, dest: &Path, env_vars: &[(String, String)]) -> Result<()> {
    let mut cmd = git(None, env_vars);
    cmd.arg("clone").arg("--quiet").arg("--").arg(url).arg(dest);
    run(cmd, "clone").await?;
    debug!("git clone succeeded");
    Ok(())
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

/// Run `git fetch origin +refs/*:refs/*` inside a clone, mirroring every
/// upstream ref (branches, tags, pull refs) into the local namespace.
///
/// `--update-head-ok` is required because the checked-out branch is one of
/// the refs being overwritten.  Nothing is pruned.
#[instrument(skip(env_vars), fields(repo = %repo_path.display()))]
pub async fn git_fetch_all_refs(repo_path: &Path, env_vars: &[(String, String)]) -> Result<()> {
    let mut cmd = git(Some(repo_path), env_vars);
    cmd.arg("fetch")
        .arg("--force")
        .arg("--update-head-ok")
        .arg("origin")
        .arg("+refs/*:refs/*");
    run(cmd, "fetch").await?;
    debug!("git fetch complete");
    Ok(())
}

// ---------------------------------------------------------------------------
// Worktree
// ---------------------------------------------------------------------------

/// Return the top-level directory of the worktree containing `repo_path`.
///
/// Fails for bare repositories and for directories outside any repository.
#[instrument(fields(repo = %repo_path.display()))]
pub async fn git_worktree_root(repo_path: &Path) -> Result<PathBuf> {
    let mut cmd = git(Some(repo_path), &[]);
    cmd.arg("rev-parse").arg("--show-toplevel");
    let output = run(cmd, "rev-parse --show-toplevel").await?;

    let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if root.is_empty() {
        bail!("{} has no worktree", repo_path.display());
    }
    Ok(PathBuf::from(root))
}

/// Check out local branch `branch`.
#[instrument(fields(repo = %repo_path.display(), %branch))]
pub async fn git_checkout(repo_path: &Path, branch: &str) -> Result<()> {
    let mut cmd = git(Some(repo_path), &[]);
    cmd.arg("checkout").arg("--quiet").arg(branch).arg("--");
    run(cmd, "checkout").await?;
    debug!("git checkout succeeded");
    Ok(())
}

// ---------------------------------------------------------------------------
// Refs
// ---------------------------------------------------------------------------

/// Short names of every local branch (`refs/heads/*`), in ref order.
///
/// `lstrip=2` keeps slashes inside branch names and, unlike `:short`, never
/// disambiguates against a tag of the same name.
#[instrument(fields(repo = %repo_path.display()))]
pub async fn git_list_local_branches(repo_path: &Path) -> Result<Vec<String>> {
    let mut cmd = git(Some(repo_path), &[]);
    cmd.arg("for-each-ref")
        .arg("--format=%(refname:lstrip=2)")
        .arg("refs/heads/");
    let output = run(cmd, "for-each-ref").await?;

    let branches: Vec<String> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    debug!(branch_count = branches.len(), "git for-each-ref complete");
    Ok(branches)
}

/// Whether `refs/heads/<branch>` exists.
#[instrument(fields(repo = %repo_path.display(), %branch))]
pub async fn git_branch_exists(repo_path: &Path, branch: &str) -> Result<bool> {
    let mut cmd = git(Some(repo_path), &[]);
    cmd.arg("show-ref")
        .arg("--verify")
        .arg("--quiet")
        .arg(format!("refs/heads/{branch}"));

    let output = cmd
        .output()
        .await
        .context("failed to spawn git show-ref")?;

    // show-ref exits 1 for a missing ref; anything else is a real failure.
    match output.status.code() {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        _ => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "git show-ref failed (status {}): {}",
                output.status,
                stderr.trim(),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn git_available() -> bool {
        std::process::Command::new("git").arg("--version").output().is_ok()
    }

    fn setup_git(dir: &Path, args: &[&str]) {
        let output = std::process::Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(["-c", "user.name=Policy Bot", "-c", "user.email=bot@example.com"])
            .args(["-c", "commit.gpgsign=false"])
            .args(args)
            .output()
            .unwrap();
        assert!(output.status.success(), "git {args:?}: {output:?}");
    }

    #[tokio::test]
    async fn lists_branch_names_with_slashes_and_shadowing_tags() {
        if !git_available() {
            eprintln!("git not available, skipping");
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        setup_git(tmp.path(), &["init", "--quiet"]);
        setup_git(tmp.path(), &["symbolic-ref", "HEAD", "refs/heads/main"]);
        setup_git(tmp.path(), &["commit", "--quiet", "--allow-empty", "-m", "initial"]);
        setup_git(tmp.path(), &["branch", "release/v1"]);
        setup_git(tmp.path(), &["branch", "prod-temp"]);
        setup_git(tmp.path(), &["tag", "prod-temp"]);

        let branches = git_list_local_branches(tmp.path()).await.unwrap();
        assert_eq!(branches, vec!["main", "prod-temp", "release/v1"]);

        assert!(git_branch_exists(tmp.path(), "release/v1").await.unwrap());
        assert!(!git_branch_exists(tmp.path(), "release").await.unwrap());
    }

    #[tokio::test]
    async fn clone_of_missing_remote_fails_with_stderr() {
        if !git_available() {
            eprintln!("git not available, skipping");
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let err = git_clone(
            &tmp.path().join("nope").display().to_string(),
            &tmp.path().join("dest"),
            &[],
        )
        .await
        .unwrap_err();
        assert!(format!("{err:#}").contains("git clone failed"), "{err:#}");
    }

    #[tokio::test]
    async fn rev_parse_outside_repository_fails() {
        if !git_available() {
            eprintln!("git not available, skipping");
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        // GIT_CEILING_DIRECTORIES keeps git from finding an enclosing repo.
        let mut cmd = git(Some(tmp.path()), &[]);
        cmd.env("GIT_CEILING_DIRECTORIES", tmp.path())
            .arg("rev-parse")
            .arg("--show-toplevel");
        assert!(run(cmd, "rev-parse").await.is_err());
    }
}
