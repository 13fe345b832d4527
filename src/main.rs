use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use policybot_cache::config::{load_config, Config};
use policybot_cache::credentials::BackendRegistry;
use policybot_cache::metrics::MetricsRegistry;
use policybot_cache::{installation_access_token, InstallationClients, LocalRepoCache};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "policybot-cache",
    about = "Exercise the installation client and working-copy caches"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/policybot-cache/config.yaml")]
    config: String,

    /// Print Prometheus metrics to stdout after the command finishes.
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mint an installation access token for an org.
    Token {
        #[arg(long)]
        org: String,
    },
    /// Clone a repository and list its branches.
    Branches {
        /// `owner/name` or a clone URL.
        #[arg(long)]
        repo: String,
    },
    /// Clone a repository, check out a branch and list its top-level files.
    Checkout {
        #[arg(long)]
        repo: String,
        #[arg(long)]
        branch: String,
    },
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn run_token(
    config: &Config,
    registry: &BackendRegistry,
    metrics: &MetricsRegistry,
    org: &str,
) -> Result<()> {
    let clients = InstallationClients::from_config(
        &config.github,
        registry,
        Some(Arc::clone(&metrics.metrics)),
    )?;
    let app = clients.get(0).await?;
    let token = installation_access_token(&app, org).await?;
    println!("minted installation token for {org} ({} chars)", token.len());
    Ok(())
}

async fn run_branches(cache: &LocalRepoCache, repo: &str) -> Result<()> {
    let copy = cache.get_local(repo).await?;
    let result = copy.list_upstream_branches().await;
    drop(copy);
    cache.close(repo).await;

    let mut branches = result?;
    branches.sort();
    for branch in branches {
        println!("{branch}");
    }
    Ok(())
}

async fn run_checkout(cache: &LocalRepoCache, repo: &str, branch: &str) -> Result<()> {
    let copy = cache.get_local(repo).await?;
    let result = async {
        copy.checkout(branch).await?;
        copy.repo_client()
            .list_files(&|path| !path.contains('/'))
            .await
            .context("failed to list files")
    }
    .await;
    drop(copy);
    cache.close(repo).await;

    for file in result? {
        println!("{file}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    // ---- Config ----
    let registry = BackendRegistry::with_defaults();
    let config = load_config(&cli.config, &registry)?;
    tracing::info!(config_path = %cli.config, app_id = config.github.app_id, "starting policybot-cache");

    let metrics = MetricsRegistry::new();
    let repos = LocalRepoCache::from_config(&config).with_metrics(Arc::clone(&metrics.metrics));

    match &cli.command {
        Command::Token { org } => run_token(&config, &registry, &metrics, org).await?,
        Command::Branches { repo } => run_branches(&repos, repo).await?,
        Command::Checkout { repo, branch } => run_checkout(&repos, repo, branch).await?,
    }

    if cli.metrics {
        print!("{}", metrics.encode().context("failed to encode metrics")?);
    }
    Ok(())
}
