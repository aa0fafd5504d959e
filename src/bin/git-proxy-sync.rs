//! Proxy reconciler entry point, called from the repo's pre-/post- hooks:
//!
//! ```text
//! git-proxy-sync "$0"        # the hook passes its own name
//! ```
//!
//! The reconciler is advisory: every error is logged and the process still
//! exits 0 so a proxy outage never blocks the Git operation itself.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use git_server::config::RepoConfig;
use git_server::reconciler::{HookPhase, Reconciler};

#[derive(Parser, Debug)]
#[command(
    name = "git-proxy-sync",
    about = "Two-way sync between a bare repository and its proxy"
)]
struct Cli {
    /// Invoking hook name (or path): pre-read, pre-write, post-read,
    /// post-write.
    hook: String,

    /// Repository to sync; defaults to $GIT_DIR.
    #[arg(long)]
    git_dir: Option<PathBuf>,
}

async fn run(cli: Cli) -> Result<()> {
    let git_dir = match cli.git_dir {
        Some(dir) => dir,
        None => PathBuf::from(std::env::var("GIT_DIR").context("GIT_DIR not set")?),
    };
    let phase = HookPhase::from_hook_name(&cli.hook)?;

    let config = RepoConfig::load(&git_dir).await?;
    let Some(proxy_url) = config.proxy_url else {
        tracing::debug!("no proxy.url configured; nothing to sync");
        return Ok(());
    };

    Reconciler::new(&git_dir, &proxy_url, phase).run().await
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        tracing::warn!(error = %e, "proxy sync failed; continuing without it");
    }
    // Advisory by contract: never block the Git operation.
    std::process::exit(0);
}
