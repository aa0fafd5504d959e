//! Process-table queries.
//!
//! Only one question is still answered via `ps`: whether a `git rebase` is
//! live on this host while we consider clearing its locks.  Peer-deployer
//! detection went to the flock marker in [`super::peer`].

use anyhow::{Context, Result};
use tracing::debug;

/// Full process listing; `ps fauwwx` with a fallback for ps variants that
/// lack the forest flag.
pub async fn process_listing() -> Result<String> {
    for args in [&["fauwwx"][..], &["auwwx"][..]] {
        let output = tokio::process::Command::new("ps")
            .args(args)
            .output()
            .await
            .context("failed to spawn ps")?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        debug!(?args, "ps variant failed; trying fallback");
    }
    anyhow::bail!("no usable ps variant");
}

/// Whether any `git rebase` process is currently running.
pub async fn rebase_in_progress() -> bool {
    match process_listing().await {
        Ok(listing) => listing_has_rebase(&listing),
        Err(_) => false,
    }
}

fn listing_has_rebase(listing: &str) -> bool {
    listing.lines().any(|line| line.contains("git rebase"))
}
