//! Standalone IPC log parser for custom post-hooks:
//!
//! ```text
//! record=$(git-pushinfo)            # $IPC from the environment
//! record=$(git-pushinfo --ipc DIR)
//! ```
//!
//! Emits one JSON object on stdout; `synthetic` tells the consumer whether
//! a real wire trace backed it.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use git_server::ipclog;

#[derive(Parser, Debug)]
#[command(
    name = "git-pushinfo",
    about = "Summarize a session's IPC artifacts as JSON"
)]
struct Cli {
    /// IPC directory; defaults to $IPC.
    #[arg(long)]
    ipc: Option<PathBuf>,

    /// Pretty-print the JSON record.
    #[arg(long)]
    pretty: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let dir = match cli.ipc {
        Some(dir) => dir,
        None => PathBuf::from(std::env::var("IPC").context("IPC not set")?),
    };

    let record = ipclog::parse_ipc_dir(&dir)?;
    let json = if cli.pretty {
        serde_json::to_string_pretty(&record)?
    } else {
        serde_json::to_string(&record)?
    };
    println!("{json}");
    Ok(())
}
