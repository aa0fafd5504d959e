//! Access gateway / hook pipeline entry point.
//!
//! Installed as the `authorized_keys` forced command (or as a login shell,
//! or symlinked into a repository's `hooks/` directory).  Argument handling
//! is deliberately not clap-shaped: sshd decides our argv, so the raw vector
//! goes straight to the gateway.

use anyhow::Result;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use git_server::gateway;

fn init_tracing() {
    let default = if std::env::var("DEBUG").map(|v| v != "0").unwrap_or(false) {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// A client that hangs up mid-transfer must not leave us lingering.
async fn exit_on_sigpipe() {
    if let Ok(mut sigpipe) =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::pipe())
    {
        sigpipe.recv().await;
        std::process::exit(1);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    tokio::spawn(exit_on_sigpipe());

    let argv: Vec<String> = std::env::args().collect();
    match gateway::run(&argv).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
