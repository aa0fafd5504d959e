//! Deploy daemon entry point.
//!
//! Daemonization has to happen before the async runtime exists, so `main`
//! is plain: parse, chdir, umask, maybe fork away, then build the runtime
//! and hand over to the daemon loop.

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use git_server::deploy::{self, pathology::PathologyTable, Daemon, DeployArgs};

fn main() -> Result<()> {
    let argv: Vec<String> = std::env::args().collect();
    let args = DeployArgs::parse();

    if args.dump_pathologies {
        print!("{}", PathologyTable::builtin_yaml());
        return Ok(());
    }

    if let Some(ref dir) = args.chdir {
        std::env::set_current_dir(dir)
            .with_context(|| format!("cannot chdir to {}", dir.display()))?;
    }
    if let Some(ref octal) = args.umask {
        deploy::apply_umask(octal)?;
    }
    if args.background {
        deploy::daemonize()?;
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let runtime = tokio::runtime::Runtime::new().context("cannot build runtime")?;
    runtime.block_on(async move {
        let mut daemon = Daemon::new(&args, &argv).await?;
        daemon.run().await
    })
}
