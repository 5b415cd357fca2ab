//! imgstashd: keep recently pulled container images warm across restarts.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use imgstash::DockerDaemon;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "imgstashd")]
#[command(about = "Persistent cache of container images for a local daemon", long_about = None)]
struct Cli {
    /// Cache directory
    dir: PathBuf,

    /// Maximum number of images kept in the cache
    #[arg(long, default_value_t = 10)]
    max_count: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let daemon = Arc::new(DockerDaemon::from_env().context("creating daemon client")?);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutting down");
                cancel.cancel();
            }
        });
    }

    imgstash::run(&cli.dir, cli.max_count, daemon, cancel)
        .await
        .context("start")?;
    Ok(())
}
