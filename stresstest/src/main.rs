//! Runs the bulk writer benchmark described by a YAML configuration file.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

use std::path::PathBuf;

use anyhow::Result;
use argh::FromArgs;
use stresstest::{Config, RunOptions, observability};
use tokio_util::sync::CancellationToken;

/// Benchmark for batched writes against a document store
#[derive(Debug, FromArgs)]
pub struct Args {
    /// path to the yaml configuration file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Args = argh::from_env();
    observability::init_tracing();

    let config = Config::load(args.config.as_deref())?;
    tracing::debug!(?config, "loaded configuration");

    let backend = config.backend.build()?;
    let workloads = config
        .workloads
        .iter()
        .map(|workload| workload.build())
        .collect::<Result<Vec<_>>>()?;
    let options = RunOptions {
        loops: config.loops,
        batch_sizes: config.batch_sizes,
        writer: config.writer,
    };

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received ctrl-c, stopping");
                shutdown.cancel();
            }
        }
    });

    stresstest::run(backend, workloads, options, shutdown).await?;
    Ok(())
}
