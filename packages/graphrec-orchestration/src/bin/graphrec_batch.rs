//! Graphrec batch runner
//!
//! # Usage
//!
//! ```bash
//! # One cycle of a job (exit code 0 = completed/skipped, 2 = partial, 1 = failed)
//! graphrec-batch --config graphrec.yaml --job reconcile-index
//!
//! # Every enabled job on its trigger, plus ingestion, search sync and
//! # ledger purge, until Ctrl-C
//! graphrec-batch --config graphrec.yaml --serve
//!
//! # Print the effective configuration
//! graphrec-batch --print-config
//! ```

use anyhow::Context;
use clap::{ArgGroup, Parser};
use graphrec_core::config::GraphrecConfig;
use graphrec_orchestration::Runtime;
use prometheus::Registry;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "graphrec-batch")]
#[command(about = "Leased, checkpointed batch jobs over the recommendation graph", long_about = None)]
#[command(group(ArgGroup::new("mode").required(true).args(["job", "serve", "print_config"])))]
struct Cli {
    /// YAML config file (defaults when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run one cycle of this job, e.g. reconcile-index
    #[arg(short, long)]
    job: Option<String>,

    /// Run the scheduler, ingestion, search sync and ledger purge until interrupted
    #[arg(long)]
    serve: bool,

    /// Print the effective configuration as YAML
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => GraphrecConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => GraphrecConfig::default(),
    };

    if cli.print_config {
        print!("{}", config.to_yaml()?);
    } else if let Some(job) = cli.job {
        let runtime = Runtime::build(config, &Registry::new())?;
        let handler = runtime.handler(&job)?;
        let cancel = CancellationToken::new();
        let ctrl_c = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                ctrl_c.cancel();
            }
        });

        let run = runtime.orchestrator.run_cycle(handler.as_ref(), &cancel).await;
        println!("{}", serde_json::to_string_pretty(&run)?);
        std::process::exit(run.exit_code());
    } else {
        let runtime = Runtime::build(config, &Registry::new())?;
        let scheduler = runtime.scheduler()?;
        let cancel = CancellationToken::new();
        let sync = runtime.spawn_search_sync(cancel.clone());
        let ingestion = runtime.spawn_ingestion(cancel.clone());
        let purge = runtime.spawn_ledger_purge(cancel.clone());
        let jobs = tokio::spawn(scheduler.run(cancel.clone()));
        info!(holder = runtime.orchestrator.holder_id(), "serving");

        tokio::signal::ctrl_c().await?;
        info!("shutting down");
        cancel.cancel();
        jobs.await?;
        ingestion.await?;
        purge.await?;
        sync.await?;
    }
    Ok(())
}
