use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use filing_consolidation::logging::{init_logging, LogConfig};
use filing_consolidation::{CheckpointStore, LocalDirectoryClient, Pipeline, PipelineConfig};

#[derive(Parser)]
#[command(name = "filing-consolidation", version, about = "Consolidates quarterly regulatory filings")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load all available periods and write the consolidation archive
    Run {
        /// Directory holding zips/ and registry/
        #[arg(long, env = "FILING_DATA_DIR")]
        data_dir: Option<PathBuf>,

        /// Reset the checkpoint and stored filings first
        #[arg(long)]
        full: bool,
    },
    /// Show checkpoint progress
    Status,
    /// Reset the checkpoint to NOT_STARTED
    Reset,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env().context("Failed to load configuration")?;

    match cli.command {
        Commands::Run { data_dir, full } => {
            if let Some(dir) = data_dir {
                config.database_path = dir.join("filings.db");
                config.data_dir = dir;
            }
            config.full_reprocess |= full;
            run(config)
        }
        Commands::Status => {
            let store = checkpoint_store(&config);
            if let Err(e) = store.load() {
                eprintln!("⚠️  {}", e);
            }
            println!("📊 Checkpoint: {}", config.checkpoint_path().display());
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            print!("{}", store.status_report());
            Ok(())
        }
        Commands::Reset => {
            let store = checkpoint_store(&config);
            let outcome = store.reset();
            println!("🔄 Checkpoint reset ({:?})", outcome);
            Ok(())
        }
    }
}

fn checkpoint_store(config: &PipelineConfig) -> CheckpointStore {
    CheckpointStore::new(config.checkpoint_path(), &config.checkpoint_fallback_path)
}

fn run(config: PipelineConfig) -> Result<()> {
    let client = LocalDirectoryClient::from_config(&config);
    let pipeline = Pipeline::new(config.clone(), client);

    let log_config = LogConfig::new(&config.log_dir, pipeline.run_id());
    let log_path = init_logging(&log_config).context("Failed to initialize logging")?;
    let pipeline = pipeline.with_log_file(log_path);

    println!("🗄️  Filing consolidation run {}", pipeline.run_id());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let summary = pipeline.run().context("Pipeline run failed")?;
    print!("{}", summary.report());

    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    if summary.complete {
        println!("🎉 Run complete");
    } else {
        println!("⏸️  Run incomplete, rerun to resume from the checkpoint");
    }
    for (reason, count) in summary.audit.counts_by_reason() {
        println!("   {:>6}x {}", count, reason.as_str());
    }
    Ok(())
}
