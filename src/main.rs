use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use renko_rebuild::config::Config;
use renko_rebuild::export;
use renko_rebuild::pipeline::PipelineController;
use renko_rebuild::source::AggTradeSource;
use renko_rebuild::store::BrickStore;

#[derive(Parser)]
#[command(
    name = "renko-rebuild",
    about = "Rebuild Renko brick series from historical tick data"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config/default.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch historical ticks and rebuild all configured brick series.
    Rebuild,
    /// Export a series' persisted bricks to CSV.
    Export {
        /// Height label of the series to export (e.g. 10 or 5K).
        height: String,

        /// Start date (YYYY-MM-DD); defaults to the configured start_date.
        #[arg(long)]
        start: Option<NaiveDate>,

        /// End date (YYYY-MM-DD); defaults to the configured end_date.
        #[arg(long)]
        end: Option<NaiveDate>,

        /// Output CSV path; defaults to renko_{series}_{start}_{end}.csv.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider (required by rustls 0.23+)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {:#}", e);
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Rebuild => {
            tracing::info!(
                instrument = %config.instrument.symbol,
                heights = ?config.pipeline.heights,
                refill = config.pipeline.refill,
                "starting rebuild"
            );
            let source = AggTradeSource::new(&config.source.rest_base_url);
            let mut controller = PipelineController::new(config, source)?;
            let summary = controller.run().await?;
            tracing::info!(
                ticks_processed = summary.ticks_processed,
                bricks_persisted = summary.bricks_persisted,
                upsert_failures = summary.upsert_failures,
                "rebuild complete"
            );
            // Orderly shutdown is done (consumer joined, queue released);
            // terminate the one-shot batch process explicitly.
            std::process::exit(0);
        }
        Commands::Export { height, start, end, out } => {
            let series_key = config.series_key(&height);
            let start = start.unwrap_or(config.pipeline.start_date);
            let end = end.unwrap_or(config.pipeline.end_date);
            let store = BrickStore::open(&config.store.path)?;
            let (path, rows) = export::export_to_csv(
                &store,
                &series_key,
                start,
                end,
                &config.export.auction_hours,
                out.as_deref(),
            )
            .with_context(|| format!("export of {} failed", series_key))?;
            println!("exported {} bricks to {}", rows, path.display());
            Ok(())
        }
    }
}
