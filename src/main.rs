use cine_etl::config::{Backend, EtlConfig};
use cine_etl::etl::{Orchestrator, RunReport};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cine-etl")]
#[command(about = "Loads GT and SV cinema sales into the analytics warehouse")]
#[command(version)]
struct Args {
    /// JSON configuration file (defaults plus ETL_* environment variables otherwise)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Connector backend: postgres or sqlite
    #[arg(long, global = true)]
    backend: Option<Backend>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline: dimensions, facts, verification
    Run {
        /// Aggregated rows per committed batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Load each source's facts concurrently
        #[arg(long)]
        concurrent: bool,

        /// Skip branch rows that already exist for the country
        #[arg(long)]
        dedupe_branches: bool,

        /// Fail when a source drops more than this share of its aggregated rows
        #[arg(long)]
        max_skipped_ratio: Option<f64>,
    },
    /// Print warehouse row counts only
    Verify,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => EtlConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path))?,
        None => EtlConfig::from_env().context("Failed to read ETL_* environment variables")?,
    };
    if let Some(backend) = args.backend {
        config.backend = backend;
    }

    match args.command {
        Commands::Run {
            batch_size,
            concurrent,
            dedupe_branches,
            max_skipped_ratio,
        } => {
            if let Some(size) = batch_size {
                config.batch_size = size;
            }
            config.concurrent_sources |= concurrent;
            config.dedupe_branches |= dedupe_branches;
            if max_skipped_ratio.is_some() {
                config.max_skipped_ratio = max_skipped_ratio;
            }
            run(config).await
        }
        Commands::Verify => verify(config).await,
    }
}

async fn run(config: EtlConfig) -> Result<()> {
    println!("\n{}", "=".repeat(60));
    println!("ETL - DATA WAREHOUSE LOAD");
    println!("{}", "=".repeat(60));

    let orchestrator = Orchestrator::from_config(config).context("Invalid ETL configuration")?;
    info!(
        sources = ?orchestrator.config().sources.iter().map(|s| s.code.as_str()).collect::<Vec<_>>(),
        backend = ?orchestrator.config().backend,
        "configuration loaded"
    );

    let report = orchestrator.run().await.context("ETL run failed")?;
    print_report(&report);
    Ok(())
}

async fn verify(config: EtlConfig) -> Result<()> {
    let orchestrator = Orchestrator::from_config(config).context("Invalid ETL configuration")?;
    let counts = orchestrator.verify().await.context("Verification failed")?;

    println!("  dim_pelicula: {} rows", counts.movies);
    println!("  dim_sucursal: {} rows", counts.branches);
    println!("  fact_ventas: {} rows", counts.facts);
    Ok(())
}

fn print_report(report: &RunReport) {
    println!("\nDimensions:");
    for (code, dims) in &report.dimensions {
        println!(
            "  {}: movies {} extracted / {} new, branches {} extracted / {} new",
            code, dims.movies.extracted, dims.movies.inserted, dims.branches.extracted, dims.branches.inserted
        );
    }

    println!("\nFacts:");
    for (code, facts) in &report.facts {
        println!(
            "  {}: {} aggregated rows, {} loaded in {} batches, {} skipped",
            code,
            facts.aggregates_read,
            facts.rows_committed,
            facts.batches_committed,
            facts.skipped.len()
        );
    }

    println!("\nVerification:");
    println!("  dim_pelicula: {} rows", report.verification.movies);
    println!("  dim_sucursal: {} rows", report.verification.branches);
    println!("  fact_ventas: {} rows", report.verification.facts);

    println!("\n{}", "=".repeat(60));
    println!("ETL completed in {:.1} seconds (run {})", report.elapsed.as_secs_f64(), report.run_id);
    println!("{}\n", "=".repeat(60));
}
