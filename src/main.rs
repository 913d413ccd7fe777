use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use outage_normalizer::batch::{BatchOrchestrator, CancelToken};
use outage_normalizer::cache::InterpretationCache;
use outage_normalizer::config::RunConfig;
use outage_normalizer::error::{NormalizeError, Result};
use outage_normalizer::interpret::openai::OpenAiInterpreter;
use outage_normalizer::interpret::GuardedInterpreter;
use outage_normalizer::logging;
use outage_normalizer::normalizer::RowNormalizer;
use outage_normalizer::output;
use outage_normalizer::source::CsvRowSource;

#[derive(Parser)]
#[command(name = "outage_normalizer")]
#[command(about = "Normalizes historical electric disturbance disclosure records")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the normalization batch over a range of source years
    Normalize {
        /// Directory containing the per-year converted CSV files
        #[arg(long, default_value = "data/original")]
        data_dir: PathBuf,
        /// Directory the normalized dataset and run report land in
        #[arg(long, default_value = "data/normalized")]
        output_dir: PathBuf,
        /// Persistent interpretation cache (JSON lines)
        #[arg(long, default_value = "data/interpretation_cache.jsonl")]
        cache: PathBuf,
        /// Inclusive year range, e.g. 2002-2023 or a single year
        #[arg(long, default_value = "2002-2023")]
        years: String,
        /// Max rows (and thus interpretation calls) in flight at once
        #[arg(long, default_value_t = 8)]
        concurrency: usize,
        /// Minimum resolved required fields for PartialSuccess
        #[arg(long, default_value_t = 2)]
        min_resolved: usize,
        /// OpenAI-compatible endpoint base URL
        #[arg(long, default_value = "https://api.openai.com/v1")]
        api_base: String,
        /// Model identifier sent with each interpretation request
        #[arg(long, default_value = "gpt-4o-mini")]
        model: String,
        /// Per-request timeout in seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,
        /// Bounded retries for transient service failures
        #[arg(long, default_value_t = 3)]
        retries: u32,
    },
    /// Cache operations
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Force invalidation: remove the cache so previously failed
    /// interpretations become eligible again
    Clear {
        #[arg(long, default_value = "data/interpretation_cache.jsonl")]
        cache: PathBuf,
    },
}

/// Parses "2002-2023" or "2005" into an inclusive range.
fn parse_years(years: &str) -> Result<(i32, i32)> {
    let parse_one = |s: &str| {
        s.trim()
            .parse::<i32>()
            .map_err(|_| NormalizeError::Format(format!("'{}' is not a year", s)))
    };
    match years.split_once('-') {
        Some((first, last)) => Ok((parse_one(first)?, parse_one(last)?)),
        None => {
            let year = parse_one(years)?;
            Ok((year, year))
        }
    }
}

async fn run_normalize(config: RunConfig) -> Result<()> {
    config.validate()?;
    let api_key = config.api_key()?;

    let source = CsvRowSource::new(&config.data_dir);
    let rows = source.read_years(config.first_year, config.last_year)?;
    info!(rows = rows.len(), "loaded raw rows");

    let cache = Arc::new(InterpretationCache::open(&config.cache_path)?);
    let port = Arc::new(OpenAiInterpreter::new(
        &config.api_base_url,
        &config.model,
        api_key,
        Duration::from_secs(config.request_timeout_secs),
    )?);
    let interpreter = Arc::new(GuardedInterpreter::new(port, config.max_retries));
    let normalizer = Arc::new(RowNormalizer::new(
        interpreter.clone(),
        cache.clone(),
        config.min_resolved_fields,
    ));
    let orchestrator =
        BatchOrchestrator::new(normalizer, config.max_concurrent_interpretations);

    // Ctrl-c stops dispatch; in-flight rows drain and partial results
    // still land on disk with the report
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("cancellation requested; finishing in-flight rows");
                cancel.cancel();
            }
        });
    }

    let result = orchestrator
        .run(rows, &cancel, || cache.stats(), || interpreter.calls())
        .await?;

    let dataset_path = config.output_dir.join(format!(
        "{}-{}_Normalized.csv",
        config.first_year, config.last_year
    ));
    let report_path = config.output_dir.join(format!(
        "{}-{}_Report.json",
        config.first_year, config.last_year
    ));
    output::write_dataset(&dataset_path, &result.records)?;
    output::write_report(&report_path, &result.report)?;
    output::print_summary(&result.report);
    println!("   Dataset: {}", dataset_path.display());
    println!("   Report:  {}", report_path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Credential and overrides come from .env when present
    dotenv::dotenv().ok();
    logging::init_logging();

    let cli = Cli::parse();
    match cli.command {
        Commands::Normalize {
            data_dir,
            output_dir,
            cache,
            years,
            concurrency,
            min_resolved,
            api_base,
            model,
            timeout,
            retries,
        } => {
            let (first_year, last_year) = parse_years(&years)?;
            let config = RunConfig {
                data_dir,
                output_dir,
                cache_path: cache,
                first_year,
                last_year,
                api_base_url: api_base,
                model,
                request_timeout_secs: timeout,
                max_retries: retries,
                max_concurrent_interpretations: concurrency,
                min_resolved_fields: min_resolved,
            };
            if let Err(e) = run_normalize(config).await {
                error!("normalization run failed: {}", e);
                return Err(e.into());
            }
        }
        Commands::Cache { command } => match command {
            CacheCommands::Clear { cache } => {
                let removed = InterpretationCache::clear(&cache)?;
                println!("🗑️  Cleared {} cached interpretations", removed);
            }
        },
    }
    Ok(())
}
