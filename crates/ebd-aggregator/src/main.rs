//! EBD Aggregator - command-line entry point

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ebd_aggregator::config::PipelineConfig;
use ebd_aggregator::filter::{filter_observations, filter_sampling};
use ebd_aggregator::pack::{pack_regions, version_from_database, PackConfig};
use ebd_aggregator::reference::{fetch_reference, EbirdClient, ReferencePaths};
use ebd_aggregator::stage::{materialize, StageOutcome};
use ebd_aggregator::stages::{run_all, AggregateStage, DatasetPaths};
use ebd_aggregator::upload::PackUploader;
use ebd_common::format::parse_size;
use ebd_common::logging::{init_logging, LogConfig, LogLevel};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ebd-aggregator")]
#[command(author, version, about = "Aggregate eBird Basic Dataset releases into region packs")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    overrides: Overrides,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Flags that override `.env` / environment configuration
#[derive(Args, Debug)]
struct Overrides {
    /// Root directory for datasets, reference files and outputs
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Aggregation engine memory ceiling, e.g. "4GiB"
    #[arg(long, global = true)]
    memory_limit: Option<String>,

    /// Worker threads for aggregation and packing
    #[arg(long, global = true)]
    threads: Option<usize>,

    /// Wilson score z-value
    #[arg(long, global = true)]
    z: Option<f64>,

    /// Minimum samples for an aggregate row
    #[arg(long, global = true)]
    min_samples: Option<u32>,

    /// Directory for aggregation engine scratch files
    #[arg(long, global = true)]
    temp_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Filter a raw EBD file down to the working columns
    Filter {
        #[command(subcommand)]
        kind: FilterCommand,
    },

    /// Fetch species taxonomy and hotspots from the eBird API
    FetchReference {
        /// Output species file (default: <data-dir>/reference/species.json)
        #[arg(long)]
        species: Option<PathBuf>,

        /// Output hotspot file (default: <data-dir>/reference/hotspots.json)
        #[arg(long)]
        hotspots: Option<PathBuf>,

        /// Output region names file (default: <data-dir>/reference/regions.json)
        #[arg(long)]
        regions: Option<PathBuf>,
    },

    /// Build the targets database for a release
    Aggregate {
        /// Release name, e.g. "dec-2025"
        #[arg(short, long, env = "EBD_RELEASE")]
        release: String,

        /// Rebuild even if the database exists
        #[arg(long)]
        force: bool,
    },

    /// Write region packs from a targets database
    Pack {
        /// Targets database, e.g. data/output/targets-dec-2025.db
        database: PathBuf,

        /// Pack output directory (default: <data-dir>/output/packs)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Pack version (default: derived from the database filename)
        #[arg(long)]
        version: Option<String>,
    },

    /// Upload a release's packs to S3-compatible storage
    Upload {
        #[arg(short, long, env = "EBD_RELEASE")]
        release: String,

        /// Pack directory (default: <data-dir>/output/packs)
        #[arg(long)]
        packs_dir: Option<PathBuf>,
    },

    /// Run filter, reference, aggregate and pack, skipping finished stages
    RunAll {
        #[arg(short, long, env = "EBD_RELEASE")]
        release: String,

        /// Rerun every stage
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum FilterCommand {
    /// Filter the observation file (ebd_*.txt.gz)
    Observations { input: PathBuf, output: PathBuf },

    /// Filter the sampling event file (ebd_sampling_*.txt.gz)
    Sampling { input: PathBuf, output: PathBuf },
}

fn load_config(overrides: &Overrides) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load()?;

    if let Some(dir) = &overrides.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(limit) = &overrides.memory_limit {
        config.memory_limit = parse_size(limit)?;
    }
    if let Some(threads) = overrides.threads {
        config.threads = threads;
    }
    if let Some(z) = overrides.z {
        config.wilson_z = z;
    }
    if let Some(min_samples) = overrides.min_samples {
        config.min_samples = min_samples;
    }
    if let Some(dir) = &overrides.temp_dir {
        config.temp_dir = Some(dir.clone());
    }

    config.validate()?;
    Ok(config)
}

fn log_outcome(stage: &str, outcome: &StageOutcome) {
    match outcome {
        StageOutcome::Skipped => info!(stage = stage, "Skipped (outputs exist)"),
        StageOutcome::Completed(report) => info!(stage = stage, "{}", report.summary),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Environment first, --verbose wins over LOG_LEVEL
    let mut log_config = LogConfig::from_env().unwrap_or_default();
    if cli.verbose {
        log_config.level = LogLevel::Debug;
    }
    init_logging(&log_config)?;

    let config = Arc::new(load_config(&cli.overrides)?);

    match cli.command {
        Command::Filter { kind } => {
            let report = tokio::task::spawn_blocking(move || match kind {
                FilterCommand::Observations { input, output } => {
                    filter_observations(&input, &output)
                },
                FilterCommand::Sampling { input, output } => filter_sampling(&input, &output),
            })
            .await?
            .context("Filter failed")?;
            info!("{}", report.summary());
        },
        Command::FetchReference {
            species,
            hotspots,
            regions,
        } => {
            let defaults = ReferencePaths::in_dir(&config.data_dir.join("reference"));
            let paths = ReferencePaths {
                species: species.unwrap_or(defaults.species),
                hotspots: hotspots.unwrap_or(defaults.hotspots),
                regions: regions.unwrap_or(defaults.regions),
            };

            let client = EbirdClient::new(config.ebird_client())?;
            let summary = fetch_reference(&client, &paths).await?;
            info!(
                species = summary.species,
                hotspots = summary.hotspots,
                regions = summary.regions,
                failed_countries = summary.failed_countries,
                "Reference data written"
            );
        },
        Command::Aggregate { release, force } => {
            let stage = AggregateStage {
                paths: DatasetPaths::new(&config.data_dir, &release),
                config: Arc::clone(&config),
            };
            let outcome = materialize(&stage, force).await?;
            log_outcome("aggregate", &outcome);
        },
        Command::Pack {
            database,
            output_dir,
            version,
        } => {
            let pack_config = PackConfig {
                version: Some(version.unwrap_or_else(|| version_from_database(&database))),
                output_dir: output_dir
                    .unwrap_or_else(|| config.data_dir.join("output").join("packs")),
                database,
                threads: config.threads,
            };
            let report = pack_regions(&pack_config).await?;
            info!(manifest = %report.manifest.display(), "{}", report.summary());
        },
        Command::Upload { release, packs_dir } => {
            let packs_dir = packs_dir
                .unwrap_or_else(|| DatasetPaths::new(&config.data_dir, &release).packs_dir);
            let uploader = PackUploader::new(&config.storage).await?;
            let report = uploader.upload_packs(&packs_dir, &release).await?;
            info!(files = report.uploaded, bytes = report.bytes, "Packs uploaded");
        },
        Command::RunAll { release, force } => {
            for (stage, outcome) in run_all(Arc::clone(&config), &release, force).await? {
                log_outcome(stage, &outcome);
            }
        },
    }

    info!("Done");
    Ok(())
}
