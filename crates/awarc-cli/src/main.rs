use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use awarc_api::{AvailabilityQuery, PartnerClient, PartnerConfig};
use awarc_core::Source;
use awarc_pipeline::{
    ingest_source, open_availability_table, IngestOptions, IngestionRun, PipelineConfig,
};

#[derive(Debug, Parser)]
#[command(name = "awarc")]
#[command(version, about = "Archive award availability snapshots into a versioned parquet table")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest availability from the partner API, one run per source.
    Ingest {
        /// Mileage program source names; omit to ingest every known program.
        sources: Vec<String>,
        /// Additional source names, repeatable.
        #[arg(short = 's', long = "source")]
        source: Vec<String>,
        /// Table location; defaults to AWARC_TABLE_ROOT.
        #[arg(long)]
        table: Option<PathBuf>,
        /// Earliest travel date to fetch (YYYY-MM-DD).
        #[arg(long, value_parser = parse_date)]
        start_date: Option<NaiveDate>,
        /// Latest travel date to fetch (YYYY-MM-DD).
        #[arg(long, value_parser = parse_date)]
        end_date: Option<NaiveDate>,
        /// Cabin class filter.
        #[arg(long, value_enum)]
        cabin: Option<Cabin>,
        /// Maximum API pages to fetch per source.
        #[arg(long)]
        max_pages: Option<u64>,
        /// Records per API page.
        #[arg(long)]
        page_size: Option<u32>,
        /// Starting offset, to resume deeper into the result set.
        #[arg(long, default_value_t = 0)]
        skip: u64,
        /// Compact and vacuum the table after a successful run.
        #[arg(long)]
        optimize: bool,
    },
    /// Compact partitions and vacuum versions past the retention horizon.
    Optimize {
        #[arg(long)]
        table: Option<PathBuf>,
        #[arg(long, default_value_t = 168)]
        retention_hours: u64,
    },
    /// Show table metadata.
    Info {
        #[arg(long)]
        table: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Cabin {
    Economy,
    Premium,
    Business,
    First,
}

impl Cabin {
    fn as_str(self) -> &'static str {
        match self {
            Cabin::Economy => "economy",
            Cabin::Premium => "premium",
            Cabin::Business => "business",
            Cabin::First => "first",
        }
    }
}

fn parse_date(input: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .map_err(|err| format!("invalid date '{input}' (expected YYYY-MM-DD): {err}"))
}

fn resolve_sources(positional: &[String], flagged: &[String]) -> Result<Vec<Source>> {
    let combined: Vec<&String> = positional.iter().chain(flagged.iter()).collect();
    if combined.is_empty() {
        return Ok(Source::ALL.to_vec());
    }
    combined
        .into_iter()
        .map(|name| {
            name.parse::<Source>().map_err(|_| {
                let valid = Source::ALL
                    .iter()
                    .map(|source| source.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                anyhow::anyhow!("invalid source '{name}'. Valid sources: {valid}")
            })
        })
        .collect()
}

fn print_run(run: &IngestionRun) {
    println!("Ingestion completed for {}:", run.source);
    println!("  pages_fetched: {}", run.pages_fetched);
    println!("  records_seen: {}", run.records_seen);
    println!("  records_inserted: {}", run.records_inserted);
    println!("  records_updated: {}", run.records_updated);
    println!("  records_unchanged: {}", run.records_unchanged);
    if let Some(version) = run.final_version {
        println!("  table_version: {version}");
    }
    if let Some(reason) = run.stopped_early {
        println!("  stopped_early: {reason:?}");
    }
    for error in &run.errors {
        println!("  error: {error}");
    }
}


#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command {
        Commands::Ingest {
            sources,
            source,
            table,
            start_date,
            end_date,
            cabin,
            max_pages,
            page_size,
            skip,
            optimize,
        } => {
            if config.api_key.is_empty() {
                bail!("AWARC_API_KEY environment variable not set");
            }
            let selected = resolve_sources(&sources, &source)?;
            let table_root = table.unwrap_or_else(|| config.table_root.clone());
            let table = open_availability_table(&table_root)?;

            let mut partner = PartnerConfig::new(config.api_key.clone());
            partner.base_url = config.base_url.clone();
            partner.timeout = Duration::from_secs(config.http_timeout_secs);
            let client = PartnerClient::new(partner)?;

            let options = IngestOptions {
                max_pages,
                optimize_after: optimize,
                batch_size: config.batch_size,
                ..Default::default()
            };
            let page_size = page_size.unwrap_or(config.page_size);

            let mut completed = 0usize;
            let mut failed = 0usize;
            for src in &selected {
                let query = AvailabilityQuery {
                    cabin: cabin.map(|c| c.as_str().to_string()),
                    start_date,
                    end_date,
                    ..Default::default()
                };
                match ingest_source(&client, &table, *src, query, page_size, skip, &options).await
                {
                    Ok(run) => {
                        completed += 1;
                        print_run(&run);
                    }
                    Err(failure) => {
                        failed += 1;
                        eprintln!("{failure}");
                        print_run(&failure.run);
                    }
                }
            }
            println!(
                "\nIngestion summary: {completed}/{} sources completed",
                selected.len()
            );
            if failed > 0 {
                bail!("{failed} source(s) ended with unresolved errors");
            }
        }
        Commands::Optimize {
            table,
            retention_hours,
        } => {
            let table_root = table.unwrap_or_else(|| config.table_root.clone());
            let table = open_availability_table(&table_root)?;
            let stats = table.optimize(
                Duration::from_secs(retention_hours * 3600),
                Utc::now(),
            )?;
            println!("Optimization completed for {}:", table_root.display());
            println!("  partitions_compacted: {}", stats.partitions_compacted);
            println!("  files_deleted: {}", stats.files_deleted);
        }
        Commands::Info { table } => {
            let table_root = table.unwrap_or_else(|| config.table_root.clone());
            let table = open_availability_table(&table_root)?;
            let info = table.info()?;
            println!("Table info for {}:", table_root.display());
            match info.version {
                Some(version) => println!("  version: {version}"),
                None => println!("  version: (table not yet created)"),
            }
            println!("  partitions: {}", info.partitions.join(", "));
            println!("  active_segments: {}", info.active_segments);
            println!("  rows: {}", info.rows);
        }
    }

    Ok(())
}
