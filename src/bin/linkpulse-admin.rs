use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use linkpulse::allocator::Allocator;
use linkpulse::api::analytics::AnalyticsQueryParams;
use linkpulse::analytics::{AggregateView, AggregationReader, EnrichmentWorker, GeoResolver};
use linkpulse::config::Config;
use linkpulse::storage;

#[derive(Parser)]
#[command(name = "linkpulse-admin")]
#[command(about = "Linkpulse operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the shared code counter if it does not exist yet
    InitCounter {
        /// Start value (defaults to COUNTER_START)
        #[arg(long)]
        start: Option<i64>,
    },
    /// Allocate short codes and print them
    Mint {
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },
    /// Run one enrichment pass over the click buffer
    Drain,
    /// Lifetime stats of one link
    LinkStats { short_code: String },
    /// Stats over every link of an owner
    OwnerStats {
        owner_id: String,
        /// Inclusive start date (YYYY-MM-DD)
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Inclusive end date (YYYY-MM-DD)
        #[arg(long)]
        to: Option<NaiveDate>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let backends = storage::connect(&config.database).await?;

    match cli.command {
        Commands::InitCounter { start } => {
            let start = start.unwrap_or(config.allocator.start);
            let allocator = Allocator::new(
                backends.counters.clone(),
                config.allocator.counter_key.clone(),
                config.allocator.block_size,
            )?;
            allocator.ensure_counter(start).await?;
            println!(
                "✓ Counter '{}' initialized (start {} if it was absent)",
                config.allocator.counter_key, start
            );
        }
        Commands::Mint { count } => {
            // A small block keeps unused reservations cheap
            let block_size = i64::try_from(count.max(1)).context("count too large")?;
            let allocator = Allocator::new(
                backends.counters.clone(),
                config.allocator.counter_key.clone(),
                block_size,
            )?;
            allocator.ensure_counter(config.allocator.start).await?;
            for _ in 0..count {
                println!("{}", allocator.next_code(config.allocator.code_width).await?);
            }
        }
        Commands::Drain => {
            let worker = EnrichmentWorker::new(
                backends.buffer.clone(),
                backends.analytics.clone(),
                backends.links.clone(),
                GeoResolver::from_config(&config.analytics),
                config.analytics.claim_lease(),
            );
            let report = worker.tick().await?;
            println!(
                "✓ Drained {} key(s): {} inserted, {} duplicate(s), {} dropped",
                report.keys, report.inserted, report.duplicates, report.dropped
            );
        }
        Commands::LinkStats { short_code } => {
            let reader =
                AggregationReader::new(backends.analytics.clone(), config.analytics.query_timeout());
            print_view(&reader.summarize_link(&short_code).await?)?;
        }
        Commands::OwnerStats { owner_id, from, to } => {
            let range = AnalyticsQueryParams {
                start_date: from,
                end_date: to,
            }
            .range();
            let reader =
                AggregationReader::new(backends.analytics.clone(), config.analytics.query_timeout());
            print_view(&reader.summarize_owner(&owner_id, range).await?)?;
        }
    }

    Ok(())
}

fn print_view(view: &AggregateView) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(view)?);
    Ok(())
}
