use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mgnrega_adapters::FixtureSource;
use mgnrega_core::RecordFilter;
use mgnrega_sync::{connect_store, run_ingest_once, IngestConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mgnrega-cli")]
#[command(about = "MGNREGA district data ingestion and API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the upstream page (or a saved response) and upsert it.
    Ingest {
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    Migrate,
    Serve,
    /// Print stored rows as JSON.
    Query {
        #[arg(long)]
        state_name: Option<String>,
        #[arg(long)]
        fin_year: Option<String>,
        #[arg(long)]
        district_name: Option<String>,
        /// Print summary figures instead of rows.
        #[arg(long)]
        summary: bool,
    },
    Districts,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Ingest { fixture: None }) {
        Commands::Ingest { fixture } => {
            let summary = match fixture {
                Some(path) => {
                    let config = IngestConfig::from_env();
                    run_ingest_once(&config, Arc::new(FixtureSource::from_file(path))).await?
                }
                None => mgnrega_sync::run_ingest_once_from_env().await?,
            };
            println!(
                "ingest complete: run_id={} source={} fetched={} written={} ({})",
                summary.run_id,
                summary.source_id,
                summary.fetched,
                summary.written,
                summary.message()
            );
        }
        Commands::Migrate => {
            let config = IngestConfig::from_env();
            let store = connect_store(&config).await?;
            println!("migrations applied ({})", store.backend().as_str());
        }
        Commands::Serve => {
            mgnrega_web::serve_from_env().await?;
        }
        Commands::Query {
            state_name,
            fin_year,
            district_name,
            summary,
        } => {
            let store = connect_store(&IngestConfig::from_env()).await?;
            let filter = RecordFilter {
                state_name,
                fin_year,
                district_name,
            };
            let out = if summary {
                serde_json::to_string_pretty(&store.summary(&filter).await?)?
            } else {
                serde_json::to_string_pretty(&store.query(&filter).await?)?
            };
            println!("{out}");
        }
        Commands::Districts => {
            let store = connect_store(&IngestConfig::from_env()).await?;
            for district in store.distinct_districts().await? {
                println!("{district}");
            }
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn query_flags_map_to_filter_fields() {
        let cli = Cli::try_parse_from([
            "mgnrega-cli",
            "query",
            "--state-name",
            "Maha",
            "--fin-year",
            "2024-2025",
            "--summary",
        ])
        .expect("parse");
        match cli.command {
            Some(Commands::Query {
                state_name,
                fin_year,
                district_name,
                summary,
            }) => {
                assert_eq!(state_name.as_deref(), Some("Maha"));
                assert_eq!(fin_year.as_deref(), Some("2024-2025"));
                assert!(district_name.is_none());
                assert!(summary);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
