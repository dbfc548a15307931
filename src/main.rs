pub mod types;
pub mod error;
pub mod selection;
pub mod config;
pub mod data;
pub mod ranking;
pub mod coverage;
pub mod filter;
pub mod geometry;
pub mod summary;
pub mod pipeline;
pub mod cache;
pub mod lookup;
pub mod report;
pub mod server;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::filter::{Filter, LocalityFilter, RankRange};
use crate::pipeline::Request;
use crate::selection::GroupSelection;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rank zones for one or more group selections and write the report files
    Report {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        /// Group selection such as "A,B,C"; repeat for several scenarios
        #[arg(short, long = "groups", value_name = "GROUPS")]
        groups: Vec<String>,
        /// Restrict output to one locality
        #[arg(short, long)]
        locality: Option<String>,
        #[arg(long)]
        rank_min: Option<u32>,
        #[arg(long)]
        rank_max: Option<u32>,
        /// Overrides `output.dir`
        #[arg(short, long, value_name = "DIR")]
        out: Option<PathBuf>,
    },
    /// List the localities present in the zone dataset
    Localities {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
    /// Serve the analysis API
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Report {
            config,
            groups,
            locality,
            rank_min,
            rank_max,
            out,
        } => {
            println!("Generating reports with config: {:?}", config);
            let app_config = config::AppConfig::load_from_file(&config)?;
            let sources = data::load_sources(&app_config)?;
            for notice in &sources.notices {
                println!("Notice: {}", notice);
            }

            let dataset = &sources.dataset;
            let filter = Filter {
                locality: LocalityFilter::parse(locality.as_deref()),
                rank_range: RankRange::resolve(
                    rank_min,
                    rank_max,
                    dataset.len(),
                    app_config.processing.rank_window(),
                ),
            };

            let requested: Vec<Option<&str>> = if groups.is_empty() {
                vec![None]
            } else {
                groups.iter().map(|g| Some(g.as_str())).collect()
            };
            let mut requests: Vec<Request> = Vec::new();
            for input in requested {
                let (selection, notice) = GroupSelection::resolve(input, &dataset.available_groups);
                if let Some(notice) = notice {
                    println!("Notice: {}", notice);
                }
                let request = Request {
                    selection,
                    filter: filter.clone(),
                };
                if requests.contains(&request) {
                    warn!("Skipping repeated selection {}", request.selection);
                    continue;
                }
                requests.push(request);
            }

            let dir = out.unwrap_or(app_config.output.dir);
            let files = report::generate_reports(&dir, &sources, &requests)?;
            for f in &files {
                println!(
                    "Groups {}: {} zones -> {:?}, {:?}{}",
                    f.selection,
                    f.rows,
                    f.table,
                    f.summary,
                    f.zones
                        .as_ref()
                        .map(|z| format!(", {:?}", z))
                        .unwrap_or_default()
                );
            }
            println!("Reports complete!");
        }
        Commands::Localities { config } => {
            let app_config = config::AppConfig::load_from_file(&config)?;
            let sources = data::load_sources(&app_config)?;
            for name in sources.dataset.localities() {
                println!("{}", name);
            }
        }
        Commands::Serve { config } => {
            println!("Serving analysis API with config: {:?}", config);
            let app_config = config::AppConfig::load_from_file(&config)?;
            let sources = data::load_sources(&app_config)?;
            for notice in &sources.notices {
                println!("Notice: {}", notice);
            }
            server::start_server(app_config, sources).await?;
        }
    }

    Ok(())
}
