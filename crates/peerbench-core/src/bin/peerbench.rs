//! Administrative command-line interface for the peerbench engine.
//!
//! `init` prepares the store, `load` stands in for the upstream line-item
//! batch refresh, `build` runs the precomputation pipeline and reports the
//! published generation, and the remaining commands are operational
//! conveniences over the serving and backup surfaces. Any failure exits
//! non-zero; build failures name the failing stage.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use peerbench_core::config::Registry;
use peerbench_core::errors::PeerbenchResult;
use peerbench_core::models::{EntityAttribute, LineItem};
use peerbench_core::pipeline::{build, BuildOptions};
use peerbench_core::query::capability::CapabilityDetector;
use peerbench_core::query::guards::clamp_workers;
use peerbench_core::query::router::{QueryRouter, RouterOptions};
use peerbench_core::store::database::Database;

#[derive(Parser, Debug)]
#[command(name = "peerbench", version, about = "KPI and peer-benchmark precomputation engine")]
struct Cli {
    /// Path to the SQLite store.
    #[arg(long, global = true, default_value = "peerbench.sqlite3")]
    db: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialise the store schema (idempotent).
    Init,
    /// Replace the line-item store from a JSON batch file.
    Load { input: PathBuf },
    /// Run the precomputation build pipeline and publish a new generation.
    Build {
        /// KPI-tree and scope configuration file.
        #[arg(long, default_value = "config.json")]
        config: PathBuf,
        /// Worker threads for the parallel stages.
        #[arg(long, default_value_t = 4)]
        workers: usize,
    },
    /// Report current serving capabilities and recent build runs.
    Status,
    /// Query KPI values for one entity and period.
    Kpis {
        #[arg(long, default_value = "config.json")]
        config: PathBuf,
        entity_id: String,
        period: i64,
    },
    /// Query one benchmark partition.
    Bench {
        #[arg(long, default_value = "config.json")]
        config: PathBuf,
        kpi_key: String,
        scope_id: String,
        scope_key: String,
        period: i64,
    },
    /// Back up the store to a file.
    Backup { destination: PathBuf },
    /// Restore the store from a backup file.
    Restore { source: PathBuf },
}

/// Upstream batch document accepted by `load`.
#[derive(Debug, Deserialize)]
struct LoadBatch {
    #[serde(default)]
    entities: Vec<LoadEntity>,
    line_items: Vec<LineItem>,
}

#[derive(Debug, Deserialize)]
struct LoadEntity {
    entity_id: String,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> PeerbenchResult<()> {
    let db = Database::new(cli.db)?;

    match cli.command {
        Commands::Init => {
            db.init_schema()?;
            println!("initialised store at {}", db.db_path().display());
        }
        Commands::Load { input } => {
            db.init_schema()?;
            let text = std::fs::read_to_string(&input)?;
            let batch: LoadBatch = serde_json::from_str(&text)?;
            let attributes: Vec<EntityAttribute> = batch
                .entities
                .iter()
                .flat_map(|entity| {
                    entity.attributes.iter().map(move |(dimension, value)| {
                        EntityAttribute {
                            entity_id: entity.entity_id.clone(),
                            dimension: dimension.clone(),
                            value: value.clone(),
                        }
                    })
                })
                .collect();
            db.replace_line_items(&batch.line_items, &attributes)?;
            println!(
                "loaded {} line items for {} entities",
                batch.line_items.len(),
                batch.entities.len()
            );
        }
        Commands::Build { config, workers } => {
            db.init_schema()?;
            let registry = Registry::from_json_file(&config)?;
            let opts = BuildOptions {
                workers: clamp_workers(workers),
            };
            let report = build(&db, &registry, &opts)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Status => {
            let capabilities = CapabilityDetector::detect(&db);
            let runs = db.recent_build_runs(5).unwrap_or_default();
            let status = serde_json::json!({
                "capabilities": capabilities,
                "recent_builds": runs,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Kpis {
            config,
            entity_id,
            period,
        } => {
            let registry = Arc::new(Registry::from_json_file(&config)?);
            let router = QueryRouter::new(db, registry, RouterOptions::default());
            let response = router.get_kpis(&entity_id, period);
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Bench {
            config,
            kpi_key,
            scope_id,
            scope_key,
            period,
        } => {
            let registry = Arc::new(Registry::from_json_file(&config)?);
            let router = QueryRouter::new(db, registry, RouterOptions::default());
            let response = router.get_benchmarks(&kpi_key, &scope_id, &scope_key, period);
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Backup { destination } => {
            let written = db.backup_to(&destination)?;
            println!("backup written to {written}");
        }
        Commands::Restore { source } => {
            db.restore_from(&source)?;
            println!("store restored from {}", source.display());
        }
    }
    Ok(())
}
