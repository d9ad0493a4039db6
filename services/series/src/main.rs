//! Series - Fills gaps in raw facts and recomputes the derived tables
//!
//! Responsibilities:
//! - Interpolate missing values of the raw tables in a fixed order
//! - Recompute every derived series from the raw facts
//! - Replace each table in one transaction so readers never see a partial write
//!
//! Usage:
//!   cargo run --bin series -- run
//!   cargo run --bin series -- interpolate --table occupazione
//!   cargo run --bin series -- aggregate --target produttivita_totale_aree

mod aggregate;
mod interpolate;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::SqlitePool;
use store::tables::TableKind;
use store::{StoreKind, Table};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::aggregate::{run_series, series_for, SeriesSpec, SERIES};
use crate::interpolate::interpolate;

#[derive(Parser, Debug)]
#[command(name = "series", about = "Interpolates raw facts and recomputes derived series")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fill gaps in raw tables (all of them by default)
    Interpolate {
        /// Raw table to interpolate; repeatable
        #[arg(long)]
        table: Vec<String>,

        /// Column to fill; defaults to the table's value column
        #[arg(long)]
        column: Vec<String>,
    },
    /// Recompute derived tables (all of them by default)
    Aggregate {
        /// Derived table to recompute; repeatable
        #[arg(long)]
        target: Vec<String>,
    },
    /// Interpolate every raw table, then recompute every series
    Run,
}

#[derive(Debug, Clone)]
struct Config {
    db_url: String,
    species_db_url: String,
}

impl Config {
    fn from_env() -> Self {
        Self {
            db_url: std::env::var("DB_URL").unwrap_or_else(|_| "sqlite:pesca.db".to_string()),
            species_db_url: std::env::var("SPECIES_DB_URL")
                .unwrap_or_else(|_| "sqlite:specie.db".to_string()),
        }
    }
}

struct Stores {
    pesca: SqlitePool,
    species: SqlitePool,
}

impl Stores {
    fn pool(&self, table: Table) -> &SqlitePool {
        match table.store() {
            StoreKind::Pesca => &self.pesca,
            StoreKind::Species => &self.species,
        }
    }
}

fn raw_tables(names: &[String]) -> Result<Vec<Table>> {
    if names.is_empty() {
        return Ok(Table::ALL
            .into_iter()
            .filter(|t| t.kind() == TableKind::Raw)
            .collect());
    }
    names
        .iter()
        .map(|name| -> Result<Table> {
            let table = Table::from_name(name)?;
            if table.kind() != TableKind::Raw {
                anyhow::bail!("'{}' is not a raw table", name);
            }
            Ok(table)
        })
        .collect()
}

fn series_specs(targets: &[String]) -> Result<Vec<&'static SeriesSpec>> {
    if targets.is_empty() {
        return Ok(SERIES.iter().collect());
    }
    targets
        .iter()
        .map(|name| -> Result<&'static SeriesSpec> {
            let target = Table::from_name(name)?;
            Ok(series_for(target)?)
        })
        .collect()
}

async fn run_interpolation(stores: &Stores, tables: &[Table], columns: &[String]) -> Result<()> {
    let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
    for &table in tables {
        let mut conn = stores.pool(table).acquire().await?;
        let report = interpolate(&mut conn, table, &columns)
            .await
            .with_context(|| format!("Failed to interpolate {}", table.name()))?;
        for column in &report.columns {
            info!(
                table = table.name(),
                column = column.column,
                filled = column.filled,
                unfilled_boundaries = column.unfilled_boundaries,
                "interpolation report"
            );
        }
    }
    Ok(())
}

async fn run_aggregation(stores: &Stores, specs: &[&SeriesSpec]) -> Result<()> {
    for spec in specs {
        let mut conn = stores.pool(spec.target).acquire().await?;
        let report = run_series(&mut conn, spec)
            .await
            .with_context(|| format!("Failed to recompute {}", spec.target.name()))?;
        info!(
            target = report.target.name(),
            input_rows = report.input_rows,
            skipped_rows = report.skipped_rows,
            duplicate_keys = report.duplicate_keys.len(),
            groups = report.groups,
            "aggregate report"
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::from_env();

    let pesca = store::db::connect(&config.db_url, 1)
        .await
        .context("Failed to open main store")?;
    let species = store::db::connect(&config.species_db_url, 1)
        .await
        .context("Failed to open species store")?;
    // Raw tables are created by the importer; a fresh store fails with MissingTable.
    let stores = Stores { pesca, species };

    match args.command {
        Command::Interpolate { table, column } => {
            let tables = raw_tables(&table)?;
            if !column.is_empty() && tables.len() != 1 {
                anyhow::bail!("--column needs exactly one --table");
            }
            run_interpolation(&stores, &tables, &column).await?;
        }
        Command::Aggregate { target } => {
            run_aggregation(&stores, &series_specs(&target)?).await?;
        }
        Command::Run => {
            info!("series pipeline starting");
            run_interpolation(&stores, &raw_tables(&[])?, &[]).await?;
            run_aggregation(&stores, &series_specs(&[])?).await?;
            info!("series pipeline finished");
        }
    }

    Ok(())
}
