//! Importer - Loads remote CSV statistics into the raw fact tables
//!
//! Responsibilities:
//! - Fetch each configured source with bounded retry
//! - Repair encoding damage and apply the source's column renames
//! - Resolve region names and insert one raw fact per row
//! - Report rejected rows individually; a bad row or a bad source never
//!   stops the others
//! - Record every run in `import_runs`
//!
//! Usage:
//!   cargo run --bin importer -- --config config/sources.json
//!   cargo run --bin importer -- --config config/sources.json --source-id eurostat-fish-ld-it --force

mod fetch;
mod load;
mod normalize;
mod runs;
mod sources;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::SqlitePool;
use store::schema::bootstrap;
use store::{RegionRegistry, StoreKind};
use tokio::fs;
use tracing::{debug, error, info, warn, Instrument};
use tracing_subscriber::EnvFilter;

use crate::fetch::{build_client, fetch, FetchPolicy};
use crate::load::{insert_facts, insert_species, InsertReport};
use crate::normalize::{decode_text, normalize};
use crate::runs::{finish_run, last_loaded_hash, start_run, RunStatus, RunSummary};
use crate::sources::{load_sources_config, Dataset, Source};

#[derive(Parser, Debug)]
#[command(name = "importer", about = "Imports remote CSV sources into the raw fact tables")]
struct Args {
    /// Path to sources config file
    #[arg(long, default_value = "config/sources.json")]
    config: String,

    /// Only import this source
    #[arg(long)]
    source_id: Option<String>,

    /// Import even when the content is unchanged since the last run
    #[arg(long, default_value = "false")]
    force: bool,

    /// Empty the target raw table before inserting
    #[arg(long, default_value = "false")]
    replace: bool,

    /// Fetch and normalize only; write nothing
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Keep a copy of each repaired CSV in this directory
    #[arg(long)]
    save_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct Config {
    db_url: String,
    species_db_url: String,
    fetch: FetchPolicy,
}

impl Config {
    fn from_env() -> Result<Self> {
        let defaults = FetchPolicy::default();
        Ok(Self {
            db_url: std::env::var("DB_URL").unwrap_or_else(|_| "sqlite:pesca.db".to_string()),
            species_db_url: std::env::var("SPECIES_DB_URL")
                .unwrap_or_else(|_| "sqlite:specie.db".to_string()),
            fetch: FetchPolicy {
                attempts: env_number("FETCH_RETRIES")?.unwrap_or(defaults.attempts),
                backoff: env_number("FETCH_BACKOFF_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.backoff),
                timeout: env_number("FETCH_TIMEOUT_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.timeout),
            },
        })
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{} must be a non-negative integer, got '{}'", key, raw)),
        Err(_) => Ok(None),
    }
}

struct Stores {
    pesca: SqlitePool,
    species: SqlitePool,
    registry: RegionRegistry,
}

/// Outcome of one source, for the final summary.
enum SourceOutcome {
    Loaded(InsertReport),
    Unchanged,
    DryRun(usize),
}

async fn import_source(
    client: &reqwest::Client,
    stores: &Stores,
    config: &Config,
    args: &Args,
    source: &Source,
) -> Result<SourceOutcome> {
    let delimiter = source.delimiter_byte()?;
    let fetched = fetch(client, &source.url, &config.fetch).await?;

    if !args.force && !args.dry_run {
        let mut conn = stores.pesca.acquire().await?;
        let last_hash = last_loaded_hash(&mut conn, &source.id).await?;
        if last_hash.as_deref() == Some(fetched.content_hash.as_str()) {
            let run_id = start_run(&mut conn, &source.id).await?;
            finish_run(
                &mut conn,
                run_id,
                RunStatus::Skipped,
                &RunSummary {
                    content_hash: Some(&fetched.content_hash),
                    ..Default::default()
                },
            )
            .await?;
            return Ok(SourceOutcome::Unchanged);
        }
    }

    let text = decode_text(&fetched.bytes);
    debug!(mime_type = %fetched.mime_type, chars = text.len(), "content decoded");

    if let Some(dir) = &args.save_dir {
        fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}.csv", source.id));
        fs::write(&path, text.as_bytes())
            .await
            .with_context(|| format!("Failed to save {}", path.display()))?;
        info!(path = %path.display(), "repaired csv saved");
    }

    let table = normalize(&text, delimiter, &source.renames)?;
    info!(
        target = source.dataset.table().name(),
        rows = table.rows.len(),
        rejected_lines = table.rejected.len(),
        columns = ?table.headers,
        "source normalized"
    );

    if args.dry_run {
        return Ok(SourceOutcome::DryRun(table.rows.len()));
    }

    let mut conn = match source.dataset {
        Dataset::Regional { .. } => stores.pesca.acquire().await?,
        Dataset::Species => stores.species.acquire().await?,
    };
    let report = match source.dataset {
        Dataset::Regional { metric } => {
            insert_facts(&mut conn, &stores.registry, metric, &table.rows, args.replace).await?
        }
        Dataset::Species => insert_species(&mut conn, &table.rows, args.replace).await?,
    };
    drop(conn);

    let mut audit = stores.pesca.acquire().await?;
    let run_id = start_run(&mut audit, &source.id).await?;
    let status = if report.is_partial() {
        RunStatus::Partial
    } else {
        RunStatus::Ok
    };
    finish_run(
        &mut audit,
        run_id,
        status,
        &RunSummary {
            content_hash: Some(&fetched.content_hash),
            rows_inserted: report.inserted,
            rows_failed: report.failures.len() + table.rejected.len(),
            error: None,
        },
    )
    .await?;

    Ok(SourceOutcome::Loaded(report))
}

async fn record_failure(pool: &SqlitePool, source_id: &str, err: &anyhow::Error) -> Result<()> {
    let mut conn = pool.acquire().await?;
    let run_id = start_run(&mut conn, source_id).await?;
    let message = format!("{:#}", err);
    finish_run(
        &mut conn,
        run_id,
        RunStatus::Failed,
        &RunSummary {
            error: Some(&message),
            ..Default::default()
        },
    )
    .await?;
    Ok(())
}

/// Per-outcome source counts for the final summary.
#[derive(Debug, Default, PartialEq, Eq)]
struct ImportTotals {
    loaded: usize,
    partial: usize,
    unchanged: usize,
    failed: usize,
}

/// Import every source in turn. A failing source is logged and audited; the
/// others still run.
async fn import_all(
    client: &reqwest::Client,
    stores: &Stores,
    config: &Config,
    args: &Args,
    sources: &[&Source],
) -> ImportTotals {
    let mut totals = ImportTotals::default();

    for &source in sources {
        let span = tracing::info_span!("source", id = %source.id, provider = %source.provider);
        let outcome = async {
            info!(name = %source.name, url = %source.url, "importing");
            import_source(client, stores, config, args, source).await
        }
        .instrument(span)
        .await;

        match outcome {
            Ok(SourceOutcome::Loaded(report)) => {
                if report.is_partial() {
                    totals.partial += 1;
                    warn!(
                        source = %source.id,
                        inserted = report.inserted,
                        failed = report.failures.len(),
                        "source partially imported"
                    );
                } else {
                    totals.loaded += 1;
                    info!(source = %source.id, inserted = report.inserted, "source imported");
                }
            }
            Ok(SourceOutcome::Unchanged) => {
                totals.unchanged += 1;
                info!(source = %source.id, "content unchanged since last import; skipped (use --force to reload)");
            }
            Ok(SourceOutcome::DryRun(rows)) => {
                totals.loaded += 1;
                info!(source = %source.id, rows, "dry run - nothing written");
            }
            Err(e) => {
                totals.failed += 1;
                error!(source = %source.id, error = %format!("{:#}", e), "source failed");
                if !args.dry_run {
                    if let Err(audit) = record_failure(&stores.pesca, &source.id, &e).await {
                        error!(source = %source.id, error = %format!("{:#}", audit), "could not record failed run");
                    }
                }
            }
        }
    }

    totals
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;

    info!(config = %args.config, dry_run = args.dry_run, "importer starting");

    let sources_config = load_sources_config(&args.config).await?;
    info!(version = %sources_config.version, "sources config loaded");

    let pesca = store::db::connect(&config.db_url, 1)
        .await
        .context("Failed to open main store")?;
    let species = store::db::connect(&config.species_db_url, 1)
        .await
        .context("Failed to open species store")?;

    let registry = {
        let mut conn = pesca.acquire().await?;
        bootstrap(&mut conn, StoreKind::Pesca).await?;
        RegionRegistry::load(&mut conn).await?
    };
    {
        let mut conn = species.acquire().await?;
        bootstrap(&mut conn, StoreKind::Species).await?;
    }
    info!(regions = registry.len(), "region registry loaded");

    let stores = Stores {
        pesca,
        species,
        registry,
    };

    let sources: Vec<&Source> = sources_config
        .sources
        .iter()
        .filter(|s| s.enabled)
        .filter(|s| args.source_id.as_deref().map_or(true, |id| s.id == id))
        .collect();

    if sources.is_empty() {
        anyhow::bail!("No enabled sources match the filter criteria");
    }

    let client = build_client(&config.fetch)?;
    let totals = import_all(&client, &stores, &config, &args, &sources).await;

    info!(
        loaded = totals.loaded,
        partial = totals.partial,
        unchanged = totals.unchanged,
        failed = totals.failed,
        "import finished"
    );
    Ok(())
}
