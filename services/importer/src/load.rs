//! Insert normalized rows as raw facts.
//!
//! Every row is checked before anything is written. A row that fails is
//! reported with its line and reason; the rest of the batch still goes in.

use sqlx::{Connection, SqliteConnection};
use store::{Metric, RegionRegistry, StoreError, StoreResult, Table};
use tracing::{info, warn};

use crate::normalize::{parse_value, parse_year, NormalizedRow};

pub const YEAR_FIELD: &str = "anno";
pub const REGION_FIELD: &str = "regione";

/// Canonical species dataset fields.
pub const SPECIES_REGION_FIELD: &str = "region_code";
pub const SPECIES_PERIOD_FIELD: &str = "time_period";
pub const SPECIES_VALUE_FIELD: &str = "observed_value";
pub const SPECIES_FIELD: &str = "species";

#[derive(Debug, Clone, PartialEq)]
pub struct RawFact {
    pub year: i64,
    pub region_id: i64,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpeciesObservation {
    pub region_code: String,
    pub time_period: i64,
    pub observed_value: Option<f64>,
    pub species: String,
}

#[derive(Debug)]
pub struct RowFailure {
    pub line: usize,
    pub error: StoreError,
}

#[derive(Debug, Default)]
pub struct InsertReport {
    pub inserted: usize,
    pub failures: Vec<RowFailure>,
}

impl InsertReport {
    /// Some rows went in, some did not.
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }

    fn fail(&mut self, line: usize, error: StoreError) {
        warn!(line, %error, "row rejected");
        self.failures.push(RowFailure { line, error });
    }
}

fn invalid(row: &NormalizedRow, reason: String) -> StoreError {
    StoreError::invalid_row(row.line, reason)
}

pub fn raw_fact_from_row(
    row: &NormalizedRow,
    registry: &RegionRegistry,
    metric: Metric,
) -> StoreResult<RawFact> {
    let year = parse_year(row.require(YEAR_FIELD)?).map_err(|r| invalid(row, r))?;
    let region_id = registry.resolve(row.require(REGION_FIELD)?)?;
    let raw_value = row.get(metric.value_column()).ok_or_else(|| {
        invalid(row, format!("missing field '{}'", metric.value_column()))
    })?;
    let value = parse_value(raw_value).map_err(|r| invalid(row, r))?;

    Ok(RawFact {
        year,
        region_id,
        value,
    })
}

pub fn species_from_row(row: &NormalizedRow) -> StoreResult<SpeciesObservation> {
    let region_code = row.require(SPECIES_REGION_FIELD)?.to_string();
    let time_period = parse_year(row.require(SPECIES_PERIOD_FIELD)?).map_err(|r| invalid(row, r))?;
    let raw_value = row.get(SPECIES_VALUE_FIELD).ok_or_else(|| {
        invalid(row, format!("missing field '{}'", SPECIES_VALUE_FIELD))
    })?;
    let observed_value = parse_value(raw_value).map_err(|r| invalid(row, r))?;
    let species = row.require(SPECIES_FIELD)?.to_string();

    Ok(SpeciesObservation {
        region_code,
        time_period,
        observed_value,
        species,
    })
}

/// Insert one raw fact per resolvable row of `rows` into `metric`'s table.
/// With `replace`, the table is emptied first, in the same transaction.
pub async fn insert_facts(
    conn: &mut SqliteConnection,
    registry: &RegionRegistry,
    metric: Metric,
    rows: &[NormalizedRow],
    replace: bool,
) -> StoreResult<InsertReport> {
    let table = metric.table();
    let mut report = InsertReport::default();
    let mut facts = Vec::with_capacity(rows.len());

    for row in rows {
        match raw_fact_from_row(row, registry, metric) {
            Ok(fact) => facts.push(fact),
            Err(error) => report.fail(row.line, error),
        }
    }

    let insert = format!(
        r#"INSERT INTO "{}" (anno, regione_id, "{}") VALUES (?, ?, ?)"#,
        table.name(),
        metric.value_column()
    );

    let mut tx = conn.begin().await?;
    if replace {
        clear_table(&mut tx, table).await?;
    }
    for fact in &facts {
        sqlx::query(&insert)
            .bind(fact.year)
            .bind(fact.region_id)
            .bind(fact.value)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    report.inserted = facts.len();
    info!(
        table = table.name(),
        inserted = report.inserted,
        failed = report.failures.len(),
        "raw facts inserted"
    );
    Ok(report)
}

pub async fn insert_species(
    conn: &mut SqliteConnection,
    rows: &[NormalizedRow],
    replace: bool,
) -> StoreResult<InsertReport> {
    let mut report = InsertReport::default();
    let mut observations = Vec::with_capacity(rows.len());

    for row in rows {
        match species_from_row(row) {
            Ok(obs) => observations.push(obs),
            Err(error) => report.fail(row.line, error),
        }
    }

    let mut tx = conn.begin().await?;
    if replace {
        clear_table(&mut tx, Table::Specie).await?;
    }
    for obs in &observations {
        sqlx::query(
            "INSERT INTO specie (region_code, time_period, observed_value, species) VALUES (?, ?, ?, ?)",
        )
        .bind(&obs.region_code)
        .bind(obs.time_period)
        .bind(obs.observed_value)
        .bind(&obs.species)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    report.inserted = observations.len();
    info!(
        table = Table::Specie.name(),
        inserted = report.inserted,
        failed = report.failures.len(),
        "species observations inserted"
    );
    Ok(report)
}

async fn clear_table(conn: &mut SqliteConnection, table: Table) -> StoreResult<()> {
    let deleted = sqlx::query(&format!(r#"DELETE FROM "{}""#, table.name()))
        .execute(&mut *conn)
        .await?
        .rows_affected();
    info!(table = table.name(), deleted, "raw table cleared before import");
    Ok(())
}
