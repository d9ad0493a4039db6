//! Derived series: group raw facts and reduce each group to one value.
//!
//! Regional facts are joined to `regioni`; a fact whose region does not
//! resolve never reaches a derived table and is counted in the report.
//! Repeated (year, region) observations are reduced together like any other
//! rows and listed in the report.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use sqlx::SqliteConnection;
use store::db::{ensure_table, replace_table};
use store::tables::TableKind;
use store::{Cell, StoreError, StoreResult, Table};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    Year,
    YearArea,
    SpeciesPeriod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reducer {
    Sum,
    Mean,
}

/// One component of a group key or an observation identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyValue {
    Int(i64),
    Text(String),
}

impl From<KeyValue> for Cell {
    fn from(value: KeyValue) -> Self {
        match value {
            KeyValue::Int(v) => Cell::Integer(v),
            KeyValue::Text(v) => Cell::Text(v),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(v) => write!(f, "{}", v),
            KeyValue::Text(v) => f.write_str(v),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Group the observation reduces into.
    pub key: Vec<KeyValue>,
    /// What makes two observations the same fact, e.g. (anno, regione_id).
    pub identity: Vec<KeyValue>,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DerivedRow {
    pub key: Vec<KeyValue>,
    pub value: Option<f64>,
}

impl DerivedRow {
    fn into_cells(self) -> Vec<Cell> {
        let mut cells: Vec<Cell> = self.key.into_iter().map(Cell::from).collect();
        cells.push(Cell::from(self.value));
        cells
    }
}

#[derive(Default)]
struct Accumulator {
    sum: f64,
    count: usize,
}

/// Reduce `observations` per group key, output sorted by key.
///
/// Nulls are skipped. A group with no values sums to 0.0 and has no mean.
pub fn aggregate(observations: &[Observation], reducer: Reducer) -> Vec<DerivedRow> {
    let mut groups: BTreeMap<&[KeyValue], Accumulator> = BTreeMap::new();
    for obs in observations {
        let acc = groups.entry(obs.key.as_slice()).or_default();
        if let Some(value) = obs.value {
            acc.sum += value;
            acc.count += 1;
        }
    }

    groups
        .into_iter()
        .map(|(key, acc)| DerivedRow {
            key: key.to_vec(),
            value: match reducer {
                Reducer::Sum => Some(acc.sum),
                Reducer::Mean if acc.count > 0 => Some(acc.sum / acc.count as f64),
                Reducer::Mean => None,
            },
        })
        .collect()
}

/// Identities seen more than once, in first-seen order.
pub fn duplicate_identities(observations: &[Observation]) -> Vec<Vec<KeyValue>> {
    let mut seen: HashMap<&[KeyValue], usize> = HashMap::new();
    let mut duplicates = Vec::new();
    for obs in observations {
        let count = seen.entry(obs.identity.as_slice()).or_default();
        *count += 1;
        if *count == 2 {
            duplicates.push(obs.identity.clone());
        }
    }
    duplicates
}

/// A derived table and how it is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeriesSpec {
    pub source: Table,
    pub target: Table,
    pub group_by: GroupBy,
    pub reducer: Reducer,
}

pub const SERIES: &[SeriesSpec] = &[
    SeriesSpec {
        source: Table::Produttivita,
        target: Table::ProduttivitaTotaleAree,
        group_by: GroupBy::YearArea,
        reducer: Reducer::Sum,
    },
    SeriesSpec {
        source: Table::Produttivita,
        target: Table::ProduttivitaTotaleNazionale,
        group_by: GroupBy::Year,
        reducer: Reducer::Sum,
    },
    SeriesSpec {
        source: Table::Economia,
        target: Table::MediaValoreAggiuntoAree,
        group_by: GroupBy::YearArea,
        reducer: Reducer::Mean,
    },
    SeriesSpec {
        source: Table::Occupazione,
        target: Table::MediaVariazioneOccupazioneNazionale,
        group_by: GroupBy::Year,
        reducer: Reducer::Mean,
    },
    SeriesSpec {
        source: Table::Occupazione,
        target: Table::MediaVariazioneOccupazioneAree,
        group_by: GroupBy::YearArea,
        reducer: Reducer::Mean,
    },
    SeriesSpec {
        source: Table::Specie,
        target: Table::MediaSpecie,
        group_by: GroupBy::SpeciesPeriod,
        reducer: Reducer::Mean,
    },
];

/// The series that writes `target`, if any.
pub fn series_for(target: Table) -> StoreResult<&'static SeriesSpec> {
    SERIES.iter().find(|s| s.target == target).ok_or_else(|| {
        StoreError::schema_mismatch(format!("'{}' is not a derived series", target.name()))
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateReport {
    pub target: Table,
    pub input_rows: usize,
    /// Facts dropped because their region did not resolve.
    pub skipped_rows: usize,
    /// (anno, regione_id) of every dropped fact.
    pub unresolved_keys: Vec<(i64, i64)>,
    pub duplicate_keys: Vec<Vec<KeyValue>>,
    pub groups: usize,
}

struct Loaded {
    observations: Vec<Observation>,
    input_rows: usize,
    unresolved_keys: Vec<(i64, i64)>,
}

async fn load_regional(
    conn: &mut SqliteConnection,
    source: Table,
    group_by: GroupBy,
) -> StoreResult<Loaded> {
    let value_column = source.value_column().ok_or_else(|| {
        StoreError::schema_mismatch(format!("'{}' has no value column", source.name()))
    })?;
    ensure_table(conn, source).await?;
    ensure_table(conn, Table::Regioni).await?;

    // LEFT JOIN so unresolved facts can be counted; they are dropped below.
    let sql = format!(
        r#"
        SELECT f.anno, f.regione_id, r.area_geografica, f."{value}"
        FROM "{table}" f
        LEFT JOIN regioni r ON r.id = f.regione_id
        ORDER BY f.anno, f.regione_id, f.id
        "#,
        value = value_column,
        table = source.name(),
    );
    let rows: Vec<(i64, i64, Option<String>, Option<f64>)> =
        sqlx::query_as(&sql).fetch_all(&mut *conn).await?;

    let mut loaded = Loaded {
        observations: Vec::with_capacity(rows.len()),
        input_rows: rows.len(),
        unresolved_keys: Vec::new(),
    };

    for (anno, regione_id, area, value) in rows {
        let Some(area) = area else {
            loaded.unresolved_keys.push((anno, regione_id));
            continue;
        };
        let key = match group_by {
            GroupBy::Year => vec![KeyValue::Int(anno)],
            GroupBy::YearArea => vec![KeyValue::Int(anno), KeyValue::Text(area)],
            GroupBy::SpeciesPeriod => {
                return Err(StoreError::schema_mismatch(format!(
                    "'{}' cannot be grouped by species",
                    source.name()
                )))
            }
        };
        loaded.observations.push(Observation {
            key,
            identity: vec![KeyValue::Int(anno), KeyValue::Int(regione_id)],
            value,
        });
    }

    Ok(loaded)
}

async fn load_species(conn: &mut SqliteConnection) -> StoreResult<Loaded> {
    ensure_table(conn, Table::Specie).await?;

    let rows: Vec<(String, i64, String, Option<f64>)> = sqlx::query_as(
        r#"
        SELECT species, time_period, region_code, observed_value
        FROM specie
        ORDER BY time_period, species, region_code, id
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    let input_rows = rows.len();
    let observations = rows
        .into_iter()
        .map(|(species, time_period, region_code, value)| Observation {
            key: vec![KeyValue::Text(species.clone()), KeyValue::Int(time_period)],
            identity: vec![
                KeyValue::Text(species),
                KeyValue::Int(time_period),
                KeyValue::Text(region_code),
            ],
            value,
        })
        .collect();

    Ok(Loaded {
        observations,
        input_rows,
        unresolved_keys: Vec::new(),
    })
}

/// Recompute `spec.target` from its source table and swap it in.
pub async fn run_series(
    conn: &mut SqliteConnection,
    spec: &SeriesSpec,
) -> StoreResult<AggregateReport> {
    if spec.source.kind() != TableKind::Raw || spec.target.kind() != TableKind::Derived {
        return Err(StoreError::schema_mismatch(format!(
            "cannot derive '{}' from '{}'",
            spec.target.name(),
            spec.source.name()
        )));
    }

    let loaded = match spec.group_by {
        GroupBy::SpeciesPeriod => load_species(conn).await?,
        group_by => load_regional(conn, spec.source, group_by).await?,
    };

    let duplicate_keys = duplicate_identities(&loaded.observations);
    let derived = aggregate(&loaded.observations, spec.reducer);
    let groups = derived.len();
    let rows: Vec<Vec<Cell>> = derived.into_iter().map(DerivedRow::into_cells).collect();
    replace_table(conn, spec.target, &rows).await?;

    let report = AggregateReport {
        target: spec.target,
        input_rows: loaded.input_rows,
        skipped_rows: loaded.unresolved_keys.len(),
        unresolved_keys: loaded.unresolved_keys,
        duplicate_keys,
        groups,
    };

    if report.skipped_rows > 0 {
        warn!(
            target = spec.target.name(),
            skipped = report.skipped_rows,
            keys = ?report.unresolved_keys,
            "facts with unresolved region dropped"
        );
    }
    if !report.duplicate_keys.is_empty() {
        let keys: Vec<String> = report
            .duplicate_keys
            .iter()
            .map(|k| {
                k.iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .collect();
        warn!(
            target = spec.target.name(),
            duplicates = report.duplicate_keys.len(),
            keys = %keys.join(", "),
            "repeated observations reduced together"
        );
    }
    info!(
        source = spec.source.name(),
        target = spec.target.name(),
        input = report.input_rows,
        groups = report.groups,
        "series recomputed"
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::db::{connect_in_memory, read_rows};
    use store::schema::bootstrap;
    use store::StoreKind;

    fn obs(anno: i64, area: &str, value: Option<f64>) -> Observation {
        Observation {
            key: vec![KeyValue::Int(anno), KeyValue::Text(area.to_string())],
            identity: vec![KeyValue::Int(anno), KeyValue::Text(area.to_string())],
            value,
        }
    }

    fn row(anno: i64, area: &str, value: Option<f64>) -> DerivedRow {
        DerivedRow {
            key: vec![KeyValue::Int(anno), KeyValue::Text(area.to_string())],
            value,
        }
    }

    #[test]
    fn sum_reduces_a_group() {
        let input = [obs(2019, "A", Some(10.0)), obs(2019, "A", Some(5.0))];
        assert_eq!(aggregate(&input, Reducer::Sum), vec![row(2019, "A", Some(15.0))]);
    }

    #[test]
    fn mean_reduces_a_group() {
        let input = [obs(2019, "A", Some(10.0)), obs(2019, "A", Some(6.0))];
        assert_eq!(aggregate(&input, Reducer::Mean), vec![row(2019, "A", Some(8.0))]);
    }

    #[test]
    fn nulls_are_skipped() {
        let input = [
            obs(2019, "A", Some(4.0)),
            obs(2019, "A", None),
            obs(2020, "A", None),
        ];
        assert_eq!(
            aggregate(&input, Reducer::Mean),
            vec![row(2019, "A", Some(4.0)), row(2020, "A", None)]
        );
        assert_eq!(
            aggregate(&input, Reducer::Sum),
            vec![row(2019, "A", Some(4.0)), row(2020, "A", Some(0.0))]
        );
    }

    #[test]
    fn output_is_sorted_by_key() {
        let input = [
            obs(2021, "Sud", Some(1.0)),
            obs(2020, "Sud", Some(2.0)),
            obs(2020, "Centro", Some(3.0)),
        ];
        let keys: Vec<Vec<KeyValue>> = aggregate(&input, Reducer::Sum)
            .into_iter()
            .map(|r| r.key)
            .collect();
        assert_eq!(
            keys,
            vec![
                vec![KeyValue::Int(2020), KeyValue::Text("Centro".into())],
                vec![KeyValue::Int(2020), KeyValue::Text("Sud".into())],
                vec![KeyValue::Int(2021), KeyValue::Text("Sud".into())],
            ]
        );
    }

    #[test]
    fn duplicates_are_reported_once() {
        let input = [
            obs(2019, "A", Some(1.0)),
            obs(2019, "A", Some(2.0)),
            obs(2019, "A", Some(3.0)),
            obs(2020, "A", Some(4.0)),
        ];
        assert_eq!(
            duplicate_identities(&input),
            vec![vec![KeyValue::Int(2019), KeyValue::Text("A".into())]]
        );
    }

    #[test]
    fn every_target_has_one_series() {
        for table in Table::ALL {
            let found = series_for(table).is_ok();
            assert_eq!(found, table.kind() == TableKind::Derived, "{}", table.name());
        }
    }

    async fn pesca_with(facts: &[(i64, i64, Option<f64>)]) -> sqlx::SqlitePool {
        let pool = connect_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        bootstrap(&mut conn, StoreKind::Pesca).await.unwrap();
        for &(anno, regione_id, value) in facts {
            sqlx::query("INSERT INTO produttivita (anno, regione_id, produttivita) VALUES (?, ?, ?)")
                .bind(anno)
                .bind(regione_id)
                .bind(value)
                .execute(&mut *conn)
                .await
                .unwrap();
        }
        drop(conn);
        pool
    }

    #[tokio::test]
    async fn two_north_west_regions_sum_nationally_and_per_area() {
        // Piemonte (2) and Liguria (3) are both Nord-ovest.
        let pool = pesca_with(&[(2020, 2, Some(10.0)), (2020, 3, Some(20.0))]).await;
        let mut conn = pool.acquire().await.unwrap();

        let national = series_for(Table::ProduttivitaTotaleNazionale).unwrap();
        let report = run_series(&mut conn, national).await.unwrap();
        assert_eq!(report.groups, 1);
        assert_eq!(
            read_rows(&mut conn, Table::ProduttivitaTotaleNazionale).await.unwrap(),
            vec![vec![Cell::Integer(2020), Cell::Real(30.0)]]
        );

        let areas = series_for(Table::ProduttivitaTotaleAree).unwrap();
        run_series(&mut conn, areas).await.unwrap();
        assert_eq!(
            read_rows(&mut conn, Table::ProduttivitaTotaleAree).await.unwrap(),
            vec![vec![
                Cell::Integer(2020),
                Cell::Text("Nord-ovest".to_string()),
                Cell::Real(30.0)
            ]]
        );
    }

    #[tokio::test]
    async fn duplicate_facts_are_reduced_together_and_reported() {
        let pool = pesca_with(&[
            (2020, 2, Some(10.0)),
            (2020, 2, Some(10.0)),
            (2020, 3, Some(5.0)),
        ])
        .await;
        let mut conn = pool.acquire().await.unwrap();

        let report = run_series(&mut conn, series_for(Table::ProduttivitaTotaleNazionale).unwrap())
            .await
            .unwrap();
        assert_eq!(report.input_rows, 3);
        assert_eq!(
            report.duplicate_keys,
            vec![vec![KeyValue::Int(2020), KeyValue::Int(2)]]
        );
        assert_eq!(
            read_rows(&mut conn, Table::ProduttivitaTotaleNazionale).await.unwrap(),
            vec![vec![Cell::Integer(2020), Cell::Real(25.0)]]
        );
    }

    #[tokio::test]
    async fn unresolved_regions_are_dropped_and_counted() {
        let pool = pesca_with(&[(2020, 2, Some(10.0))]).await;
        let mut conn = pool.acquire().await.unwrap();
        sqlx::query("PRAGMA foreign_keys = OFF")
            .execute(&mut *conn)
            .await
            .unwrap();
        sqlx::query("INSERT INTO produttivita (anno, regione_id, produttivita) VALUES (2020, 99, 50.0)")
            .execute(&mut *conn)
            .await
            .unwrap();

        let report = run_series(&mut conn, series_for(Table::ProduttivitaTotaleAree).unwrap())
            .await
            .unwrap();
        assert_eq!(report.input_rows, 2);
        assert_eq!(report.skipped_rows, 1);
        assert_eq!(report.unresolved_keys, vec![(2020, 99)]);
        assert_eq!(
            read_rows(&mut conn, Table::ProduttivitaTotaleAree).await.unwrap(),
            vec![vec![
                Cell::Integer(2020),
                Cell::Text("Nord-ovest".to_string()),
                Cell::Real(10.0)
            ]]
        );
    }

    #[tokio::test]
    async fn rerun_replaces_the_previous_series() {
        let pool = pesca_with(&[(2019, 2, Some(1.0))]).await;
        let mut conn = pool.acquire().await.unwrap();
        let spec = series_for(Table::ProduttivitaTotaleNazionale).unwrap();

        run_series(&mut conn, spec).await.unwrap();
        sqlx::query("DELETE FROM produttivita")
            .execute(&mut *conn)
            .await
            .unwrap();
        sqlx::query("INSERT INTO produttivita (anno, regione_id, produttivita) VALUES (2021, 2, 7.0)")
            .execute(&mut *conn)
            .await
            .unwrap();
        run_series(&mut conn, spec).await.unwrap();

        assert_eq!(
            read_rows(&mut conn, Table::ProduttivitaTotaleNazionale).await.unwrap(),
            vec![vec![Cell::Integer(2021), Cell::Real(7.0)]]
        );
    }

    #[tokio::test]
    async fn species_mean_per_species_and_period() {
        let pool = connect_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        bootstrap(&mut conn, StoreKind::Species).await.unwrap();
        for (region, period, value, species) in [
            ("ITC", 2019, Some(4.0), "HKE"),
            ("ITF", 2019, Some(8.0), "HKE"),
            ("ITC", 2019, None, "ANE"),
            ("ITC", 2020, Some(1.0), "HKE"),
        ] {
            sqlx::query(
                "INSERT INTO specie (region_code, time_period, observed_value, species) VALUES (?, ?, ?, ?)",
            )
            .bind(region)
            .bind(period)
            .bind(value)
            .bind(species)
            .execute(&mut *conn)
            .await
            .unwrap();
        }

        let report = run_series(&mut conn, series_for(Table::MediaSpecie).unwrap())
            .await
            .unwrap();
        assert_eq!(report.groups, 3);
        assert!(report.duplicate_keys.is_empty());
        assert_eq!(
            read_rows(&mut conn, Table::MediaSpecie).await.unwrap(),
            vec![
                vec![Cell::Text("ANE".into()), Cell::Integer(2019), Cell::Null],
                vec![Cell::Text("HKE".into()), Cell::Integer(2019), Cell::Real(6.0)],
                vec![Cell::Text("HKE".into()), Cell::Integer(2020), Cell::Real(1.0)],
            ]
        );
    }

    #[tokio::test]
    async fn missing_source_table_is_fatal() {
        let pool = connect_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();

        let err = run_series(&mut conn, series_for(Table::MediaValoreAggiuntoAree).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingTable { ref table } if table == "economia"));
    }
}
