//! Linear gap filling of raw fact tables.
//!
//! Rows are walked in the table's sort key order and each requested column
//! is filled positionally between its nearest known neighbours. Nulls after
//! the last known value carry that value forward. Nulls before the first
//! known value have nothing to fill from and are left as they are.

use sqlx::SqliteConnection;
use store::db::{read_rows, replace_table};
use store::tables::ColumnKind;
use store::{Cell, StoreError, StoreResult, Table};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct Filled {
    pub values: Vec<Option<f64>>,
    pub filled: usize,
    /// Leading nulls that stayed null.
    pub boundary: usize,
}

/// Fill nulls of `values` by linear interpolation on position, forward only:
/// interior gaps are interpolated, trailing nulls take the last known value,
/// leading nulls stay null.
pub fn interpolate_linear(values: &[Option<f64>]) -> Filled {
    let mut out = values.to_vec();
    let known: Vec<(usize, f64)> = values
        .iter()
        .enumerate()
        .filter_map(|(idx, v)| v.map(|v| (idx, v)))
        .collect();

    let (first, last_known) = match (known.first(), known.last()) {
        (Some(&(first, _)), Some(&last)) => (first, last),
        _ => {
            return Filled {
                values: out,
                filled: 0,
                boundary: values.len(),
            }
        }
    };

    let mut filled = 0;
    for pair in known.windows(2) {
        let (lo, lo_value) = pair[0];
        let (hi, hi_value) = pair[1];
        let span = (hi - lo) as f64;
        for (idx, slot) in out.iter_mut().enumerate().take(hi).skip(lo + 1) {
            let t = (idx - lo) as f64 / span;
            *slot = Some(lo_value + (hi_value - lo_value) * t);
            filled += 1;
        }
    }

    let (last, last_value) = last_known;
    for slot in out.iter_mut().skip(last + 1) {
        *slot = Some(last_value);
        filled += 1;
    }

    Filled {
        values: out,
        filled,
        boundary: first,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnReport {
    pub column: &'static str,
    pub filled: usize,
    pub unfilled_boundaries: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterpolationReport {
    pub table: Table,
    pub rows: usize,
    pub columns: Vec<ColumnReport>,
}

impl InterpolationReport {
    pub fn filled(&self) -> usize {
        self.columns.iter().map(|c| c.filled).sum()
    }
}

/// Interpolate `columns` of `table` and write the table back in full.
///
/// An empty `columns` means the table's value column. Every column must be
/// a REAL column of `table`.
pub async fn interpolate(
    conn: &mut SqliteConnection,
    table: Table,
    columns: &[&str],
) -> StoreResult<InterpolationReport> {
    let requested: Vec<&str> = if columns.is_empty() {
        table.value_column().into_iter().collect()
    } else {
        columns.to_vec()
    };
    if requested.is_empty() {
        return Err(StoreError::schema_mismatch(format!(
            "table '{}' has no value column to interpolate",
            table.name()
        )));
    }

    let mut targets = Vec::with_capacity(requested.len());
    for name in requested {
        let column = table.column(name)?;
        if column.kind != ColumnKind::Real {
            return Err(StoreError::schema_mismatch(format!(
                "column '{}' of '{}' is not numeric",
                name,
                table.name()
            )));
        }
        let position = table
            .columns()
            .iter()
            .position(|c| c.name == column.name)
            .unwrap_or_default();
        targets.push((position, column.name));
    }

    let mut rows = read_rows(conn, table).await?;
    let mut report = InterpolationReport {
        table,
        rows: rows.len(),
        columns: Vec::with_capacity(targets.len()),
    };

    for (position, name) in targets {
        let values: Vec<Option<f64>> = rows.iter().map(|row| row[position].as_f64()).collect();
        let result = interpolate_linear(&values);

        for (row, value) in rows.iter_mut().zip(result.values) {
            if row[position].is_null() {
                row[position] = Cell::from(value);
            }
        }

        if result.boundary > 0 {
            warn!(
                table = table.name(),
                column = name,
                unfilled = result.boundary,
                "leading nulls left unfilled"
            );
        }
        report.columns.push(ColumnReport {
            column: name,
            filled: result.filled,
            unfilled_boundaries: result.boundary,
        });
    }

    replace_table(conn, table, &rows).await?;

    info!(
        table = table.name(),
        rows = report.rows,
        filled = report.filled(),
        "table interpolated"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::db::connect_in_memory;
    use store::schema::bootstrap;
    use store::StoreKind;

    #[test]
    fn interior_gaps_are_filled_linearly() {
        let result = interpolate_linear(&[Some(1.0), None, None, Some(4.0), None, Some(8.0)]);
        assert_eq!(
            result.values,
            vec![Some(1.0), Some(2.0), Some(3.0), Some(4.0), Some(6.0), Some(8.0)]
        );
        assert_eq!(result.filled, 3);
        assert_eq!(result.boundary, 0);
    }

    #[test]
    fn leading_nulls_stay_null_and_trailing_nulls_carry_forward() {
        let result = interpolate_linear(&[None, Some(2.0), None, Some(4.0), None, None]);
        assert_eq!(
            result.values,
            vec![None, Some(2.0), Some(3.0), Some(4.0), Some(4.0), Some(4.0)]
        );
        assert_eq!(result.filled, 3);
        assert_eq!(result.boundary, 1);
    }

    #[test]
    fn trailing_null_takes_last_known_value() {
        let result = interpolate_linear(&[Some(1.0), None, Some(3.0), None]);
        assert_eq!(result.values, vec![Some(1.0), Some(2.0), Some(3.0), Some(3.0)]);
        assert_eq!(result.boundary, 0);
    }

    #[test]
    fn all_null_and_empty_inputs() {
        let result = interpolate_linear(&[None, None]);
        assert_eq!(result.values, vec![None, None]);
        assert_eq!(result.boundary, 2);

        let result = interpolate_linear(&[]);
        assert!(result.values.is_empty());
        assert_eq!(result.filled, 0);
    }

    #[test]
    fn known_values_are_never_altered() {
        let input = [Some(5.0), None, Some(-1.0), Some(7.25), None, Some(0.0)];
        let result = interpolate_linear(&input);
        for (before, after) in input.iter().zip(&result.values) {
            if before.is_some() {
                assert_eq!(before, after);
            }
        }
    }

    #[test]
    fn second_pass_changes_nothing() {
        let once = interpolate_linear(&[None, Some(1.0), None, Some(3.0), None]);
        let twice = interpolate_linear(&once.values);
        assert_eq!(once.values, twice.values);
        assert_eq!(twice.filled, 0);
    }

    async fn seeded(facts: &[(i64, i64, Option<f64>)]) -> sqlx::SqlitePool {
        let pool = connect_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        bootstrap(&mut conn, StoreKind::Pesca).await.unwrap();
        for &(anno, regione_id, value) in facts {
            sqlx::query("INSERT INTO occupazione (anno, regione_id, occupazione) VALUES (?, ?, ?)")
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

    async fn stored(conn: &mut SqliteConnection) -> Vec<(i64, i64, Option<f64>)> {
        sqlx::query_as("SELECT anno, regione_id, occupazione FROM occupazione ORDER BY anno, regione_id")
            .fetch_all(&mut *conn)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn table_is_filled_in_year_then_region_order() {
        // Inserted out of order; the fill must follow (anno, regione_id).
        let pool = seeded(&[
            (2021, 2, Some(30.0)),
            (2019, 2, Some(10.0)),
            (2020, 2, None),
            (2018, 2, None),
        ])
        .await;
        let mut conn = pool.acquire().await.unwrap();

        let report = interpolate(&mut conn, Table::Occupazione, &[]).await.unwrap();
        assert_eq!(report.rows, 4);
        assert_eq!(
            report.columns,
            vec![ColumnReport {
                column: "occupazione",
                filled: 1,
                unfilled_boundaries: 1,
            }]
        );

        assert_eq!(
            stored(&mut conn).await,
            vec![
                (2018, 2, None),
                (2019, 2, Some(10.0)),
                (2020, 2, Some(20.0)),
                (2021, 2, Some(30.0)),
            ]
        );
    }

    #[tokio::test]
    async fn running_twice_is_idempotent() {
        let pool = seeded(&[
            (2019, 2, Some(1.0)),
            (2019, 3, None),
            (2020, 2, Some(2.0)),
            (2020, 3, None),
        ])
        .await;
        let mut conn = pool.acquire().await.unwrap();

        interpolate(&mut conn, Table::Occupazione, &[]).await.unwrap();
        let first = stored(&mut conn).await;
        assert_eq!(
            first,
            vec![
                (2019, 2, Some(1.0)),
                (2019, 3, Some(1.5)),
                (2020, 2, Some(2.0)),
                (2020, 3, Some(2.0)),
            ]
        );
        let second_report = interpolate(&mut conn, Table::Occupazione, &[]).await.unwrap();
        assert_eq!(second_report.filled(), 0);
        assert_eq!(stored(&mut conn).await, first);
    }

    #[tokio::test]
    async fn non_numeric_or_unknown_columns_are_rejected() {
        let pool = seeded(&[]).await;
        let mut conn = pool.acquire().await.unwrap();

        let err = interpolate(&mut conn, Table::Occupazione, &["anno"]).await.unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch { .. }));

        let err = interpolate(&mut conn, Table::Occupazione, &["valore"]).await.unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch { .. }));

        let err = interpolate(&mut conn, Table::Regioni, &[]).await.unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch { .. }));
    }

    #[tokio::test]
    async fn missing_table_is_fatal() {
        let pool = connect_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();

        let err = interpolate(&mut conn, Table::Produttivita, &[]).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingTable { .. }));
    }
}
