//! Read-only query service used by the HTTP layer.

use sqlx::SqliteConnection;

use crate::db::{decode_cell, ensure_table};
use crate::error::{StoreError, StoreResult};
use crate::tables::{quoted, Column, Table};
use crate::value::Record;

/// Inclusive year range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YearRange {
    pub from: i64,
    pub to: i64,
}

impl YearRange {
    /// Both bounds or nothing. A single bound is ignored, not clamped.
    pub fn from_bounds(from: Option<i64>, to: Option<i64>) -> Option<YearRange> {
        match (from, to) {
            (Some(from), Some(to)) => Some(YearRange { from, to }),
            _ => None,
        }
    }
}

/// Select `columns` (all when empty) from an allow-listed `table`, optionally
/// restricted to `range` on the table's year column. Rows come back in
/// storage order.
pub async fn query(
    conn: &mut SqliteConnection,
    table: Table,
    columns: &[String],
    range: Option<YearRange>,
) -> StoreResult<Vec<Record>> {
    let selected: Vec<Column> = if columns.is_empty() {
        table.columns().to_vec()
    } else {
        columns
            .iter()
            .map(|name| table.column(name.trim()))
            .collect::<StoreResult<_>>()?
    };

    let select: Vec<String> = selected.iter().map(|c| quoted(c.name)).collect();
    let mut sql = format!("SELECT {} FROM {}", select.join(", "), quoted(table.name()));

    if let Some(range) = range {
        let year = table.year_column().ok_or_else(|| {
            StoreError::schema_mismatch(format!(
                "table '{}' has no year column to filter on",
                table.name()
            ))
        })?;
        sql.push_str(&format!(" WHERE {} BETWEEN ? AND ?", quoted(year)));
    }
    sql.push_str(" ORDER BY rowid");

    ensure_table(conn, table).await?;

    let mut q = sqlx::query(&sql);
    if let Some(range) = range {
        q = q.bind(range.from).bind(range.to);
    }
    let rows = q.fetch_all(&mut *conn).await?;

    rows.iter()
        .map(|row| {
            let mut record = Record::new();
            for (idx, column) in selected.iter().enumerate() {
                record.push(column.name, decode_cell(row, idx, column)?);
            }
            Ok::<_, StoreError>(record)
        })
        .collect()
}
