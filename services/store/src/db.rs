//! Connection setup and whole-table reads and writes.

use std::str::FromStr;
use std::time::Duration;

use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Connection, Row, Sqlite, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::tables::{quoted, Column, ColumnKind, Table};
use crate::value::Cell;

/// Open a pool on a SQLite database, creating the file when missing.
pub async fn connect(url: &str, max_connections: u32) -> StoreResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    debug!(url, max_connections, "sqlite pool opened");
    Ok(pool)
}

/// Single-connection in-memory database. The connection is never recycled,
/// so the data lives as long as the pool.
pub async fn connect_in_memory() -> StoreResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    Ok(pool)
}

pub async fn table_exists(conn: &mut SqliteConnection, name: &str) -> StoreResult<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
    )
    .bind(name)
    .fetch_one(&mut *conn)
    .await?;
    Ok(exists)
}

/// Fail with `MissingTable` when a stage's input was never created.
pub async fn ensure_table(conn: &mut SqliteConnection, table: Table) -> StoreResult<()> {
    if table_exists(conn, table.name()).await? {
        Ok(())
    } else {
        Err(StoreError::MissingTable {
            table: table.name().to_string(),
        })
    }
}

pub(crate) fn decode_cell(row: &SqliteRow, idx: usize, column: &Column) -> StoreResult<Cell> {
    let cell = match column.kind {
        ColumnKind::Integer => row
            .try_get::<Option<i64>, _>(idx)?
            .map_or(Cell::Null, Cell::Integer),
        ColumnKind::Real => row
            .try_get::<Option<f64>, _>(idx)?
            .map_or(Cell::Null, Cell::Real),
        ColumnKind::Text => row
            .try_get::<Option<String>, _>(idx)?
            .map_or(Cell::Null, Cell::Text),
    };
    Ok(cell)
}

pub(crate) fn bind_cell<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    cell: &Cell,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match cell {
        Cell::Null => query.bind(None::<i64>),
        Cell::Integer(v) => query.bind(*v),
        Cell::Real(v) => query.bind(*v),
        Cell::Text(v) => query.bind(v.clone()),
    }
}

/// Read every row of `table`, all columns, in the table's sort key order.
pub async fn read_rows(conn: &mut SqliteConnection, table: Table) -> StoreResult<Vec<Vec<Cell>>> {
    ensure_table(conn, table).await?;

    let columns = table.columns();
    let select: Vec<String> = columns.iter().map(|c| quoted(c.name)).collect();
    let order: Vec<String> = table.sort_key().iter().map(|c| quoted(c)).collect();
    let sql = format!(
        "SELECT {} FROM {} ORDER BY {}",
        select.join(", "),
        quoted(table.name()),
        order.join(", ")
    );

    let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
    rows.iter()
        .map(|row| {
            columns
                .iter()
                .enumerate()
                .map(|(idx, column)| decode_cell(row, idx, column))
                .collect::<StoreResult<Vec<Cell>>>()
        })
        .collect()
}

/// Replace the whole content of `table` with `rows`.
///
/// Rows go into a staging table that is renamed over the target inside one
/// transaction, so a reader sees either the old content or the new one.
pub async fn replace_table(
    conn: &mut SqliteConnection,
    table: Table,
    rows: &[Vec<Cell>],
) -> StoreResult<usize> {
    let columns = table.columns();
    for (idx, row) in rows.iter().enumerate() {
        if row.len() != columns.len() {
            return Err(StoreError::schema_mismatch(format!(
                "row {} has {} values, table '{}' has {} columns",
                idx,
                row.len(),
                table.name(),
                columns.len()
            )));
        }
    }

    let staging = format!("{}__staging", table.name());
    let names: Vec<String> = columns.iter().map(|c| quoted(c.name)).collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    let insert = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quoted(&staging),
        names.join(", "),
        placeholders
    );

    let mut tx = conn.begin().await?;

    sqlx::query(&format!("DROP TABLE IF EXISTS {}", quoted(&staging)))
        .execute(&mut *tx)
        .await?;
    sqlx::query(&table.create_sql(&staging))
        .execute(&mut *tx)
        .await?;

    for row in rows {
        let mut query = sqlx::query(&insert);
        for cell in row {
            query = bind_cell(query, cell);
        }
        query.execute(&mut *tx).await?;
    }

    sqlx::query(&format!("DROP TABLE IF EXISTS {}", quoted(table.name())))
        .execute(&mut *tx)
        .await?;
    sqlx::query(&format!(
        "ALTER TABLE {} RENAME TO {}",
        quoted(&staging),
        quoted(table.name())
    ))
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    debug!(table = table.name(), rows = rows.len(), "table replaced");
    Ok(rows.len())
}
