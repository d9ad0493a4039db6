//! Schema bootstrap for both stores.

use sqlx::SqliteConnection;

use crate::error::StoreResult;
use crate::registry::seed_regions;
use crate::tables::{StoreKind, Table};

/// Audit trail of importer runs, one row per source per run.
const IMPORT_RUNS_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS import_runs (
        run_id TEXT PRIMARY KEY,
        source_id TEXT NOT NULL,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        status TEXT NOT NULL,
        content_hash TEXT,
        rows_inserted INTEGER NOT NULL DEFAULT 0,
        rows_failed INTEGER NOT NULL DEFAULT 0,
        error TEXT
    )
"#;

/// Create every table of `store` and, for the main store, seed the region
/// registry. Safe to run repeatedly.
pub async fn bootstrap(conn: &mut SqliteConnection, store: StoreKind) -> StoreResult<()> {
    for table in Table::ALL.into_iter().filter(|t| t.store() == store) {
        sqlx::query(&table.create_sql(table.name()))
            .execute(&mut *conn)
            .await?;
    }

    if store == StoreKind::Pesca {
        sqlx::query(IMPORT_RUNS_SQL).execute(&mut *conn).await?;
        seed_regions(conn).await?;
    }

    Ok(())
}
