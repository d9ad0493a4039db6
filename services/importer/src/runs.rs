//! Audit records of importer runs (`import_runs`).

use chrono::Utc;
use sqlx::SqliteConnection;
use store::StoreResult;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Ok,
    Partial,
    Failed,
    Skipped,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Ok => "ok",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
            RunStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Default)]
pub struct RunSummary<'a> {
    pub content_hash: Option<&'a str>,
    pub rows_inserted: usize,
    pub rows_failed: usize,
    pub error: Option<&'a str>,
}

/// Hash of the last download of `source_id` that was loaded, if any.
pub async fn last_loaded_hash(
    conn: &mut SqliteConnection,
    source_id: &str,
) -> StoreResult<Option<String>> {
    let hash: Option<Option<String>> = sqlx::query_scalar(
        r#"
        SELECT content_hash FROM import_runs
        WHERE source_id = ? AND status IN ('ok', 'partial')
        ORDER BY started_at DESC
        LIMIT 1
        "#,
    )
    .bind(source_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(hash.flatten())
}

pub async fn start_run(conn: &mut SqliteConnection, source_id: &str) -> StoreResult<Uuid> {
    let run_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO import_runs (run_id, source_id, started_at, status) VALUES (?, ?, ?, ?)",
    )
    .bind(run_id.to_string())
    .bind(source_id)
    .bind(Utc::now())
    .bind(RunStatus::Running.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(run_id)
}

pub async fn finish_run(
    conn: &mut SqliteConnection,
    run_id: Uuid,
    status: RunStatus,
    summary: &RunSummary<'_>,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        UPDATE import_runs
        SET finished_at = ?, status = ?, content_hash = ?, rows_inserted = ?, rows_failed = ?, error = ?
        WHERE run_id = ?
        "#,
    )
    .bind(Utc::now())
    .bind(status.as_str())
    .bind(summary.content_hash)
    .bind(summary.rows_inserted as i64)
    .bind(summary.rows_failed as i64)
    .bind(summary.error)
    .bind(run_id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::db::connect_in_memory;
    use store::schema::bootstrap;
    use store::StoreKind;

    #[tokio::test]
    async fn only_loaded_runs_count_as_last_hash() {
        let pool = connect_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        bootstrap(&mut conn, StoreKind::Pesca).await.unwrap();

        assert_eq!(last_loaded_hash(&mut conn, "prod").await.unwrap(), None);

        let failed = start_run(&mut conn, "prod").await.unwrap();
        finish_run(
            &mut conn,
            failed,
            RunStatus::Failed,
            &RunSummary {
                error: Some("HTTP 503"),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(last_loaded_hash(&mut conn, "prod").await.unwrap(), None);

        let ok = start_run(&mut conn, "prod").await.unwrap();
        finish_run(
            &mut conn,
            ok,
            RunStatus::Partial,
            &RunSummary {
                content_hash: Some("sha256:abc"),
                rows_inserted: 10,
                rows_failed: 1,
                error: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(
            last_loaded_hash(&mut conn, "prod").await.unwrap().as_deref(),
            Some("sha256:abc")
        );
        assert_eq!(last_loaded_hash(&mut conn, "other").await.unwrap(), None);

        let (status, inserted): (String, i64) =
            sqlx::query_as("SELECT status, rows_inserted FROM import_runs WHERE run_id = ?")
                .bind(ok.to_string())
                .fetch_one(&mut *conn)
                .await
                .unwrap();
        assert_eq!(status, "partial");
        assert_eq!(inserted, 10);
    }
}
