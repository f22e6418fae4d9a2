//! SQLite implementation of [`pod_manager::Repository`].
//!
//! One append-only table, `exchange_results`, keyed by the pod's radio
//! address. Every exchange this pod performs, successful or not, is one row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pod_common::{PodError, Result};
use pod_manager::{ExchangeResult, PodState, Repository};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

/// Persists exchange outcomes to a SQLite database.
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates the `exchange_results` table if it doesn't already exist.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS exchange_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                radio_address INTEGER NOT NULL,
                request_time INTEGER NOT NULL,
                result_time INTEGER NOT NULL,
                success INTEGER NOT NULL,
                exception TEXT,
                pod_snapshot TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_exchange_results_radio_address
                ON exchange_results(radio_address);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(sqlx_error)?;

        info!("initialized pod-store schema");
        Ok(())
    }

    /// Every row recorded for one pod, oldest first.
    pub async fn history(&self, radio_address: u32) -> Result<Vec<ExchangeResult>> {
        let rows = sqlx::query(
            "SELECT request_time, result_time, success, exception \
             FROM exchange_results WHERE radio_address = ? ORDER BY id ASC",
        )
        .bind(radio_address as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error)?;

        rows.iter().map(parse_row).collect()
    }
}

fn parse_row(row: &sqlx::sqlite::SqliteRow) -> Result<ExchangeResult> {
    let request_ms: i64 = row.get("request_time");
    let result_ms: i64 = row.get("result_time");
    let request_time = millis_to_datetime(request_ms)?;
    let result_time = millis_to_datetime(result_ms)?;
    Ok(ExchangeResult {
        request_time,
        result_time,
        success: row.get::<i64, _>("success") != 0,
        exception: row.try_get("exception").ok().flatten(),
    })
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| PodError::InternalError(format!("invalid stored timestamp {ms}")))
}

fn sqlx_error(err: sqlx::Error) -> PodError {
    PodError::InternalError(format!("sqlite error: {err}"))
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn save(&self, pod: &PodState, result: &ExchangeResult) -> Result<()> {
        let snapshot = serde_json::to_string(pod)
            .map_err(|e| PodError::InternalError(format!("failed to serialize pod state: {e}")))?;

        sqlx::query(
            "INSERT INTO exchange_results \
             (radio_address, request_time, result_time, success, exception, pod_snapshot) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(pod.radio_address as i64)
        .bind(result.request_time.timestamp_millis())
        .bind(result.result_time.timestamp_millis())
        .bind(result.success as i64)
        .bind(&result.exception)
        .bind(&snapshot)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error)?;

        debug!(radio_address = pod.radio_address, success = result.success, "saved exchange result");
        Ok(())
    }
}
