//! # Staging store
//!
//! Append-only side table holding payloads too large for NOTIFY. Rows are
//! read without being deleted, since several listener processes may need the
//! same row, and are removed only by the periodic reap sweep.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::{PgConnection, Row};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::error::{RelayError, Result};

/// Queries against one staging table
#[derive(Debug, Clone)]
pub struct StagingStore {
    table: String,
    create_sql: String,
    insert_sql: String,
    select_sql: String,
    delete_sql: String,
}

impl StagingStore {
    /// `table` must already be validated as a plain identifier
    pub fn new<S: Into<String>>(table: S) -> Self {
        let table = table.into();
        Self {
            create_sql: format!(
                "CREATE UNLOGGED TABLE IF NOT EXISTS {table} (\
                 id SERIAL PRIMARY KEY, \
                 payload TEXT NOT NULL, \
                 created_at TIMESTAMPTZ NOT NULL DEFAULT NOW())"
            ),
            insert_sql: format!(
                "INSERT INTO {table} (payload, created_at) VALUES ($1, $2) RETURNING id"
            ),
            select_sql: format!("SELECT payload FROM {table} WHERE id = $1"),
            delete_sql: format!("DELETE FROM {table} WHERE created_at < $1"),
            table,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the table if it does not exist
    pub async fn ensure_table(&self, conn: &mut PgConnection) -> Result<()> {
        sqlx::query(&self.create_sql).execute(&mut *conn).await?;
        Ok(())
    }

    /// Stage a payload and return its id.
    ///
    /// A missing table is created and the insert attempted exactly once more.
    #[instrument(skip(self, conn, payload), fields(table = %self.table, bytes = payload.len()))]
    pub async fn insert(&self, conn: &mut PgConnection, payload: &str) -> Result<i64> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_insert(conn, payload).await {
                Err(RelayError::SchemaMissing(error)) if attempt == 1 => {
                    info!(table = %self.table, "Staging table missing, creating it");
                    self.ensure_table(conn).await?;
                    debug!(cause = %error, "Retrying staged insert");
                }
                Err(RelayError::SchemaMissing(error)) => return Err(RelayError::Database(error)),
                other => return other,
            }
        }
    }

    async fn try_insert(&self, conn: &mut PgConnection, payload: &str) -> Result<i64> {
        let row = sqlx::query(&self.insert_sql)
            .bind(payload)
            .bind(Utc::now())
            .fetch_one(&mut *conn)
            .await?;
        let id: i32 = row.try_get("id")?;
        Ok(i64::from(id))
    }

    /// Read a staged payload without removing it
    #[instrument(skip(self, conn), fields(table = %self.table))]
    pub async fn fetch(&self, conn: &mut PgConnection, id: i64) -> Result<String> {
        let key = i32::try_from(id).map_err(|_| RelayError::NotFound { id })?;
        let row = match sqlx::query(&self.select_sql)
            .bind(key)
            .fetch_optional(&mut *conn)
            .await
        {
            Ok(row) => row,
            // No table means nothing was ever staged here
            Err(error) => match RelayError::from(error) {
                RelayError::SchemaMissing(_) => None,
                other => return Err(other),
            },
        };

        match row {
            Some(row) => Ok(row.try_get("payload")?),
            None => Err(RelayError::NotFound { id }),
        }
    }

    /// Delete every row created strictly before `older_than`
    #[instrument(skip(self, conn), fields(table = %self.table))]
    pub async fn reap(&self, conn: &mut PgConnection, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(&self.delete_sql)
            .bind(older_than)
            .execute(&mut *conn)
            .await?;
        let reaped = result.rows_affected();
        debug!(reaped, cutoff = %older_than, "Reaped staged payloads");
        Ok(reaped)
    }
}

/// When to sweep the staging table, and how far back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapPolicy {
    inserts_per_delete: i64,
    retention: Duration,
}

impl ReapPolicy {
    pub fn new(inserts_per_delete: i64, retention: Duration) -> Self {
        Self {
            inserts_per_delete: inserts_per_delete.max(1),
            retention,
        }
    }

    /// Sweep on every id that is an exact multiple of the cadence.
    ///
    /// Ids skipped by the sequence (rolled back inserts) can delay a sweep
    /// by a full cadence.
    pub fn should_reap(&self, id: i64) -> bool {
        id > 0 && id % self.inserts_per_delete == 0
    }

    /// Rows created before this instant are considered orphaned
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match ChronoDuration::from_std(self.retention) {
            Ok(retention) => now - retention,
            Err(_) => {
                warn!(retention = ?self.retention, "Retention out of range, reaping nothing");
                DateTime::<Utc>::MIN_UTC
            }
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }
}
