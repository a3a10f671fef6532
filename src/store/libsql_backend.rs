//! libSQL backend — async `Store` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are persisted as
//! fixed-width RFC 3339 strings so lexicographic comparison in SQL matches
//! chronological order.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{JobBatch, JobStatus, ScheduledJob, Stage, Store, UserRecord};

/// Column list shared by every scheduled_jobs SELECT, in `row_to_job` order.
const JOB_COLUMNS: &str =
    "id, batch_id, campaign_id, user_id, message_key, fire_at, status, attempts, \
     next_attempt_at, created_at, fired_at";

/// libSQL store backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: fixed-width RFC 3339 with microseconds and `Z`.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Map a libsql Row to a ScheduledJob. Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<ScheduledJob, libsql::Error> {
    let id: i64 = row.get(0)?;
    let batch_str: String = row.get(1)?;
    let campaign_id: String = row.get(2)?;
    let user_id: String = row.get(3)?;
    let message_key: String = row.get(4)?;
    let fire_str: String = row.get(5)?;
    let status_str: String = row.get(6)?;
    let attempts: i64 = row.get(7)?;
    let next_attempt_str: Option<String> = row.get::<String>(8).ok();
    let created_str: String = row.get(9)?;
    let fired_str: Option<String> = row.get::<String>(10).ok();

    Ok(ScheduledJob {
        id,
        batch_id: Uuid::parse_str(&batch_str).unwrap_or_else(|_| Uuid::nil()),
        campaign_id,
        user_id,
        message_key,
        fire_at: parse_datetime(&fire_str),
        status: JobStatus::parse(&status_str),
        attempts: attempts.max(0) as u32,
        next_attempt_at: next_attempt_str.as_deref().map(parse_datetime),
        created_at: parse_datetime(&created_str),
        fired_at: fired_str.as_deref().map(parse_datetime),
    })
}

fn row_to_user(row: &libsql::Row) -> Result<UserRecord, libsql::Error> {
    let user_id: String = row.get(0)?;
    let stage_str: String = row.get(1)?;
    let joined_str: String = row.get(2)?;
    Ok(UserRecord {
        user_id,
        stage: Stage::parse(&stage_str),
        joined_at: parse_datetime(&joined_str),
    })
}

fn query_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

#[async_trait]
impl Store for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Users ───────────────────────────────────────────────────────

    async fn get_or_create_user(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(UserRecord, bool), DatabaseError> {
        // INSERT OR IGNORE keeps first-sighting detection race-free at the
        // database level: exactly one caller observes rows_affected == 1.
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO users (user_id, stage, joined_at) VALUES (?1, 'new', ?2)",
                params![user_id, fmt_ts(now)],
            )
            .await
            .map_err(query_err)?;

        let record = self
            .get_user(user_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "user".to_string(),
                id: user_id.to_string(),
            })?;

        Ok((record, inserted == 1))
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT user_id, stage, joined_at FROM users WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_user(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn advance_stage(&self, user_id: &str, stage: Stage) -> Result<(), DatabaseError> {
        // Rank guard keeps the stage lattice monotone even under races.
        self.conn()
            .execute(
                "UPDATE users SET stage = ?1 WHERE user_id = ?2
                 AND (CASE stage
                        WHEN 'greeted' THEN 1
                        WHEN 'gift_enrolled' THEN 2
                        ELSE 0
                      END) < ?3",
                params![stage.as_str(), user_id, stage.rank()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    // ── Scheduled jobs ──────────────────────────────────────────────

    async fn insert_jobs(&self, batch: &JobBatch) -> Result<Vec<ScheduledJob>, DatabaseError> {
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to open transaction: {e}")))?;

        for (message_key, fire_at) in &batch.entries {
            tx.execute(
                "INSERT INTO scheduled_jobs
                     (batch_id, campaign_id, user_id, message_key, fire_at,
                      status, attempts, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?6)",
                params![
                    batch.batch_id.to_string(),
                    batch.campaign_id.as_str(),
                    batch.user_id.as_str(),
                    message_key.as_str(),
                    fmt_ts(*fire_at),
                    fmt_ts(batch.created_at)
                ],
            )
            .await
            .map_err(query_err)?;
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to commit job batch: {e}")))?;

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE batch_id = ?1 ORDER BY id ASC"
                ),
                params![batch.batch_id.to_string()],
            )
            .await
            .map_err(query_err)?;

        let mut jobs = Vec::with_capacity(batch.entries.len());
        while let Some(row) = rows.next().await.map_err(query_err)? {
            jobs.push(row_to_job(&row).map_err(query_err)?);
        }
        Ok(jobs)
    }

    async fn live_jobs(
        &self,
        campaign_id: &str,
        user_id: &str,
    ) -> Result<Vec<ScheduledJob>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM scheduled_jobs
                     WHERE campaign_id = ?1 AND user_id = ?2
                       AND status IN ('pending', 'inflight', 'fired')
                     ORDER BY id ASC"
                ),
                params![campaign_id, user_id],
            )
            .await
            .map_err(query_err)?;

        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            jobs.push(row_to_job(&row).map_err(query_err)?);
        }
        Ok(jobs)
    }

    async fn due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>, DatabaseError> {
        let now_str = fmt_ts(now);
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM scheduled_jobs
                     WHERE status = 'pending' AND fire_at <= ?1
                       AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
                     ORDER BY fire_at ASC, id ASC
                     LIMIT ?2"
                ),
                params![now_str, limit as i64],
            )
            .await
            .map_err(query_err)?;

        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            jobs.push(row_to_job(&row).map_err(query_err)?);
        }
        Ok(jobs)
    }

    async fn claim_job(&self, id: i64) -> Result<bool, DatabaseError> {
        // The status guard makes the claim atomic: concurrent workers race
        // on this UPDATE and exactly one sees rows_affected == 1.
        let affected = self
            .conn()
            .execute(
                "UPDATE scheduled_jobs
                 SET status = 'inflight', updated_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, fmt_ts(Utc::now())],
            )
            .await
            .map_err(query_err)?;
        Ok(affected == 1)
    }

    async fn mark_fired(&self, id: i64, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE scheduled_jobs
                 SET status = 'fired', fired_at = ?2, updated_at = ?2
                 WHERE id = ?1 AND status = 'inflight'",
                params![id, fmt_ts(now)],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn release_job(
        &self,
        id: i64,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE scheduled_jobs
                 SET status = 'pending', attempts = ?2, next_attempt_at = ?3, updated_at = ?4
                 WHERE id = ?1 AND status = 'inflight'",
                params![id, attempts as i64, fmt_ts(next_attempt_at), fmt_ts(Utc::now())],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn mark_failed(&self, id: i64, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE scheduled_jobs
                 SET status = 'failed', updated_at = ?2
                 WHERE id = ?1 AND status IN ('pending', 'inflight')",
                params![id, fmt_ts(now)],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn cancel_batch(
        &self,
        campaign_id: &str,
        user_id: &str,
    ) -> Result<usize, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE scheduled_jobs
                 SET status = 'cancelled', updated_at = ?3
                 WHERE campaign_id = ?1 AND user_id = ?2 AND status = 'pending'",
                params![campaign_id, user_id, fmt_ts(Utc::now())],
            )
            .await
            .map_err(query_err)?;
        Ok(affected as usize)
    }

    async fn jobs_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM scheduled_jobs
                     WHERE status = ?1
                     ORDER BY id DESC
                     LIMIT ?2"
                ),
                params![status.as_str(), limit as i64],
            )
            .await
            .map_err(query_err)?;

        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            jobs.push(row_to_job(&row).map_err(query_err)?);
        }
        Ok(jobs)
    }

    async fn reset_inflight(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
        // In-flight jobs at startup are orphans from a previous run: no
        // delivery task survives a restart, so the claim is stale.
        let affected = self
            .conn()
            .execute(
                "UPDATE scheduled_jobs SET status = 'pending', updated_at = ?1
                 WHERE status = 'inflight'",
                params![fmt_ts(now)],
            )
            .await
            .map_err(query_err)?;
        Ok(affected as usize)
    }
}
