//! Backend-agnostic `Store` trait and the domain records it persists.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;

/// Conversation stage for a user. A monotone lattice: the store only ever
/// advances a stage, never regresses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    New,
    Greeted,
    GiftEnrolled,
}

impl Stage {
    /// Lattice rank. Higher ranks supersede lower ones.
    pub fn rank(self) -> i64 {
        match self {
            Stage::New => 0,
            Stage::Greeted => 1,
            Stage::GiftEnrolled => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::New => "new",
            Stage::Greeted => "greeted",
            Stage::GiftEnrolled => "gift_enrolled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "greeted" => Stage::Greeted,
            "gift_enrolled" => Stage::GiftEnrolled,
            _ => Stage::New,
        }
    }
}

/// Per-user conversation record. At most one per user id, created lazily on
/// the first inbound event; `joined_at` is immutable once set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub user_id: String,
    pub stage: Stage,
    pub joined_at: DateTime<Utc>,
}

/// Lifecycle of a scheduled drip job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its fire time (or a retry window).
    Pending,
    /// Claimed by a fire-loop worker; released back to pending on failure.
    InFlight,
    /// Delivered exactly once. Terminal.
    Fired,
    /// Administratively cancelled before firing. Terminal.
    Cancelled,
    /// Retries exhausted. Terminal, surfaced for operator visibility.
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InFlight => "inflight",
            JobStatus::Fired => "fired",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "inflight" => JobStatus::InFlight,
            "fired" => JobStatus::Fired,
            "cancelled" => JobStatus::Cancelled,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Pending,
        }
    }
}

/// A persisted one-shot delivery job.
///
/// `id` is a monotone row id: jobs inserted earlier in a batch sort lower,
/// which is the deterministic tie-break for equal `fire_at` values.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScheduledJob {
    pub id: i64,
    pub batch_id: Uuid,
    pub campaign_id: String,
    pub user_id: String,
    pub message_key: String,
    pub fire_at: DateTime<Utc>,
    pub status: JobStatus,
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub fired_at: Option<DateTime<Utc>>,
}

/// One enrollment batch, inserted atomically.
#[derive(Debug, Clone)]
pub struct JobBatch {
    pub batch_id: Uuid,
    pub campaign_id: String,
    pub user_id: String,
    /// (message_key, fire_at) in campaign order.
    pub entries: Vec<(String, DateTime<Utc>)>,
    pub created_at: DateTime<Utc>,
}

/// Backend-agnostic persistence for users and scheduled jobs.
#[async_trait]
pub trait Store: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Users ───────────────────────────────────────────────────────

    /// Fetch the user record, creating it at stage `new` if this is the
    /// first sighting. Returns `(record, is_new)`.
    async fn get_or_create_user(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(UserRecord, bool), DatabaseError>;

    /// Get a user record if it exists.
    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, DatabaseError>;

    /// Advance a user's stage. A no-op if the stored stage already ranks
    /// equal or higher (stages never regress).
    async fn advance_stage(&self, user_id: &str, stage: Stage) -> Result<(), DatabaseError>;

    // ── Scheduled jobs ──────────────────────────────────────────────

    /// Insert an enrollment batch. Returns the persisted jobs in insertion
    /// order, row ids assigned.
    async fn insert_jobs(&self, batch: &JobBatch) -> Result<Vec<ScheduledJob>, DatabaseError>;

    /// Jobs for `(campaign_id, user_id)` that are pending, in flight, or
    /// fired — the idempotent-enrollment probe. Cancelled and failed jobs
    /// do not block re-enrollment.
    async fn live_jobs(
        &self,
        campaign_id: &str,
        user_id: &str,
    ) -> Result<Vec<ScheduledJob>, DatabaseError>;

    /// Pending jobs due at `now` (fire time reached, retry window open),
    /// ordered by `fire_at` then row id.
    async fn due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>, DatabaseError>;

    /// Atomically claim a pending job for delivery. Returns `false` if the
    /// job was no longer pending (another worker got there first).
    async fn claim_job(&self, id: i64) -> Result<bool, DatabaseError>;

    /// Mark a claimed job as fired.
    async fn mark_fired(&self, id: i64, now: DateTime<Utc>) -> Result<(), DatabaseError>;

    /// Release a claimed job back to pending after a delivery failure,
    /// recording the attempt count and the next retry window.
    async fn release_job(
        &self,
        id: i64,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Mark a job as permanently failed.
    async fn mark_failed(&self, id: i64, now: DateTime<Utc>) -> Result<(), DatabaseError>;

    /// Cancel the pending jobs of one enrollment. Returns the count.
    async fn cancel_batch(&self, campaign_id: &str, user_id: &str)
    -> Result<usize, DatabaseError>;

    /// List jobs by status, most recent first (operator visibility).
    async fn jobs_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>, DatabaseError>;

    /// Reset orphaned in-flight jobs back to pending (crash recovery).
    /// Returns the count.
    async fn reset_inflight(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError>;
}
