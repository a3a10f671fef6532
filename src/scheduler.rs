//! Drip scheduler — durable, idempotent, exactly-once-fired delivery of
//! time-delayed messages.
//!
//! Enrollment turns a campaign definition into a batch of absolute-time
//! pending jobs. The fire loop claims due jobs one at a time (an atomic
//! pending→inflight transition in the store), delivers, and marks them
//! fired; a lost claim means another worker owns the job. Transport
//! failures release the job back to pending with exponential backoff until
//! the attempt budget runs out.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::campaign::CampaignRegistry;
use crate::catalog::MessageCatalog;
use crate::error::{DatabaseError, DeliveryError, EnrollmentError};
use crate::gateway::DeliveryGateway;
use crate::store::{JobBatch, ScheduledJob, Store};

/// Jobs examined per tick. A tick that hits the cap simply leaves the rest
/// for the next cadence.
const TICK_BATCH_LIMIT: usize = 100;

/// Base delay for delivery retries.
const RETRY_BASE: Duration = Duration::from_secs(5);

/// Cap for the exponential retry delay.
const RETRY_CAP: Duration = Duration::from_secs(300);

/// The delayed-delivery scheduler.
pub struct DripScheduler {
    store: Arc<dyn Store>,
    registry: CampaignRegistry,
    gateway: Arc<dyn DeliveryGateway>,
    catalog: MessageCatalog,
    max_attempts: u32,
}

impl DripScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        registry: CampaignRegistry,
        gateway: Arc<dyn DeliveryGateway>,
        catalog: MessageCatalog,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            registry,
            gateway,
            catalog,
            max_attempts,
        }
    }

    /// Enroll a user in a campaign at reference time `now`.
    ///
    /// Idempotent per (campaign, user): while any job from a previous batch
    /// is pending, in flight, or fired, the existing batch is returned and
    /// nothing new is created. Re-enrollment is possible only after a full
    /// administrative cancellation.
    ///
    /// Callers must serialize enrollments per user (the inbound handler's
    /// per-user lock does this); the probe-then-insert here is not atomic.
    pub async fn enroll(
        &self,
        campaign_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledJob>, EnrollmentError> {
        if user_id.is_empty() {
            return Err(EnrollmentError::EmptyUserId);
        }
        let campaign =
            self.registry
                .get(campaign_id)
                .ok_or_else(|| EnrollmentError::UnknownCampaign {
                    campaign_id: campaign_id.to_string(),
                })?;

        let existing = self.store.live_jobs(campaign_id, user_id).await?;
        if !existing.is_empty() {
            debug!(
                campaign_id,
                user_id,
                jobs = existing.len(),
                "Enrollment already live, returning existing batch"
            );
            return Ok(existing);
        }

        let batch = JobBatch {
            batch_id: Uuid::new_v4(),
            campaign_id: campaign_id.to_string(),
            user_id: user_id.to_string(),
            entries: campaign
                .steps
                .iter()
                .map(|s| (s.message_key.to_string(), now + s.offset))
                .collect(),
            created_at: now,
        };

        let jobs = self.store.insert_jobs(&batch).await?;
        info!(
            campaign_id,
            user_id,
            batch_id = %batch.batch_id,
            jobs = jobs.len(),
            "Enrolled drip campaign"
        );
        Ok(jobs)
    }

    /// Administratively cancel a user's pending enrollment jobs.
    pub async fn cancel_enrollment(
        &self,
        campaign_id: &str,
        user_id: &str,
    ) -> Result<usize, DatabaseError> {
        let cancelled = self.store.cancel_batch(campaign_id, user_id).await?;
        if cancelled > 0 {
            info!(campaign_id, user_id, cancelled, "Cancelled enrollment");
        }
        Ok(cancelled)
    }

    /// Startup recovery: release claims orphaned by a previous process.
    /// Past-due pending jobs then fire on the first tick — the store is the
    /// sole source of truth, not in-memory timers.
    pub async fn recover(&self, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        let reset = self.store.reset_inflight(now).await?;
        if reset > 0 {
            info!(reset, "Released orphaned in-flight jobs");
        }
        Ok(())
    }

    /// One fire-loop tick: deliver every due job, in (fire_at, id) order.
    ///
    /// Returns the number of jobs fired. A store error aborts the tick;
    /// the next cadence retries. Safe to run concurrently with other ticks
    /// or scheduler instances — the per-job claim arbitrates.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let due = self.store.due_jobs(now, TICK_BATCH_LIMIT).await?;
        if due.is_empty() {
            return Ok(0);
        }

        let mut fired = 0;
        for job in due {
            if !self.store.claim_job(job.id).await? {
                // Another worker won the claim.
                continue;
            }
            if self.fire_job(&job, now).await? {
                fired += 1;
            }
        }
        Ok(fired)
    }

    /// Deliver one claimed job. Returns whether it was marked fired.
    async fn fire_job(&self, job: &ScheduledJob, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let text = match self.catalog.lookup(&job.message_key) {
            Ok(text) => text,
            Err(e) => {
                // A catalog miss never resolves by retrying.
                error!(job_id = job.id, message_key = %job.message_key, "Catalog miss: {e}");
                self.store.mark_failed(job.id, now).await?;
                return Ok(false);
            }
        };

        match self.gateway.push(&job.user_id, text).await {
            Ok(()) => {
                self.store.mark_fired(job.id, now).await?;
                info!(
                    job_id = job.id,
                    user_id = %job.user_id,
                    message_key = %job.message_key,
                    "Drip message fired"
                );
                Ok(true)
            }
            Err(e) => {
                self.handle_delivery_failure(job, now, &e).await?;
                Ok(false)
            }
        }
    }

    async fn handle_delivery_failure(
        &self,
        job: &ScheduledJob,
        now: DateTime<Utc>,
        err: &DeliveryError,
    ) -> Result<(), DatabaseError> {
        let attempts = job.attempts + 1;
        if attempts >= self.max_attempts {
            warn!(
                job_id = job.id,
                user_id = %job.user_id,
                attempts,
                "Delivery retries exhausted, marking job failed: {err}"
            );
            self.store.mark_failed(job.id, now).await?;
        } else {
            let delay = retry_backoff(attempts);
            warn!(
                job_id = job.id,
                user_id = %job.user_id,
                attempts,
                retry_in_secs = delay.as_secs(),
                "Delivery failed, job stays pending: {err}"
            );
            let next_attempt_at = now
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(5));
            self.store.release_job(job.id, attempts, next_attempt_at).await?;
        }
        Ok(())
    }
}

/// Exponential backoff with jitter: base * 2^(attempts-1), capped.
fn retry_backoff(attempts: u32) -> Duration {
    let exp = attempts.saturating_sub(1).min(16);
    let delay = RETRY_BASE.saturating_mul(2u32.saturating_pow(exp)).min(RETRY_CAP);
    let jitter = rand::thread_rng().gen_range(0..=1000);
    delay + Duration::from_millis(jitter)
}

/// Spawn the fire-loop background task: recover once, then tick forever.
pub fn spawn_fire_loop(scheduler: Arc<DripScheduler>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Fire loop started");

        if let Err(e) = scheduler.recover(Utc::now()).await {
            error!("Startup recovery failed: {e}");
        }

        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match scheduler.run_tick(Utc::now()).await {
                Ok(0) => {}
                Ok(fired) => debug!(fired, "Fire-loop tick complete"),
                Err(e) => error!("Fire-loop tick aborted: {e}"),
            }
        }
    })
}
