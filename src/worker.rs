use crate::job_registry::JobRegistry;
use crate::schema::Job;
use crate::util::try_to_extract_panic_info;
use crate::{backoff, storage};
use anyhow::Context as _;
use chrono::{DateTime, TimeDelta, Utc};
use futures_util::FutureExt;
use rand::Rng;
use sqlx::SqlitePool;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

/// Outcome of a single claim-execute-resolve cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tick {
    /// No job was eligible.
    Idle,
    /// The handler succeeded and the job was deleted.
    Succeeded,
    /// The handler failed and the job was scheduled for another attempt.
    Rescheduled,
    /// The handler failed on the last allowed attempt.
    Failed,
    /// No handler is registered under the job name.
    HandlerNotFound,
}

pub(crate) struct Worker<Context> {
    pub(crate) connection_pool: SqlitePool,
    pub(crate) context: Context,
    pub(crate) job_registry: Arc<JobRegistry<Context>>,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
    pub(crate) lease_duration: Duration,
    pub(crate) shutdown: CancellationToken,
}

impl<Context: Clone + Send + Sync + 'static> Worker<Context> {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// The lease expiry for a job claimed at `now`.
    fn lease_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        TimeDelta::from_std(self.lease_duration)
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Run ticks until shutdown is requested, or until the queue is empty if
    /// `shutdown_when_queue_empty` is set.
    ///
    /// A shutdown request never interrupts a running job: the current tick
    /// completes first.
    #[allow(clippy::cognitive_complexity)]
    pub(crate) async fn run(&self) {
        while !self.shutdown.is_cancelled() {
            match self.run_next_job().await {
                Ok(Tick::Idle) if self.shutdown_when_queue_empty => {
                    debug!("No pending background jobs found. Shutting down the worker…");
                    break;
                }
                Ok(Tick::Idle) => trace!("No pending background jobs found"),
                Ok(_) => {}
                Err(error) => error!("Failed to run job: {error:#}"),
            }

            let sleep_duration = self.sleep_duration_with_jitter();
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => {}
                () = sleep(sleep_duration) => {}
            }
        }

        debug!("Worker stopped");
    }

    /// Claim the next eligible job, if there is one, and run it.
    ///
    /// Errors are storage failures. Handler failures are part of the
    /// returned [`Tick`].
    pub(crate) async fn run_next_job(&self) -> anyhow::Result<Tick> {
        let now = Utc::now();

        trace!("Looking for next background job…");
        let job = storage::claim_next_job(&self.connection_pool, now, self.lease_until(now))
            .await
            .context("Failed to claim next job")?;

        let Some(job) = job else {
            return Ok(Tick::Idle);
        };

        let span = info_span!(
            "job",
            job.id = %job.id,
            job.name = %job.name,
            job.attempts = job.attempts,
        );

        self.execute(job, now).instrument(span).await
    }

    async fn execute(&self, job: Job, now: DateTime<Utc>) -> anyhow::Result<Tick> {
        let pool = &self.connection_pool;

        let Some(run_task_fn) = self.job_registry.get(&job.name) else {
            error!(params = %job.params, "No handler registered for job. Marking it as failed…");
            storage::mark_job_failed(pool, &job.id, now)
                .await
                .context("Failed to mark job without handler as failed")?;
            return Ok(Tick::HandlerNotFound);
        };

        debug!("Running job…");
        let cancellation = self.shutdown.child_token();
        let future = async {
            run_task_fn(self.context.clone(), cancellation, job.params.clone()).await
        };

        let result = AssertUnwindSafe(future)
            .catch_unwind()
            .await
            .map_err(|e| try_to_extract_panic_info(&*e))
            // TODO: Replace with flatten() once that stabilizes
            .and_then(std::convert::identity);

        let error = match result {
            Ok(()) => {
                info!("Job completed");
                storage::delete_successful_job(pool, &job.id)
                    .await
                    .context("Failed to delete successful job")?;
                return Ok(Tick::Succeeded);
            }
            Err(error) => error,
        };

        let attempts = job.attempts.saturating_add(1);
        if attempts > job.max_attempts {
            error!(
                max_attempts = job.max_attempts,
                "Job failed with no remaining attempts: {error:#}"
            );
            storage::mark_job_failed(pool, &job.id, now)
                .await
                .context("Failed to mark exhausted job as failed")?;
            return Ok(Tick::Failed);
        }

        let at = backoff::next_attempt_at(Utc::now(), attempts);
        warn!(
            next_attempt = attempts,
            next_attempt_at = %at,
            "Job failed and will be retried: {error:#}"
        );
        storage::reschedule_failed_job(pool, &job.id, attempts, at)
            .await
            .context("Failed to reschedule failed job")?;

        Ok(Tick::Rescheduled)
    }
}
