use crate::errors::EnqueueError;
use crate::storage::{self, NewJobRow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::instrument;
use uuid::Uuid;

/// The default number of attempts a job gets before it is marked as failed.
pub const DEFAULT_MAX_ATTEMPTS: i64 = 10;

/// A job ready to be enqueued.
///
/// Built from a handler name and serializable parameters. By default the job
/// is eligible immediately and uses the attempts ceiling of the [`Client`]
/// enqueueing it.
#[derive(Debug, Clone)]
pub struct NewJob {
    name: String,
    params: String,
    at: Option<DateTime<Utc>>,
    max_attempts: Option<i64>,
}

impl NewJob {
    /// Create a new job for the handler registered under `name`.
    pub fn new<P: Serialize + ?Sized>(
        name: impl Into<String>,
        params: &P,
    ) -> Result<Self, EnqueueError> {
        let name = name.into();
        if name.is_empty() {
            return Err(EnqueueError::EmptyJobName);
        }

        Ok(Self {
            name,
            params: serde_json::to_string(params)?,
            at: None,
            max_attempts: None,
        })
    }

    /// Delay the first attempt until `at`.
    #[must_use]
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.at = Some(at);
        self
    }

    /// Override the number of attempts before the job is marked as failed.
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: i64) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// The handler name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The serialized parameters.
    pub fn params(&self) -> &str {
        &self.params
    }
}

/// Inserts jobs into the queue.
///
/// Enqueueing is fire-and-forget: no job identifier is returned. Callers that
/// need to correlate a job with their own data must put a key in the params.
#[derive(Debug, Clone)]
pub struct Client {
    connection_pool: SqlitePool,
    max_attempts: i64,
}

impl Client {
    /// Create a client using [`DEFAULT_MAX_ATTEMPTS`] for new jobs.
    pub fn new(connection_pool: SqlitePool) -> Self {
        Self {
            connection_pool,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Set the attempts ceiling used for jobs that don't specify their own.
    ///
    /// Enqueueing such a job fails with [`EnqueueError::InvalidMaxAttempts`]
    /// if the ceiling is below 1.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: i64) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// The attempts ceiling used for jobs that don't specify their own.
    pub fn max_attempts(&self) -> i64 {
        self.max_attempts
    }

    /// Enqueue a job for the handler registered under `name`.
    ///
    /// The job becomes eligible immediately.
    pub async fn enqueue<P: Serialize + ?Sized>(
        &self,
        name: &str,
        params: &P,
    ) -> Result<(), EnqueueError> {
        self.enqueue_job(NewJob::new(name, params)?).await
    }

    /// Enqueue a prepared job.
    #[instrument(name = "jobs.enqueue", skip_all, fields(job.name = %job.name))]
    pub async fn enqueue_job(&self, job: NewJob) -> Result<(), EnqueueError> {
        let max_attempts = job.max_attempts.unwrap_or(self.max_attempts);
        if max_attempts < 1 {
            return Err(EnqueueError::InvalidMaxAttempts(max_attempts));
        }

        let id = Uuid::new_v4().to_string();
        let row = NewJobRow {
            id: &id,
            name: &job.name,
            params: &job.params,
            at: job.at.unwrap_or_else(Utc::now),
            max_attempts,
        };

        storage::insert_job(&self.connection_pool, &row).await?;
        Ok(())
    }
}
