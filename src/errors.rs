use std::time::Duration;

/// Errors that can occur while enqueueing a job.
///
/// Nothing is persisted when one of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    /// The job name was empty.
    #[error("Job name must not be empty")]
    EmptyJobName,

    /// The attempts ceiling was lower than one.
    #[error("Job max attempts must be at least 1, got {0}")]
    InvalidMaxAttempts(i64),

    /// Failed to serialize the job parameters.
    #[error(transparent)]
    SerializationError(#[from] serde_json::Error),

    /// Database error occurred while inserting the job.
    #[error(transparent)]
    DatabaseError(#[from] sqlx::Error),
}

/// Errors that can occur while stopping a running [`Runner`](crate::Runner).
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    /// The workers were still busy when the grace period ran out.
    #[error("Background workers did not shut down within {0:?}")]
    Timeout(Duration),
}
