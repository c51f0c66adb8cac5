#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod background_job;
pub mod backoff;
mod client;
mod errors;
mod job_registry;
mod runner;
/// Database schema definitions.
pub mod schema;
mod storage;
mod util;
mod worker;

/// The main trait for defining background jobs.
pub use self::background_job::BackgroundJob;
/// Client for enqueueing jobs.
pub use self::client::{Client, DEFAULT_MAX_ATTEMPTS, NewJob};
/// Error types for enqueueing and shutdown.
pub use self::errors::{EnqueueError, ShutdownError};
/// The main runner that orchestrates job processing.
pub use self::runner::{DEFAULT_LEASE_DURATION, DEFAULT_POLL_INTERVAL, RunHandle, Runner};
/// Helpers for inspecting and recovering permanently failed jobs.
pub use self::storage::{failed_job_count, failed_jobs, retry_failed_job};
/// Token used to request shutdown and passed to running jobs.
pub use tokio_util::sync::CancellationToken;

use sqlx::SqlitePool;
use sqlx::migrate::MigrateError;

/// Create the `jobs` table, or bring it up to date.
///
/// Migrations are tracked by sqlx, so this can run on every start.
pub async fn setup_database(pool: &SqlitePool) -> Result<(), MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
