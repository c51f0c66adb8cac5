//! Database schema definitions for SQLx.
//!
//! This module contains the row type of the `jobs` table and the timestamp
//! encoding used by every statement touching it.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::FromRow;

/// Represents a job record in the `jobs` table
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Unique identifier for the job, assigned at enqueue time
    pub id: String,
    /// Name of the handler the job is dispatched to
    pub name: String,
    /// Serialized JSON parameters, opaque to the scheduler
    pub params: String,
    /// Earliest time at which the job may be claimed
    pub at: DateTime<Utc>,
    /// Number of attempts made so far, including the current one
    pub attempts: i64,
    /// Attempts ceiling after which the job is marked as failed
    pub max_attempts: i64,
    /// Lease expiry, set while a worker is executing the job
    pub locked_until: Option<DateTime<Utc>>,
    /// Set once the job failed permanently
    pub failed: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether the job reached a terminal failure state.
    pub fn is_failed(&self) -> bool {
        self.failed.is_some()
    }
}

/// Encodes a timestamp as fixed-width RFC 3339 text.
///
/// Columns are compared as text inside SQL, so every timestamp written by the
/// crate uses the same UTC form and microsecond precision.
pub(crate) fn encode_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}
