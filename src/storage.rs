use crate::schema::{Job, encode_timestamp};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

/// The columns selected by every statement returning a [`Job`].
const JOB_COLUMNS: &str = "id, name, params, at, attempts, max_attempts, locked_until, failed";

/// A job that has not been persisted yet.
pub(crate) struct NewJobRow<'a> {
    pub(crate) id: &'a str,
    pub(crate) name: &'a str,
    pub(crate) params: &'a str,
    pub(crate) at: DateTime<Utc>,
    pub(crate) max_attempts: i64,
}

/// Inserts a new job with its first attempt pending.
pub(crate) async fn insert_job(pool: &SqlitePool, job: &NewJobRow<'_>) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO jobs (id, name, params, at, attempts, max_attempts)
        VALUES ($1, $2, $3, $4, 1, $5)
        ",
    )
    .bind(job.id)
    .bind(job.name)
    .bind(job.params)
    .bind(encode_timestamp(job.at))
    .bind(job.max_attempts)
    .execute(pool)
    .await?;
    Ok(())
}

/// Claims the oldest eligible job by leasing it until `locked_until`.
///
/// Selection and locking happen in a single statement, so two workers can
/// never lease the same row at the same time.
pub(crate) async fn claim_next_job(
    pool: &SqlitePool,
    now: DateTime<Utc>,
    locked_until: DateTime<Utc>,
) -> Result<Option<Job>, sqlx::Error> {
    let query = format!(
        r"
        UPDATE jobs
        SET locked_until = $1
        WHERE id = (
            SELECT id
            FROM jobs
            WHERE failed IS NULL
              AND attempts <= max_attempts
              AND at <= $2
              AND (locked_until IS NULL OR locked_until <= $2)
            ORDER BY at ASC
            LIMIT 1
        )
        RETURNING {JOB_COLUMNS}
        "
    );

    sqlx::query_as::<_, Job>(&query)
        .bind(encode_timestamp(locked_until))
        .bind(encode_timestamp(now))
        .fetch_optional(pool)
        .await
}

/// Deletes a job that has successfully completed running
pub(crate) async fn delete_successful_job(pool: &SqlitePool, job_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM jobs WHERE id = $1")
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Records a failed attempt and releases the lease until the next one is due.
pub(crate) async fn reschedule_failed_job(
    pool: &SqlitePool,
    job_id: &str,
    attempts: i64,
    at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE jobs SET attempts = $1, at = $2, locked_until = NULL WHERE id = $3")
        .bind(attempts)
        .bind(encode_timestamp(at))
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Marks a job as permanently failed. It is never claimed again.
pub(crate) async fn mark_job_failed(
    pool: &SqlitePool,
    job_id: &str,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE jobs SET failed = $1, locked_until = NULL WHERE id = $2")
        .bind(encode_timestamp(now))
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// The number of jobs that failed permanently
pub async fn failed_job_count(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM jobs WHERE failed IS NOT NULL")
        .fetch_one(pool)
        .await
}

/// Get the jobs that failed permanently, oldest failure first
pub async fn failed_jobs(pool: &SqlitePool) -> Result<Vec<Job>, sqlx::Error> {
    let query =
        format!("SELECT {JOB_COLUMNS} FROM jobs WHERE failed IS NOT NULL ORDER BY failed ASC");

    sqlx::query_as::<_, Job>(&query).fetch_all(pool).await
}

/// Puts a permanently failed job back into the queue with a fresh attempt budget.
///
/// The retry counts as the next attempt and the ceiling is raised by the
/// job's original `max_attempts`, so `attempts` keeps increasing.
///
/// Returns `false` if no failed job with this id exists.
pub async fn retry_failed_job(pool: &SqlitePool, job_id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r"
        UPDATE jobs
        SET failed = NULL,
            locked_until = NULL,
            attempts = attempts + 1,
            max_attempts = max_attempts + attempts,
            at = $1
        WHERE id = $2 AND failed IS NOT NULL
        ",
    )
    .bind(encode_timestamp(Utc::now()))
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup_database;
    use chrono::TimeDelta;
    use claims::{assert_none, assert_ok, assert_some};
    use futures_util::future::join_all;
    use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
    use tempfile::TempDir;

    fn lease(now: DateTime<Utc>) -> DateTime<Utc> {
        now + TimeDelta::minutes(1)
    }

    async fn setup_test_db() -> anyhow::Result<SqlitePool> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        setup_database(&pool).await?;
        Ok(pool)
    }

    /// A database file with several connections, so claims really run side by side.
    async fn setup_shared_db(dir: &TempDir) -> anyhow::Result<SqlitePool> {
        let options = SqliteConnectOptions::new()
            .filename(dir.path().join("jobs.db"))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        setup_database(&pool).await?;
        Ok(pool)
    }

    async fn insert(pool: &SqlitePool, id: &str, at: DateTime<Utc>, max_attempts: i64) {
        let row = NewJobRow {
            id,
            name: "test",
            params: "null",
            at,
            max_attempts,
        };
        assert_ok!(insert_job(pool, &row).await);
    }

    #[tokio::test]
    async fn claim_returns_nothing_on_empty_queue() -> anyhow::Result<()> {
        let pool = setup_test_db().await?;
        let now = Utc::now();

        assert_none!(claim_next_job(&pool, now, lease(now)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn claim_leases_the_job() -> anyhow::Result<()> {
        let pool = setup_test_db().await?;
        let now = Utc::now();
        insert(&pool, "a", now - TimeDelta::seconds(1), 10).await;

        let job = assert_some!(claim_next_job(&pool, now, lease(now)).await?);
        assert_eq!(job.id, "a");
        assert_eq!(job.name, "test");
        assert_eq!(job.attempts, 1);
        assert_eq!(job.max_attempts, 10);
        assert_eq!(
            job.locked_until.map(encode_timestamp),
            Some(encode_timestamp(lease(now)))
        );

        // The lease holds for any later claim until it expires
        assert_none!(claim_next_job(&pool, now, lease(now)).await?);
        let later = now + TimeDelta::seconds(59);
        assert_none!(claim_next_job(&pool, later, lease(later)).await?);

        let expired = lease(now);
        let job = assert_some!(claim_next_job(&pool, expired, lease(expired)).await?);
        assert_eq!(job.id, "a");
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_a_job() -> anyhow::Result<()> {
        let pool = setup_test_db().await?;
        let now = Utc::now();
        insert(&pool, "a", now - TimeDelta::seconds(1), 10).await;

        let (first, second) = tokio::join!(
            claim_next_job(&pool, now, lease(now)),
            claim_next_job(&pool, now, lease(now)),
        );

        let claimed = [first?, second?].into_iter().flatten().count();
        assert_eq!(claimed, 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn claims_from_separate_connections_never_share_a_job() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pool = setup_shared_db(&dir).await?;
        let now = Utc::now();

        let mut expected = Vec::new();
        for i in 0..50 {
            let id = format!("job-{i}");
            insert(&pool, &id, now - TimeDelta::seconds(1), 10).await;
            expected.push(id);
        }

        let claimers = (0..8).map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move {
                let mut ids = Vec::new();
                while let Some(job) = claim_next_job(&pool, now, lease(now)).await? {
                    ids.push(job.id);
                }
                Ok::<_, sqlx::Error>(ids)
            })
        });

        let mut claimed = Vec::new();
        for result in join_all(claimers).await {
            claimed.extend(result??);
        }

        claimed.sort_unstable();
        expected.sort_unstable();
        assert_eq!(claimed, expected);
        Ok(())
    }

    #[tokio::test]
    async fn claim_picks_the_oldest_job_first() -> anyhow::Result<()> {
        let pool = setup_test_db().await?;
        let now = Utc::now();
        insert(&pool, "newer", now - TimeDelta::seconds(10), 10).await;
        insert(&pool, "older", now - TimeDelta::seconds(20), 10).await;

        let first = assert_some!(claim_next_job(&pool, now, lease(now)).await?);
        let second = assert_some!(claim_next_job(&pool, now, lease(now)).await?);
        assert_eq!(first.id, "older");
        assert_eq!(second.id, "newer");
        Ok(())
    }

    #[tokio::test]
    async fn claim_skips_jobs_scheduled_in_the_future() -> anyhow::Result<()> {
        let pool = setup_test_db().await?;
        let now = Utc::now();
        insert(&pool, "a", now + TimeDelta::seconds(10), 10).await;

        assert_none!(claim_next_job(&pool, now, lease(now)).await?);

        let due = now + TimeDelta::seconds(10);
        assert_some!(claim_next_job(&pool, due, lease(due)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn failed_jobs_are_never_claimed() -> anyhow::Result<()> {
        let pool = setup_test_db().await?;
        let now = Utc::now();
        insert(&pool, "a", now - TimeDelta::seconds(1), 10).await;
        mark_job_failed(&pool, "a", now).await?;

        assert_none!(claim_next_job(&pool, now, lease(now)).await?);
        let much_later = now + TimeDelta::days(365);
        assert_none!(claim_next_job(&pool, much_later, lease(much_later)).await?);
        assert_eq!(failed_job_count(&pool).await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn exhausted_jobs_are_never_claimed() -> anyhow::Result<()> {
        let pool = setup_test_db().await?;
        let now = Utc::now();
        insert(&pool, "a", now - TimeDelta::seconds(1), 2).await;
        reschedule_failed_job(&pool, "a", 3, now - TimeDelta::seconds(1)).await?;

        assert_none!(claim_next_job(&pool, now, lease(now)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn rescheduling_releases_the_lease() -> anyhow::Result<()> {
        let pool = setup_test_db().await?;
        let now = Utc::now();
        insert(&pool, "a", now - TimeDelta::seconds(1), 10).await;
        assert_some!(claim_next_job(&pool, now, lease(now)).await?);

        let retry_at = now + TimeDelta::seconds(21);
        reschedule_failed_job(&pool, "a", 2, retry_at).await?;

        assert_none!(claim_next_job(&pool, now, lease(now)).await?);
        let job = assert_some!(claim_next_job(&pool, retry_at, lease(retry_at)).await?);
        assert_eq!(job.attempts, 2);
        assert_eq!(encode_timestamp(job.at), encode_timestamp(retry_at));
        Ok(())
    }

    #[tokio::test]
    async fn failed_jobs_can_be_retried_by_an_operator() -> anyhow::Result<()> {
        let pool = setup_test_db().await?;
        let now = Utc::now();
        insert(&pool, "a", now - TimeDelta::seconds(1), 1).await;
        mark_job_failed(&pool, "a", now).await?;

        let failed = failed_jobs(&pool).await?;
        assert_eq!(failed.len(), 1);
        assert!(failed.iter().all(Job::is_failed));

        assert!(retry_failed_job(&pool, "a").await?);
        assert!(!retry_failed_job(&pool, "a").await?);
        assert!(!retry_failed_job(&pool, "missing").await?);
        assert_eq!(failed_job_count(&pool).await?, 0);

        let later = Utc::now() + TimeDelta::seconds(1);
        let job = assert_some!(claim_next_job(&pool, later, lease(later)).await?);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.max_attempts, 2);
        Ok(())
    }
}
