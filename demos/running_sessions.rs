//! Runs the two jobs of a running-activity tracker against a local database.
//!
//! ```bash
//! DATABASE_URL=sqlite://jobs.db?mode=rwc cargo run --example running_sessions
//! ```
//!
//! Press Ctrl+C to stop the workers.

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use jobs::{BackgroundJob, CancellationToken, Runner, failed_jobs, setup_database};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Stand-in for the application layer the jobs call into
#[derive(Clone, Default)]
struct Application {
    sessions: Arc<Mutex<HashSet<String>>>,
}

impl Application {
    fn track(&self, slug: String) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(slug);
        }
    }

    fn delete(&self, slug: &str) -> Result<()> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| anyhow::anyhow!("session store poisoned"))?;
        anyhow::ensure!(sessions.remove(slug), "unknown running session {slug}");
        Ok(())
    }
}

/// Parses an uploaded GPX file and stores the running session
#[derive(Serialize, Deserialize)]
struct TrackRunningSessionJob {
    when: DateTime<Utc>,
    filepath: String,
}

impl BackgroundJob for TrackRunningSessionJob {
    const JOB_NAME: &'static str = "track-running-session-job";
    type Context = Application;

    async fn run(&self, app: Self::Context, _cancellation: CancellationToken) -> Result<()> {
        let gpx = tokio::fs::read_to_string(&self.filepath)
            .await
            .with_context(|| format!("can't open gpxfile (path={})", self.filepath))?;

        let slug = format!("{}-run", self.when.format("%Y-%m-%d"));
        info!(%slug, bytes = gpx.len(), "Tracked running session");
        app.track(slug);
        Ok(())
    }
}

/// Deletes a stored running session
#[derive(Serialize, Deserialize)]
struct DeleteRunningSessionJob {
    slug: String,
}

impl BackgroundJob for DeleteRunningSessionJob {
    const JOB_NAME: &'static str = "delete-running-session-job";
    type Context = Application;

    async fn run(&self, app: Self::Context, _cancellation: CancellationToken) -> Result<()> {
        app.delete(&self.slug)?;
        info!(slug = %self.slug, "Deleted running session");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,running_sessions=info,jobs=info".into()),
        )
        .compact()
        .init();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://jobs.db?mode=rwc".into());
    let pool = SqlitePool::connect(&database_url).await?;
    setup_database(&pool).await?;

    let runner = Runner::new(pool.clone(), Application::default())
        .register_job_type::<TrackRunningSessionJob>()
        .register_job_type::<DeleteRunningSessionJob>()
        .poll_interval(Duration::from_secs(1))
        .jitter(Duration::from_millis(200));

    let client = runner.client();
    TrackRunningSessionJob {
        when: Utc::now(),
        filepath: "Cargo.toml".into(),
    }
    .enqueue(&client)
    .await?;
    DeleteRunningSessionJob {
        slug: "never-tracked".into(),
    }
    .enqueue(&client)
    .await?;
    info!("Enqueued 2 jobs");

    let handle = runner.start();
    tokio::signal::ctrl_c().await?;
    info!("Shutting down…");
    handle.shutdown_with_timeout(Duration::from_secs(30)).await?;

    for job in failed_jobs(&pool).await? {
        warn!(job.id = %job.id, job.name = %job.name, "Job needs operator attention");
    }

    Ok(())
}
