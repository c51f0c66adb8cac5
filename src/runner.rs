use crate::client::Client;
use crate::errors::ShutdownError;
use crate::job_registry::JobRegistry;
use crate::worker::Worker;
use crate::BackgroundJob;
use futures_util::future::join_all;
use sqlx::SqlitePool;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

/// How long a worker sleeps between two ticks by default.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// How long a claimed job stays leased to its worker by default.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_JITTER: Duration = Duration::ZERO;

/// The core runner responsible for claiming and running jobs
pub struct Runner<Context: Clone + Send + Sync + 'static> {
    connection_pool: SqlitePool,
    job_registry: JobRegistry<Context>,
    context: Context,
    num_workers: usize,
    poll_interval: Duration,
    jitter: Duration,
    lease_duration: Duration,
    shutdown_when_queue_empty: bool,
    shutdown: CancellationToken,
}

impl<Context: std::fmt::Debug + Clone + Send + Sync + 'static> std::fmt::Debug for Runner<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("job_registry", &self.job_registry)
            .field("context", &self.context)
            .field("num_workers", &self.num_workers)
            .field("poll_interval", &self.poll_interval)
            .field("jitter", &self.jitter)
            .field("lease_duration", &self.lease_duration)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish_non_exhaustive()
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context> {
    /// Create a new runner with the given connection pool and context.
    pub fn new(connection_pool: SqlitePool, context: Context) -> Self {
        Self {
            connection_pool,
            job_registry: JobRegistry::default(),
            context,
            num_workers: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            lease_duration: DEFAULT_LEASE_DURATION,
            shutdown_when_queue_empty: false,
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a job type to be processed by this runner.
    ///
    /// A later registration under the same [`BackgroundJob::JOB_NAME`]
    /// replaces this one.
    #[must_use]
    pub fn register_job_type<J: BackgroundJob<Context = Context>>(mut self) -> Self {
        self.job_registry.register::<J>();
        self
    }

    /// Register a handler receiving the raw JSON parameters of jobs named `name`.
    ///
    /// A later registration under the same name replaces this one.
    #[must_use]
    pub fn register_handler<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Context, CancellationToken, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.job_registry.register_fn(name, handler);
        self
    }

    /// Set the number of concurrent polling loops.
    #[must_use]
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set how long workers sleep between two ticks.
    #[must_use]
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling for jobs simultaneously. The actual jitter applied will
    /// be a random value between 0 and the specified duration.
    #[must_use]
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set how long a claimed job is leased to the worker running it.
    ///
    /// The lease must outlast the slowest handler. Once it expires, another
    /// worker may claim and run the same job again.
    #[must_use]
    pub fn lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    /// Set the runner to shut down when the job queue is empty.
    #[must_use]
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Use `token` to request a shutdown, e.g. a token shared with an HTTP server.
    #[must_use]
    pub fn shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// A client enqueueing jobs into the database used by this runner.
    pub fn client(&self) -> Client {
        Client::new(self.connection_pool.clone())
    }

    /// Start the background workers.
    ///
    /// This returns a [`RunHandle`] which can be used to request a shutdown
    /// and wait for the workers to stop.
    pub fn start(&self) -> RunHandle {
        let job_registry = Arc::new(self.job_registry.clone());
        info!(job_names = ?job_registry.job_names(), "Starting background workers…");

        let mut handles = Vec::with_capacity(self.num_workers);
        for i in 1..=self.num_workers {
            let name = format!("background-worker-{i}");
            info!(worker.name = %name, "Starting worker…");

            let worker = Worker {
                connection_pool: self.connection_pool.clone(),
                context: self.context.clone(),
                job_registry: job_registry.clone(),
                shutdown_when_queue_empty: self.shutdown_when_queue_empty,
                poll_interval: self.poll_interval,
                jitter: self.jitter,
                lease_duration: self.lease_duration,
                shutdown: self.shutdown.clone(),
            };

            let span = info_span!("worker", worker.name = %name);
            let handle = tokio::spawn(async move { worker.run().instrument(span).await });

            handles.push(handle);
        }

        RunHandle {
            handles,
            shutdown: self.shutdown.clone(),
        }
    }
}

/// Handle to a running background job processing system
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl RunHandle {
    /// Ask the workers to stop after their current tick.
    ///
    /// This never blocks and may be called any number of times, including
    /// after the workers already stopped.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// The token cancelled by [`shutdown`](Self::shutdown).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Wait for all background workers to shut down.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Background worker task panicked");
            }
        });
    }

    /// Request a shutdown and wait at most `timeout` for the workers to stop.
    ///
    /// Workers still running a job when the timeout elapses are left running
    /// in the background.
    pub async fn shutdown_with_timeout(self, timeout: Duration) -> Result<(), ShutdownError> {
        self.shutdown();
        tokio::time::timeout(timeout, self.wait_for_shutdown())
            .await
            .map_err(|_| ShutdownError::Timeout(timeout))
    }
}
