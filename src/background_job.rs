use crate::client::{Client, NewJob};
use crate::errors::EnqueueError;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Trait for defining background jobs that can be enqueued and executed asynchronously.
///
/// The job value itself is the payload: it is serialized to JSON when
/// enqueued and deserialized again right before [`run`](Self::run) is called.
pub trait BackgroundJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name of the task.
    ///
    /// This MUST be unique for the whole application.
    const JOB_NAME: &'static str;

    /// Number of attempts before the job is marked as failed.
    ///
    /// `None` uses the ceiling of the [`Client`] enqueueing the job.
    const MAX_ATTEMPTS: Option<i64> = None;

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + 'static;

    /// Execute the task. This method should define its logic.
    ///
    /// `cancellation` is cancelled once the runner is asked to shut down. The
    /// runner still waits for this future to complete.
    fn run(
        &self,
        ctx: Self::Context,
        cancellation: CancellationToken,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Enqueue this job for background execution.
    fn enqueue<'a>(&'a self, client: &'a Client) -> BoxFuture<'a, Result<(), EnqueueError>> {
        let mut job = match NewJob::new(Self::JOB_NAME, self) {
            Ok(job) => job,
            Err(err) => return async move { Err(err) }.boxed(),
        };
        if let Some(max_attempts) = Self::MAX_ATTEMPTS {
            job = job.max_attempts(max_attempts);
        }

        client.enqueue_job(job).boxed()
    }
}
