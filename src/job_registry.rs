use crate::BackgroundJob;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Type-erased job handler: receives the runner context, a cancellation
/// token and the serialized job parameters.
pub(crate) type RunTaskFn<Context> = dyn Fn(Context, CancellationToken, String) -> BoxFuture<'static, anyhow::Result<()>>
    + Send
    + Sync;

/// Maps job names to their handlers.
///
/// Populated before the runner starts and shared read-only by its workers.
pub(crate) struct JobRegistry<Context> {
    entries: HashMap<String, Arc<RunTaskFn<Context>>>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<Context> Clone for JobRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<Context> fmt::Debug for JobRegistry<Context> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_names", &self.job_names())
            .finish()
    }
}

impl<Context: Clone + Send + 'static> JobRegistry<Context> {
    /// Register a typed job. Replaces any handler registered under the same name.
    pub(crate) fn register<J: BackgroundJob<Context = Context>>(&mut self) {
        self.entries
            .insert(J::JOB_NAME.to_string(), Arc::new(runnable::<J>));
    }

    /// Register a raw handler. Replaces any handler registered under the same name.
    pub(crate) fn register_fn<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Context, CancellationToken, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: Arc<RunTaskFn<Context>> = Arc::new(
            move |ctx: Context, cancellation: CancellationToken, params: String| {
                handler(ctx, cancellation, params).boxed()
            },
        );
        self.entries.insert(name.into(), handler);
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Arc<RunTaskFn<Context>>> {
        self.entries.get(name)
    }
}

impl<Context> JobRegistry<Context> {
    pub(crate) fn job_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

fn runnable<J: BackgroundJob>(
    ctx: J::Context,
    cancellation: CancellationToken,
    params: String,
) -> BoxFuture<'static, anyhow::Result<()>> {
    async move {
        let job: J = serde_json::from_str(&params)?;
        job.run(ctx, cancellation).await
    }
    .boxed()
}
