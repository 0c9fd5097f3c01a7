use std::future::Future;
use std::sync::Arc;

use crate::Job;

/// Implementations of this trait can be registered to run jobs in a
/// [`Worker`](crate::Worker).
///
/// # Example
///
/// Register a handler as a struct that implements [`JobRunner`]:
///
/// ```no_run
/// # tokio_test::block_on(async {
/// use async_trait::async_trait;
/// use gearman::{Job, JobRunner, Worker};
/// use std::io;
///
/// struct Reverser;
///
/// #[async_trait]
/// impl JobRunner for Reverser {
///     type Error = io::Error;
///     async fn run(&self, job: Job) -> Result<(), Self::Error> {
///         let mut out = job.workload().to_vec();
///         out.reverse();
///         job.complete(out).ok();
///         Ok(())
///     }
/// }
///
/// let w = Worker::connect(("127.0.0.1", gearman::DEFAULT_PORT)).await.unwrap();
/// w.register("reverse", Reverser).await.unwrap();
/// # });
/// ```
#[async_trait::async_trait]
pub trait JobRunner: Send + Sync {
    /// The error type that the handler may return.
    type Error;
    /// A handler function that runs a job.
    async fn run(&self, job: Job) -> Result<(), Self::Error>;
}

#[async_trait::async_trait]
impl<E, F, Fut> JobRunner for Box<F>
where
    F: Send + Sync + Fn(Job) -> Fut,
    Fut: Future<Output = Result<(), E>> + Send,
{
    type Error = E;
    async fn run(&self, job: Job) -> Result<(), E> {
        self(job).await
    }
}

#[async_trait::async_trait]
impl<'a, E, F, Fut> JobRunner for &'a F
where
    F: Send + Sync + Fn(Job) -> Fut,
    Fut: Future<Output = Result<(), E>> + Send,
{
    type Error = E;
    async fn run(&self, job: Job) -> Result<(), E> {
        self(job).await
    }
}

#[repr(transparent)]
pub(crate) struct Closure<F>(pub F);

#[async_trait::async_trait]
impl<E, F, Fut> JobRunner for Closure<F>
where
    F: Send + Sync + Fn(Job) -> Fut,
    Fut: Future<Output = Result<(), E>> + Send,
{
    type Error = E;
    async fn run(&self, job: Job) -> Result<(), E> {
        (self.0)(job).await
    }
}

/// A [`JobRunner`] with its error type reduced to displayable text, so the
/// registry and the grab loop need not be generic over handler error types.
#[async_trait::async_trait]
pub(crate) trait ErasedRunner: Send + Sync {
    /// Run the job; `Some(text)` is the handler's error rendered for a
    /// WORK_EXCEPTION payload.
    async fn run_erased(&self, job: Job) -> Option<String>;
}

pub(crate) struct Erase<R>(pub R);

#[async_trait::async_trait]
impl<R> ErasedRunner for Erase<R>
where
    R: JobRunner,
    R::Error: std::fmt::Display,
{
    async fn run_erased(&self, job: Job) -> Option<String> {
        self.0.run(job).await.err().map(|e| e.to_string())
    }
}

pub(crate) type SharedRunner = Arc<dyn ErasedRunner>;
