//! Broker, queue and iterator trait definitions

use async_trait::async_trait;
use futures::future::BoxFuture;
use hopper_core::{Error, Job, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Predicate selecting which buried jobs get republished
pub type RepublishCondition = Box<dyn Fn(&Job) -> bool + Send + Sync>;

/// Callback run by [`Queue::transaction`] against a staging queue
pub type TxCallback = Box<dyn FnOnce(Arc<dyn Queue>) -> BoxFuture<'static, Result<()>> + Send>;

/// Wrap an async closure into a [`TxCallback`]
pub fn tx_callback<F, Fut>(f: F) -> TxCallback
where
    F: FnOnce(Arc<dyn Queue>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move |queue| Box::pin(f(queue)))
}

/// Whether `job` satisfies every condition. No conditions match everything.
pub fn complies(conditions: &[RepublishCondition], job: &Job) -> bool {
    conditions.iter().all(|condition| condition(job))
}

/// Reject jobs that can't be published
pub(crate) fn ensure_publishable(job: &Job) -> Result<()> {
    if job.is_empty() {
        return Err(Error::EmptyJob);
    }
    Ok(())
}

/// A connection to one backend, producing queues by name
#[async_trait]
pub trait Broker: Send + Sync {
    /// Get the queue called `name`, creating it if needed. Repeated calls
    /// with the same name share the same queue state.
    async fn queue(&self, name: &str) -> Result<Arc<dyn Queue>>;

    /// Release every backend resource
    async fn close(&self) -> Result<()>;
}

/// A named queue of jobs with a buried side store
#[async_trait]
pub trait Queue: Send + Sync {
    /// Publish a job for immediate delivery
    async fn publish(&self, job: Job) -> Result<()>;

    /// Publish a job that becomes visible after `delay`. Returns without
    /// waiting for the delay.
    async fn publish_delayed(&self, job: Job, delay: Duration) -> Result<()>;

    /// Run `callback` against a staging queue and publish everything it
    /// published only if it succeeds
    async fn transaction(&self, _callback: TxCallback) -> Result<()> {
        Err(Error::TransactionsNotSupported)
    }

    /// Start consuming. `window` bounds delivered but unsettled jobs; zero
    /// means unbounded.
    async fn consume(&self, window: usize) -> Result<Box<dyn JobIter>>;

    /// Move buried jobs matching every condition back into circulation,
    /// clearing their error type
    async fn republish_buried(&self, conditions: Vec<RepublishCondition>) -> Result<()>;
}

/// A consumption cursor over one queue, shareable between tasks
#[async_trait]
pub trait JobIter: Send + Sync {
    /// Wait for the next job. Fails with [`Error::AlreadyClosed`] once the
    /// iterator is closed.
    async fn next(&self) -> Result<Job>;

    /// Stop delivering. Idempotent.
    async fn close(&self) -> Result<()>;
}
