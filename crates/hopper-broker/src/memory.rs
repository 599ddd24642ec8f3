//! In-memory broker
//!
//! Jobs live in a per-queue arena ordered by priority and then by a
//! monotonically increasing sequence number, so dequeueing removes the
//! entry and every iterator of a queue competes for the same jobs.
//! Iterators poll: an idle `next` sleeps for the configured interval
//! between looks at the arena.

use crate::traits::{complies, ensure_publishable, Broker, JobIter, Queue, RepublishCondition, TxCallback};
use crate::window::{Window, WindowSlot};
use async_trait::async_trait;
use hopper_core::{Acknowledger, Error, Job, MemoryConfig, Priority, Result};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Arena key: higher priority first, then publish order
type Slot = (Reverse<Priority>, u64);

/// In-memory broker. Queues live until the broker is closed.
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, MemoryQueue>>,
    config: MemoryConfig,
    finite: bool,
}

impl MemoryBroker {
    /// Create a broker whose iterators wait forever for new jobs
    pub fn new() -> Self {
        Self::with_config(MemoryConfig::default(), false)
    }

    /// Create a broker whose iterators stop with [`Error::EndOfStream`] once
    /// their queue is empty
    pub fn new_finite() -> Self {
        Self::with_config(MemoryConfig::default(), true)
    }

    /// Create a broker with custom config
    pub fn with_config(config: MemoryConfig, finite: bool) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            config,
            finite,
        }
    }

    /// Get the concrete queue called `name`, creating it if needed
    pub async fn memory_queue(&self, name: &str) -> MemoryQueue {
        let mut queues = self.queues.lock().await;
        queues
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!("Created memory queue {}", name);
                MemoryQueue::new(name, self.config.poll_interval(), self.finite)
            })
            .clone()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn queue(&self, name: &str) -> Result<Arc<dyn Queue>> {
        Ok(Arc::new(self.memory_queue(name).await))
    }

    /// Drop every queue. Iterators already handed out fail with
    /// [`Error::AlreadyClosed`] on their next poll.
    async fn close(&self) -> Result<()> {
        let mut queues = self.queues.lock().await;
        for queue in queues.values() {
            queue.inner.closed.store(true, Ordering::SeqCst);
        }
        debug!("Closed {} memory queues", queues.len());
        queues.clear();
        Ok(())
    }
}

#[derive(Default)]
struct QueueState {
    pending: BTreeMap<Slot, Job>,
    buried: Vec<Job>,
    next_seq: u64,
}

impl QueueState {
    fn push(&mut self, job: Job) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert((Reverse(job.priority), seq), job);
    }
}

struct QueueInner {
    name: String,
    state: Mutex<QueueState>,
    poll_interval: Duration,
    finite: bool,
    /// Staging queues of a transaction publish delayed jobs at once and
    /// refuse nested transactions
    staging: bool,
    /// Set when the owning broker is closed
    closed: AtomicBool,
}

impl QueueInner {
    async fn push(&self, job: Job) {
        let mut state = self.state.lock().await;
        state.push(job);
    }

    async fn pop(&self) -> Option<Job> {
        let mut state = self.state.lock().await;
        state.pending.pop_first().map(|(_, job)| job)
    }

    async fn bury(&self, job: Job) {
        let mut state = self.state.lock().await;
        state.buried.push(job);
    }
}

/// A queue held in memory
#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<QueueInner>,
}

impl MemoryQueue {
    fn new(name: &str, poll_interval: Duration, finite: bool) -> Self {
        Self::build(name, poll_interval, finite, false)
    }

    fn build(name: &str, poll_interval: Duration, finite: bool, staging: bool) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.to_string(),
                state: Mutex::new(QueueState::default()),
                poll_interval,
                finite,
                staging,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Queue name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Jobs waiting for delivery
    pub async fn pending_len(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }

    /// Jobs waiting in the buried store
    pub async fn buried_len(&self) -> usize {
        self.inner.state.lock().await.buried.len()
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn publish(&self, job: Job) -> Result<()> {
        ensure_publishable(&job)?;
        debug!("Published job {} to memory queue {}", job.id, self.inner.name);
        self.inner.push(job).await;
        Ok(())
    }

    async fn publish_delayed(&self, job: Job, delay: Duration) -> Result<()> {
        ensure_publishable(&job)?;

        if self.inner.staging {
            self.inner.push(job).await;
            return Ok(());
        }

        debug!(
            "Scheduled job {} on memory queue {} in {:?}",
            job.id, self.inner.name, delay
        );
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.push(job).await;
        });
        Ok(())
    }

    async fn transaction(&self, callback: TxCallback) -> Result<()> {
        if self.inner.staging {
            return Err(Error::TransactionsNotSupported);
        }

        let staging = MemoryQueue::build(
            &self.inner.name,
            self.inner.poll_interval,
            self.inner.finite,
            true,
        );

        if let Err(e) = callback(Arc::new(staging.clone())).await {
            debug!("Transaction on memory queue {} rolled back: {}", self.inner.name, e);
            return Err(e);
        }

        let staged = {
            let mut staged = staging.inner.state.lock().await;
            std::mem::take(&mut staged.pending)
        };

        let mut state = self.inner.state.lock().await;
        let count = staged.len();
        for job in staged.into_values() {
            state.push(job);
        }
        debug!(
            "Transaction on memory queue {} committed {} jobs",
            self.inner.name, count
        );
        Ok(())
    }

    async fn consume(&self, window: usize) -> Result<Box<dyn JobIter>> {
        Ok(Box::new(MemoryJobIter {
            queue: Arc::clone(&self.inner),
            window: Window::new(window),
            closed: AtomicBool::new(false),
            finite: self.inner.finite,
        }))
    }

    async fn republish_buried(&self, conditions: Vec<RepublishCondition>) -> Result<()> {
        let mut state = self.inner.state.lock().await;

        let buried = std::mem::take(&mut state.buried);
        let mut republished = 0usize;
        for mut job in buried {
            if complies(&conditions, &job) {
                job.error_type.clear();
                state.push(job);
                republished += 1;
            } else {
                state.buried.push(job);
            }
        }

        debug!(
            "Republished {} buried jobs on memory queue {}, {} left buried",
            republished,
            self.inner.name,
            state.buried.len()
        );
        Ok(())
    }
}

/// Polling iterator over a memory queue
pub struct MemoryJobIter {
    queue: Arc<QueueInner>,
    window: Window,
    closed: AtomicBool,
    finite: bool,
}

impl MemoryJobIter {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.queue.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobIter for MemoryJobIter {
    async fn next(&self) -> Result<Job> {
        let slot = self.window.acquire().await?;

        loop {
            // Dropping the slot on any error path hands it back
            if self.is_closed() {
                return Err(Error::AlreadyClosed);
            }

            match self.queue.pop().await {
                Some(mut job) => {
                    debug!("Delivering job {} from memory queue {}", job.id, self.queue.name);
                    job.bind_acknowledger(Box::new(MemoryAcknowledger {
                        queue: Arc::clone(&self.queue),
                        _slot: slot,
                    }));
                    return Ok(job);
                }
                None if self.finite => return Err(Error::EndOfStream),
                None => tokio::time::sleep(self.queue.poll_interval).await,
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.window.close();
        Ok(())
    }
}

/// Settles one memory delivery. Holds the window slot until consumed.
struct MemoryAcknowledger {
    queue: Arc<QueueInner>,
    _slot: WindowSlot,
}

#[async_trait]
impl Acknowledger for MemoryAcknowledger {
    async fn ack(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn reject(self: Box<Self>, job: Job, requeue: bool) -> Result<()> {
        if requeue {
            debug!("Requeued job {} on memory queue {}", job.id, self.queue.name);
            self.queue.push(job).await;
        } else {
            warn!(
                "Buried job {} on memory queue {} ({})",
                job.id, self.queue.name, job.error_type
            );
            self.queue.bury(job).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::tx_callback;

    fn fast_broker(finite: bool) -> MemoryBroker {
        MemoryBroker::with_config(MemoryConfig { poll_interval_ms: 10 }, finite)
    }

    fn job(payload: i32) -> Job {
        let mut job = Job::new();
        job.encode(&payload).unwrap();
        job
    }

    #[tokio::test]
    async fn test_queue_is_memoized_by_name() {
        let broker = fast_broker(true);
        let a = broker.queue("jobs").await.unwrap();
        let b = broker.queue("jobs").await.unwrap();

        a.publish(job(1)).await.unwrap();
        let iter = b.consume(1).await.unwrap();
        let delivered = iter.next().await.unwrap();
        assert_eq!(delivered.decode::<i32>().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_close_drops_queues() {
        let broker = fast_broker(true);
        let queue = broker.memory_queue("jobs").await;
        queue.publish(job(1)).await.unwrap();

        broker.close().await.unwrap();
        assert_eq!(broker.memory_queue("jobs").await.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_close_ends_outstanding_iterators() {
        let broker = fast_broker(false);
        let queue = broker.memory_queue("jobs").await;
        let iter = queue.consume(1).await.unwrap();

        let waiting = tokio::spawn(async move { iter.next().await.map(|_| ()) });
        tokio::time::sleep(Duration::from_millis(30)).await;
        broker.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_millis(500), waiting)
            .await
            .expect("iterator should notice the closed broker")
            .unwrap();
        assert!(matches!(result, Err(Error::AlreadyClosed)));
    }

    #[tokio::test]
    async fn test_consume_with_huge_window() {
        let broker = fast_broker(true);
        let queue = broker.memory_queue("jobs").await;
        queue.publish(job(1)).await.unwrap();

        let iter = queue.consume(usize::MAX).await.unwrap();
        let delivered = iter.next().await.unwrap();
        assert_eq!(delivered.decode::<i32>().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let broker = fast_broker(true);
        let queue = broker.memory_queue("jobs").await;

        queue.publish(job(1).with_priority(Priority::Low)).await.unwrap();
        queue.publish(job(2).with_priority(Priority::Urgent)).await.unwrap();
        queue.publish(job(3).with_priority(Priority::Low)).await.unwrap();
        queue.publish(job(4).with_priority(Priority::Urgent)).await.unwrap();
        queue.publish(job(5)).await.unwrap();

        let iter = queue.consume(0).await.unwrap();
        let mut order = Vec::new();
        for _ in 0..5 {
            let mut j = iter.next().await.unwrap();
            order.push(j.decode::<i32>().unwrap());
            j.ack().await.unwrap();
        }
        assert_eq!(order, vec![2, 4, 5, 1, 3]);
        assert!(matches!(iter.next().await, Err(Error::EndOfStream)));
    }

    #[tokio::test]
    async fn test_reject_buries_with_error_type() {
        let broker = fast_broker(true);
        let queue = broker.memory_queue("jobs").await;
        queue.publish(job(7)).await.unwrap();

        let iter = queue.consume(1).await.unwrap();
        let mut delivered = iter.next().await.unwrap();
        delivered.error_type = "bad-input".to_string();
        delivered.reject(false).await.unwrap();

        assert_eq!(queue.pending_len().await, 0);
        assert_eq!(queue.buried_len().await, 1);
        {
            let state = queue.inner.state.lock().await;
            assert_eq!(state.buried[0].error_type, "bad-input");
        }

        queue.republish_buried(Vec::new()).await.unwrap();
        assert_eq!(queue.buried_len().await, 0);

        let again = iter.next().await.unwrap();
        assert_eq!(again.decode::<i32>().unwrap(), 7);
        assert!(again.error_type.is_empty());
    }

    #[tokio::test]
    async fn test_window_slot_released_on_settle() {
        let broker = fast_broker(false);
        let queue = broker.memory_queue("jobs").await;
        for i in 0..3 {
            queue.publish(job(i)).await.unwrap();
        }

        let iter = queue.consume(1).await.unwrap();
        let mut first = iter.next().await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(100), iter.next()).await;
        assert!(blocked.is_err(), "window of one must hold the second delivery");

        first.ack().await.unwrap();
        let second = tokio::time::timeout(Duration::from_millis(500), iter.next())
            .await
            .expect("slot should be free after ack")
            .unwrap();
        assert_eq!(second.decode::<i32>().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_nested_transaction_not_supported() {
        let broker = fast_broker(true);
        let queue = broker.memory_queue("jobs").await;

        let result = queue
            .transaction(tx_callback(|tx| async move {
                tx.publish(job(1)).await?;
                tx.transaction(tx_callback(|_| async { Ok(()) })).await
            }))
            .await;

        assert!(matches!(result, Err(Error::TransactionsNotSupported)));
        assert_eq!(queue.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_delayed_publish_inside_transaction_is_immediate() {
        let broker = fast_broker(true);
        let queue = broker.memory_queue("jobs").await;

        queue
            .transaction(tx_callback(|tx| async move {
                tx.publish_delayed(job(1), Duration::from_secs(3600)).await
            }))
            .await
            .unwrap();

        assert_eq!(queue.pending_len().await, 1);
    }
}
