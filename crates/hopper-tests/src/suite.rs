//! Conformance cases every backend has to pass
//!
//! Each case takes a connected broker, works on a fresh queue and returns
//! an error describing the first violated expectation.

use crate::common::{job_with, publish_ints, unique_queue};
use anyhow::{bail, ensure, Context, Result};
use hopper_broker::{tx_callback, Broker, JobIter, RepublishCondition};
use hopper_core::{Error, Job, Priority};
use hopper_telemetry::JobLogContext;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Upper bound for anything that should happen "soon"
const PATIENCE: Duration = Duration::from_secs(10);

/// Time given to a blocked `next` to prove it stays blocked
const SETTLE: Duration = Duration::from_millis(50);

fn shared(iter: Box<dyn JobIter>) -> Arc<dyn JobIter> {
    Arc::from(iter)
}

/// Spawn a `next` that must end with [`Error::AlreadyClosed`]
fn expect_closed(iter: &Arc<dyn JobIter>) -> JoinHandle<Result<()>> {
    let iter = Arc::clone(iter);
    tokio::spawn(async move {
        match iter.next().await {
            Err(Error::AlreadyClosed) => Ok(()),
            Ok(job) => bail!("expected a closed iterator, got job {}", job.id),
            Err(e) => bail!("expected a closed iterator, got {}", e),
        }
    })
}

async fn next_soon(iter: &dyn JobIter) -> Result<Job> {
    let job = tokio::time::timeout(PATIENCE, iter.next())
        .await
        .context("timed out waiting for a job")??;
    Ok(job)
}

async fn wait_for_calls(rx: &mut mpsc::UnboundedReceiver<()>, n: usize) -> Result<()> {
    for _ in 0..n {
        tokio::time::timeout(PATIENCE, rx.recv())
            .await
            .context("timed out waiting for deliveries")?
            .context("consumer stopped")?;
    }
    Ok(())
}

async fn joined(handle: JoinHandle<Result<()>>) -> Result<()> {
    tokio::time::timeout(PATIENCE, handle)
        .await
        .context("timed out waiting for the iterator to close")??
}

pub async fn consume_empty(broker: &dyn Broker) -> Result<()> {
    let queue = broker.queue(&unique_queue("consume_empty")).await?;
    let iter = queue.consume(1).await?;
    iter.close().await?;
    Ok(())
}

pub async fn next_on_closed(broker: &dyn Broker) -> Result<()> {
    let queue = broker.queue(&unique_queue("next_closed")).await?;
    let iter = shared(queue.consume(1).await?);

    let waiter = expect_closed(&iter);
    iter.close().await?;
    joined(waiter).await?;

    // Idempotent close, and later calls fail the same way
    iter.close().await?;
    ensure!(matches!(iter.next().await, Err(Error::AlreadyClosed)));
    Ok(())
}

pub async fn next_waits_for_publish(broker: &dyn Broker) -> Result<()> {
    let queue = broker.queue(&unique_queue("next_empty")).await?;
    let iter = shared(queue.consume(1).await?);

    let waiter = {
        let iter = Arc::clone(&iter);
        tokio::spawn(async move { iter.next().await })
    };

    tokio::time::sleep(SETTLE).await;
    ensure!(!waiter.is_finished(), "next returned on an empty queue");

    queue.publish(job_with(&1)?).await?;

    let job = tokio::time::timeout(PATIENCE, waiter).await???;
    ensure!(job.decode::<i32>()? == 1);
    iter.close().await?;
    Ok(())
}

pub async fn reject_without_requeue(broker: &dyn Broker) -> Result<()> {
    let queue = broker.queue(&unique_queue("reject_no_requeue")).await?;
    queue.publish(job_with(&1)?).await?;

    let iter = shared(queue.consume(1).await?);
    let mut job = next_soon(iter.as_ref()).await?;
    job.reject(false).await?;

    let waiter = expect_closed(&iter);
    tokio::time::sleep(SETTLE).await;
    iter.close().await?;
    joined(waiter).await
}

pub async fn reject_with_requeue(broker: &dyn Broker) -> Result<()> {
    let queue = broker.queue(&unique_queue("reject_requeue")).await?;
    queue.publish(job_with(&1)?).await?;

    let iter = queue.consume(1).await?;
    let mut job = next_soon(iter.as_ref()).await?;
    let id = job.id.clone();
    job.reject(true).await?;

    let again = next_soon(iter.as_ref()).await?;
    ensure!(again.id == id, "requeued job came back as {}", again.id);
    iter.close().await?;
    Ok(())
}

pub async fn settle_twice(broker: &dyn Broker) -> Result<()> {
    let queue = broker.queue(&unique_queue("settle_twice")).await?;
    queue.publish(job_with(&1)?).await?;

    let iter = queue.consume(1).await?;
    let mut job = next_soon(iter.as_ref()).await?;
    job.ack().await?;

    ensure!(matches!(job.ack().await, Err(Error::CannotAcknowledge)));
    ensure!(matches!(job.reject(true).await, Err(Error::CannotAcknowledge)));

    let mut fresh = job_with(&2)?;
    ensure!(matches!(fresh.ack().await, Err(Error::CannotAcknowledge)));

    iter.close().await?;
    Ok(())
}

pub async fn publish_empty(broker: &dyn Broker) -> Result<()> {
    let queue = broker.queue(&unique_queue("publish_empty")).await?;

    ensure!(matches!(queue.publish(Job::default()).await, Err(Error::EmptyJob)));
    ensure!(matches!(queue.publish(Job::new()).await, Err(Error::EmptyJob)));
    ensure!(matches!(
        queue.publish_delayed(Job::default(), Duration::from_secs(1)).await,
        Err(Error::EmptyJob)
    ));
    ensure!(matches!(
        queue.publish_delayed(Job::new(), Duration::from_secs(1)).await,
        Err(Error::EmptyJob)
    ));
    Ok(())
}

pub async fn publish_and_consume_in_order(broker: &dyn Broker) -> Result<()> {
    let queue = broker.queue(&unique_queue("immediate_ack")).await?;
    let published = publish_ints(queue.as_ref(), 100, Priority::Normal).await?;

    let iter = shared(queue.consume(1).await?);
    for (i, sent) in published.iter().enumerate() {
        let mut job = next_soon(iter.as_ref()).await?;
        job.ack().await?;

        ensure!(job.decode::<i32>()? == i as i32, "job {} out of order", i);
        ensure!(job.id == sent.id);
        ensure!(job.priority == sent.priority);
        ensure!(job.timestamp.timestamp() == sent.timestamp.timestamp());
    }

    let waiter = expect_closed(&iter);
    iter.close().await?;
    joined(waiter).await
}

pub async fn job_fields_survive_delivery(broker: &dyn Broker) -> Result<()> {
    let queue = broker.queue(&unique_queue("headers")).await?;

    let cases = [(10, "error-test"), (10, ""), (0, "error-test"), (0, "")];
    for (i, (retries, error_type)) in cases.iter().enumerate() {
        let mut job = job_with(&i)?;
        job.retries = *retries;
        job.error_type = error_type.to_string();
        queue.publish(job).await?;
    }

    let iter = queue.consume(cases.len()).await?;
    for (retries, error_type) in cases {
        let mut job = next_soon(iter.as_ref()).await?;
        ensure!(job.retries == retries, "retries {} != {}", job.retries, retries);
        ensure!(job.error_type == error_type, "error type {:?}", job.error_type);
        job.ack().await?;
    }

    iter.close().await?;
    Ok(())
}

pub async fn shared_iterator_concurrently(broker: &dyn Broker) -> Result<()> {
    const CONSUMERS: usize = 10;

    let queue = broker.queue(&unique_queue("shared_iter")).await?;
    publish_ints(queue.as_ref(), CONSUMERS as i32, Priority::Normal).await?;

    let iter = shared(queue.consume(CONSUMERS).await?);
    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let iter = Arc::clone(&iter);
            // Never settled on purpose
            tokio::spawn(async move { iter.next().await })
        })
        .collect();

    let all = futures::future::try_join_all(consumers);
    let results = tokio::time::timeout(Duration::from_secs(1), all)
        .await
        .context("gave up waiting for consumers to start")??;
    for result in results {
        result?;
    }

    iter.close().await?;
    Ok(())
}

pub async fn delayed(broker: &dyn Broker) -> Result<()> {
    let delay = Duration::from_secs(1);
    let queue = broker.queue(&unique_queue("delayed")).await?;

    let start = Instant::now();
    queue.publish_delayed(job_with("hello")?, delay).await?;

    let iter = queue.consume(1).await?;
    let mut job = next_soon(iter.as_ref()).await?;
    let since = start.elapsed();

    ensure!(job.decode::<String>()? == "hello");
    ensure!(since >= delay, "delivered after {:?}", since);
    job.ack().await?;
    iter.close().await?;
    Ok(())
}

pub async fn transaction_error(broker: &dyn Broker) -> Result<()> {
    let queue = broker.queue(&unique_queue("tx_error")).await?;

    let result = queue
        .transaction(tx_callback(|tx| async move {
            tx.publish(job_with("goodbye").map_err(|e| Error::Serialization(e.to_string()))?)
                .await?;
            Err::<(), _>(Error::Broker("foo".to_string()))
        }))
        .await;
    ensure!(matches!(result, Err(Error::Broker(ref m)) if m == "foo"), "{:?}", result);

    let iter = shared(queue.consume(1).await?);
    let waiter = expect_closed(&iter);
    tokio::time::sleep(SETTLE).await;
    iter.close().await?;
    joined(waiter).await
}

pub async fn transaction(broker: &dyn Broker) -> Result<()> {
    let queue = broker.queue(&unique_queue("tx")).await?;
    let live = Arc::clone(&queue);

    queue
        .transaction(tx_callback(move |tx| async move {
            for i in 0..3 {
                let mut job = Job::new();
                job.encode(&i)?;
                tx.publish(job).await?;
            }

            // Nothing staged may reach the live queue before commit
            let peek = live.consume(0).await?;
            let early = tokio::time::timeout(SETTLE, peek.next()).await;
            peek.close().await?;
            match early {
                Err(_) | Ok(Err(Error::EndOfStream)) => Ok(()),
                Ok(Ok(job)) => Err(Error::Broker(format!(
                    "job {} visible before commit",
                    job.id
                ))),
                Ok(Err(e)) => Err(e),
            }
        }))
        .await?;

    let iter = queue.consume(0).await?;
    let mut payloads = Vec::new();
    for _ in 0..3 {
        let mut job = next_soon(iter.as_ref()).await?;
        payloads.push(job.decode::<i32>()?);
        job.ack().await?;
    }
    payloads.sort_unstable();
    ensure!(payloads == vec![0, 1, 2], "committed {:?}", payloads);
    iter.close().await?;
    Ok(())
}

pub async fn nested_transaction_not_supported(broker: &dyn Broker) -> Result<()> {
    let queue = broker.queue(&unique_queue("tx_nested")).await?;

    let result = queue
        .transaction(tx_callback(|tx| async move {
            tx.transaction(tx_callback(|_| async { Ok(()) })).await
        }))
        .await;

    ensure!(matches!(result, Err(Error::TransactionsNotSupported)), "{:?}", result);
    Ok(())
}

pub async fn retry_queue(broker: &dyn Broker) -> Result<()> {
    let queue = broker.queue(&unique_queue("retry")).await?;
    queue.publish(job_with(&1)?).await?;
    queue.publish(job_with(&2)?).await?;

    let iter = shared(queue.consume(1).await?);
    for _ in 0..2 {
        let mut job = next_soon(iter.as_ref()).await?;
        job.reject(false).await?;
    }

    queue.republish_buried(Vec::new()).await?;

    for expected in [1, 2] {
        let mut job = next_soon(iter.as_ref()).await?;
        ensure!(job.decode::<i32>()? == expected, "republished out of order");
        job.ack().await?;
    }

    let waiter = expect_closed(&iter);
    iter.close().await?;
    iter.close().await?;
    joined(waiter).await
}

pub async fn republish_buried_with_condition(broker: &dyn Broker) -> Result<()> {
    let queue = broker.queue(&unique_queue("republish")).await?;
    for payload in ["payload 1", "republish", "payload 3", "payload 4"] {
        queue.publish(Job::new().with_raw(payload)).await?;
    }

    let iter = queue.consume(1).await?;
    for _ in 0..4 {
        let mut job = next_soon(iter.as_ref()).await?;
        job.error_type = "failed".to_string();
        job.reject(false).await?;
    }

    let condition: RepublishCondition = Box::new(|job: &Job| job.raw.as_ref() == b"republish");
    queue.republish_buried(vec![condition]).await?;

    let mut job = next_soon(iter.as_ref()).await?;
    ensure!(job.raw.as_ref() == b"republish", "got {:?}", job.raw);
    ensure!(job.error_type.is_empty(), "error type was not cleared");
    job.ack().await?;

    // The rest stayed buried, in order
    queue.republish_buried(Vec::new()).await?;
    for expected in ["payload 1", "payload 3", "payload 4"] {
        let mut job = next_soon(iter.as_ref()).await?;
        ensure!(job.raw.as_ref() == expected.as_bytes(), "got {:?}", job.raw);
        job.ack().await?;
    }

    iter.close().await?;
    Ok(())
}

pub async fn priorities(broker: &dyn Broker) -> Result<()> {
    const PER_LEVEL: i32 = 20;

    let queue = broker.queue(&unique_queue("priorities")).await?;
    publish_ints(queue.as_ref(), PER_LEVEL, Priority::Low).await?;
    publish_ints(queue.as_ref(), PER_LEVEL, Priority::Urgent).await?;

    let iter = queue.consume(1).await?;
    let mut received = Vec::new();
    for _ in 0..PER_LEVEL * 2 {
        let mut job = next_soon(iter.as_ref()).await?;
        job.ack().await?;
        received.push(job.priority);
    }

    let (first, last) = received.split_at(PER_LEVEL as usize);
    ensure!(first.iter().all(|p| *p == Priority::Urgent), "{:?}", received);
    ensure!(last.iter().all(|p| *p == Priority::Low), "{:?}", received);

    iter.close().await?;
    Ok(())
}

/// At most `window` jobs are in flight until they are settled, then the
/// rest flows through
pub async fn concurrent(broker: &dyn Broker, window: usize) -> Result<()> {
    let name = unique_queue(&format!("concurrent_{}", window));
    let queue = broker.queue(&name).await?;
    let iter = shared(queue.consume(window).await?);

    let calls = Arc::new(AtomicUsize::new(0));
    let (called_tx, mut called_rx) = mpsc::unbounded_channel::<()>();
    let (go_tx, go_rx) = watch::channel(false);

    let consumer = {
        let iter = Arc::clone(&iter);
        let calls = Arc::clone(&calls);
        tokio::spawn(async move {
            loop {
                let mut job = match iter.next().await {
                    Ok(job) => job,
                    Err(Error::AlreadyClosed) => return Ok(()),
                    Err(e) => return Err(anyhow::Error::from(e)),
                };

                let calls = Arc::clone(&calls);
                let called_tx = called_tx.clone();
                let mut go_rx = go_rx.clone();
                let span = JobLogContext::new(&job, &name).span();
                tokio::spawn(
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let _ = called_tx.send(());
                        if go_rx.wait_for(|go| *go).await.is_ok() {
                            if let Err(e) = job.ack().await {
                                tracing::error!("ack failed: {}", e);
                            }
                        }
                    }
                    .instrument(span),
                );
            }
        })
    };

    ensure!(calls.load(Ordering::SeqCst) == 0);
    publish_ints(queue.as_ref(), (window * 3) as i32, Priority::Normal).await?;

    // The first batch is exactly one window
    wait_for_calls(&mut called_rx, window).await?;
    tokio::time::sleep(SETTLE).await;
    ensure!(
        calls.load(Ordering::SeqCst) == window,
        "{} jobs in flight with a window of {}",
        calls.load(Ordering::SeqCst),
        window
    );

    go_tx.send(true)?;
    wait_for_calls(&mut called_rx, 2 * window).await?;
    ensure!(calls.load(Ordering::SeqCst) == 3 * window);

    iter.close().await?;
    tokio::time::timeout(PATIENCE, consumer).await???;
    Ok(())
}
