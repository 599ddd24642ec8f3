//! Consumer side of the AMQP broker

use super::connector::{buried_exchange, Connector};
use super::{lapin_error, publish_on, wire};
use crate::traits::JobIter;
use crate::window::{Window, WindowSlot};
use async_trait::async_trait;
use futures::StreamExt;
use hopper_core::{Acknowledger, Error, Job, Result};
use lapin::{acker::Acker, message::Delivery, options::*, types::FieldTable, Channel, Consumer};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

struct Subscription {
    channel: Channel,
    consumer: Consumer,
    tag: String,
}

/// Iterator over deliveries of one AMQP queue. The consumer is recreated
/// transparently when its channel dies. Closing interrupts a pending poll
/// or resubscribe at once.
pub struct AmqpJobIter {
    queue: String,
    connector: Arc<Connector>,
    window: Window,
    prefetch: u16,
    subscription: Mutex<Option<Subscription>>,
    closed: watch::Sender<bool>,
}

impl AmqpJobIter {
    pub(crate) async fn start(
        queue: &str,
        connector: Arc<Connector>,
        window: Window,
        size: usize,
    ) -> Result<Self> {
        let iter = Self {
            queue: queue.to_string(),
            connector,
            window,
            prefetch: size.min(u16::MAX as usize) as u16,
            subscription: Mutex::new(None),
            closed: watch::Sender::new(false),
        };

        let subscription = iter.subscribe().await?;
        *iter.subscription.lock().await = Some(subscription);
        Ok(iter)
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn subscribe(&self) -> Result<Subscription> {
        let channel = self.connector.dedicated_channel().await?;

        if self.prefetch > 0 {
            channel
                .basic_qos(self.prefetch, BasicQosOptions::default())
                .await
                .map_err(lapin_error)?;
        }

        let tag = format!("hopper-{}", Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                &self.queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(lapin_error)?;

        debug!("Consuming queue {} as {}", self.queue, tag);
        Ok(Subscription {
            channel,
            consumer,
            tag,
        })
    }

    fn settle(&self, delivery: Delivery, slot: WindowSlot) -> Job {
        let mut job = wire::job_from_message(&delivery.properties, &delivery.data, self.connector.config());
        job.bind_acknowledger(Box::new(AmqpAcknowledger {
            acker: delivery.acker,
            queue: self.queue.clone(),
            connector: Arc::clone(&self.connector),
            _slot: slot,
        }));
        job
    }
}

#[async_trait]
impl JobIter for AmqpJobIter {
    async fn next(&self) -> Result<Job> {
        // Subscribed before the flag is read so a close in between still
        // registers as a change
        let mut closed = self.closed.subscribe();
        let slot = self.window.acquire().await?;
        let poll_interval = self.connector.config().poll_interval();
        let mut subscription = self.subscription.lock().await;

        loop {
            if self.is_closed() {
                return Err(Error::AlreadyClosed);
            }

            if subscription.is_none() {
                // A reconnect may back off for as long as the outage lasts
                let resubscribed = tokio::select! {
                    _ = closed.changed() => None,
                    result = self.subscribe() => Some(result?),
                };
                let Some(resubscribed) = resubscribed else {
                    return Err(Error::AlreadyClosed);
                };
                *subscription = Some(resubscribed);
            }
            let Some(active) = subscription.as_mut() else {
                continue;
            };

            let polled = tokio::select! {
                _ = closed.changed() => None,
                polled = tokio::time::timeout(poll_interval, active.consumer.next()) => Some(polled),
            };
            let Some(polled) = polled else {
                return Err(Error::AlreadyClosed);
            };

            match polled {
                // Idle, look at the closed flag again
                Err(_) => continue,
                Ok(Some(Ok(delivery))) => return Ok(self.settle(delivery, slot)),
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "Consumer of queue {} failed, resubscribing", self.queue);
                    *subscription = None;
                }
                Ok(None) => {
                    warn!("Consumer of queue {} ended, resubscribing", self.queue);
                    *subscription = None;
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        self.window.close();

        // Any `next` holding the subscription gives it up once it sees the
        // flag. The channel stays open so outstanding deliveries can still
        // settle.
        if let Some(active) = self.subscription.lock().await.take() {
            if let Err(e) = active
                .channel
                .basic_cancel(&active.tag, BasicCancelOptions::default())
                .await
            {
                debug!("Failed to cancel consumer {}: {}", active.tag, e);
            }
        }

        debug!("Closed iterator on queue {}", self.queue);
        Ok(())
    }
}

/// Settles one AMQP delivery. Holds the window slot until consumed.
struct AmqpAcknowledger {
    acker: Acker,
    queue: String,
    connector: Arc<Connector>,
    _slot: WindowSlot,
}

#[async_trait]
impl Acknowledger for AmqpAcknowledger {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(lapin_error)
    }

    async fn reject(self: Box<Self>, job: Job, requeue: bool) -> Result<()> {
        if requeue {
            debug!("Requeued job {} on queue {}", job.id, self.queue);
            return self
                .acker
                .reject(BasicRejectOptions { requeue: true })
                .await
                .map_err(lapin_error);
        }

        // Bury through the exchange so the current retries and error type
        // travel with the job, then ack the delivered copy
        let config = self.connector.config();
        let exchange = buried_exchange(&self.queue, config);
        let channel = self.connector.channel().await?;
        publish_on(&channel, &exchange, "", &job, config).await?;

        warn!(
            "Buried job {} on queue {} ({})",
            job.id, self.queue, job.error_type
        );
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(lapin_error)
    }
}
