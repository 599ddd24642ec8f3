//! AMQP 0.9.1 broker implementation using lapin
//!
//! Every queue `q` is declared with:
//! - Durable main queue `q` supporting priorities up to
//!   [`hopper_core::Priority::MAX`]
//! - Fanout exchange `q` + buried exchange suffix, used as dead-letter
//!   exchange of the main queue
//! - Durable buried queue `q` + buried queue suffix bound to that exchange
//!
//! Delayed jobs go through per-delay queues whose TTL dead-letters them
//! back into `q`. Lost connections are re-established with backoff and the
//! declared topology is restored before use.

mod connector;
mod iter;
mod wire;

pub use iter::AmqpJobIter;

use crate::traits::{complies, ensure_publishable, Broker, JobIter, Queue, RepublishCondition, TxCallback};
use crate::window::Window;
use async_trait::async_trait;
use connector::{buried_exchange, buried_queue, Connector};
use hopper_core::{AmqpConfig, Error, Job, Result};
use lapin::{
    options::*,
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
    Channel,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Publish attempts before giving up on a channel that keeps dying
const PUBLISH_ATTEMPTS: usize = 3;

/// Extra lifetime of an idle delay queue after its TTL
const DELAY_QUEUE_GRACE_MS: u128 = 60_000;

/// Map a lapin error, telling connectivity failures apart
pub(crate) fn lapin_error(err: lapin::Error) -> Error {
    match err {
        lapin::Error::InvalidChannelState(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::IOError(_) => Error::ConnectionLost(err.to_string()),
        other => Error::Broker(other.to_string()),
    }
}

/// AMQP broker
pub struct AmqpBroker {
    connector: Arc<Connector>,
    queues: Mutex<HashMap<String, Arc<AmqpQueue>>>,
}

impl AmqpBroker {
    /// Connect with the default configuration
    pub async fn connect(url: &str) -> Result<Self> {
        Self::with_config(url, AmqpConfig::default()).await
    }

    /// Connect with custom config
    pub async fn with_config(url: &str, config: AmqpConfig) -> Result<Self> {
        let connector = Connector::new(url, Arc::new(config))?;
        connector.connect().await?;

        info!("Connected to AMQP broker");

        Ok(Self {
            connector: Arc::new(connector),
            queues: Mutex::new(HashMap::new()),
        })
    }

    /// Get the concrete queue called `name`, declaring it if needed
    pub async fn amqp_queue(&self, name: &str) -> Result<Arc<AmqpQueue>> {
        let mut queues = self.queues.lock().await;
        if let Some(queue) = queues.get(name) {
            return Ok(Arc::clone(queue));
        }

        self.connector.declare(name).await?;
        let queue = Arc::new(AmqpQueue::new(name, Arc::clone(&self.connector), None));
        queues.insert(name.to_string(), Arc::clone(&queue));
        Ok(queue)
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn queue(&self, name: &str) -> Result<Arc<dyn Queue>> {
        let queue: Arc<dyn Queue> = self.amqp_queue(name).await?;
        Ok(queue)
    }

    async fn close(&self) -> Result<()> {
        self.queues.lock().await.clear();
        self.connector.close().await
    }
}

/// A queue on an AMQP server
pub struct AmqpQueue {
    name: String,
    connector: Arc<Connector>,
    /// Set on the staging queue handed to a transaction callback
    tx_channel: Option<Channel>,
}

impl AmqpQueue {
    fn new(name: &str, connector: Arc<Connector>, tx_channel: Option<Channel>) -> Self {
        Self {
            name: name.to_string(),
            connector,
            tx_channel,
        }
    }

    /// Queue name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the queue holding buried jobs
    pub fn buried_queue_name(&self) -> String {
        buried_queue(&self.name, self.connector.config())
    }

    /// Put `job` straight into the buried store
    pub async fn bury(&self, job: &Job) -> Result<()> {
        ensure_publishable(job)?;
        let exchange = buried_exchange(&self.name, self.connector.config());
        self.send(&exchange, "", job).await
    }

    fn config(&self) -> &AmqpConfig {
        self.connector.config()
    }

    /// Publish on the transaction channel when staging, otherwise on the
    /// shared channel with retries across reconnects
    async fn send(&self, exchange: &str, routing_key: &str, job: &Job) -> Result<()> {
        if let Some(channel) = &self.tx_channel {
            return publish_on(channel, exchange, routing_key, job, self.config()).await;
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let channel = self.connector.channel().await?;

            match publish_on(&channel, exchange, routing_key, job, self.config()).await {
                Err(e) if e.is_retryable() && attempt < PUBLISH_ATTEMPTS => {
                    warn!(error = %e, "Publish of job {} failed, retrying", job.id);
                }
                result => return result,
            }
        }
    }

    async fn declare_delay_queue(&self, delay: Duration) -> Result<String> {
        let delayed = format!("{}.delayed.{}", self.name, delay.as_millis());

        let mut args = FieldTable::default();
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString("".into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(self.name.as_str().into()),
        );
        args.insert(
            "x-message-ttl".into(),
            AMQPValue::LongLongInt(delay.as_millis() as i64),
        );
        args.insert(
            "x-expires".into(),
            AMQPValue::LongLongInt((delay.as_millis() + DELAY_QUEUE_GRACE_MS) as i64),
        );

        let channel = match &self.tx_channel {
            Some(channel) => channel.clone(),
            None => self.connector.channel().await?,
        };

        channel
            .queue_declare(
                &delayed,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await
            .map_err(lapin_error)?;

        Ok(delayed)
    }
}

#[async_trait]
impl Queue for AmqpQueue {
    async fn publish(&self, job: Job) -> Result<()> {
        ensure_publishable(&job)?;
        self.send("", &self.name, &job).await?;
        debug!("Published job {} to queue {}", job.id, self.name);
        Ok(())
    }

    async fn publish_delayed(&self, job: Job, delay: Duration) -> Result<()> {
        ensure_publishable(&job)?;

        let delayed = self.declare_delay_queue(delay).await?;
        self.send("", &delayed, &job).await?;

        debug!("Scheduled job {} on queue {} in {:?}", job.id, self.name, delay);
        Ok(())
    }

    async fn transaction(&self, callback: TxCallback) -> Result<()> {
        if self.tx_channel.is_some() {
            return Err(Error::TransactionsNotSupported);
        }

        let channel = self.connector.dedicated_channel().await?;
        channel
            .tx_select()
            .await
            .map_err(lapin_error)?;

        let staging = Arc::new(AmqpQueue::new(
            &self.name,
            Arc::clone(&self.connector),
            Some(channel.clone()),
        ));

        let result = match callback(staging).await {
            Ok(()) => channel
                .tx_commit()
                .await
                .map_err(lapin_error),
            Err(e) => {
                debug!("Transaction on queue {} rolled back: {}", self.name, e);
                if let Err(rollback) = channel.tx_rollback().await {
                    warn!("Rollback on queue {} failed: {}", self.name, rollback);
                }
                Err(e)
            }
        };

        if let Err(e) = channel.close(200, "transaction finished").await {
            debug!("Failed to close transaction channel: {}", e);
        }
        result
    }

    async fn consume(&self, window: usize) -> Result<Box<dyn JobIter>> {
        if self.tx_channel.is_some() {
            return Err(Error::TransactionsNotSupported);
        }

        let iter = AmqpJobIter::start(
            &self.name,
            Arc::clone(&self.connector),
            Window::new(window),
            window,
        )
        .await?;
        Ok(Box::new(iter))
    }

    async fn republish_buried(&self, conditions: Vec<RepublishCondition>) -> Result<()> {
        let channel = self.connector.dedicated_channel().await?;
        let buried = self.buried_queue_name();
        let config = self.config();

        let mut kept = Vec::new();
        let mut republished = 0usize;

        let drained: Result<()> = async {
            loop {
                let got = tokio::time::timeout(
                    config.buried_timeout(),
                    channel.basic_get(&buried, BasicGetOptions { no_ack: false }),
                )
                .await;

                let message = match got {
                    Ok(Ok(Some(message))) => message,
                    Ok(Ok(None)) | Err(_) => return Ok(()),
                    Ok(Err(e)) => return Err(lapin_error(e)),
                };

                let delivery = message.delivery;
                let mut job = wire::job_from_message(&delivery.properties, &delivery.data, config);

                if complies(&conditions, &job) {
                    job.error_type.clear();
                    publish_on(&channel, "", &self.name, &job, config).await?;
                    republished += 1;
                } else {
                    kept.push(job);
                }

                delivery
                    .acker
                    .ack(BasicAckOptions::default())
                    .await
                    .map_err(lapin_error)?;
            }
        }
        .await;

        // Acked but unmatched jobs go back to the buried store even on error
        let exchange = buried_exchange(&self.name, config);
        for job in &kept {
            if let Err(e) = publish_on(&channel, &exchange, "", job, config).await {
                warn!("Failed to re-bury job {} on queue {}: {}", job.id, self.name, e);
            }
        }

        if let Err(e) = channel.close(200, "republish finished").await {
            debug!("Failed to close republish channel: {}", e);
        }

        debug!(
            "Republished {} buried jobs on queue {}, {} left buried",
            republished,
            self.name,
            kept.len()
        );
        drained
    }
}

/// Publish `job` and wait for the broker confirm when the channel is in
/// confirm mode
pub(crate) async fn publish_on(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    job: &Job,
    config: &AmqpConfig,
) -> Result<()> {
    let confirmation = channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions::default(),
            &job.raw,
            wire::properties_for(job, config),
        )
        .await
        .map_err(lapin_error)?
        .await
        .map_err(lapin_error)?;

    if let Confirmation::Nack(_) = confirmation {
        return Err(Error::Broker(format!("job {} was not confirmed", job.id)));
    }
    Ok(())
}
