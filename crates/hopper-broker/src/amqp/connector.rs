//! Connection management with reconnect-with-backoff

use super::lapin_error;
use deadpool_lapin::{Config, Pool, Runtime};
use hopper_core::{AmqpConfig, Error, Priority, Result};
use lapin::{
    options::*,
    types::{AMQPValue, FieldTable},
    Channel, ExchangeKind,
};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Reply code sent when we close a channel ourselves
const REPLY_SUCCESS: u16 = 200;

/// Owns the connection pool, the shared publishing channel and the set of
/// declared queues to restore after a reconnect
pub(crate) struct Connector {
    pool: Pool,
    config: Arc<AmqpConfig>,
    shared: Mutex<Option<Channel>>,
    topology: Mutex<BTreeSet<String>>,
    closed: AtomicBool,
}

impl Connector {
    /// Build the pool for `url` without connecting
    pub(crate) fn new(url: &str, config: Arc<AmqpConfig>) -> Result<Self> {
        url.parse::<lapin::uri::AMQPUri>()
            .map_err(|e| Error::Configuration(format!("invalid AMQP URI {:?}: {}", url, e)))?;

        let cfg = Config {
            url: Some(url.to_string()),
            ..Default::default()
        };

        let pool = cfg
            .builder(Some(Runtime::Tokio1))
            .max_size(config.pool_size.max(1))
            .build()
            .map_err(|e| Error::Configuration(e.to_string()))?;

        Ok(Self {
            pool,
            config,
            shared: Mutex::new(None),
            topology: Mutex::new(BTreeSet::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn config(&self) -> &AmqpConfig {
        &self.config
    }

    /// First connection. Fails fast instead of backing off.
    pub(crate) async fn connect(&self) -> Result<()> {
        let channel = self
            .establish_shared()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        *self.shared.lock().await = Some(channel);
        Ok(())
    }

    /// The shared channel, reconnecting first if it went away
    pub(crate) async fn channel(&self) -> Result<Channel> {
        let mut shared = self.shared.lock().await;

        if let Some(channel) = shared.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
            warn!("AMQP channel lost, reconnecting");
        }

        let channel = self
            .retrying("reconnect", move || self.establish_shared())
            .await?;
        *shared = Some(channel.clone());
        Ok(channel)
    }

    /// A new channel for a consumer or a transaction
    pub(crate) async fn dedicated_channel(&self) -> Result<Channel> {
        // Routes through the shared channel so topology is restored first
        self.channel().await?;
        self.retrying("open channel", move || self.open_channel()).await
    }

    /// Declare the topology of `queue` and remember it for reconnects
    pub(crate) async fn declare(&self, queue: &str) -> Result<()> {
        let channel = self.channel().await?;
        declare_topology(&channel, queue, &self.config).await?;
        self.topology.lock().await.insert(queue.to_string());
        Ok(())
    }

    /// Close the shared channel and the pool. Later operations fail.
    pub(crate) async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(channel) = self.shared.lock().await.take() {
            if channel.status().connected() {
                if let Err(e) = channel.close(REPLY_SUCCESS, "broker closed").await {
                    debug!("Failed to close AMQP channel: {}", e);
                }
            }
        }

        self.pool.close();
        info!("AMQP broker closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Broker("broker is closed".to_string()));
        }
        Ok(())
    }

    async fn open_channel(&self) -> Result<Channel> {
        self.ensure_open()?;

        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| Error::ConnectionLost(e.to_string()))?;

        conn.create_channel().await.map_err(lapin_error)
    }

    async fn establish_shared(&self) -> Result<Channel> {
        let channel = self.open_channel().await?;

        if self.config.publisher_confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(lapin_error)?;
        }

        let queues: Vec<String> = self.topology.lock().await.iter().cloned().collect();
        for queue in &queues {
            declare_topology(&channel, queue, &self.config).await?;
        }
        if !queues.is_empty() {
            debug!("Restored topology of {} queues", queues.len());
        }

        Ok(channel)
    }

    /// Run `op` until it succeeds, sleeping with backoff between
    /// connectivity failures. Other errors are returned as is.
    async fn retrying<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = self.config.backoff();

        loop {
            self.ensure_open()?;

            match op().await {
                Ok(value) => {
                    if backoff.attempt() > 0 {
                        info!(
                            "AMQP {} succeeded after {} retries",
                            what,
                            backoff.attempt()
                        );
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(error = %e, "AMQP {} failed, retrying in {:?}", what, delay);
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(Error::ReconnectFailed {
                            attempts: backoff.attempt(),
                            message: e.to_string(),
                        })
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }
}

/// Name of the dead-letter exchange of `queue`
pub(crate) fn buried_exchange(queue: &str, config: &AmqpConfig) -> String {
    format!("{}{}", queue, config.buried_exchange_suffix)
}

/// Name of the buried queue of `queue`
pub(crate) fn buried_queue(queue: &str, config: &AmqpConfig) -> String {
    format!("{}{}", queue, config.buried_queue_suffix)
}

/// Arguments of the main queue: priority support and dead-lettering into
/// the buried exchange
fn queue_arguments(queue: &str, config: &AmqpConfig) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        "x-max-priority".into(),
        AMQPValue::ShortShortUInt(Priority::MAX.as_u8()),
    );
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(buried_exchange(queue, config).into()),
    );
    args
}

async fn declare_topology(channel: &Channel, queue: &str, config: &AmqpConfig) -> Result<()> {
    let exchange = buried_exchange(queue, config);
    let buried = buried_queue(queue, config);

    channel
        .exchange_declare(
            &exchange,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(lapin_error)?;

    channel
        .queue_declare(
            &buried,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(lapin_error)?;

    channel
        .queue_bind(
            &buried,
            &exchange,
            "",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(lapin_error)?;

    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            queue_arguments(queue, config),
        )
        .await
        .map_err(lapin_error)?;

    debug!("Declared AMQP queue {} with buried queue {}", queue, buried);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::ShortString;

    #[test]
    fn test_buried_names() {
        let config = AmqpConfig::default();
        assert_eq!(buried_exchange("emails", &config), "emails.buriedExchange");
        assert_eq!(buried_queue("emails", &config), "emails.buriedQueue");
    }

    #[test]
    fn test_queue_arguments() {
        let config = AmqpConfig::default();
        let args = queue_arguments("emails", &config);
        let args = args.inner();

        assert_eq!(
            args.get(&ShortString::from("x-max-priority")),
            Some(&AMQPValue::ShortShortUInt(8))
        );
        assert!(args.contains_key(&ShortString::from("x-dead-letter-exchange")));
    }

    #[tokio::test]
    async fn test_bad_uri_is_rejected() {
        let result = Connector::new("badurl", Arc::new(AmqpConfig::default()));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
