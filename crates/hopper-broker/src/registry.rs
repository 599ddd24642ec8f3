//! Scheme registry dispatching broker URIs to backend constructors

use crate::memory::MemoryBroker;
use crate::traits::Broker;
use futures::future::BoxFuture;
use hopper_core::{Error, HopperConfig, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Async constructor building a broker from its URI
pub type Constructor = Arc<dyn Fn(String) -> BoxFuture<'static, Result<Box<dyn Broker>>> + Send + Sync>;

/// Maps URI schemes to broker constructors
#[derive(Default)]
pub struct BrokerRegistry {
    constructors: RwLock<HashMap<String, Constructor>>,
}

impl BrokerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with every built-in backend registered
    pub async fn with_defaults(config: HopperConfig) -> Self {
        let registry = Self::new();

        let memory = config.memory.clone();
        registry
            .register("memory", move |_uri| {
                let memory = memory.clone();
                async move { Ok(Box::new(MemoryBroker::with_config(memory, false)) as Box<dyn Broker>) }
            })
            .await;

        let memory = config.memory.clone();
        registry
            .register("memoryfinite", move |_uri| {
                let memory = memory.clone();
                async move { Ok(Box::new(MemoryBroker::with_config(memory, true)) as Box<dyn Broker>) }
            })
            .await;

        #[cfg(feature = "amqp")]
        for scheme in ["amqp", "amqps"] {
            let amqp = config.amqp.clone();
            registry
                .register(scheme, move |uri| {
                    let amqp = amqp.clone();
                    async move {
                        let broker = crate::amqp::AmqpBroker::with_config(&uri, amqp).await?;
                        Ok(Box::new(broker) as Box<dyn Broker>)
                    }
                })
                .await;
        }

        registry
    }

    /// Register a constructor for `scheme`, replacing any previous one
    pub async fn register<F, Fut>(&self, scheme: &str, constructor: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Box<dyn Broker>>> + Send + 'static,
    {
        let constructor: Constructor = Arc::new(move |uri| Box::pin(constructor(uri)));
        let mut constructors = self.constructors.write().await;
        constructors.insert(scheme.to_ascii_lowercase(), constructor);
        debug!("Registered broker scheme {}", scheme);
    }

    /// Registered schemes, sorted
    pub async fn schemes(&self) -> Vec<String> {
        let constructors = self.constructors.read().await;
        let mut schemes: Vec<String> = constructors.keys().cloned().collect();
        schemes.sort();
        schemes
    }

    /// Build a broker for `uri`, dispatching on its scheme
    pub async fn connect(&self, uri: &str) -> Result<Box<dyn Broker>> {
        let scheme = scheme_of(uri)?;

        let constructor = {
            let constructors = self.constructors.read().await;
            constructors
                .get(&scheme)
                .cloned()
                .ok_or_else(|| Error::UnsupportedScheme(scheme.clone()))?
        };

        info!("Creating {} broker", scheme);
        constructor(uri.to_string()).await
    }
}

/// Extract the lowercased scheme of `scheme://rest`
fn scheme_of(uri: &str) -> Result<String> {
    match uri.split_once("://") {
        Some((scheme, _)) if !scheme.is_empty() => Ok(scheme.to_ascii_lowercase()),
        _ => Err(Error::UnsupportedScheme(uri.to_string())),
    }
}
