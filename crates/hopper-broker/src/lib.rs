//! Hopper Broker - Backend-agnostic queue abstraction
//!
//! This crate provides a unified interface over queue backends:
//! - Memory (in-process, optionally finite)
//! - AMQP 0.9.1 (behind the `amqp` feature, with reconnect-with-backoff)
//!
//! Brokers are looked up by URI scheme through [`BrokerRegistry`].

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;
pub mod registry;
pub mod traits;
pub mod window;

#[cfg(feature = "amqp")]
pub use amqp::{AmqpBroker, AmqpJobIter, AmqpQueue};
pub use memory::{MemoryBroker, MemoryJobIter, MemoryQueue};
pub use registry::BrokerRegistry;
pub use traits::{complies, tx_callback, Broker, JobIter, Queue, RepublishCondition, TxCallback};
pub use window::{Window, WindowSlot};

/// Connect to `uri` using the built-in backends with default settings
pub async fn connect(uri: &str) -> hopper_core::Result<Box<dyn Broker>> {
    BrokerRegistry::with_defaults(hopper_core::HopperConfig::default())
        .await
        .connect(uri)
        .await
}
