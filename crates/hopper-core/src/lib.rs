//! Hopper Core - Core types for the Hopper queue client
//!
//! This crate provides the backend-independent building blocks:
//! - Jobs, priorities and the acknowledgement capability
//! - Payload codecs keyed by content type
//! - Exponential backoff for reconnecting backends
//! - Configuration structures
//! - Error types

pub mod backoff;
pub mod codec;
pub mod config;
pub mod error;
pub mod job;

pub use backoff::Backoff;
pub use codec::{Codec, CONTENT_TYPE_JSON, CONTENT_TYPE_MSGPACK, CONTENT_TYPE_YAML};
pub use config::{AmqpConfig, BrokerConfig, HopperConfig, LoggingConfig, MemoryConfig};
pub use error::{Error, Result};
pub use job::{Acknowledger, Job, Priority};
