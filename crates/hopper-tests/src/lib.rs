//! Hopper Integration Tests
//!
//! [`suite`] holds backend-independent conformance cases that take any
//! [`hopper_broker::Broker`]. The memory backend runs them on every
//! `cargo test`; the AMQP runs need a server:
//! ```sh
//! docker run -d --name rabbitmq -p 5672:5672 rabbitmq:3-management
//! cargo test -p hopper-tests -- --ignored
//! ```

pub mod common;
pub mod suite;
