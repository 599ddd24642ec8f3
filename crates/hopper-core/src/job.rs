//! Jobs, priorities and the acknowledgement capability

use crate::codec::{Codec, CONTENT_TYPE_MSGPACK};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use uuid::Uuid;

/// Priority level of a job. Higher values are consumed first when the
/// backend can order them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 4,
    High = 6,
    Urgent = 8,
}

impl Priority {
    /// Highest priority a backend has to support
    pub const MAX: Priority = Priority::Urgent;

    /// Numeric value used on the wire
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl From<u8> for Priority {
    /// Maps a wire value to the closest level at or below it
    fn from(value: u8) -> Self {
        match value {
            0..=3 => Priority::Low,
            4..=5 => Priority::Normal,
            6..=7 => Priority::High,
            _ => Priority::Urgent,
        }
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.as_u8()
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Urgent => write!(f, "urgent"),
        }
    }
}

/// Disposition logic for one delivery.
///
/// Implementations are handed out by a job iterator and consumed by the
/// first call, so a delivery can be settled at most once.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// The job finished and must not be delivered again
    async fn ack(self: Box<Self>) -> Result<()>;

    /// The job failed. `job` is the delivered job in its current state (error
    /// type, retries), detached from this acknowledger. With `requeue` it goes
    /// back into circulation, otherwise it is buried.
    async fn reject(self: Box<Self>, job: Job, requeue: bool) -> Result<()>;
}

/// Acknowledgement state carried by a job
#[derive(Default)]
enum Disposition {
    /// Never delivered by a queue
    #[default]
    Detached,
    /// Delivered, waiting for ack or reject
    Pending(Box<dyn Acknowledger>),
    /// Already acked or rejected
    Settled,
}

impl fmt::Debug for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Detached => write!(f, "Detached"),
            Disposition::Pending(_) => write!(f, "Pending"),
            Disposition::Settled => write!(f, "Settled"),
        }
    }
}

/// A unit of work published to and consumed from a queue
#[derive(Debug, Default)]
pub struct Job {
    /// Unique job ID
    pub id: String,

    /// Priority level
    pub priority: Priority,

    /// When the job was created
    pub timestamp: DateTime<Utc>,

    /// Retry counter, carried through redeliveries
    pub retries: i32,

    /// Kind of the last failure, empty if none
    pub error_type: String,

    /// Content type of `raw`
    pub content_type: String,

    /// Encoded payload
    pub raw: Bytes,

    disposition: Disposition,
}

impl Job {
    /// Create a job with a fresh ID, normal priority, the current timestamp
    /// and the MessagePack content type
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            priority: Priority::Normal,
            timestamp: Utc::now(),
            retries: 0,
            error_type: String::new(),
            content_type: CONTENT_TYPE_MSGPACK.to_string(),
            raw: Bytes::new(),
            disposition: Disposition::Detached,
        }
    }

    /// Set the priority
    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    /// Builder-style priority setter
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Replace the payload with raw bytes, bypassing the codec
    pub fn with_raw(mut self, raw: impl Into<Bytes>) -> Self {
        self.raw = raw.into();
        self
    }

    /// Encode `payload` with the job's content type
    pub fn encode<T: Serialize + ?Sized>(&mut self, payload: &T) -> Result<()> {
        let codec = Codec::from_content_type(&self.content_type)?;
        self.raw = Bytes::from(codec.encode(payload)?);
        Ok(())
    }

    /// Decode the payload with the job's content type
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Codec::from_content_type(&self.content_type)?.decode(&self.raw)
    }

    /// Size of the encoded payload
    pub fn size(&self) -> usize {
        self.raw.len()
    }

    /// A job without payload can't be published
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Whether the job was delivered and still waits for ack or reject
    pub fn is_pending(&self) -> bool {
        matches!(self.disposition, Disposition::Pending(_))
    }

    /// Copy of this job without its acknowledger
    pub fn detached(&self) -> Job {
        Job {
            id: self.id.clone(),
            priority: self.priority,
            timestamp: self.timestamp,
            retries: self.retries,
            error_type: self.error_type.clone(),
            content_type: self.content_type.clone(),
            raw: self.raw.clone(),
            disposition: Disposition::Detached,
        }
    }

    /// Bind the acknowledger of a fresh delivery. Used by backends.
    pub fn bind_acknowledger(&mut self, acknowledger: Box<dyn Acknowledger>) {
        self.disposition = Disposition::Pending(acknowledger);
    }

    /// Mark the job as done
    pub async fn ack(&mut self) -> Result<()> {
        self.take_acknowledger()?.ack().await
    }

    /// Mark the job as failed. With `requeue` it is delivered again,
    /// otherwise it is buried until the queue republishes it.
    pub async fn reject(&mut self, requeue: bool) -> Result<()> {
        let acknowledger = self.take_acknowledger()?;
        acknowledger.reject(self.detached(), requeue).await
    }

    fn take_acknowledger(&mut self) -> Result<Box<dyn Acknowledger>> {
        match std::mem::replace(&mut self.disposition, Disposition::Settled) {
            Disposition::Pending(acknowledger) => Ok(acknowledger),
            Disposition::Detached => {
                self.disposition = Disposition::Detached;
                Err(Error::CannotAcknowledge)
            }
            Disposition::Settled => Err(Error::CannotAcknowledge),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Counting {
        acks: AtomicUsize,
        rejects: AtomicUsize,
    }

    struct CountingAck(Arc<Counting>);

    #[async_trait]
    impl Acknowledger for CountingAck {
        async fn ack(self: Box<Self>) -> Result<()> {
            self.0.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reject(self: Box<Self>, job: Job, _requeue: bool) -> Result<()> {
            assert!(!job.is_pending());
            self.0.rejects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_new_job_defaults() {
        let job = Job::new();
        assert!(!job.id.is_empty());
        assert_eq!(job.priority, Priority::Normal);
        assert_eq!(job.content_type, CONTENT_TYPE_MSGPACK);
        assert_eq!(job.retries, 0);
        assert!(job.error_type.is_empty());
        assert!(job.is_empty());
        assert_ne!(Job::new().id, job.id);
    }

    #[test]
    fn test_priority_order_and_wire_values() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Urgent);
        assert_eq!(Priority::from(Priority::Urgent.as_u8()), Priority::Urgent);
        assert_eq!(Priority::from(200), Priority::Urgent);
        assert_eq!(Priority::from(5), Priority::Normal);
    }

    #[test]
    fn test_encode_decode_payload() {
        let mut job = Job::new();
        job.encode("hello world!").unwrap();
        assert!(job.size() > 0);
        let payload: String = job.decode().unwrap();
        assert_eq!(payload, "hello world!");
    }

    #[test]
    fn test_unknown_content_type() {
        let mut job = Job::new();
        job.content_type = "text/x-unknown".to_string();
        assert!(matches!(
            job.encode(&1),
            Err(Error::UnknownContentType(_))
        ));
    }

    #[tokio::test]
    async fn test_ack_without_acknowledger() {
        let mut job = Job::new();
        assert!(matches!(job.ack().await, Err(Error::CannotAcknowledge)));
        assert!(matches!(
            job.reject(true).await,
            Err(Error::CannotAcknowledge)
        ));
    }

    #[tokio::test]
    async fn test_second_disposition_is_refused() {
        let counts = Arc::new(Counting::default());
        let mut job = Job::new();
        job.bind_acknowledger(Box::new(CountingAck(counts.clone())));
        assert!(job.is_pending());

        job.ack().await.unwrap();
        assert!(matches!(job.ack().await, Err(Error::CannotAcknowledge)));
        assert!(matches!(
            job.reject(false).await,
            Err(Error::CannotAcknowledge)
        ));

        assert_eq!(counts.acks.load(Ordering::SeqCst), 1);
        assert_eq!(counts.rejects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_detached_copy_has_no_acknowledger() {
        let counts = Arc::new(Counting::default());
        let mut job = Job::new().with_raw("payload");
        job.error_type = "timeout".to_string();
        job.bind_acknowledger(Box::new(CountingAck(counts.clone())));

        let mut copy = job.detached();
        assert_eq!(copy.id, job.id);
        assert_eq!(copy.error_type, "timeout");
        assert!(matches!(copy.ack().await, Err(Error::CannotAcknowledge)));

        job.reject(false).await.unwrap();
        assert_eq!(counts.rejects.load(Ordering::SeqCst), 1);
    }
}
