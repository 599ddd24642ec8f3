//! Mapping between jobs and AMQP message properties

use bytes::Bytes;
use chrono::{DateTime, Utc};
use hopper_core::{AmqpConfig, Job, Priority, CONTENT_TYPE_MSGPACK};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::BasicProperties;

/// Persistent delivery mode
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Message properties carrying every job field except the body
pub(crate) fn properties_for(job: &Job, config: &AmqpConfig) -> BasicProperties {
    let mut headers = FieldTable::default();
    headers.insert(
        config.retries_header.as_str().into(),
        AMQPValue::LongInt(job.retries),
    );
    if !job.error_type.is_empty() {
        headers.insert(
            config.error_header.as_str().into(),
            AMQPValue::LongString(job.error_type.as_str().into()),
        );
    }

    BasicProperties::default()
        .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
        .with_message_id(job.id.as_str().into())
        .with_priority(job.priority.as_u8())
        .with_timestamp(job.timestamp.timestamp().max(0) as u64)
        .with_content_type(job.content_type.as_str().into())
        .with_headers(headers)
}

/// Rebuild a job from a delivered message
pub(crate) fn job_from_message(properties: &BasicProperties, body: &[u8], config: &AmqpConfig) -> Job {
    let mut job = Job::default();

    job.id = properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string())
        .unwrap_or_default();
    job.priority = properties
        .priority()
        .map(Priority::from)
        .unwrap_or_default();
    job.timestamp = properties
        .timestamp()
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts as i64, 0))
        .unwrap_or_else(Utc::now);
    job.content_type = properties
        .content_type()
        .as_ref()
        .map(|ct| ct.as_str().to_string())
        .unwrap_or_else(|| CONTENT_TYPE_MSGPACK.to_string());
    job.raw = Bytes::copy_from_slice(body);

    if let Some(headers) = properties.headers() {
        let headers = headers.inner();
        job.retries = headers
            .get(&ShortString::from(config.retries_header.as_str()))
            .and_then(retries_from)
            .unwrap_or(0);
        job.error_type = headers
            .get(&ShortString::from(config.error_header.as_str()))
            .and_then(text_from)
            .unwrap_or_default();
    }

    job
}

/// Accept the retry counter in any integer width and saturate it to i32
pub(crate) fn retries_from(value: &AMQPValue) -> Option<i32> {
    let wide: i64 = match value {
        AMQPValue::ShortShortInt(v) => i64::from(*v),
        AMQPValue::ShortShortUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::LongLongInt(v) => *v,
        _ => return None,
    };

    Some(wide.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32)
}

fn text_from(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_retries(value: AMQPValue) -> BasicProperties {
        let mut headers = FieldTable::default();
        headers.insert("x-retries".into(), value);
        BasicProperties::default()
            .with_message_id("id".into())
            .with_priority(Priority::Normal.as_u8())
            .with_content_type(CONTENT_TYPE_MSGPACK.into())
            .with_headers(headers)
    }

    #[test]
    fn test_retries_header_integer_widths() {
        let config = AmqpConfig::default();
        for value in [
            AMQPValue::ShortShortInt(42),
            AMQPValue::ShortShortUInt(42),
            AMQPValue::ShortInt(42),
            AMQPValue::ShortUInt(42),
            AMQPValue::LongInt(42),
            AMQPValue::LongUInt(42),
            AMQPValue::LongLongInt(42),
        ] {
            let job = job_from_message(&with_retries(value.clone()), b"x", &config);
            assert_eq!(job.retries, 42, "{:?}", value);
        }
    }

    #[test]
    fn test_retries_saturate() {
        assert_eq!(
            retries_from(&AMQPValue::LongLongInt(i64::MAX)),
            Some(i32::MAX)
        );
        assert_eq!(
            retries_from(&AMQPValue::LongUInt(u32::MAX)),
            Some(i32::MAX)
        );
        assert_eq!(retries_from(&AMQPValue::Boolean(true)), None);
    }

    #[test]
    fn test_missing_headers_default_to_zero_values() {
        let properties = BasicProperties::default().with_message_id("id".into());
        let job = job_from_message(&properties, b"payload", &AmqpConfig::default());

        assert_eq!(job.id, "id");
        assert_eq!(job.retries, 0);
        assert!(job.error_type.is_empty());
        assert_eq!(job.priority, Priority::Normal);
        assert_eq!(job.content_type, CONTENT_TYPE_MSGPACK);
        assert_eq!(job.raw.as_ref(), b"payload");
    }

    #[test]
    fn test_error_header_only_when_set() {
        let config = AmqpConfig::default();
        let mut job = Job::new().with_raw("x");

        let properties = properties_for(&job, &config);
        let headers = properties.headers().as_ref().unwrap().inner();
        assert!(!headers.contains_key(&ShortString::from("x-error-type")));

        job.error_type = "timeout".to_string();
        job.retries = 3;
        job.set_priority(Priority::Urgent);
        let properties = properties_for(&job, &config);
        let decoded = job_from_message(&properties, &job.raw, &config);

        assert_eq!(decoded.id, job.id);
        assert_eq!(decoded.error_type, "timeout");
        assert_eq!(decoded.retries, 3);
        assert_eq!(decoded.priority, Priority::Urgent);
        assert_eq!(decoded.timestamp.timestamp(), job.timestamp.timestamp());
        assert_eq!(*properties.delivery_mode(), Some(DELIVERY_MODE_PERSISTENT));
    }

    #[test]
    fn test_custom_header_names() {
        let config = AmqpConfig {
            retries_header: "x-attempts".to_string(),
            error_header: "x-failure".to_string(),
            ..Default::default()
        };
        let mut job = Job::new().with_raw("x");
        job.retries = 5;
        job.error_type = "oom".to_string();

        let properties = properties_for(&job, &config);
        let headers = properties.headers().as_ref().unwrap().inner();
        assert!(headers.contains_key(&ShortString::from("x-attempts")));
        assert!(headers.contains_key(&ShortString::from("x-failure")));
    }
}
