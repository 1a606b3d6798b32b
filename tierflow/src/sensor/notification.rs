//! File-arrival notification parsing.
//!
//! Accepted bodies:
//! - S3 event notifications (`{"Records": [...]}`), one arrival per created object
//! - the same wrapped once in an SNS envelope (`{"Type": "Notification", "Message": "..."}`)
//! - EventBridge `Object Created` events from `aws.s3`
//! - S3 test events, which carry no records

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::domain::{FileReference, SizeTier};

/// A single file announced by a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileArrival {
    pub file: FileReference,
    /// Tier requested by the producer, overriding size-based classification.
    pub explicit_tier: Option<SizeTier>,
}

/// A record that could not be turned into a [`FileArrival`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidRecord {
    pub index: usize,
    pub reason: String,
}

/// Everything extracted from one message body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedNotification {
    pub arrivals: Vec<FileArrival>,
    pub invalid: Vec<InvalidRecord>,
    /// Records for events other than object creation.
    pub skipped: usize,
}

impl ParsedNotification {
    /// Some records are dispatchable and some are not.
    pub fn is_partial(&self) -> bool {
        !self.arrivals.is_empty() && !self.invalid.is_empty()
    }
}

/// The message body as a whole could not be understood.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MalformedMessage {
    #[error("message body is not valid JSON: {0}")]
    Syntax(String),

    #[error("message body matches no supported notification shape: {0}")]
    Schema(String),
}

impl MalformedMessage {
    /// Redelivering the message cannot change the result.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Schema(_))
    }
}

#[derive(Debug, Deserialize)]
struct S3EventRecord {
    s3: S3Entity,
    #[serde(rename = "taskSize", alias = "task_size", default)]
    task_size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct S3Entity {
    bucket: S3Bucket,
    object: S3Object,
}

#[derive(Debug, Deserialize)]
struct S3Bucket {
    name: String,
}

#[derive(Debug, Deserialize)]
struct S3Object {
    key: String,
    size: u64,
    #[serde(rename = "eTag", alias = "etag", default)]
    e_tag: Option<String>,
    #[serde(rename = "versionId", alias = "version-id", default)]
    version_id: Option<String>,
    #[serde(default)]
    sequencer: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventBridgeDetail {
    bucket: S3Bucket,
    object: S3Object,
    #[serde(rename = "taskSize", alias = "task_size", default)]
    task_size: Option<String>,
}

/// Parse one message body into file arrivals.
pub fn parse_notification(body: &str) -> Result<ParsedNotification, MalformedMessage> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| MalformedMessage::Syntax(e.to_string()))?;

    if let Some(inner) = sns_message(&value)? {
        let inner: Value = serde_json::from_str(inner)
            .map_err(|e| MalformedMessage::Syntax(format!("SNS message: {e}")))?;
        return parse_value(&inner);
    }
    parse_value(&value)
}

fn sns_message(value: &Value) -> Result<Option<&str>, MalformedMessage> {
    if value.get("Type").and_then(Value::as_str) != Some("Notification") {
        return Ok(None);
    }
    value
        .get("Message")
        .and_then(Value::as_str)
        .map(Some)
        .ok_or_else(|| MalformedMessage::Schema("SNS envelope without a Message string".into()))
}

fn parse_value(value: &Value) -> Result<ParsedNotification, MalformedMessage> {
    let Some(object) = value.as_object() else {
        return Err(MalformedMessage::Schema("expected a JSON object".into()));
    };

    if object.get("Event").and_then(Value::as_str) == Some("s3:TestEvent") {
        return Ok(ParsedNotification::default());
    }

    if let Some(records) = object.get("Records") {
        let records = records
            .as_array()
            .ok_or_else(|| MalformedMessage::Schema("Records is not an array".into()))?;
        return Ok(parse_s3_records(records));
    }

    if object.get("source").and_then(Value::as_str) == Some("aws.s3")
        && let Some(detail) = object.get("detail")
    {
        let detail_type = object.get("detail-type").and_then(Value::as_str);
        return Ok(parse_event_bridge(detail_type, detail));
    }

    Err(MalformedMessage::Schema(
        "no Records array, S3 test event or EventBridge S3 event".into(),
    ))
}

fn parse_s3_records(records: &[Value]) -> ParsedNotification {
    let mut parsed = ParsedNotification::default();
    for (index, record) in records.iter().enumerate() {
        if let Some(event_name) = record.get("eventName").and_then(Value::as_str)
            && !is_object_created(event_name)
        {
            parsed.skipped += 1;
            continue;
        }

        let result = serde_json::from_value::<S3EventRecord>(record.clone())
            .map_err(|e| e.to_string())
            .and_then(|r| arrival(r.s3.bucket, r.s3.object, r.task_size));
        match result {
            Ok(arrival) => parsed.arrivals.push(arrival),
            Err(reason) => parsed.invalid.push(InvalidRecord { index, reason }),
        }
    }
    parsed
}

fn parse_event_bridge(detail_type: Option<&str>, detail: &Value) -> ParsedNotification {
    let mut parsed = ParsedNotification::default();
    if detail_type != Some("Object Created") {
        parsed.skipped = 1;
        return parsed;
    }
    let result = serde_json::from_value::<EventBridgeDetail>(detail.clone())
        .map_err(|e| e.to_string())
        .and_then(|d| arrival(d.bucket, d.object, d.task_size));
    match result {
        Ok(arrival) => parsed.arrivals.push(arrival),
        Err(reason) => parsed.invalid.push(InvalidRecord { index: 0, reason }),
    }
    parsed
}

fn is_object_created(event_name: &str) -> bool {
    event_name
        .strip_prefix("s3:")
        .unwrap_or(event_name)
        .starts_with("ObjectCreated:")
}

fn arrival(
    bucket: S3Bucket,
    object: S3Object,
    task_size: Option<String>,
) -> Result<FileArrival, String> {
    if bucket.name.is_empty() {
        return Err("empty bucket name".to_string());
    }
    let key = decode_key(&object.key)?;
    if key.is_empty() {
        return Err("empty object key".to_string());
    }

    let fingerprint = [object.e_tag, object.version_id, object.sequencer]
        .into_iter()
        .flatten()
        .map(|f| f.trim_matches('"').to_string())
        .find(|f| !f.is_empty())
        .ok_or_else(|| "no eTag, versionId or sequencer".to_string())?;

    let explicit_tier = task_size
        .map(|raw| {
            raw.parse::<SizeTier>()
                .map_err(|_| format!("unknown taskSize '{raw}'"))
        })
        .transpose()?;

    Ok(FileArrival {
        file: FileReference::new(bucket.name, key, object.size, fingerprint),
        explicit_tier,
    })
}

/// Decode an object key as it appears in S3 notifications.
pub fn decode_key(raw: &str) -> Result<String, String> {
    urlencoding::decode(&raw.replace('+', " "))
        .map(|key| key.into_owned())
        .map_err(|e| format!("object key '{raw}' is not valid UTF-8 once decoded: {e}"))
}
