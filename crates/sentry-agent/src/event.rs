//! Decoding of log subscription payloads.
//!
//! Matching log events are delivered to the function as a JSON envelope
//! `{"awslogs": {"data": "..."}}`, where `data` is a base64 encoding of a
//! gzip-compressed JSON `LogsData` document.
use chrono::{DateTime, TimeZone, Utc};
use std::io::{Read, Write};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not a log subscription envelope")]
    Envelope(#[source] serde_json::Error),
    #[error("payload data is not valid base64")]
    Base64(#[from] base64::DecodeError),
    #[error("payload data is not valid gzip")]
    Gzip(#[source] std::io::Error),
    #[error("payload data is not a valid logs document")]
    Document(#[source] serde_json::Error),
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct Envelope {
    awslogs: AwsLogs,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct AwsLogs {
    data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    DataMessage,
    /// Sent when the subscription is created, to check that the destination is reachable.
    ControlMessage,
}

/// A batch of log events which matched a subscription filter.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsData {
    pub message_type: MessageType,
    #[serde(default)]
    pub owner: String,
    pub log_group: String,
    pub log_stream: String,
    #[serde(default)]
    pub subscription_filters: Vec<String>,
    #[serde(default)]
    pub log_events: Vec<LogEvent>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LogEvent {
    #[serde(default)]
    pub id: String,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub message: String,
}

impl LogEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.timestamp)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

/// Decode an invocation payload into its `LogsData`.
pub fn decode(payload: &[u8]) -> Result<LogsData, DecodeError> {
    let Envelope {
        awslogs: AwsLogs { data },
    } = serde_json::from_slice(payload).map_err(DecodeError::Envelope)?;

    let compressed = base64::decode(data.trim())?;

    let mut document = Vec::new();
    flate2::read::GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut document)
        .map_err(DecodeError::Gzip)?;

    serde_json::from_slice(&document).map_err(DecodeError::Document)
}

/// Encode `LogsData` into an invocation payload, as the platform delivers it.
pub fn encode(logs: &LogsData) -> Vec<u8> {
    let document = serde_json::to_vec(logs).expect("LogsData always serializes");

    let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    gz.write_all(&document).expect("writing to a Vec cannot fail");
    let compressed = gz.finish().expect("writing to a Vec cannot fail");

    serde_json::to_vec(&Envelope {
        awslogs: AwsLogs {
            data: base64::encode(compressed),
        },
    })
    .expect("Envelope always serializes")
}
