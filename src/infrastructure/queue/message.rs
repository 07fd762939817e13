//! Broker-neutral message model and the header vocabulary shared by task
//! messages and chunked stream transfers.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

pub const HEADER_RETRY_COUNT: &str = "x-retry-count";
pub const HEADER_MESSAGE_TYPE: &str = "x-message-type";
pub const HEADER_SEQUENCE: &str = "x-sequence";
pub const HEADER_FILE_NAME: &str = "x-file-name";
pub const HEADER_TOTAL_SIZE: &str = "x-total-size";
pub const HEADER_CHUNK_SIZE: &str = "x-chunk-size";
pub const HEADER_BYTES_PROCESSED: &str = "x-bytes-processed";
pub const HEADER_IS_LAST: &str = "x-is-last";
pub const HEADER_IS_END: &str = "x-is-end";
pub const HEADER_TOTAL_CHUNKS: &str = "x-total-chunks";

pub const STREAM_MESSAGE_TYPE: &str = "stream";
pub const APP_ID: &str = "video-transcoding-service";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Int(i64),
    Bool(bool),
    Text(String),
}

pub type Headers = BTreeMap<String, HeaderValue>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    pub headers: Headers,
    pub persistent: bool,
    pub timestamp: Option<u64>,
    pub app_id: Option<String>,
}

impl MessageProperties {
    /// Persistent message stamped with id, time and app id.
    pub fn persistent(message_id: &str) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .ok();

        Self {
            message_id: Some(message_id.to_string()),
            persistent: true,
            timestamp,
            app_id: Some(APP_ID.to_string()),
            ..Self::default()
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_header(mut self, key: &str, value: HeaderValue) -> Self {
        self.headers.insert(key.to_string(), value);
        self
    }

    pub fn header_int(&self, key: &str) -> Option<i64> {
        match self.headers.get(key)? {
            HeaderValue::Int(v) => Some(*v),
            HeaderValue::Text(s) => s.parse().ok(),
            HeaderValue::Bool(_) => None,
        }
    }

    pub fn header_bool(&self, key: &str) -> bool {
        matches!(self.headers.get(key), Some(HeaderValue::Bool(true)))
    }

    pub fn header_text(&self, key: &str) -> Option<&str> {
        match self.headers.get(key)? {
            HeaderValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Retry count carried by the message, 0 when the header is absent.
    pub fn retry_count(&self) -> u32 {
        self.header_int(HEADER_RETRY_COUNT)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0)
    }
}

/// A message handed to a consumer. Must be acked or nacked by tag.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub payload: Bytes,
    pub properties: MessageProperties,
    pub redelivered: bool,
}

impl Delivery {
    pub fn message_id(&self) -> &str {
        self.properties.message_id.as_deref().unwrap_or_default()
    }
}

/// Caller-supplied description of a byte stream about to be published.
#[derive(Debug, Clone, Default)]
pub struct StreamMetadata {
    pub file_size: Option<u64>,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub chunk_size: Option<usize>,
}

/// Stream headers as read back from a received chunk or end marker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeaders {
    pub sequence: u64,
    pub file_name: Option<String>,
    pub total_size: Option<u64>,
    pub chunk_size: Option<u64>,
    pub bytes_processed: Option<u64>,
    pub is_last: bool,
    pub is_end: bool,
    pub total_chunks: Option<u64>,
    pub content_type: Option<String>,
}

impl StreamHeaders {
    pub fn from_properties(properties: &MessageProperties) -> Self {
        let unsigned = |key| properties.header_int(key).and_then(|v| u64::try_from(v).ok());

        Self {
            sequence: unsigned(HEADER_SEQUENCE).unwrap_or(0),
            file_name: properties.header_text(HEADER_FILE_NAME).map(str::to_string),
            total_size: unsigned(HEADER_TOTAL_SIZE),
            chunk_size: unsigned(HEADER_CHUNK_SIZE),
            bytes_processed: unsigned(HEADER_BYTES_PROCESSED),
            is_last: properties.header_bool(HEADER_IS_LAST),
            is_end: properties.header_bool(HEADER_IS_END),
            total_chunks: unsigned(HEADER_TOTAL_CHUNKS),
            content_type: properties.content_type.clone(),
        }
    }
}

pub(crate) fn int(value: u64) -> HeaderValue {
    HeaderValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
}
