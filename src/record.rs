//! Identity and addressing of records in the log

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::message::DynMessage;

/// Opaque record key, compared and hashed by its canonical bytes
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKey(Option<Bytes>);

impl MessageKey {
    /// The absent key
    pub const NONE: MessageKey = MessageKey(None);

    /// Build a key from raw bytes
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(Some(bytes.into()))
    }

    /// Build a key from a 64-bit integer (big-endian encoding)
    pub fn from_i64(value: i64) -> Self {
        Self(Some(Bytes::copy_from_slice(&value.to_be_bytes())))
    }

    /// Build a key from a UUID (16 raw bytes)
    pub fn from_uuid(value: Uuid) -> Self {
        Self(Some(Bytes::copy_from_slice(value.as_bytes())))
    }

    /// Whether this is the absent key
    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    /// Canonical bytes, if any
    pub fn as_bytes(&self) -> Option<&[u8]> {
        self.0.as_deref()
    }

    /// Decode an integer key
    pub fn to_i64(&self) -> Option<i64> {
        let bytes: [u8; 8] = self.as_bytes()?.try_into().ok()?;
        Some(i64::from_be_bytes(bytes))
    }

    /// Decode a UTF-8 key
    pub fn to_str(&self) -> Option<&str> {
        std::str::from_utf8(self.as_bytes()?).ok()
    }
}

impl From<&str> for MessageKey {
    fn from(value: &str) -> Self {
        Self::from_bytes(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<String> for MessageKey {
    fn from(value: String) -> Self {
        Self::from_bytes(value)
    }
}

impl From<i64> for MessageKey {
    fn from(value: i64) -> Self {
        Self::from_i64(value)
    }
}

impl From<Uuid> for MessageKey {
    fn from(value: Uuid) -> Self {
        Self::from_uuid(value)
    }
}

impl From<Option<Bytes>> for MessageKey {
    fn from(value: Option<Bytes>) -> Self {
        Self(value)
    }
}

impl fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageKey({self})")
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            None => f.write_str("<none>"),
            Some(bytes) => match std::str::from_utf8(bytes) {
                Ok(s) if !s.chars().any(char::is_control) => f.write_str(s),
                _ => {
                    for byte in bytes.iter() {
                        write!(f, "{byte:02x}")?;
                    }
                    Ok(())
                }
            },
        }
    }
}

/// A topic and one of its partitions
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    /// Topic name
    pub topic: String,
    /// Partition index
    pub partition: i32,
}

impl TopicPartition {
    /// Create a topic partition
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// A resume position for a partition: the next offset to consume
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicPartitionOffset {
    /// Partition the offset belongs to
    pub partition: TopicPartition,
    /// Next offset to consume
    pub offset: i64,
}

impl TopicPartitionOffset {
    /// Create a resume position
    pub fn new(partition: TopicPartition, offset: i64) -> Self {
        Self { partition, offset }
    }
}

/// Physical position of a record: topic, partition and offset
///
/// Ids are only ordered within the same topic partition; comparing ids from
/// different partitions yields `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId {
    /// Topic name
    pub topic: String,
    /// Partition index
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
}

impl RecordId {
    /// Create a record id
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }

    /// The partition this record lives in
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Position to resume from once this record is done
    pub fn next_position(&self) -> TopicPartitionOffset {
        TopicPartitionOffset::new(self.topic_partition(), self.offset + 1)
    }
}

impl PartialOrd for RecordId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.topic == other.topic && self.partition == other.partition {
            Some(self.offset.cmp(&other.offset))
        } else {
            None
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// Record headers, string keys to optional string values
pub type Headers = BTreeMap<String, Option<String>>;

/// A decoded input record
#[derive(Clone)]
pub struct Record {
    /// Position in the log
    pub id: RecordId,
    /// Record key
    pub key: MessageKey,
    /// Decoded value
    pub value: Arc<dyn DynMessage>,
    /// Broker timestamp
    pub timestamp: DateTime<Utc>,
    /// Record headers
    pub headers: Headers,
}

impl Record {
    /// Type tag of the decoded value
    pub fn message_type(&self) -> &str {
        self.value.message_type()
    }

    /// Downcast the value to a concrete message type
    pub fn value_as<T: 'static>(&self) -> Option<&T> {
        self.value.as_any().downcast_ref::<T>()
    }

    /// Header value by name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.as_deref())
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("message_type", &self.message_type())
            .field("timestamp", &self.timestamp)
            .finish()
    }
}
