//! Narrow interface to the partitioned log
//!
//! The processor engine drives the broker only through these traits:
//! subscribe, poll, commit, rebalance callbacks, watermark and committed
//! offset queries on the consuming side, and an ordered, fire-and-forget
//! [`DeliveryDriver`] on the producing side.
//!
//! Two implementations ship with the crate: [`memory`], an in-process log
//! used by tests and demos, and `kafka` (feature `kafka`), backed by rdkafka.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

use crate::error::BrokerResult;
use crate::processor::config::{OutputTopic, ProcessorOptions};
use crate::record::{Headers, MessageKey, RecordId, TopicPartition, TopicPartitionOffset};

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

pub use memory::{MemoryBroker, MemoryConsumer, MemoryDeliveryDriver};

/// A raw record as returned by [`LogConsumer::poll`]
#[derive(Debug, Clone)]
pub struct ConsumedRecord {
    /// Position in the log
    pub id: RecordId,
    /// Record key
    pub key: MessageKey,
    /// Raw payload
    pub payload: Option<Bytes>,
    /// Record headers
    pub headers: Headers,
    /// Broker timestamp
    pub timestamp: DateTime<Utc>,
}

/// A raw record handed to a [`DeliveryDriver`]
#[derive(Debug, Clone)]
pub struct OutboundRecord {
    /// Destination topic
    pub topic: String,
    /// Record key
    pub key: MessageKey,
    /// Serialized payload
    pub payload: Bytes,
    /// Record headers
    pub headers: Headers,
    /// Explicit timestamp; the broker assigns one when absent
    pub timestamp: Option<DateTime<Utc>>,
}

/// Commits resume positions for a consumer group
pub trait OffsetCommitter: Send + Sync {
    /// Synchronously commit the given next-offsets
    fn commit(&self, offsets: &[TopicPartitionOffset]) -> BrokerResult<()>;
}

/// Receives partition ownership changes
///
/// Callbacks run inside [`LogConsumer::poll`]; the rebalance is acknowledged
/// only after the callback returns.
#[async_trait]
pub trait RebalanceListener: Send + Sync {
    /// Partitions newly assigned to this member
    async fn on_assigned(&self, committer: &dyn OffsetCommitter, partitions: &[TopicPartition]);

    /// Partitions being handed over to another member
    async fn on_revoked(&self, committer: &dyn OffsetCommitter, partitions: &[TopicPartition]);

    /// Partitions already taken away, e.g. after a session timeout
    async fn on_lost(&self, committer: &dyn OffsetCommitter, partitions: &[TopicPartition]);
}

/// Consuming side of the log client
#[async_trait]
pub trait LogConsumer: OffsetCommitter {
    /// Join the group and subscribe to `topics`
    fn subscribe(&self, topics: &[String], listener: Arc<dyn RebalanceListener>) -> BrokerResult<()>;

    /// Wait up to `timeout` for the next record
    ///
    /// Must be cancel safe: dropping the future never loses a record.
    async fn poll(&self, timeout: Duration) -> BrokerResult<Option<ConsumedRecord>>;

    /// Partitions currently owned by this member
    fn assignment(&self) -> BrokerResult<Vec<TopicPartition>>;

    /// Low and high watermarks of a partition
    fn watermarks(&self, partition: &TopicPartition, timeout: Duration) -> BrokerResult<(i64, i64)>;

    /// Committed next-offsets of the group, `None` when nothing was committed
    fn committed(
        &self,
        partitions: &[TopicPartition],
        timeout: Duration,
    ) -> BrokerResult<Vec<(TopicPartition, Option<i64>)>>;

    /// Leave the group and release resources
    fn close(&self) -> BrokerResult<()>;
}

/// Completion of a single delivery
pub type DeliveryFuture = BoxFuture<'static, BrokerResult<RecordId>>;

/// Producing side of the log client
///
/// `send` enqueues synchronously, so records sent from one thread keep their
/// order; the returned future resolves once the broker acknowledged the
/// record. Transient broker errors are retried below this interface.
pub trait DeliveryDriver: Send + Sync {
    /// Enqueue a record for delivery
    fn send(&self, record: OutboundRecord) -> DeliveryFuture;

    /// Block until everything enqueued is acknowledged or `timeout` elapses
    fn flush(&self, timeout: Duration) -> BrokerResult<()>;
}

/// Creates broker clients for a processor
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Create the group consumer
    fn create_consumer(&self, options: &ProcessorOptions) -> BrokerResult<Arc<dyn LogConsumer>>;

    /// Create the delivery driver
    fn create_driver(&self, options: &ProcessorOptions) -> BrokerResult<Arc<dyn DeliveryDriver>>;

    /// Create the output topic if it does not exist
    async fn ensure_topic(&self, options: &ProcessorOptions, topic: &OutputTopic) -> BrokerResult<()>;
}
