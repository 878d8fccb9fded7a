//! rdkafka-backed broker clients
//!
//! Rebalance callbacks arrive synchronously from librdkafka while the consume
//! loop is inside [`LogConsumer::poll`]; the async [`RebalanceListener`] is
//! driven to completion on the calling worker with `block_in_place`, so a
//! multi-threaded Tokio runtime is required.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::message::{Header, Headers as _, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, ClientContext, Message, Offset, TopicPartitionList};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, error, info, warn};

use super::{
    ClientFactory, ConsumedRecord, DeliveryDriver, DeliveryFuture, LogConsumer, OffsetCommitter,
    OutboundRecord, RebalanceListener,
};
use crate::error::{BrokerError, BrokerResult};
use crate::processor::config::{OutputTopic, ProcessorOptions};
use crate::record::{Headers, MessageKey, RecordId, TopicPartition, TopicPartitionOffset};

const ADMIN_TIMEOUT: Duration = Duration::from_secs(30);

fn base_config(options: &ProcessorOptions) -> ClientConfig {
    let mut config = ClientConfig::new();
    for (key, value) in options.connection.client_properties() {
        config.set(key, value);
    }
    config.set("client.id", &options.client_id);
    for (key, value) in &options.client_properties {
        config.set(key, value);
    }
    config
}

fn to_partition_list(partitions: &[TopicPartition]) -> TopicPartitionList {
    let mut list = TopicPartitionList::with_capacity(partitions.len());
    for tp in partitions {
        list.add_partition(&tp.topic, tp.partition);
    }
    list
}

fn from_partition_list(list: &TopicPartitionList) -> Vec<TopicPartition> {
    list.elements()
        .iter()
        .map(|element| TopicPartition::new(element.topic(), element.partition()))
        .collect()
}

fn commit_offsets<C>(consumer: &C, offsets: &[TopicPartitionOffset]) -> BrokerResult<()>
where
    C: Consumer<KafkaContext>,
{
    let mut list = TopicPartitionList::with_capacity(offsets.len());
    for offset in offsets {
        list.add_partition_offset(
            &offset.partition.topic,
            offset.partition.partition,
            Offset::Offset(offset.offset),
        )?;
    }
    consumer.commit(&list, CommitMode::Sync)?;
    Ok(())
}

/// Drive an async callback to completion from librdkafka's callback thread
fn block_on_callback<F: Future<Output = ()>>(future: F) {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| handle.block_on(future))
        }
        _ => futures::executor::block_on(future),
    }
}

/// Consumer context forwarding rebalances to the processor's listener
pub struct KafkaContext {
    listener: Mutex<Option<Arc<dyn RebalanceListener>>>,
}

impl ClientContext for KafkaContext {}

struct BaseCommitter<'a>(&'a BaseConsumer<KafkaContext>);

impl OffsetCommitter for BaseCommitter<'_> {
    fn commit(&self, offsets: &[TopicPartitionOffset]) -> BrokerResult<()> {
        commit_offsets(self.0, offsets)
    }
}

impl ConsumerContext for KafkaContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        let Rebalance::Revoke(list) = rebalance else {
            return;
        };
        let Some(listener) = self.listener.lock().clone() else {
            return;
        };
        let partitions = from_partition_list(list);
        let committer = BaseCommitter(base_consumer);
        if base_consumer.assignment_lost() {
            warn!(?partitions, "Partitions lost");
            block_on_callback(listener.on_lost(&committer, &partitions));
        } else {
            info!(?partitions, "Partitions revoked");
            block_on_callback(listener.on_revoked(&committer, &partitions));
        }
    }

    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(list) => {
                let Some(listener) = self.listener.lock().clone() else {
                    return;
                };
                let partitions = from_partition_list(list);
                info!(?partitions, "Partitions assigned");
                block_on_callback(listener.on_assigned(&BaseCommitter(base_consumer), &partitions));
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(err) => error!("Rebalance error: {}", err),
        }
    }
}

/// Group consumer over a [`StreamConsumer`]
pub struct KafkaConsumer {
    consumer: StreamConsumer<KafkaContext>,
}

impl KafkaConsumer {
    pub fn new(options: &ProcessorOptions) -> BrokerResult<Self> {
        let mut config = base_config(options);
        config
            .set("group.id", options.group_id())
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", options.auto_offset_reset.as_str());

        let consumer: StreamConsumer<KafkaContext> = config
            .create_with_context(KafkaContext {
                listener: Mutex::new(None),
            })
            .map_err(|e| BrokerError::Connection(format!("Failed to create consumer: {}", e)))?;
        Ok(Self { consumer })
    }

    fn convert(message: &rdkafka::message::BorrowedMessage<'_>) -> ConsumedRecord {
        let mut headers = Headers::new();
        if let Some(raw) = message.headers() {
            for header in raw.iter() {
                let value = header.value.map(|v| String::from_utf8_lossy(v).into_owned());
                headers.insert(header.key.to_string(), value);
            }
        }
        let timestamp = message
            .timestamp()
            .to_millis()
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now);

        ConsumedRecord {
            id: RecordId::new(message.topic(), message.partition(), message.offset()),
            key: message
                .key()
                .map(|key| MessageKey::from_bytes(Bytes::copy_from_slice(key)))
                .unwrap_or(MessageKey::NONE),
            payload: message.payload().map(Bytes::copy_from_slice),
            headers,
            timestamp,
        }
    }
}

impl OffsetCommitter for KafkaConsumer {
    fn commit(&self, offsets: &[TopicPartitionOffset]) -> BrokerResult<()> {
        commit_offsets(&self.consumer, offsets)
    }
}

#[async_trait]
impl LogConsumer for KafkaConsumer {
    fn subscribe(&self, topics: &[String], listener: Arc<dyn RebalanceListener>) -> BrokerResult<()> {
        *self.consumer.context().listener.lock() = Some(listener);
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&topics)
            .map_err(|e| BrokerError::Subscription(format!("Failed to subscribe: {}", e)))?;
        info!("Subscribed to topics: {:?}", topics);
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> BrokerResult<Option<ConsumedRecord>> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(message)) => Ok(Some(Self::convert(&message))),
            Ok(Err(e)) => Err(BrokerError::Consume(e.to_string())),
        }
    }

    fn assignment(&self) -> BrokerResult<Vec<TopicPartition>> {
        Ok(from_partition_list(&self.consumer.assignment()?))
    }

    fn watermarks(&self, partition: &TopicPartition, timeout: Duration) -> BrokerResult<(i64, i64)> {
        Ok(self
            .consumer
            .fetch_watermarks(&partition.topic, partition.partition, timeout)?)
    }

    fn committed(
        &self,
        partitions: &[TopicPartition],
        timeout: Duration,
    ) -> BrokerResult<Vec<(TopicPartition, Option<i64>)>> {
        let committed = self
            .consumer
            .committed_offsets(to_partition_list(partitions), timeout)?;
        Ok(committed
            .elements()
            .iter()
            .map(|element| {
                let offset = match element.offset() {
                    Offset::Offset(offset) => Some(offset),
                    _ => None,
                };
                (TopicPartition::new(element.topic(), element.partition()), offset)
            })
            .collect())
    }

    fn close(&self) -> BrokerResult<()> {
        self.consumer.unsubscribe();
        debug!("Consumer unsubscribed");
        Ok(())
    }
}

/// Ordered delivery over a [`FutureProducer`]
pub struct KafkaDeliveryDriver {
    producer: FutureProducer,
}

impl KafkaDeliveryDriver {
    pub fn new(options: &ProcessorOptions) -> BrokerResult<Self> {
        let producer: FutureProducer = base_config(options)
            .create()
            .map_err(|e| BrokerError::Connection(format!("Failed to create producer: {}", e)))?;
        Ok(Self { producer })
    }
}

impl DeliveryDriver for KafkaDeliveryDriver {
    fn send(&self, record: OutboundRecord) -> DeliveryFuture {
        let mut headers = OwnedHeaders::new_with_capacity(record.headers.len());
        for (key, value) in &record.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: value.as_deref(),
            });
        }

        let mut outbound = FutureRecord::to(&record.topic)
            .payload(&record.payload[..])
            .headers(headers);
        if let Some(key) = record.key.as_bytes() {
            outbound = outbound.key(key);
        }
        if let Some(timestamp) = record.timestamp {
            outbound = outbound.timestamp(timestamp.timestamp_millis());
        }

        let topic = record.topic.clone();
        match self.producer.send_result(outbound) {
            Ok(delivery) => async move {
                match delivery.await {
                    Ok(Ok((partition, offset))) => Ok(RecordId::new(topic, partition, offset)),
                    Ok(Err((e, _))) => Err(BrokerError::Kafka(e)),
                    Err(_) => Err(BrokerError::Delivery(format!(
                        "delivery to '{}' was cancelled",
                        topic
                    ))),
                }
            }
            .boxed(),
            Err((e, _)) => futures::future::ready(Err(BrokerError::Kafka(e))).boxed(),
        }
    }

    fn flush(&self, timeout: Duration) -> BrokerResult<()> {
        self.producer.flush(Timeout::After(timeout))?;
        Ok(())
    }
}

/// [`ClientFactory`] creating rdkafka clients
#[derive(Debug, Default, Clone)]
pub struct KafkaClients;

#[async_trait]
impl ClientFactory for KafkaClients {
    fn create_consumer(&self, options: &ProcessorOptions) -> BrokerResult<Arc<dyn LogConsumer>> {
        Ok(Arc::new(KafkaConsumer::new(options)?))
    }

    fn create_driver(&self, options: &ProcessorOptions) -> BrokerResult<Arc<dyn DeliveryDriver>> {
        Ok(Arc::new(KafkaDeliveryDriver::new(options)?))
    }

    async fn ensure_topic(&self, options: &ProcessorOptions, topic: &OutputTopic) -> BrokerResult<()> {
        let admin: AdminClient<DefaultClientContext> = base_config(options)
            .create()
            .map_err(|e| BrokerError::Connection(format!("Failed to create admin client: {}", e)))?;

        let mut new_topic = NewTopic::new(
            &topic.name,
            topic.partitions,
            TopicReplication::Fixed(topic.replication_factor),
        );
        for (key, value) in &topic.configs {
            new_topic = new_topic.set(key, value);
        }
        let admin_options = AdminOptions::new().operation_timeout(Some(ADMIN_TIMEOUT));

        for result in admin.create_topics(&[new_topic], &admin_options).await? {
            match result {
                Ok(name) => info!(topic = %name, "Created output topic"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %name, "Output topic already exists")
                }
                Err((name, code)) => {
                    return Err(BrokerError::Metadata(format!(
                        "failed to create topic '{}': {}",
                        name, code
                    )))
                }
            }
        }
        Ok(())
    }
}

