//! Shared fixtures for processor integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use krimson::broker::{ClientFactory, DeliveryDriver, LogConsumer, MemoryDeliveryDriver};
use krimson::codec::MESSAGE_TYPE_HEADER;
use krimson::gap::all_caught_up;
use krimson::record::Headers;
use krimson::{
    BrokerResult, JsonCodec, MemoryBroker, Message, OutputTopic, Processor, ProcessorOptions,
    ProcessorResult, ProcessorStatus,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub seq: i64,
}

impl Message for Note {
    const MESSAGE_TYPE: &'static str = "test.Note";
}

/// A type no test processor routes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ignored {
    pub seq: i64,
}

impl Message for Ignored {
    const MESSAGE_TYPE: &'static str = "test.Ignored";
}

pub fn codec() -> JsonCodec {
    JsonCodec::new().register::<Note>().register::<Ignored>()
}

/// Write a typed record the way a producer would
pub fn produce<T>(broker: &MemoryBroker, topic: &str, key: i64, value: &T)
where
    T: Message + Serialize,
{
    let payload = serde_json::to_vec(value).unwrap();
    let mut headers = Headers::new();
    headers.insert(MESSAGE_TYPE_HEADER.to_string(), Some(T::MESSAGE_TYPE.to_string()));
    broker.produce(topic, key, payload, headers).unwrap();
}

/// Write a payload-less record tagged with a message type
pub fn produce_tombstone(broker: &MemoryBroker, topic: &str, key: i64, message_type: &str) {
    let mut headers = Headers::new();
    headers.insert(MESSAGE_TYPE_HEADER.to_string(), Some(message_type.to_string()));
    broker.produce_tombstone(topic, key, headers).unwrap();
}

pub fn produce_notes(broker: &MemoryBroker, topic: &str, seqs: std::ops::Range<i64>) {
    for seq in seqs {
        produce(broker, topic, seq, &Note { seq });
    }
}

pub fn options(client_id: &str, input: &str) -> ProcessorOptions {
    ProcessorOptions {
        client_id: client_id.to_string(),
        input_topics: vec![input.to_string()],
        poll_timeout_ms: 50,
        commit_interval_ms: 0,
        flush_timeout_ms: 2_000,
        ..ProcessorOptions::default()
    }
}

pub fn with_output(mut options: ProcessorOptions, output: &str) -> ProcessorOptions {
    options.output_topic = Some(OutputTopic::new(output));
    options
}

/// Client factory over a [`MemoryBroker`] with a custom delivery driver
pub struct TestClients {
    pub broker: MemoryBroker,
    pub driver: MemoryDeliveryDriver,
}

impl TestClients {
    pub fn new(broker: &MemoryBroker, driver: MemoryDeliveryDriver) -> Arc<Self> {
        Arc::new(Self {
            broker: broker.clone(),
            driver,
        })
    }
}

#[async_trait]
impl ClientFactory for TestClients {
    fn create_consumer(&self, options: &ProcessorOptions) -> BrokerResult<Arc<dyn LogConsumer>> {
        self.broker.create_consumer(options)
    }

    fn create_driver(&self, _options: &ProcessorOptions) -> BrokerResult<Arc<dyn DeliveryDriver>> {
        Ok(Arc::new(self.driver.clone()))
    }

    async fn ensure_topic(&self, options: &ProcessorOptions, topic: &OutputTopic) -> BrokerResult<()> {
        self.broker.ensure_topic(options, topic).await
    }
}

/// Activate on a background task
pub fn spawn_activate(processor: &Processor) -> (CancellationToken, JoinHandle<ProcessorResult<()>>) {
    let token = CancellationToken::new();
    let processor = processor.clone();
    let activation = token.clone();
    let handle = tokio::spawn(async move { processor.activate(activation, None).await });
    (token, handle)
}

pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub async fn wait_until_async<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub async fn wait_activated(processor: &Processor) {
    wait_until(|| processor.status() == ProcessorStatus::Activated).await;
}

/// Wait until the processor owns partitions and has no gap on any of them
pub async fn wait_caught_up(processor: &Processor) {
    wait_until_async(|| async {
        match processor.subscription_gap().await {
            Ok(gaps) => !gaps.is_empty() && all_caught_up(&gaps),
            Err(_) => false,
        }
    })
    .await;
}
