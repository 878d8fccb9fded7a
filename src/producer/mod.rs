//! Fire-and-forget producer with per-request result callbacks
//!
//! [`Producer::produce`] never blocks: it encodes the request, attaches the
//! traceability headers and queues it. A single dispatcher task hands queued
//! records to the [`DeliveryDriver`] in submission order while holding at
//! most `max_in_flight` unacknowledged deliveries. Each request's callback is
//! invoked exactly once with a [`ProducerResult`] carrying its request id.

mod in_flight;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{DeliveryDriver, OutboundRecord};
use crate::codec::{Serializer, MESSAGE_TYPE_HEADER, SCHEMA_ID_HEADER};
use crate::error::{BrokerError, ContextError, ProcessorError, ProcessorResult};
use crate::message::{DynMessage, Message};
use crate::record::{Headers, MessageKey, RecordId};
use in_flight::InFlight;

/// Header naming the producing client
pub const PRODUCER_HEADER: &str = "krimson.producer";

/// Header carrying the request correlation id
pub const REQUEST_ID_HEADER: &str = "krimson.request-id";

/// An outbound send intent
#[derive(Debug, Clone)]
pub struct ProducerRequest {
    /// Destination; the producer's default topic when `None`
    pub topic: Option<String>,
    /// Record key
    pub key: MessageKey,
    /// Value to serialize
    pub message: Arc<dyn DynMessage>,
    /// Extra headers
    pub headers: Headers,
    /// Explicit timestamp
    pub timestamp: Option<DateTime<Utc>>,
    /// Correlation id
    pub request_id: Uuid,
}

impl ProducerRequest {
    /// Request for a typed message with a fresh request id
    pub fn new<T: Message>(message: T) -> Self {
        Self::from_shared(Arc::new(message))
    }

    /// Request for an already shared message
    pub fn from_shared(message: Arc<dyn DynMessage>) -> Self {
        Self {
            topic: None,
            key: MessageKey::NONE,
            message,
            headers: Headers::new(),
            timestamp: None,
            request_id: Uuid::new_v4(),
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<MessageKey>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), Some(value.into()));
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = request_id;
        self
    }
}

/// Outcome of a [`ProducerRequest`]
#[derive(Debug, Clone)]
pub struct ProducerResult {
    /// Correlation id of the request
    pub request_id: Uuid,
    /// Resolved destination topic, empty when none could be resolved
    pub topic: String,
    /// Position of the written record on success
    pub record_id: Option<RecordId>,
    /// Failure on error
    pub error: Option<Arc<ProcessorError>>,
    /// Completion time
    pub timestamp: DateTime<Utc>,
}

impl ProducerResult {
    fn succeeded(request_id: Uuid, record_id: RecordId) -> Self {
        Self {
            request_id,
            topic: record_id.topic.clone(),
            record_id: Some(record_id),
            error: None,
            timestamp: Utc::now(),
        }
    }

    fn failed(request_id: Uuid, topic: String, error: ProcessorError) -> Self {
        Self {
            request_id,
            topic,
            record_id: None,
            error: Some(Arc::new(error)),
            timestamp: Utc::now(),
        }
    }

    /// Whether the record was acknowledged
    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    /// Convert a failed result into an [`ProcessorError::OutputDelivery`]
    pub fn into_error(self) -> Option<ProcessorError> {
        let request_id = self.request_id;
        let topic = self.topic;
        self.error.map(|source| ProcessorError::OutputDelivery {
            request_id,
            topic,
            source,
        })
    }
}

/// Callback receiving the result of one request
pub type ResultCallback = Box<dyn FnOnce(ProducerResult) + Send + 'static>;

struct Pending {
    request_id: Uuid,
    record: OutboundRecord,
    callback: ResultCallback,
}

struct ProducerInner {
    client_id: String,
    default_topic: Option<String>,
    serializer: Arc<dyn Serializer>,
    driver: Arc<dyn DeliveryDriver>,
    in_flight: Arc<InFlight>,
    queue: Mutex<Option<mpsc::UnboundedSender<Pending>>>,
}

/// Fire-and-forget producer owned by one processor
#[derive(Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
}

impl Producer {
    /// Create a producer and start its dispatcher
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(
        client_id: impl Into<String>,
        default_topic: Option<String>,
        serializer: Arc<dyn Serializer>,
        driver: Arc<dyn DeliveryDriver>,
        max_in_flight: usize,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let in_flight = Arc::new(InFlight::default());
        tokio::spawn(dispatch(
            rx,
            driver.clone(),
            in_flight.clone(),
            Arc::new(Semaphore::new(max_in_flight.max(1))),
        ));

        Self {
            inner: Arc::new(ProducerInner {
                client_id: client_id.into(),
                default_topic,
                serializer,
                driver,
                in_flight,
                queue: Mutex::new(Some(tx)),
            }),
        }
    }

    /// Requests not yet acknowledged
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.count()
    }

    /// Queue a request; `on_result` is called exactly once
    pub fn produce(&self, request: ProducerRequest, on_result: ResultCallback) {
        let request_id = request.request_id;
        let topic = request
            .topic
            .clone()
            .or_else(|| self.inner.default_topic.clone());

        let record = match topic {
            Some(topic) => self.encode(topic, request),
            None => Err((String::new(), ContextError::NoOutputTopic.into())),
        };
        let record = match record {
            Ok(record) => record,
            Err((topic, error)) => {
                warn!(%request_id, topic, %error, "Output request rejected before delivery");
                on_result(ProducerResult::failed(request_id, topic, error));
                return;
            }
        };

        self.inner.in_flight.add();
        let pending = Pending {
            request_id,
            record,
            callback: on_result,
        };
        let rejected = match self.inner.queue.lock().as_ref() {
            Some(queue) => queue.send(pending).err().map(|e| e.0),
            None => Some(pending),
        };
        if let Some(pending) = rejected {
            self.inner.in_flight.remove();
            let topic = pending.record.topic;
            (pending.callback)(ProducerResult::failed(
                request_id,
                topic,
                BrokerError::Closed.into(),
            ));
        }
    }

    /// Produce and wait for the result
    ///
    /// With `throw_on_error` a failed result is returned as
    /// [`ProcessorError::OutputDelivery`].
    pub async fn produce_and_wait(
        &self,
        request: ProducerRequest,
        throw_on_error: bool,
    ) -> ProcessorResult<ProducerResult> {
        let (tx, rx) = oneshot::channel();
        self.produce(
            request,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        let result = rx.await.map_err(|_| ProcessorError::Cancelled)?;
        match result.clone().into_error() {
            Some(error) if throw_on_error => Err(error),
            _ => Ok(result),
        }
    }

    /// Wait until every queued request has been acknowledged
    pub async fn flush(&self, timeout: Duration) -> ProcessorResult<()> {
        self.inner
            .in_flight
            .wait_idle(timeout)
            .await
            .map_err(ProcessorError::Flush)
    }

    /// Flush, then stop accepting requests
    ///
    /// Requests produced after close fail with [`BrokerError::Closed`].
    pub async fn close(&self, timeout: Duration) -> ProcessorResult<()> {
        let flushed = self.flush(timeout).await;
        let queue = self.inner.queue.lock().take();
        if queue.is_some() {
            info!(client_id = %self.inner.client_id, "Producer closed");
        }
        self.inner.driver.flush(timeout)?;
        flushed
    }

    fn encode(
        &self,
        topic: String,
        request: ProducerRequest,
    ) -> Result<OutboundRecord, (String, ProcessorError)> {
        let encoded = match self.inner.serializer.serialize(&topic, request.message.as_ref()) {
            Ok(encoded) => encoded,
            Err(error) => return Err((topic, error)),
        };

        let mut headers = request.headers;
        headers.insert(PRODUCER_HEADER.into(), Some(self.inner.client_id.clone()));
        headers.insert(REQUEST_ID_HEADER.into(), Some(request.request_id.to_string()));
        headers.insert(MESSAGE_TYPE_HEADER.into(), Some(encoded.message_type));
        if let Some(schema_id) = encoded.schema_id {
            headers.insert(SCHEMA_ID_HEADER.into(), Some(schema_id.to_string()));
        }

        Ok(OutboundRecord {
            topic,
            key: request.key,
            payload: encoded.payload,
            headers,
            timestamp: request.timestamp,
        })
    }
}

async fn dispatch(
    mut queue: mpsc::UnboundedReceiver<Pending>,
    driver: Arc<dyn DeliveryDriver>,
    in_flight: Arc<InFlight>,
    window: Arc<Semaphore>,
) {
    while let Some(pending) = queue.recv().await {
        let Ok(permit) = window.clone().acquire_owned().await else {
            error!("Delivery window closed");
            break;
        };
        let Pending {
            request_id,
            record,
            callback,
        } = pending;
        let topic = record.topic.clone();
        let delivery = driver.send(record);
        let in_flight = in_flight.clone();

        tokio::spawn(async move {
            let result = match delivery.await {
                Ok(record_id) => {
                    debug!(%request_id, %record_id, "Output delivered");
                    ProducerResult::succeeded(request_id, record_id)
                }
                Err(error) => {
                    warn!(%request_id, topic, %error, "Output delivery failed");
                    ProducerResult::failed(request_id, topic, error.into())
                }
            };
            drop(permit);
            callback(result);
            in_flight.remove();
        });
    }
    debug!("Producer dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::codec::JsonCodec;
    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Reading {
        value: i64,
    }

    impl Message for Reading {
        const MESSAGE_TYPE: &'static str = "test.Reading";
    }

    fn producer(broker: &MemoryBroker, default_topic: Option<&str>) -> Producer {
        Producer::new(
            "test-client",
            default_topic.map(String::from),
            Arc::new(JsonCodec::new().register::<Reading>()),
            Arc::new(broker.driver()),
            4,
        )
    }

    #[tokio::test]
    async fn test_produce_preserves_order_and_headers() {
        let broker = MemoryBroker::new();
        let producer = producer(&broker, Some("readings"));

        for value in 0..20 {
            producer.produce(
                ProducerRequest::new(Reading { value }).with_key("sensor"),
                Box::new(|_| {}),
            );
        }
        producer.flush(Duration::from_secs(5)).await.unwrap();

        let records = broker.records("readings");
        let values: Vec<i64> = records
            .iter()
            .map(|r| serde_json::from_slice::<Reading>(r.payload.as_ref().unwrap()).unwrap().value)
            .collect();
        assert_eq!(values, (0..20).collect::<Vec<_>>());

        let headers = &records[0].headers;
        assert_eq!(headers[PRODUCER_HEADER].as_deref(), Some("test-client"));
        assert_eq!(headers[MESSAGE_TYPE_HEADER].as_deref(), Some("test.Reading"));
        assert_eq!(headers[SCHEMA_ID_HEADER].as_deref(), Some("1"));
        assert!(headers.contains_key(REQUEST_ID_HEADER));
    }

    #[tokio::test]
    async fn test_result_carries_request_id() {
        let broker = MemoryBroker::new();
        let producer = producer(&broker, Some("readings"));
        let request_id = Uuid::new_v4();

        let result = producer
            .produce_and_wait(
                ProducerRequest::new(Reading { value: 1 }).with_request_id(request_id),
                true,
            )
            .await
            .unwrap();
        assert!(result.success());
        assert_eq!(result.request_id, request_id);
        assert_eq!(result.record_id, Some(RecordId::new("readings", 0, 0)));
    }

    #[tokio::test]
    async fn test_missing_topic_fails_through_callback() {
        let broker = MemoryBroker::new();
        let producer = producer(&broker, None);

        let result = producer
            .produce_and_wait(ProducerRequest::new(Reading { value: 1 }), false)
            .await
            .unwrap();
        assert!(!result.success());
        assert_eq!(producer.in_flight(), 0);

        let error = producer
            .produce_and_wait(ProducerRequest::new(Reading { value: 1 }), true)
            .await
            .unwrap_err();
        assert!(matches!(error, ProcessorError::OutputDelivery { .. }));
    }

    #[tokio::test]
    async fn test_delivery_failure_is_reported() {
        let broker = MemoryBroker::new();
        let producer = Producer::new(
            "test-client",
            Some("readings".into()),
            Arc::new(JsonCodec::new().register::<Reading>()),
            Arc::new(
                broker
                    .driver()
                    .fail_when(|_| Some(BrokerError::Delivery("broker rejected".into()))),
            ),
            4,
        );

        let result = producer
            .produce_and_wait(ProducerRequest::new(Reading { value: 1 }), false)
            .await
            .unwrap();
        assert!(matches!(
            result.error.as_deref(),
            Some(ProcessorError::Broker(BrokerError::Delivery(_)))
        ));
    }

    #[tokio::test]
    async fn test_produce_after_close_fails() {
        let broker = MemoryBroker::new();
        let producer = producer(&broker, Some("readings"));
        producer.close(Duration::from_secs(1)).await.unwrap();

        let result = producer
            .produce_and_wait(ProducerRequest::new(Reading { value: 1 }), false)
            .await
            .unwrap();
        assert!(matches!(
            result.error.as_deref(),
            Some(ProcessorError::Broker(BrokerError::Closed))
        ));
    }

    #[tokio::test]
    async fn test_flush_waits_for_slow_acknowledgements() {
        let broker = MemoryBroker::new();
        let producer = Producer::new(
            "test-client",
            Some("readings".into()),
            Arc::new(JsonCodec::new().register::<Reading>()),
            Arc::new(broker.driver().with_delay(Duration::from_millis(20))),
            2,
        );
        for value in 0..5 {
            producer.produce(ProducerRequest::new(Reading { value }), Box::new(|_| {}));
        }
        assert!(producer.in_flight() > 0);
        producer.flush(Duration::from_secs(5)).await.unwrap();
        assert_eq!(producer.in_flight(), 0);
        assert_eq!(broker.records("readings").len(), 5);
    }
}
