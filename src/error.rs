//! Error types for the processor runtime

use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::record::RecordId;

/// Boxed error returned by user handlers and hooks
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Text of a caught panic payload
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Result type for broker client operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Result type for processor operations
pub type ProcessorResult<T> = Result<T, ProcessorError>;

/// Errors reported by the underlying log client
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Kafka client errors
    #[cfg(feature = "kafka")]
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Connection errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// Subscription errors
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Errors while polling for records
    #[error("Consume error: {0}")]
    Consume(String),

    /// Offset commit errors
    #[error("Commit error: {0}")]
    Commit(String),

    /// Delivery failures reported for a produced record
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// Watermark or metadata lookups
    #[error("Metadata error: {0}")]
    Metadata(String),

    /// Topic does not exist
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    /// Timeout errors
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Client has been closed
    #[error("Client closed")]
    Closed,
}

impl BrokerError {
    /// Check if the error is transient and the operation may be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            #[cfg(feature = "kafka")]
            BrokerError::Kafka(e) => matches!(
                e.rdkafka_error_code(),
                Some(
                    rdkafka::types::RDKafkaErrorCode::RequestTimedOut
                        | rdkafka::types::RDKafkaErrorCode::OperationTimedOut
                        | rdkafka::types::RDKafkaErrorCode::CoordinatorLoadInProgress
                        | rdkafka::types::RDKafkaErrorCode::NotCoordinator
                        | rdkafka::types::RDKafkaErrorCode::RebalanceInProgress
                )
            ),
            BrokerError::Connection(_) => true,
            BrokerError::Timeout(_) => true,
            _ => false,
        }
    }
}

/// Route registration and lookup errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// A handler is already registered for the message type
    #[error("a route for message type '{message_type}' is already registered")]
    DuplicateRoute {
        /// Type tag of the duplicated route
        message_type: &'static str,
    },

    /// No handler is registered for the message type
    #[error("no route for message type '{message_type}'")]
    NoRoute {
        /// Type tag that could not be routed
        message_type: String,
    },

    /// A processor was built without any route
    #[error("no routes registered")]
    Empty,
}

/// Misuse of a processor context
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// `output` was called after the engine collected the outputs
    #[error("output queue is sealed; outputs must be added before the handler returns")]
    Sealed,

    /// The engine sealed the same context twice
    #[error("output queue was already sealed")]
    AlreadySealed,

    /// The request has no topic and the processor has no output topic
    #[error("output request has no topic and no output topic is configured")]
    NoOutputTopic,
}

/// Errors surfaced by the processor engine
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Broker client errors
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Routing errors
    #[error(transparent)]
    Router(#[from] RouterError),

    /// Context misuse
    #[error(transparent)]
    Context(#[from] ContextError),

    /// Message (de)serialization errors
    #[error("Codec error: {0}")]
    Codec(String),

    /// A handler failed while processing a record
    #[error("handler failed for {record}: {source}")]
    Handler {
        /// Record being processed
        record: RecordId,
        /// Error returned by the handler
        #[source]
        source: BoxError,
    },

    /// An output produced for a record was not delivered
    #[error("output {request_id} to topic '{topic}' failed: {source}")]
    OutputDelivery {
        /// Correlation id of the failed request
        request_id: Uuid,
        /// Destination topic
        topic: String,
        /// Encode or delivery failure
        #[source]
        source: Arc<ProcessorError>,
    },

    /// Processing was cancelled
    #[error("processing cancelled")]
    Cancelled,

    /// The processor was terminated and cannot be activated again
    #[error("processor '{0}' is terminated; build a new instance")]
    AlreadyTerminated(String),

    /// Operation requires an activated processor
    #[error("processor '{0}' is not activated")]
    NotActivated(String),

    /// Producer flush did not drain in time
    #[error("flush timed out with {0} requests in flight")]
    Flush(usize),

    /// Gap query for an unregistered client id
    #[error("no gap source registered for client '{0}'")]
    GapNotFound(String),

    /// Root cause combined with failures raised while tearing down
    #[error("{}", describe_termination(.cause.as_deref(), .teardown))]
    Termination {
        /// Error that triggered the termination, if any
        cause: Option<Arc<ProcessorError>>,
        /// Errors raised while stopping the consumer and producer
        teardown: Vec<ProcessorError>,
    },
}

fn describe_termination(cause: Option<&ProcessorError>, teardown: &[ProcessorError]) -> String {
    let teardown = teardown
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    match cause {
        Some(cause) => format!("{cause} (teardown errors: {teardown})"),
        None => format!("teardown failed: {teardown}"),
    }
}

impl ProcessorError {
    /// Whether this error represents a clean, cancellation-driven shutdown
    pub fn is_cancellation(&self) -> bool {
        match self {
            ProcessorError::Cancelled => true,
            ProcessorError::Handler { source, .. } => source
                .downcast_ref::<ProcessorError>()
                .is_some_and(ProcessorError::is_cancellation),
            _ => false,
        }
    }
}
