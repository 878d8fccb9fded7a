//! Typed stream processing over a partitioned log
//!
//! A [`Processor`] consumes records from input topics as part of a consumer
//! group, decodes them into typed messages, routes each message to the
//! handlers registered for its type and produces the outputs those handlers
//! emit. A record's offset is committed only after every output it emitted
//! was acknowledged, which gives at-least-once processing end to end.
//!
//! # Example
//!
//! ```no_run
//! use krimson::{JsonCodec, MemoryBroker, Message, Processor, ProcessorContext, OutputTopic};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Greeting {
//!     name: String,
//! }
//!
//! impl Message for Greeting {
//!     const MESSAGE_TYPE: &'static str = "demo.Greeting";
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let processor = Processor::builder()
//!     .client_id("greeter")
//!     .bootstrap_servers("memory")
//!     .input_topic("greetings")
//!     .output_topic(OutputTopic::new("replies"))
//!     .codec(JsonCodec::new().register::<Greeting>())
//!     .clients(Arc::new(MemoryBroker::new()))
//!     .process(|greeting: &Greeting, context: &ProcessorContext| {
//!         context.output_message(Greeting {
//!             name: format!("hello {}", greeting.name),
//!         })?;
//!         Ok(())
//!     })
//!     .build()?;
//!
//! processor.activate(CancellationToken::new(), None).await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all)]

/// Broker abstraction and implementations
pub mod broker;

/// Message encoding
pub mod codec;

/// Per-record processing context
pub mod context;

/// Error types
pub mod error;

/// Subscription gap tracking
pub mod gap;

/// Lifecycle event interceptors
pub mod interceptor;

/// Typed message values
pub mod message;

/// Processor lifecycle and consume loop
pub mod processor;

/// Fire-and-forget output producer
pub mod producer;

/// Record identity and metadata
pub mod record;

/// Retry with exponential backoff
pub mod retry;

/// Typed routing to handlers
pub mod router;

/// Keyed state stores
pub mod state;

pub use broker::{ClientFactory, MemoryBroker};
pub use codec::{Deserializer, JsonCodec, Serializer};
pub use context::ProcessorContext;
pub use error::{
    BoxError, BrokerError, BrokerResult, ContextError, ProcessorError, ProcessorResult, RouterError,
};
pub use gap::{GapTracker, SubscriptionPartitionGap, SubscriptionTopicGap};
pub use interceptor::{
    Interceptor, LoggingInterceptor, MetricsInterceptor, MetricsSnapshot, ProcessorEvent,
};
pub use message::{Message, UnknownMessage};
pub use processor::{
    OffsetReset, OnTerminated, OutputTopic, Processor, ProcessorBuilder, ProcessorOptions,
    ProcessorStatus,
};
pub use producer::{Producer, ProducerRequest, ProducerResult};
pub use record::{MessageKey, Record, RecordId, TopicPartition, TopicPartitionOffset};
pub use retry::RetryPolicy;
pub use router::{HandlerResult, Router, RouterModule};
pub use state::{MemoryStateStore, StateStore, StateStoreExt};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the tracing subscriber with JSON output filtered by `RUST_LOG`
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
