//! Synchronous lifecycle event bus
//!
//! The engine publishes a [`ProcessorEvent`] at every step of a record's life
//! and at every lifecycle transition. Events are dispatched on the calling
//! task, in registration order, before the engine moves on. An interceptor
//! that panics is logged and skipped; it never reaches processing code.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use crate::error::{panic_message, BrokerError, ProcessorError};
use crate::gap::{GapProbe, SubscriptionTopicGap};
use crate::processor::ProcessorStatus;
use crate::producer::ProducerResult;
use crate::record::{Record, RecordId, TopicPartition, TopicPartitionOffset};

/// Lifecycle and per-record events
#[derive(Debug, Clone, Copy)]
pub enum ProcessorEvent<'a> {
    /// The processor subscribed and entered `Activated`
    Activated {
        client_id: &'a str,
        group_id: &'a str,
        topics: &'a [String],
        probe: &'a GapProbe,
    },
    PartitionsAssigned {
        client_id: &'a str,
        partitions: &'a [TopicPartition],
    },
    PartitionsRevoked {
        client_id: &'a str,
        partitions: &'a [TopicPartition],
    },
    PartitionsLost {
        client_id: &'a str,
        partitions: &'a [TopicPartition],
    },
    /// A routable record is about to be handled
    InputReady { client_id: &'a str, record: &'a Record },
    /// A record without a route was tracked without handling
    InputSkipped { client_id: &'a str, record: &'a Record },
    /// A record and all of its outputs completed; its position is tracked
    InputProcessed {
        client_id: &'a str,
        record: &'a Record,
        outputs: usize,
        elapsed: Duration,
    },
    /// A record's handler or one of its outputs failed
    InputError {
        client_id: &'a str,
        record: &'a Record,
        error: &'a ProcessorError,
    },
    /// One output of a record completed
    OutputProcessed {
        client_id: &'a str,
        input: &'a RecordId,
        result: &'a ProducerResult,
    },
    /// Committing positions failed
    CommitFailed {
        client_id: &'a str,
        offsets: &'a [TopicPartitionOffset],
        error: &'a BrokerError,
    },
    /// Terminate was called on a processor that is not activated
    TerminateIgnored {
        client_id: &'a str,
        status: ProcessorStatus,
    },
    /// The processor reached `Terminated`
    Terminated {
        client_id: &'a str,
        gaps: &'a [SubscriptionTopicGap],
        error: Option<&'a ProcessorError>,
    },
}

impl ProcessorEvent<'_> {
    /// Short event name for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            ProcessorEvent::Activated { .. } => "activated",
            ProcessorEvent::PartitionsAssigned { .. } => "partitions_assigned",
            ProcessorEvent::PartitionsRevoked { .. } => "partitions_revoked",
            ProcessorEvent::PartitionsLost { .. } => "partitions_lost",
            ProcessorEvent::InputReady { .. } => "input_ready",
            ProcessorEvent::InputSkipped { .. } => "input_skipped",
            ProcessorEvent::InputProcessed { .. } => "input_processed",
            ProcessorEvent::InputError { .. } => "input_error",
            ProcessorEvent::OutputProcessed { .. } => "output_processed",
            ProcessorEvent::CommitFailed { .. } => "commit_failed",
            ProcessorEvent::TerminateIgnored { .. } => "terminate_ignored",
            ProcessorEvent::Terminated { .. } => "terminated",
        }
    }
}

/// Observer of [`ProcessorEvent`]s
///
/// Called synchronously on the publishing task; implementations must be quick
/// and must not block.
pub trait Interceptor: Send + Sync {
    fn intercept(&self, event: &ProcessorEvent<'_>);
}

impl<F> Interceptor for F
where
    F: Fn(&ProcessorEvent<'_>) + Send + Sync,
{
    fn intercept(&self, event: &ProcessorEvent<'_>) {
        self(event)
    }
}

/// Ordered list of interceptors, fixed once the processor is built
#[derive(Clone, Default)]
pub struct InterceptorBus {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an interceptor at the end, or in front with `prepend`
    pub fn register(&mut self, interceptor: Arc<dyn Interceptor>, prepend: bool) {
        if prepend {
            self.interceptors.insert(0, interceptor);
        } else {
            self.interceptors.push(interceptor);
        }
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Dispatch to every interceptor in order
    pub fn publish(&self, event: ProcessorEvent<'_>) {
        for (index, interceptor) in self.interceptors.iter().enumerate() {
            let outcome = catch_unwind(AssertUnwindSafe(|| interceptor.intercept(&event)));
            if let Err(panic) = outcome {
                let message = panic_message(panic.as_ref());
                error!(
                    interceptor = index,
                    event = event.name(),
                    panic = %message,
                    "Interceptor panicked; event delivery continues"
                );
            }
        }
    }
}

/// Renders every event through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingInterceptor;

impl Interceptor for LoggingInterceptor {
    fn intercept(&self, event: &ProcessorEvent<'_>) {
        match *event {
            ProcessorEvent::Activated {
                client_id,
                group_id,
                topics,
                ..
            } => info!(client_id, group_id, ?topics, "Processor activated"),
            ProcessorEvent::PartitionsAssigned {
                client_id,
                partitions,
            } => info!(client_id, ?partitions, "Partitions assigned"),
            ProcessorEvent::PartitionsRevoked {
                client_id,
                partitions,
            } => info!(client_id, ?partitions, "Partitions revoked"),
            ProcessorEvent::PartitionsLost {
                client_id,
                partitions,
            } => warn!(client_id, ?partitions, "Partitions lost"),
            ProcessorEvent::InputReady { client_id, record } => {
                trace!(client_id, record = %record.id, message_type = record.message_type(), "Input ready")
            }
            ProcessorEvent::InputSkipped { client_id, record } => {
                debug!(client_id, record = %record.id, message_type = record.message_type(), "Input skipped, no route")
            }
            ProcessorEvent::InputProcessed {
                client_id,
                record,
                outputs,
                elapsed,
            } => debug!(client_id, record = %record.id, outputs, ?elapsed, "Input processed"),
            ProcessorEvent::InputError {
                client_id,
                record,
                error,
            } => error!(client_id, record = %record.id, %error, "Input error"),
            ProcessorEvent::OutputProcessed {
                client_id,
                input,
                result,
            } => match &result.error {
                None => trace!(client_id, %input, request_id = %result.request_id, "Output processed"),
                Some(error) => warn!(client_id, %input, request_id = %result.request_id, %error, "Output failed"),
            },
            ProcessorEvent::CommitFailed {
                client_id,
                offsets,
                error,
            } => warn!(client_id, ?offsets, %error, "Offset commit failed"),
            ProcessorEvent::TerminateIgnored { client_id, status } => {
                warn!(client_id, ?status, "Terminate requested while not activated")
            }
            ProcessorEvent::Terminated {
                client_id,
                gaps,
                error,
            } => match error {
                None => info!(client_id, ?gaps, "Processor terminated"),
                Some(error) => error!(client_id, ?gaps, %error, "Processor terminated with error"),
            },
        }
    }
}

/// Point-in-time copy of [`ProcessorMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub records_ready: u64,
    pub records_skipped: u64,
    pub records_processed: u64,
    pub records_failed: u64,
    pub outputs_succeeded: u64,
    pub outputs_failed: u64,
    pub rebalances: u64,
    pub commit_failures: u64,
    pub average_processing: Duration,
    pub errors_by_kind: HashMap<String, u64>,
}

/// Counters fed by [`MetricsInterceptor`]
#[derive(Debug, Default)]
pub struct ProcessorMetrics {
    records_ready: AtomicU64,
    records_skipped: AtomicU64,
    records_processed: AtomicU64,
    records_failed: AtomicU64,
    outputs_succeeded: AtomicU64,
    outputs_failed: AtomicU64,
    rebalances: AtomicU64,
    commit_failures: AtomicU64,
    processing_micros: AtomicU64,
    errors_by_kind: Mutex<HashMap<String, u64>>,
}

impl ProcessorMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        let processed = self.records_processed.load(Ordering::Relaxed);
        let total_micros = self.processing_micros.load(Ordering::Relaxed);
        MetricsSnapshot {
            records_ready: self.records_ready.load(Ordering::Relaxed),
            records_skipped: self.records_skipped.load(Ordering::Relaxed),
            records_processed: processed,
            records_failed: self.records_failed.load(Ordering::Relaxed),
            outputs_succeeded: self.outputs_succeeded.load(Ordering::Relaxed),
            outputs_failed: self.outputs_failed.load(Ordering::Relaxed),
            rebalances: self.rebalances.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            average_processing: if processed == 0 {
                Duration::ZERO
            } else {
                Duration::from_micros(total_micros / processed)
            },
            errors_by_kind: self.errors_by_kind.lock().clone(),
        }
    }

    fn record_error(&self, error: &ProcessorError) {
        let kind = match error {
            ProcessorError::Handler { .. } => "handler",
            ProcessorError::OutputDelivery { .. } => "output_delivery",
            ProcessorError::Codec(_) => "codec",
            ProcessorError::Broker(_) => "broker",
            ProcessorError::Context(_) => "context",
            _ => "other",
        };
        *self.errors_by_kind.lock().entry(kind.to_string()).or_insert(0) += 1;
    }
}

/// Counts records, outputs, rebalances and processing latency
#[derive(Debug, Default, Clone)]
pub struct MetricsInterceptor {
    metrics: Arc<ProcessorMetrics>,
}

impl MetricsInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared counters, readable while the processor runs
    pub fn metrics(&self) -> Arc<ProcessorMetrics> {
        self.metrics.clone()
    }
}

impl Interceptor for MetricsInterceptor {
    fn intercept(&self, event: &ProcessorEvent<'_>) {
        let metrics = &self.metrics;
        match event {
            ProcessorEvent::InputReady { .. } => {
                metrics.records_ready.fetch_add(1, Ordering::Relaxed);
            }
            ProcessorEvent::InputSkipped { .. } => {
                metrics.records_skipped.fetch_add(1, Ordering::Relaxed);
            }
            ProcessorEvent::InputProcessed { elapsed, .. } => {
                metrics.records_processed.fetch_add(1, Ordering::Relaxed);
                metrics
                    .processing_micros
                    .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
            }
            ProcessorEvent::InputError { error, .. } => {
                metrics.records_failed.fetch_add(1, Ordering::Relaxed);
                metrics.record_error(error);
            }
            ProcessorEvent::OutputProcessed { result, .. } => {
                let counter = if result.success() {
                    &metrics.outputs_succeeded
                } else {
                    &metrics.outputs_failed
                };
                counter.fetch_add(1, Ordering::Relaxed);
            }
            ProcessorEvent::PartitionsAssigned { .. }
            | ProcessorEvent::PartitionsRevoked { .. }
            | ProcessorEvent::PartitionsLost { .. } => {
                metrics.rebalances.fetch_add(1, Ordering::Relaxed);
            }
            ProcessorEvent::CommitFailed { .. } => {
                metrics.commit_failures.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::{record_of, Note};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_publish_in_registration_order_with_prepend() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut bus = InterceptorBus::new();
        for (name, prepend) in [("second", false), ("third", false), ("first", true)] {
            let order = order.clone();
            bus.register(
                Arc::new(move |_: &ProcessorEvent<'_>| order.lock().push(name)),
                prepend,
            );
        }

        let record = record_of(Note("x"), 0);
        bus.publish(ProcessorEvent::InputReady {
            client_id: "c",
            record: &record,
        });
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_panicking_interceptor_does_not_stop_delivery() {
        let delivered = Arc::new(AtomicU64::new(0));
        let counter = delivered.clone();
        let mut bus = InterceptorBus::new();
        bus.register(
            Arc::new(|_: &ProcessorEvent<'_>| panic!("observer bug")),
            false,
        );
        bus.register(
            Arc::new(move |_: &ProcessorEvent<'_>| {
                counter.fetch_add(1, Ordering::Relaxed);
            }),
            false,
        );

        let record = record_of(Note("x"), 0);
        bus.publish(ProcessorEvent::InputSkipped {
            client_id: "c",
            record: &record,
        });
        assert_eq!(delivered.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_metrics_interceptor_counts_events() {
        let interceptor = MetricsInterceptor::new();
        let record = record_of(Note("x"), 0);
        let error = ProcessorError::Handler {
            record: record.id.clone(),
            source: "boom".into(),
        };

        interceptor.intercept(&ProcessorEvent::InputReady {
            client_id: "c",
            record: &record,
        });
        interceptor.intercept(&ProcessorEvent::InputProcessed {
            client_id: "c",
            record: &record,
            outputs: 0,
            elapsed: Duration::from_millis(4),
        });
        interceptor.intercept(&ProcessorEvent::InputError {
            client_id: "c",
            record: &record,
            error: &error,
        });

        let snapshot = interceptor.metrics().snapshot();
        assert_eq!(snapshot.records_ready, 1);
        assert_eq!(snapshot.records_processed, 1);
        assert_eq!(snapshot.records_failed, 1);
        assert_eq!(snapshot.average_processing, Duration::from_millis(4));
        assert_eq!(snapshot.errors_by_kind.get("handler"), Some(&1));
    }
}
