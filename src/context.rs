//! Per-record processing context
//!
//! A [`ProcessorContext`] is created for every routed record and handed to
//! its handlers. Handlers append output requests with
//! [`ProcessorContext::output`]; once the handlers return, the engine seals the
//! queue and produces its contents. Outputs added after sealing are rejected
//! with [`ContextError::Sealed`] and logged, never silently dropped.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info_span, Span};

use crate::error::ContextError;
use crate::message::Message;
use crate::producer::ProducerRequest;
use crate::record::{MessageKey, Record};
use crate::state::StateStore;

#[derive(Default)]
struct OutputQueue {
    requests: Vec<ProducerRequest>,
    sealed: bool,
}

struct ContextInner {
    record: Record,
    output_topic: Option<String>,
    span: Span,
    cancellation: CancellationToken,
    state: Option<Arc<dyn StateStore>>,
    outputs: Mutex<OutputQueue>,
}

/// Context of a single input record
///
/// Cheap to clone; clones share the same output queue.
#[derive(Clone)]
pub struct ProcessorContext {
    inner: Arc<ContextInner>,
}

impl ProcessorContext {
    /// Create a context for `record` with no output topic and no state store
    pub fn new(record: Record, cancellation: CancellationToken) -> Self {
        Self::with_collaborators(record, cancellation, None, None)
    }

    pub(crate) fn with_collaborators(
        record: Record,
        cancellation: CancellationToken,
        output_topic: Option<String>,
        state: Option<Arc<dyn StateStore>>,
    ) -> Self {
        let span = info_span!(
            "record",
            topic = %record.id.topic,
            partition = record.id.partition,
            offset = record.id.offset,
            key = %record.key,
            message_type = record.message_type(),
        );
        Self {
            inner: Arc::new(ContextInner {
                record,
                output_topic,
                span,
                cancellation,
                state,
                outputs: Mutex::new(OutputQueue::default()),
            }),
        }
    }

    /// The record being processed
    pub fn record(&self) -> &Record {
        &self.inner.record
    }

    /// Key of the record being processed
    pub fn key(&self) -> &MessageKey {
        &self.inner.record.key
    }

    /// Span carrying the record coordinates; handlers may enter it or attach children
    pub fn span(&self) -> &Span {
        &self.inner.span
    }

    /// Cancelled when the processor terminates
    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    /// State store configured on the processor
    pub fn state(&self) -> Option<&Arc<dyn StateStore>> {
        self.inner.state.as_ref()
    }

    /// Default output topic of the processor
    pub fn output_topic(&self) -> Option<&str> {
        self.inner.output_topic.as_deref()
    }

    /// Queue an output request
    ///
    /// Fails with [`ContextError::Sealed`] once the engine has collected the
    /// outputs, and with [`ContextError::NoOutputTopic`] when neither the
    /// request nor the processor names a topic.
    pub fn output(&self, request: ProducerRequest) -> Result<(), ContextError> {
        let mut outputs = self.inner.outputs.lock();
        if outputs.sealed {
            let record = &self.inner.record.id;
            error!(
                %record,
                request_id = %request.request_id,
                "Output added after the context was sealed; the request is rejected"
            );
            return Err(ContextError::Sealed);
        }
        if request.topic.is_none() && self.inner.output_topic.is_none() {
            return Err(ContextError::NoOutputTopic);
        }
        outputs.requests.push(request);
        Ok(())
    }

    /// Queue `message` to the default output topic, keyed like the input record
    pub fn output_message<T: Message>(&self, message: T) -> Result<(), ContextError> {
        self.output(ProducerRequest::new(message).with_key(self.key().clone()))
    }

    /// Whether the output queue has been sealed
    pub fn is_sealed(&self) -> bool {
        self.inner.outputs.lock().sealed
    }

    /// Number of queued outputs
    pub fn pending_outputs(&self) -> usize {
        self.inner.outputs.lock().requests.len()
    }

    /// Seal the queue and take its requests in insertion order
    pub(crate) fn seal(&self) -> Result<Vec<ProducerRequest>, ContextError> {
        let mut outputs = self.inner.outputs.lock();
        if outputs.sealed {
            return Err(ContextError::AlreadySealed);
        }
        outputs.sealed = true;
        Ok(std::mem::take(&mut outputs.requests))
    }
}

impl fmt::Debug for ProcessorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorContext")
            .field("record", &self.inner.record.id)
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::record::{Headers, RecordId};
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct Note(pub &'static str);

    impl Message for Note {
        const MESSAGE_TYPE: &'static str = "test.Note";
    }

    pub(crate) fn record_of<T: Message>(value: T, offset: i64) -> Record {
        Record {
            id: RecordId::new("notes", 0, offset),
            key: MessageKey::from("k"),
            value: Arc::new(value),
            timestamp: Utc::now(),
            headers: Headers::new(),
        }
    }

    fn context() -> ProcessorContext {
        ProcessorContext::with_collaborators(
            record_of(Note("in"), 0),
            CancellationToken::new(),
            Some("out".into()),
            None,
        )
    }

    #[test]
    fn test_seal_returns_outputs_in_order() {
        let context = context();
        context.output_message(Note("a")).unwrap();
        context
            .output(ProducerRequest::new(Note("b")).with_topic("other"))
            .unwrap();

        let outputs = context.seal().unwrap();
        let topics: Vec<_> = outputs.iter().map(|r| r.topic.clone()).collect();
        assert_eq!(topics, vec![None, Some("other".to_string())]);
        assert_eq!(outputs[0].key, MessageKey::from("k"));
        assert!(context.is_sealed());
    }

    #[test]
    fn test_output_after_seal_fails() {
        let context = context();
        context.seal().unwrap();
        assert_eq!(context.output_message(Note("late")), Err(ContextError::Sealed));
        assert_eq!(context.seal().unwrap_err(), ContextError::AlreadySealed);
    }

    #[test]
    fn test_output_without_any_topic_fails() {
        let context = ProcessorContext::new(record_of(Note("in"), 0), CancellationToken::new());
        assert_eq!(
            context.output_message(Note("x")),
            Err(ContextError::NoOutputTopic)
        );
        assert!(context
            .output(ProducerRequest::new(Note("x")).with_topic("explicit"))
            .is_ok());
    }

    #[test]
    fn test_clones_share_queue_and_cancellation() {
        let token = CancellationToken::new();
        let context = ProcessorContext::with_collaborators(
            record_of(Note("in"), 0),
            token.child_token(),
            Some("out".into()),
            None,
        );
        let clone = context.clone();
        clone.output_message(Note("via clone")).unwrap();
        assert_eq!(context.pending_outputs(), 1);

        token.cancel();
        assert!(context.is_cancelled());
    }
}
