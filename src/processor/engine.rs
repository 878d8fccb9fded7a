//! The processor engine
//!
//! One consume loop per processor: poll, decode, route, seal the context,
//! produce the outputs. A record's position becomes commit-eligible only once
//! all of its outputs are acknowledged; the first failed output terminates the
//! processor. Positions are committed periodically, before partitions are
//! handed over, and during termination.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::completion::{CompletionOutcome, OutputCompletion};
use super::config::ProcessorOptions;
use super::offsets::OffsetTracker;
use super::{OnTerminated, ProcessorStatus};
use crate::broker::{
    ClientFactory, ConsumedRecord, DeliveryDriver, LogConsumer, OffsetCommitter, RebalanceListener,
};
use crate::codec::{Deserializer, Serializer};
use crate::context::ProcessorContext;
use crate::error::{panic_message, BrokerResult, ProcessorError, ProcessorResult};
use crate::gap::{GapProbe, GapSource, SubscriptionPartitionGap, SubscriptionTopicGap};
use crate::interceptor::{InterceptorBus, ProcessorEvent};
use crate::producer::{Producer, ProducerResult};
use crate::record::{Record, TopicPartition};
use crate::router::MasterRouter;
use crate::state::StateStore;

/// Collaborators a processor is built from
pub(crate) struct ProcessorParts {
    pub(crate) options: ProcessorOptions,
    pub(crate) router: MasterRouter,
    pub(crate) bus: InterceptorBus,
    pub(crate) serializer: Arc<dyn Serializer>,
    pub(crate) deserializer: Arc<dyn Deserializer>,
    pub(crate) state: Option<Arc<dyn StateStore>>,
    pub(crate) clients: Arc<dyn ClientFactory>,
}

/// Resources owned while activated
#[derive(Clone)]
struct Session {
    consumer: Arc<dyn LogConsumer>,
    producer: Producer,
    cancellation: CancellationToken,
    loop_done: watch::Receiver<bool>,
}

pub(crate) struct ProcessorInner {
    parts: ProcessorParts,
    group_id: String,
    topics: Vec<String>,
    status: watch::Sender<ProcessorStatus>,
    torn_down: watch::Sender<bool>,
    started: Mutex<bool>,
    session: Mutex<Option<Session>>,
    tracker: OffsetTracker,
    on_terminated: Mutex<Option<OnTerminated>>,
    outcome: Mutex<Option<ProcessorResult<()>>>,
    final_gaps: Mutex<Vec<SubscriptionTopicGap>>,
}

/// A stream processor bound to one consumer group
///
/// Cheap to clone; clones control the same instance.
#[derive(Clone)]
pub struct Processor {
    inner: Arc<ProcessorInner>,
}

impl Processor {
    pub(crate) fn from_parts(parts: ProcessorParts) -> Self {
        let (status, _) = watch::channel(ProcessorStatus::Terminated);
        let (torn_down, _) = watch::channel(false);
        Self {
            inner: Arc::new(ProcessorInner {
                group_id: parts.options.group_id().to_string(),
                topics: parts.options.input_topics(),
                parts,
                status,
                torn_down,
                started: Mutex::new(false),
                session: Mutex::new(None),
                tracker: OffsetTracker::default(),
                on_terminated: Mutex::new(None),
                outcome: Mutex::new(None),
                final_gaps: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start building a processor
    pub fn builder() -> super::ProcessorBuilder {
        super::ProcessorBuilder::new()
    }

    pub fn client_id(&self) -> &str {
        &self.inner.parts.options.client_id
    }

    pub fn group_id(&self) -> &str {
        &self.inner.group_id
    }

    /// Deduplicated input topics
    pub fn input_topics(&self) -> &[String] {
        &self.inner.topics
    }

    pub fn options(&self) -> &ProcessorOptions {
        &self.inner.parts.options
    }

    pub fn status(&self) -> ProcessorStatus {
        self.inner.current_status()
    }

    /// Gaps computed during termination
    pub fn final_gaps(&self) -> Vec<SubscriptionTopicGap> {
        self.inner.final_gaps.lock().clone()
    }

    /// Subscribe and run the consume loop until the processor terminates
    ///
    /// Returns immediately when already activated. Returns `Ok(())` after a
    /// clean, cancellation-driven shutdown and the termination error otherwise.
    /// A terminated processor cannot be activated again.
    ///
    /// When the broker clients cannot be created the error is returned and
    /// passed to `on_terminated`; the processor never activated, so it may be
    /// activated again.
    pub async fn activate(
        &self,
        cancellation: CancellationToken,
        on_terminated: Option<OnTerminated>,
    ) -> ProcessorResult<()> {
        {
            let mut started = self.inner.started.lock();
            if *started {
                return match self.status() {
                    ProcessorStatus::Activated => Ok(()),
                    _ => Err(ProcessorError::AlreadyTerminated(self.client_id().to_string())),
                };
            }
            *started = true;
        }
        self.inner.clone().run(cancellation, on_terminated).await
    }

    /// Stop the processor
    ///
    /// Only the first call tears down; later calls publish
    /// [`ProcessorEvent::TerminateIgnored`] and return at once. Waits for the
    /// consume loop, so it must not be awaited from inside a handler; cancel
    /// the activation token there instead.
    pub async fn terminate(&self) {
        self.inner.terminate(None).await
    }

    /// Per-partition lag of the owned partitions
    ///
    /// Commits eligible positions first, so processed records count as caught up.
    pub async fn subscription_gap(&self) -> ProcessorResult<Vec<SubscriptionTopicGap>> {
        self.inner.subscription_gap().await
    }

    /// Terminate if activated, then release the processor
    pub async fn dispose(self) {
        if self.status() == ProcessorStatus::Activated {
            self.terminate().await;
        }
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("client_id", &self.client_id())
            .field("group_id", &self.group_id())
            .field("status", &self.status())
            .finish()
    }
}

impl ProcessorInner {
    fn client_id(&self) -> &str {
        &self.parts.options.client_id
    }

    fn current_status(&self) -> ProcessorStatus {
        *self.status.borrow()
    }

    fn publish(&self, event: ProcessorEvent<'_>) {
        self.parts.bus.publish(event);
    }

    fn session(&self) -> Option<Session> {
        self.session.lock().clone()
    }

    async fn run(
        self: Arc<Self>,
        token: CancellationToken,
        on_terminated: Option<OnTerminated>,
    ) -> ProcessorResult<()> {
        let options = &self.parts.options;
        let (consumer, driver) = match self.connect().await {
            Ok(clients) => clients,
            Err(error) => {
                error!(client_id = self.client_id(), %error, "Processor failed to start");
                *self.started.lock() = false;
                self.notify_terminated(on_terminated, &[], Some(&error));
                return Err(error);
            }
        };
        let producer = Producer::new(
            self.client_id(),
            options.output_topic_name().map(String::from),
            self.parts.serializer.clone(),
            driver,
            options.max_in_flight,
        );

        let cancellation = token.child_token();
        let (loop_done_tx, loop_done) = watch::channel(false);
        let session = Session {
            consumer,
            producer,
            cancellation,
            loop_done,
        };
        *self.session.lock() = Some(session.clone());
        *self.on_terminated.lock() = on_terminated;
        self.status.send_replace(ProcessorStatus::Activated);

        let source: Weak<dyn GapSource> = Arc::downgrade(&self) as Weak<dyn GapSource>;
        let probe = GapProbe::new(self.client_id(), source);
        self.publish(ProcessorEvent::Activated {
            client_id: self.client_id(),
            group_id: &self.group_id,
            topics: &self.topics,
            probe: &probe,
        });

        let committer = self.spawn_committer(&session);
        let result = self.consume(&session).await;
        loop_done_tx.send_replace(true);
        if let Some(committer) = committer {
            committer.abort();
        }

        if let Err(error) = &result {
            if !error.is_cancellation() {
                error!(client_id = self.client_id(), %error, "Consume loop failed");
            }
        }
        if self.current_status() == ProcessorStatus::Activated {
            self.terminate(result.err()).await;
        }

        let mut torn_down = self.torn_down.subscribe();
        let _ = torn_down.wait_for(|done| *done).await;
        self.outcome.lock().take().unwrap_or(Ok(()))
    }

    async fn connect(&self) -> ProcessorResult<(Arc<dyn LogConsumer>, Arc<dyn DeliveryDriver>)> {
        let options = &self.parts.options;
        let clients = &self.parts.clients;
        if let Some(output) = &options.output_topic {
            clients.ensure_topic(options, output).await?;
        }
        Ok((clients.create_consumer(options)?, clients.create_driver(options)?))
    }

    /// Invoke the caller's termination callback, containing its panics
    fn notify_terminated(
        self: &Arc<Self>,
        callback: Option<OnTerminated>,
        gaps: &[SubscriptionTopicGap],
        error: Option<&ProcessorError>,
    ) {
        let Some(callback) = callback else {
            return;
        };
        let processor = Processor {
            inner: Arc::clone(self),
        };
        let invoked = catch_unwind(AssertUnwindSafe(|| callback(&processor, gaps, error)));
        if let Err(panic) = invoked {
            error!(
                client_id = self.client_id(),
                panic = %panic_message(panic.as_ref()),
                "on_terminated callback panicked"
            );
        }
    }

    async fn consume(self: &Arc<Self>, session: &Session) -> ProcessorResult<()> {
        let listener = Arc::new(RebalanceHandler {
            inner: Arc::downgrade(self),
        });
        session.consumer.subscribe(&self.topics, listener)?;
        info!(
            client_id = self.client_id(),
            group_id = %self.group_id,
            topics = ?self.topics,
            "Consume loop started"
        );

        let poll_timeout = self.parts.options.poll_timeout();
        loop {
            let polled = tokio::select! {
                biased;
                _ = session.cancellation.cancelled() => return Err(ProcessorError::Cancelled),
                polled = session.consumer.poll(poll_timeout) => polled?,
            };
            let Some(raw) = polled else {
                continue;
            };

            let record = self.decode(raw)?;
            if !self.parts.router.can_route(&record) {
                self.tracker.skip(&record.id);
                self.publish(ProcessorEvent::InputSkipped {
                    client_id: self.client_id(),
                    record: &record,
                });
                continue;
            }
            self.process(record, session).await?;
        }
    }

    fn decode(&self, raw: ConsumedRecord) -> ProcessorResult<Record> {
        let value = self
            .parts
            .deserializer
            .deserialize(&raw.id.topic, raw.payload.as_deref(), &raw.headers)
            .map_err(|error| {
                error!(record = %raw.id, %error, "Failed to decode record");
                error
            })?;
        Ok(Record {
            id: raw.id,
            key: raw.key,
            value,
            timestamp: raw.timestamp,
            headers: raw.headers,
        })
    }

    async fn process(self: &Arc<Self>, record: Record, session: &Session) -> ProcessorResult<()> {
        let started = Instant::now();
        self.publish(ProcessorEvent::InputReady {
            client_id: self.client_id(),
            record: &record,
        });
        self.tracker.begin(&record.id);

        let context = ProcessorContext::with_collaborators(
            record.clone(),
            session.cancellation.child_token(),
            self.parts.options.output_topic_name().map(String::from),
            self.parts.state.clone(),
        );
        let routed = self.parts.router.route(&context).await;
        let outputs = context.seal()?;

        if let Err(error) = routed {
            if error.is_cancellation() {
                return Err(ProcessorError::Cancelled);
            }
            self.publish(ProcessorEvent::InputError {
                client_id: self.client_id(),
                record: &record,
                error: &error,
            });
            return Err(error);
        }

        if outputs.is_empty() {
            self.tracker.complete(&record.id);
            self.publish(ProcessorEvent::InputProcessed {
                client_id: self.client_id(),
                record: &record,
                outputs: 0,
                elapsed: started.elapsed(),
            });
            return Ok(());
        }

        let completion = Arc::new(OutputCompletion::new(record, outputs.len(), started));
        for request in outputs {
            let inner = Arc::clone(self);
            let completion = completion.clone();
            session.producer.produce(
                request,
                Box::new(move |result| inner.on_output_result(&completion, result)),
            );
        }
        Ok(())
    }

    fn on_output_result(self: &Arc<Self>, completion: &OutputCompletion, result: ProducerResult) {
        let record = &completion.record;
        self.publish(ProcessorEvent::OutputProcessed {
            client_id: self.client_id(),
            input: &record.id,
            result: &result,
        });

        match completion.on_result(result.success()) {
            CompletionOutcome::AllSucceeded => {
                self.tracker.complete(&record.id);
                self.publish(ProcessorEvent::InputProcessed {
                    client_id: self.client_id(),
                    record,
                    outputs: completion.total(),
                    elapsed: completion.started.elapsed(),
                });
            }
            CompletionOutcome::FirstFailure => {
                let Some(error) = result.into_error() else {
                    return;
                };
                self.publish(ProcessorEvent::InputError {
                    client_id: self.client_id(),
                    record,
                    error: &error,
                });
                let inner = Arc::clone(self);
                tokio::spawn(async move { inner.terminate(Some(error)).await });
            }
            CompletionOutcome::Pending | CompletionOutcome::AfterFailure => {}
        }
    }

    fn spawn_committer(self: &Arc<Self>, session: &Session) -> Option<tokio::task::JoinHandle<()>> {
        let interval = self.parts.options.commit_interval()?;
        let inner = Arc::downgrade(self);
        let consumer = session.consumer.clone();
        let cancellation = session.cancellation.clone();

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = inner.upgrade() else {
                            break;
                        };
                        if let Err(error) = inner.commit_eligible(consumer.as_ref()).await {
                            warn!(%error, "Periodic commit failed");
                        }
                    }
                }
            }
            debug!("Periodic committer stopped");
        }))
    }

    /// Commit every eligible position, retrying transient failures
    async fn commit_eligible<C>(&self, committer: &C) -> BrokerResult<()>
    where
        C: OffsetCommitter + ?Sized,
    {
        let offsets = self.tracker.eligible();
        if offsets.is_empty() {
            return Ok(());
        }
        let retry = &self.parts.options.commit_retry;
        match retry.run("commit", || committer.commit(&offsets)).await {
            Ok(_) => {
                self.tracker.mark_committed(&offsets);
                debug!(client_id = self.client_id(), ?offsets, "Offsets committed");
                Ok(())
            }
            Err(error) => {
                self.publish(ProcessorEvent::CommitFailed {
                    client_id: self.client_id(),
                    offsets: &offsets,
                    error: &error,
                });
                Err(error)
            }
        }
    }

    /// Flush outputs and commit before partitions change hands
    ///
    /// Lost partitions already belong to someone else, so their positions are
    /// dropped rather than committed; they are reprocessed by the new owner.
    async fn hand_over(
        &self,
        committer: &dyn OffsetCommitter,
        partitions: &[TopicPartition],
        lost: bool,
    ) {
        if let Some(session) = self.session() {
            let timeout = self.parts.options.flush_timeout();
            if let Err(error) = session.producer.flush(timeout).await {
                warn!(client_id = self.client_id(), %error, "Flush before rebalance incomplete");
            }
        }
        if lost {
            self.tracker.release(partitions);
        }
        if let Err(error) = self.commit_eligible(committer).await {
            warn!(client_id = self.client_id(), %error, "Commit before rebalance failed");
        }
        self.tracker.release(partitions);
    }

    fn compute_gaps(&self, consumer: &dyn LogConsumer) -> ProcessorResult<Vec<SubscriptionTopicGap>> {
        let timeout = self.parts.options.poll_timeout();
        let assignment = consumer.assignment()?;
        let committed = consumer.committed(&assignment, timeout)?;

        let mut topics: BTreeMap<String, Vec<SubscriptionPartitionGap>> = BTreeMap::new();
        for (tp, committed) in committed {
            let (low, high) = consumer.watermarks(&tp, timeout)?;
            topics.entry(tp.topic).or_default().push(SubscriptionPartitionGap {
                partition: tp.partition,
                latest_offset: high,
                committed_offset: committed.unwrap_or(low),
            });
        }
        Ok(topics
            .into_iter()
            .map(|(topic, mut partitions)| {
                partitions.sort_by_key(|p| p.partition);
                SubscriptionTopicGap { topic, partitions }
            })
            .collect())
    }

    async fn subscription_gap(&self) -> ProcessorResult<Vec<SubscriptionTopicGap>> {
        let session = match self.session() {
            Some(session) if self.current_status() == ProcessorStatus::Activated => session,
            _ => return Err(ProcessorError::NotActivated(self.client_id().to_string())),
        };
        if let Err(error) = self.commit_eligible(session.consumer.as_ref()).await {
            warn!(client_id = self.client_id(), %error, "Commit before gap query failed");
        }
        self.compute_gaps(session.consumer.as_ref())
    }

    async fn terminate(self: &Arc<Self>, cause: Option<ProcessorError>) {
        let won = self.status.send_if_modified(|status| {
            if *status == ProcessorStatus::Activated {
                *status = ProcessorStatus::Terminating;
                true
            } else {
                false
            }
        });
        if !won {
            self.publish(ProcessorEvent::TerminateIgnored {
                client_id: self.client_id(),
                status: self.current_status(),
            });
            return;
        }

        let Some(session) = self.session() else {
            self.status.send_replace(ProcessorStatus::Terminated);
            self.torn_down.send_replace(true);
            return;
        };
        info!(client_id = self.client_id(), "Terminating processor");
        session.cancellation.cancel();
        let cause = cause.filter(|error| !error.is_cancellation());

        let mut loop_done = session.loop_done.clone();
        let _ = loop_done.wait_for(|done| *done).await;

        let mut teardown = Vec::new();
        let flush_timeout = self.parts.options.flush_timeout();
        if let Err(error) = session.producer.flush(flush_timeout).await {
            teardown.push(error);
        }
        if let Err(error) = self.commit_eligible(session.consumer.as_ref()).await {
            teardown.push(error.into());
        }
        let gaps = match self.compute_gaps(session.consumer.as_ref()) {
            Ok(gaps) => gaps,
            Err(error) => {
                teardown.push(error);
                Vec::new()
            }
        };
        if let Err(error) = session.consumer.close() {
            teardown.push(error.into());
        }
        if let Err(error) = session.producer.close(flush_timeout).await {
            teardown.push(error);
        }

        let error = if teardown.is_empty() {
            cause
        } else {
            Some(ProcessorError::Termination {
                cause: cause.map(Arc::new),
                teardown,
            })
        };

        *self.final_gaps.lock() = gaps.clone();
        self.status.send_replace(ProcessorStatus::Terminated);
        self.publish(ProcessorEvent::Terminated {
            client_id: self.client_id(),
            gaps: &gaps,
            error: error.as_ref(),
        });

        let callback = self.on_terminated.lock().take();
        self.notify_terminated(callback, &gaps, error.as_ref());

        *self.outcome.lock() = Some(match error {
            Some(error) => Err(error),
            None => Ok(()),
        });
        self.torn_down.send_replace(true);
    }
}

#[async_trait]
impl GapSource for ProcessorInner {
    async fn subscription_gap(&self) -> ProcessorResult<Vec<SubscriptionTopicGap>> {
        ProcessorInner::subscription_gap(self).await
    }
}

/// Forwards rebalance callbacks to the engine
struct RebalanceHandler {
    inner: Weak<ProcessorInner>,
}

#[async_trait]
impl RebalanceListener for RebalanceHandler {
    async fn on_assigned(&self, _committer: &dyn OffsetCommitter, partitions: &[TopicPartition]) {
        if let Some(inner) = self.inner.upgrade() {
            inner.publish(ProcessorEvent::PartitionsAssigned {
                client_id: inner.client_id(),
                partitions,
            });
        }
    }

    async fn on_revoked(&self, committer: &dyn OffsetCommitter, partitions: &[TopicPartition]) {
        if let Some(inner) = self.inner.upgrade() {
            inner.hand_over(committer, partitions, false).await;
            inner.publish(ProcessorEvent::PartitionsRevoked {
                client_id: inner.client_id(),
                partitions,
            });
        }
    }

    async fn on_lost(&self, committer: &dyn OffsetCommitter, partitions: &[TopicPartition]) {
        if let Some(inner) = self.inner.upgrade() {
            inner.hand_over(committer, partitions, true).await;
            inner.publish(ProcessorEvent::PartitionsLost {
                client_id: inner.client_id(),
                partitions,
            });
        }
    }
}
