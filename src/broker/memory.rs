//! In-process partitioned log
//!
//! A small broker with the semantics the processor relies on: partitioned
//! append-only topics, consumer groups with committed offsets, range
//! assignment with cooperative hand-off, rebalance callbacks served from
//! `poll`, and simulated session expiry. Used by the test-suite and demos.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::{
    ClientFactory, ConsumedRecord, DeliveryDriver, DeliveryFuture, LogConsumer, OffsetCommitter,
    OutboundRecord, RebalanceListener,
};
use crate::error::{BrokerError, BrokerResult};
use crate::processor::config::{OffsetReset, OutputTopic, ProcessorOptions};
use crate::record::{Headers, MessageKey, RecordId, TopicPartition, TopicPartitionOffset};

#[derive(Debug, Clone)]
struct StoredRecord {
    key: MessageKey,
    payload: Option<Bytes>,
    headers: Headers,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Group {
    /// member id -> subscribed topics
    members: BTreeMap<u64, Vec<String>>,
    owners: HashMap<TopicPartition, u64>,
    committed: HashMap<TopicPartition, i64>,
    expired: HashSet<u64>,
}

impl Group {
    fn release(&mut self, member: u64) {
        self.owners.retain(|_, owner| *owner != member);
    }
}

#[derive(Debug, Default)]
struct Cluster {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    groups: HashMap<String, Group>,
}

impl Cluster {
    fn ensure_topic(&mut self, topic: &str, partitions: i32) {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions.max(1) as usize]);
    }

    fn partition_log(&self, tp: &TopicPartition) -> Option<&Vec<StoredRecord>> {
        self.topics
            .get(&tp.topic)
            .and_then(|partitions| partitions.get(tp.partition as usize))
    }

    /// Range assignment of every subscribed topic over the members subscribed to it
    fn target_assignment(&self, group_id: &str, member: u64) -> Vec<TopicPartition> {
        let Some(group) = self.groups.get(group_id) else {
            return Vec::new();
        };
        let Some(own_topics) = group.members.get(&member) else {
            return Vec::new();
        };

        let mut assignment = Vec::new();
        let topics: BTreeSet<&String> = own_topics.iter().collect();
        for topic in topics {
            let Some(partitions) = self.topics.get(topic) else {
                continue;
            };
            let subscribers: Vec<u64> = group
                .members
                .iter()
                .filter(|(_, topics)| topics.contains(topic))
                .map(|(id, _)| *id)
                .collect();
            let Some(index) = subscribers.iter().position(|id| *id == member) else {
                continue;
            };

            let count = partitions.len();
            let per_member = count / subscribers.len();
            let extra = count % subscribers.len();
            let start = index * per_member + index.min(extra);
            let len = per_member + usize::from(index < extra);
            assignment.extend(
                (start..start + len).map(|p| TopicPartition::new(topic.clone(), p as i32)),
            );
        }
        assignment
    }
}

struct BrokerState {
    cluster: Mutex<Cluster>,
    changed: Notify,
    next_member: AtomicU64,
    round_robin: AtomicU64,
    auto_create_partitions: Option<i32>,
}

impl BrokerState {
    fn append(&self, record: OutboundRecord) -> BrokerResult<RecordId> {
        let OutboundRecord {
            topic,
            key,
            payload,
            headers,
            timestamp,
        } = record;
        self.append_stored(
            topic,
            StoredRecord {
                key,
                payload: Some(payload),
                headers,
                timestamp: timestamp.unwrap_or_else(Utc::now),
            },
        )
    }

    fn append_stored(&self, topic: String, record: StoredRecord) -> BrokerResult<RecordId> {
        let id = {
            let mut cluster = self.cluster.lock();
            if !cluster.topics.contains_key(&topic) {
                match self.auto_create_partitions {
                    Some(partitions) => cluster.ensure_topic(&topic, partitions),
                    None => return Err(BrokerError::UnknownTopic(topic)),
                }
            }
            let partitions = cluster
                .topics
                .get_mut(&topic)
                .ok_or_else(|| BrokerError::UnknownTopic(topic.clone()))?;

            let partition = match record.key.as_bytes() {
                Some(bytes) => (fnv1a(bytes) % partitions.len() as u64) as usize,
                None => {
                    (self.round_robin.fetch_add(1, Ordering::Relaxed) % partitions.len() as u64)
                        as usize
                }
            };
            let log = &mut partitions[partition];
            let offset = log.len() as i64;
            log.push(record);
            RecordId::new(topic, partition as i32, offset)
        };
        self.changed.notify_waiters();
        Ok(id)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// In-process broker shared by consumers and delivery drivers
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create a broker that auto-creates unknown topics with one partition
    pub fn new() -> Self {
        Self::with_auto_create(Some(1))
    }

    /// Create a broker; `None` disables topic auto-creation
    pub fn with_auto_create(partitions: Option<i32>) -> Self {
        Self {
            state: Arc::new(BrokerState {
                cluster: Mutex::new(Cluster::default()),
                changed: Notify::new(),
                next_member: AtomicU64::new(1),
                round_robin: AtomicU64::new(0),
                auto_create_partitions: partitions,
            }),
        }
    }

    /// Create a topic; existing topics are left untouched
    pub fn create_topic(&self, topic: &str, partitions: i32) {
        self.state.cluster.lock().ensure_topic(topic, partitions);
        self.state.changed.notify_waiters();
    }

    /// Number of partitions of a topic
    pub fn partition_count(&self, topic: &str) -> Option<usize> {
        self.state.cluster.lock().topics.get(topic).map(Vec::len)
    }

    /// Append a record, returning its position
    pub fn produce(
        &self,
        topic: &str,
        key: impl Into<MessageKey>,
        payload: impl Into<Bytes>,
        headers: Headers,
    ) -> BrokerResult<RecordId> {
        self.state.append(OutboundRecord {
            topic: topic.to_string(),
            key: key.into(),
            payload: payload.into(),
            headers,
            timestamp: None,
        })
    }

    /// Append a record without a payload
    pub fn produce_tombstone(
        &self,
        topic: &str,
        key: impl Into<MessageKey>,
        headers: Headers,
    ) -> BrokerResult<RecordId> {
        self.state.append_stored(
            topic.to_string(),
            StoredRecord {
                key: key.into(),
                payload: None,
                headers,
                timestamp: Utc::now(),
            },
        )
    }

    /// Member ids currently in a group
    pub fn members(&self, group_id: &str) -> Vec<u64> {
        let cluster = self.state.cluster.lock();
        cluster
            .groups
            .get(group_id)
            .map(|group| group.members.keys().copied().collect())
            .unwrap_or_default()
    }

    /// All records of a topic, partition by partition in offset order
    pub fn records(&self, topic: &str) -> Vec<ConsumedRecord> {
        let cluster = self.state.cluster.lock();
        let Some(partitions) = cluster.topics.get(topic) else {
            return Vec::new();
        };
        partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, log)| {
                log.iter().enumerate().map(move |(offset, record)| ConsumedRecord {
                    id: RecordId::new(topic, partition as i32, offset as i64),
                    key: record.key.clone(),
                    payload: record.payload.clone(),
                    headers: record.headers.clone(),
                    timestamp: record.timestamp,
                })
            })
            .collect()
    }

    /// Committed next-offset of a group for a partition
    pub fn committed_offset(&self, group_id: &str, tp: &TopicPartition) -> Option<i64> {
        let cluster = self.state.cluster.lock();
        cluster
            .groups
            .get(group_id)
            .and_then(|group| group.committed.get(tp).copied())
    }

    /// Create a consumer for a group
    pub fn consumer(&self, group_id: &str, reset: OffsetReset) -> MemoryConsumer {
        MemoryConsumer {
            broker: self.state.clone(),
            group_id: group_id.to_string(),
            member_id: self.state.next_member.fetch_add(1, Ordering::Relaxed),
            reset,
            state: Mutex::new(ConsumerState::default()),
        }
    }

    /// Create a delivery driver
    pub fn driver(&self) -> MemoryDeliveryDriver {
        MemoryDeliveryDriver {
            broker: self.state.clone(),
            fail_when: None,
            delay: None,
        }
    }

    /// Drop a member from its group as if its session timed out
    ///
    /// The member observes the loss of its partitions on its next poll and
    /// then rejoins.
    pub fn expire_member(&self, group_id: &str, member_id: u64) {
        {
            let mut cluster = self.state.cluster.lock();
            if let Some(group) = cluster.groups.get_mut(group_id) {
                if group.members.remove(&member_id).is_some() {
                    group.release(member_id);
                    group.expired.insert(member_id);
                    info!(group_id, member_id, "Member session expired");
                }
            }
        }
        self.state.changed.notify_waiters();
    }
}

#[async_trait]
impl ClientFactory for MemoryBroker {
    fn create_consumer(&self, options: &ProcessorOptions) -> BrokerResult<Arc<dyn LogConsumer>> {
        Ok(Arc::new(self.consumer(options.group_id(), options.auto_offset_reset)))
    }

    fn create_driver(&self, _options: &ProcessorOptions) -> BrokerResult<Arc<dyn DeliveryDriver>> {
        Ok(Arc::new(self.driver()))
    }

    async fn ensure_topic(&self, _options: &ProcessorOptions, topic: &OutputTopic) -> BrokerResult<()> {
        self.create_topic(&topic.name, topic.partitions);
        Ok(())
    }
}

#[derive(Default)]
struct ConsumerState {
    topics: Vec<String>,
    listener: Option<Arc<dyn RebalanceListener>>,
    assignment: Vec<TopicPartition>,
    positions: HashMap<TopicPartition, i64>,
    cursor: usize,
    joined: bool,
    closed: bool,
}

/// Group member consuming from a [`MemoryBroker`]
pub struct MemoryConsumer {
    broker: Arc<BrokerState>,
    group_id: String,
    member_id: u64,
    reset: OffsetReset,
    state: Mutex<ConsumerState>,
}

struct RebalancePlan {
    listener: Option<Arc<dyn RebalanceListener>>,
    lost: Vec<TopicPartition>,
    revoked: Vec<TopicPartition>,
}

impl MemoryConsumer {
    /// Member id within the group
    pub fn member_id(&self) -> u64 {
        self.member_id
    }

    fn plan_rebalance(&self) -> BrokerResult<RebalancePlan> {
        let mut cluster = self.broker.cluster.lock();
        let mut state = self.state.lock();
        if state.closed {
            return Err(BrokerError::Closed);
        }

        let mut lost = Vec::new();
        if state.joined {
            let group = cluster.groups.entry(self.group_id.clone()).or_default();
            if group.expired.remove(&self.member_id) {
                lost = std::mem::take(&mut state.assignment);
                state.positions.clear();
                group.members.insert(self.member_id, state.topics.clone());
            }
        }

        let target = cluster.target_assignment(&self.group_id, self.member_id);
        let revoked = state
            .assignment
            .iter()
            .filter(|tp| !target.contains(tp))
            .cloned()
            .collect();

        Ok(RebalancePlan {
            listener: state.listener.clone(),
            lost,
            revoked,
        })
    }

    fn claim_partitions(&self) -> Vec<TopicPartition> {
        let mut cluster = self.broker.cluster.lock();
        let target = cluster.target_assignment(&self.group_id, self.member_id);
        let high_watermarks: HashMap<TopicPartition, i64> = target
            .iter()
            .map(|tp| {
                let high = cluster.partition_log(tp).map_or(0, |log| log.len() as i64);
                (tp.clone(), high)
            })
            .collect();

        let mut state = self.state.lock();
        let Some(group) = cluster.groups.get_mut(&self.group_id) else {
            return Vec::new();
        };

        let mut claimed = Vec::new();
        for tp in target {
            if state.assignment.contains(&tp) {
                continue;
            }
            match group.owners.get(&tp) {
                Some(owner) if *owner != self.member_id => continue,
                _ => {}
            }
            group.owners.insert(tp.clone(), self.member_id);
            let position = match group.committed.get(&tp) {
                Some(offset) => *offset,
                None => match self.reset {
                    OffsetReset::Earliest => 0,
                    OffsetReset::Latest => high_watermarks.get(&tp).copied().unwrap_or(0),
                },
            };
            state.positions.insert(tp.clone(), position);
            state.assignment.push(tp.clone());
            claimed.push(tp);
        }
        claimed
    }

    fn release_partitions(&self, partitions: &[TopicPartition]) {
        {
            let mut cluster = self.broker.cluster.lock();
            let mut state = self.state.lock();
            state.assignment.retain(|tp| !partitions.contains(tp));
            for tp in partitions {
                state.positions.remove(tp);
            }
            if let Some(group) = cluster.groups.get_mut(&self.group_id) {
                for tp in partitions {
                    if group.owners.get(tp) == Some(&self.member_id) {
                        group.owners.remove(tp);
                    }
                }
            }
        }
        self.broker.changed.notify_waiters();
    }

    async fn rebalance(&self) -> BrokerResult<()> {
        let plan = self.plan_rebalance()?;

        if !plan.lost.is_empty() {
            info!(member_id = self.member_id, partitions = ?plan.lost, "Partitions lost");
            if let Some(listener) = &plan.listener {
                listener.on_lost(self, &plan.lost).await;
            }
            self.broker.changed.notify_waiters();
        }

        if !plan.revoked.is_empty() {
            debug!(member_id = self.member_id, partitions = ?plan.revoked, "Revoking partitions");
            if let Some(listener) = &plan.listener {
                listener.on_revoked(self, &plan.revoked).await;
            }
            self.release_partitions(&plan.revoked);
        }

        let assigned = self.claim_partitions();
        if !assigned.is_empty() {
            debug!(member_id = self.member_id, partitions = ?assigned, "Assigned partitions");
            if let Some(listener) = &plan.listener {
                listener.on_assigned(self, &assigned).await;
            }
        }
        Ok(())
    }

    fn next_record(&self) -> Option<ConsumedRecord> {
        let cluster = self.broker.cluster.lock();
        let mut state = self.state.lock();
        let count = state.assignment.len();
        for step in 0..count {
            let index = (state.cursor + step) % count;
            let tp = state.assignment[index].clone();
            let position = state.positions.get(&tp).copied().unwrap_or(0);
            let Some(log) = cluster.partition_log(&tp) else {
                continue;
            };
            if let Some(record) = log.get(position as usize) {
                state.positions.insert(tp.clone(), position + 1);
                state.cursor = (index + 1) % count;
                return Some(ConsumedRecord {
                    id: RecordId::new(tp.topic, tp.partition, position),
                    key: record.key.clone(),
                    payload: record.payload.clone(),
                    headers: record.headers.clone(),
                    timestamp: record.timestamp,
                });
            }
        }
        None
    }
}

impl OffsetCommitter for MemoryConsumer {
    fn commit(&self, offsets: &[TopicPartitionOffset]) -> BrokerResult<()> {
        let mut cluster = self.broker.cluster.lock();
        let group = cluster
            .groups
            .get_mut(&self.group_id)
            .ok_or_else(|| BrokerError::Commit(format!("unknown group '{}'", self.group_id)))?;

        if let Some(foreign) = offsets
            .iter()
            .find(|o| group.owners.get(&o.partition) != Some(&self.member_id))
        {
            return Err(BrokerError::Commit(format!(
                "member {} does not own {}",
                self.member_id, foreign.partition
            )));
        }
        for offset in offsets {
            group.committed.insert(offset.partition.clone(), offset.offset);
        }
        Ok(())
    }
}

#[async_trait]
impl LogConsumer for MemoryConsumer {
    fn subscribe(&self, topics: &[String], listener: Arc<dyn RebalanceListener>) -> BrokerResult<()> {
        {
            let mut cluster = self.broker.cluster.lock();
            if let Some(partitions) = self.broker.auto_create_partitions {
                for topic in topics {
                    cluster.ensure_topic(topic, partitions);
                }
            }
            let mut state = self.state.lock();
            if state.closed {
                return Err(BrokerError::Closed);
            }
            cluster
                .groups
                .entry(self.group_id.clone())
                .or_default()
                .members
                .insert(self.member_id, topics.to_vec());
            state.topics = topics.to_vec();
            state.listener = Some(listener);
            state.joined = true;
        }
        self.broker.changed.notify_waiters();
        info!(group_id = %self.group_id, member_id = self.member_id, ?topics, "Subscribed");
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> BrokerResult<Option<ConsumedRecord>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let changed = self.broker.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            self.rebalance().await?;
            if let Some(record) = self.next_record() {
                return Ok(Some(record));
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return Ok(None);
            }
        }
    }

    fn assignment(&self) -> BrokerResult<Vec<TopicPartition>> {
        let state = self.state.lock();
        if state.closed {
            return Err(BrokerError::Closed);
        }
        Ok(state.assignment.clone())
    }

    fn watermarks(&self, partition: &TopicPartition, _timeout: Duration) -> BrokerResult<(i64, i64)> {
        let cluster = self.broker.cluster.lock();
        cluster
            .partition_log(partition)
            .map(|log| (0, log.len() as i64))
            .ok_or_else(|| BrokerError::UnknownTopic(partition.to_string()))
    }

    fn committed(
        &self,
        partitions: &[TopicPartition],
        _timeout: Duration,
    ) -> BrokerResult<Vec<(TopicPartition, Option<i64>)>> {
        let cluster = self.broker.cluster.lock();
        let group = cluster.groups.get(&self.group_id);
        Ok(partitions
            .iter()
            .map(|tp| {
                let offset = group.and_then(|g| g.committed.get(tp).copied());
                (tp.clone(), offset)
            })
            .collect())
    }

    fn close(&self) -> BrokerResult<()> {
        {
            let mut cluster = self.broker.cluster.lock();
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.assignment.clear();
            state.positions.clear();
            state.listener = None;
            if let Some(group) = cluster.groups.get_mut(&self.group_id) {
                group.members.remove(&self.member_id);
                group.release(self.member_id);
            }
        }
        self.broker.changed.notify_waiters();
        info!(group_id = %self.group_id, member_id = self.member_id, "Consumer closed");
        Ok(())
    }
}

type FaultFn = Arc<dyn Fn(&OutboundRecord) -> Option<BrokerError> + Send + Sync>;

/// Delivery driver appending to a [`MemoryBroker`]
#[derive(Clone)]
pub struct MemoryDeliveryDriver {
    broker: Arc<BrokerState>,
    fail_when: Option<FaultFn>,
    delay: Option<Duration>,
}

impl MemoryDeliveryDriver {
    /// Fail every record for which `fault` returns an error
    pub fn fail_when<F>(mut self, fault: F) -> Self
    where
        F: Fn(&OutboundRecord) -> Option<BrokerError> + Send + Sync + 'static,
    {
        self.fail_when = Some(Arc::new(fault));
        self
    }

    /// Delay acknowledgements, keeping the append itself synchronous
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl DeliveryDriver for MemoryDeliveryDriver {
    fn send(&self, record: OutboundRecord) -> DeliveryFuture {
        if let Some(error) = self.fail_when.as_ref().and_then(|fault| fault(&record)) {
            return futures::future::ready(Err(error)).boxed();
        }
        let result = self.broker.append(record);
        match self.delay {
            Some(delay) => async move {
                tokio::time::sleep(delay).await;
                result
            }
            .boxed(),
            None => futures::future::ready(result).boxed(),
        }
    }

    fn flush(&self, _timeout: Duration) -> BrokerResult<()> {
        Ok(())
    }
}

/// Partitions passed to a listener, recorded for assertions
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingListener {
    pub events: Mutex<Vec<(&'static str, Vec<TopicPartition>)>>,
}

#[cfg(test)]
#[async_trait]
impl RebalanceListener for RecordingListener {
    async fn on_assigned(&self, _committer: &dyn OffsetCommitter, partitions: &[TopicPartition]) {
        self.events.lock().push(("assigned", partitions.to_vec()));
    }

    async fn on_revoked(&self, committer: &dyn OffsetCommitter, partitions: &[TopicPartition]) {
        let offsets: Vec<_> = partitions
            .iter()
            .map(|tp| TopicPartitionOffset::new(tp.clone(), 1))
            .collect();
        committer.commit(&offsets).ok();
        self.events.lock().push(("revoked", partitions.to_vec()));
    }

    async fn on_lost(&self, _committer: &dyn OffsetCommitter, partitions: &[TopicPartition]) {
        self.events.lock().push(("lost", partitions.to_vec()));
    }
}
