//! Subscription gap (lag) snapshots and the per-client gap tracker

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::error::{ProcessorError, ProcessorResult};
use crate::interceptor::{Interceptor, ProcessorEvent};

/// Gap of one partition: latest offset minus committed offset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionPartitionGap {
    pub partition: i32,
    /// High watermark, the offset the next written record will get
    pub latest_offset: i64,
    /// Committed next-offset of the group
    pub committed_offset: i64,
}

impl SubscriptionPartitionGap {
    pub fn gap(&self) -> i64 {
        (self.latest_offset - self.committed_offset).max(0)
    }

    pub fn caught_up(&self) -> bool {
        self.gap() == 0
    }
}

/// Gaps of the owned partitions of one topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionTopicGap {
    pub topic: String,
    pub partitions: Vec<SubscriptionPartitionGap>,
}

impl SubscriptionTopicGap {
    /// Sum of the partition gaps
    pub fn gap(&self) -> i64 {
        self.partitions.iter().map(SubscriptionPartitionGap::gap).sum()
    }

    pub fn caught_up(&self) -> bool {
        self.partitions.iter().all(SubscriptionPartitionGap::caught_up)
    }
}

/// Whether every partition of every topic has caught up
pub fn all_caught_up(gaps: &[SubscriptionTopicGap]) -> bool {
    gaps.iter().all(SubscriptionTopicGap::caught_up)
}

/// Something that can compute a live subscription gap
#[async_trait]
pub trait GapSource: Send + Sync {
    async fn subscription_gap(&self) -> ProcessorResult<Vec<SubscriptionTopicGap>>;
}

/// Handle to a processor's gap computation
///
/// Holds the processor weakly; once the processor is gone the probe reports
/// [`ProcessorError::NotActivated`].
#[derive(Clone)]
pub struct GapProbe {
    client_id: String,
    source: Weak<dyn GapSource>,
}

impl GapProbe {
    pub fn new(client_id: impl Into<String>, source: Weak<dyn GapSource>) -> Self {
        Self {
            client_id: client_id.into(),
            source,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Compute the current gap
    pub async fn gaps(&self) -> ProcessorResult<Vec<SubscriptionTopicGap>> {
        let source = self
            .source
            .upgrade()
            .ok_or_else(|| ProcessorError::NotActivated(self.client_id.clone()))?;
        source.subscription_gap().await
    }
}

impl std::fmt::Debug for GapProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GapProbe")
            .field("client_id", &self.client_id)
            .finish()
    }
}

/// Registry of gap probes keyed by processor client id
///
/// Shared between processors; clones share the same registry.
#[derive(Clone, Default)]
pub struct GapTracker {
    probes: Arc<DashMap<String, GapProbe>>,
}

impl GapTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a probe with its client id, replacing any previous one
    pub fn register(&self, probe: GapProbe) {
        debug!(client_id = probe.client_id(), "Gap probe registered");
        self.probes.insert(probe.client_id.clone(), probe);
    }

    pub fn unregister(&self, client_id: &str) {
        if self.probes.remove(client_id).is_some() {
            debug!(client_id, "Gap probe unregistered");
        }
    }

    /// Client ids with a registered probe
    pub fn client_ids(&self) -> Vec<String> {
        self.probes.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Raw per-partition gaps of a client
    pub async fn get_gaps(&self, client_id: &str) -> ProcessorResult<Vec<SubscriptionTopicGap>> {
        let probe = self
            .probes
            .get(client_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ProcessorError::GapNotFound(client_id.to_string()))?;
        probe.gaps().await
    }

    /// Whether every partition gap of a client is zero
    pub async fn has_caught_up(&self, client_id: &str) -> ProcessorResult<bool> {
        Ok(all_caught_up(&self.get_gaps(client_id).await?))
    }

    /// Interceptor registering processors on activation and removing them on termination
    pub fn interceptor(&self) -> GapTrackingInterceptor {
        GapTrackingInterceptor {
            tracker: self.clone(),
        }
    }
}

/// Keeps a [`GapTracker`] in sync with processor lifecycles
pub struct GapTrackingInterceptor {
    tracker: GapTracker,
}

impl Interceptor for GapTrackingInterceptor {
    fn intercept(&self, event: &ProcessorEvent<'_>) {
        match event {
            ProcessorEvent::Activated { probe, .. } => self.tracker.register((*probe).clone()),
            ProcessorEvent::Terminated { client_id, .. } => self.tracker.unregister(client_id),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    struct FixedGaps(Mutex<Vec<SubscriptionTopicGap>>);

    #[async_trait]
    impl GapSource for FixedGaps {
        async fn subscription_gap(&self) -> ProcessorResult<Vec<SubscriptionTopicGap>> {
            Ok(self.0.lock().clone())
        }
    }

    fn topic_gap(latest: i64, committed: i64) -> SubscriptionTopicGap {
        SubscriptionTopicGap {
            topic: "orders".into(),
            partitions: vec![
                SubscriptionPartitionGap {
                    partition: 0,
                    latest_offset: 10,
                    committed_offset: 10,
                },
                SubscriptionPartitionGap {
                    partition: 1,
                    latest_offset: latest,
                    committed_offset: committed,
                },
            ],
        }
    }

    #[test]
    fn test_gap_arithmetic() {
        let gap = topic_gap(12, 7);
        assert_eq!(gap.gap(), 5);
        assert!(!gap.caught_up());
        assert!(topic_gap(3, 3).caught_up());
        assert!(all_caught_up(&[]));
    }

    #[tokio::test]
    async fn test_tracker_reports_caught_up() {
        let source = Arc::new(FixedGaps(Mutex::new(vec![topic_gap(5, 2)])));
        let weak: Weak<dyn GapSource> = Arc::downgrade(&source) as Weak<dyn GapSource>;
        let tracker = GapTracker::new();
        tracker.register(GapProbe::new("echo", weak));

        assert!(!tracker.has_caught_up("echo").await.unwrap());
        *source.0.lock() = vec![topic_gap(5, 5)];
        assert!(tracker.has_caught_up("echo").await.unwrap());
        assert_eq!(tracker.client_ids(), vec!["echo".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_client_is_not_found() {
        let tracker = GapTracker::new();
        assert!(matches!(
            tracker.get_gaps("missing").await,
            Err(ProcessorError::GapNotFound(id)) if id == "missing"
        ));
    }

    #[tokio::test]
    async fn test_dropped_source_is_not_activated() {
        let source = Arc::new(FixedGaps(Mutex::new(Vec::new())));
        let weak: Weak<dyn GapSource> = Arc::downgrade(&source) as Weak<dyn GapSource>;
        let tracker = GapTracker::new();
        tracker.register(GapProbe::new("echo", weak));
        drop(source);

        assert!(matches!(
            tracker.get_gaps("echo").await,
            Err(ProcessorError::NotActivated(_))
        ));
    }
}
