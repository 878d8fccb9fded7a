//! Commit-eligible positions per partition
//!
//! Records are begun in log order and completed in any order (outputs of a
//! later record may be acknowledged first). The eligible position of a
//! partition is the lowest offset still pending, or the highest completed
//! offset + 1 when nothing is pending, so a commit never moves past a record
//! whose outputs are unacknowledged.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

use crate::record::{RecordId, TopicPartition, TopicPartitionOffset};

#[derive(Debug, Default)]
struct PartitionOffsets {
    pending: BTreeSet<i64>,
    completed: Option<i64>,
    committed: Option<i64>,
}

impl PartitionOffsets {
    fn eligible(&self) -> Option<i64> {
        let completed = self.completed?;
        let position = match self.pending.first() {
            Some(lowest_pending) => *lowest_pending,
            None => completed + 1,
        };
        match self.committed {
            Some(committed) if committed >= position => None,
            _ => Some(position),
        }
    }
}

/// Tracks in-progress and completed records of the owned partitions
#[derive(Debug, Default)]
pub(crate) struct OffsetTracker {
    partitions: Mutex<HashMap<TopicPartition, PartitionOffsets>>,
}

impl OffsetTracker {
    /// A record entered processing
    pub(crate) fn begin(&self, id: &RecordId) {
        self.partitions
            .lock()
            .entry(id.topic_partition())
            .or_default()
            .pending
            .insert(id.offset);
    }

    /// A begun record and all of its outputs completed
    ///
    /// Ignored for partitions no longer tracked, e.g. after a revoke.
    pub(crate) fn complete(&self, id: &RecordId) {
        let mut partitions = self.partitions.lock();
        if let Some(offsets) = partitions.get_mut(&id.topic_partition()) {
            offsets.pending.remove(&id.offset);
            offsets.completed = Some(offsets.completed.map_or(id.offset, |c| c.max(id.offset)));
        }
    }

    /// A record that needs no processing
    pub(crate) fn skip(&self, id: &RecordId) {
        self.begin(id);
        self.complete(id);
    }

    /// Positions that may be committed now
    pub(crate) fn eligible(&self) -> Vec<TopicPartitionOffset> {
        let partitions = self.partitions.lock();
        let mut offsets: Vec<_> = partitions
            .iter()
            .filter_map(|(tp, offsets)| {
                offsets
                    .eligible()
                    .map(|position| TopicPartitionOffset::new(tp.clone(), position))
            })
            .collect();
        offsets.sort_by(|a, b| a.partition.cmp(&b.partition));
        offsets
    }

    /// Record a successful commit
    pub(crate) fn mark_committed(&self, offsets: &[TopicPartitionOffset]) {
        let mut partitions = self.partitions.lock();
        for offset in offsets {
            if let Some(tracked) = partitions.get_mut(&offset.partition) {
                tracked.committed = Some(tracked.committed.map_or(offset.offset, |c| c.max(offset.offset)));
            }
        }
    }

    /// Forget partitions that are no longer owned
    pub(crate) fn release(&self, released: &[TopicPartition]) {
        let mut partitions = self.partitions.lock();
        for tp in released {
            partitions.remove(tp);
        }
    }

    /// Records begun but not completed
    pub(crate) fn pending(&self) -> usize {
        self.partitions.lock().values().map(|p| p.pending.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn id(offset: i64) -> RecordId {
        RecordId::new("t", 0, offset)
    }

    fn position(tracker: &OffsetTracker) -> Option<i64> {
        tracker.eligible().first().map(|o| o.offset)
    }

    #[test]
    fn test_nothing_eligible_before_completion() {
        let tracker = OffsetTracker::default();
        tracker.begin(&id(0));
        assert_eq!(position(&tracker), None);
        tracker.complete(&id(0));
        assert_eq!(position(&tracker), Some(1));
    }

    #[test]
    fn test_out_of_order_completion_waits_for_lowest_pending() {
        let tracker = OffsetTracker::default();
        for offset in 0..3 {
            tracker.begin(&id(offset));
        }
        tracker.complete(&id(0));
        tracker.complete(&id(2));
        assert_eq!(position(&tracker), Some(1));

        tracker.complete(&id(1));
        assert_eq!(position(&tracker), Some(3));
    }

    #[test]
    fn test_committed_positions_are_not_repeated() {
        let tracker = OffsetTracker::default();
        tracker.skip(&id(4));
        let offsets = tracker.eligible();
        assert_eq!(offsets, vec![TopicPartitionOffset::new(TopicPartition::new("t", 0), 5)]);

        tracker.mark_committed(&offsets);
        assert!(tracker.eligible().is_empty());
    }

    #[test]
    fn test_released_partitions_ignore_late_completions() {
        let tracker = OffsetTracker::default();
        tracker.begin(&id(0));
        tracker.release(&[TopicPartition::new("t", 0)]);
        tracker.complete(&id(0));
        assert!(tracker.eligible().is_empty());
        assert_eq!(tracker.pending(), 0);
    }

    proptest! {
        #[test]
        fn prop_eligible_never_passes_unacknowledged_record(
            order in Just((0..20i64).collect::<Vec<_>>()).prop_shuffle()
        ) {
            let tracker = OffsetTracker::default();
            for offset in 0..20 {
                tracker.begin(&id(offset));
            }

            let mut done = BTreeSet::new();
            for offset in order {
                tracker.complete(&id(offset));
                done.insert(offset);

                let first_unacknowledged = (0..20).find(|o| !done.contains(o)).unwrap_or(20);
                if let Some(position) = position(&tracker) {
                    prop_assert!(position <= first_unacknowledged);
                }
            }
            prop_assert_eq!(position(&tracker), Some(20));
        }
    }
}
