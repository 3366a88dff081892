use async_trait::async_trait;
use bulkload_id::PartitionKey;
use dashmap::{DashMap, mapref::entry::Entry};
use tracing::{debug, warn};

use super::{PartitionHistogram, StateKey};
use crate::queue::{self, PartitionedSink};

/// Expected record counts per checkpoint and flushed record counts per partition
///
/// Both sides are updated concurrently. Expected counts come from the front door as checkpoints
/// arrive, flushed counts come from the complete stage as parts become durable. Each entry is
/// updated atomically on its own.
#[derive(Debug, Default)]
pub struct StateHistogramStore {
    expected: DashMap<StateKey, u64>,
    flushed: DashMap<PartitionKey, u64>,
}

impl StateHistogramStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record what the producer declared for `key`
    ///
    /// The first declaration wins. Returns `false` and keeps the existing count if `key` already
    /// has one.
    pub fn accept_expected_counts(&self, key: StateKey, count: u64) -> bool {
        match self.expected.entry(key) {
            Entry::Occupied(entry) => {
                warn!(
                    ordinal = %entry.key().ordinal(),
                    expected = *entry.get(),
                    redeclared = count,
                    "checkpoint already has an expected count"
                );
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(count);
                true
            }
        }
    }

    pub fn accept_flushed_counts(&self, counts: PartitionHistogram) {
        for (key, count) in counts {
            *self.flushed.entry(key).or_default() += count;
        }
    }

    pub fn expected_count(&self, key: &StateKey) -> Option<u64> {
        self.expected.get(key).map(|count| *count)
    }

    /// Records flushed across every partition `key` references
    pub fn flushed_count(&self, key: &StateKey) -> u64 {
        key.partition_keys()
            .iter()
            .map(|partition| self.flushed.get(partition).map_or(0, |count| *count))
            .sum()
    }

    /// Whether the flushed counts for `key` add up to exactly what was expected
    ///
    /// More flushed than expected never completes. It is logged as an accounting anomaly and the
    /// checkpoint stays pending.
    pub fn is_complete(&self, key: &StateKey) -> bool {
        let Some(expected) = self.expected_count(key) else {
            return false;
        };
        let flushed = self.flushed_count(key);
        if flushed > expected {
            warn!(
                ordinal = %key.ordinal(),
                expected,
                flushed,
                "flushed more records than the checkpoint declared"
            );
        }
        flushed == expected
    }

    /// Forget `key` and every partition it references. Returns the flushed count.
    pub fn remove(&self, key: &StateKey) -> u64 {
        self.expected.remove(key);
        key.partition_keys()
            .iter()
            .filter_map(|partition| self.flushed.remove(partition))
            .map(|(_, count)| count)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.expected.is_empty() && self.flushed.is_empty()
    }
}

/// Terminal sink of the pipeline. Publishing merges the flushed counts and never blocks.
#[async_trait]
impl PartitionedSink<PartitionHistogram> for StateHistogramStore {
    async fn publish(&self, counts: PartitionHistogram, _partition: usize) -> queue::Result<()> {
        self.accept_flushed_counts(counts);
        Ok(())
    }

    fn close(&self) {
        debug!("no more flushed counts will arrive");
    }

    fn num_partitions(&self) -> usize {
        1
    }
}
