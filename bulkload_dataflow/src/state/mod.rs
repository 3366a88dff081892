//! Checkpoint tracking.
//!
//! Every checkpoint that arrives gets a [`StateKey`]: its arrival ordinal plus the partition keys
//! its records were routed under. The producer's declared record count is recorded as the
//! checkpoint's *expected* count in the [`StateHistogramStore`]. As the complete stage makes parts
//! durable it adds *flushed* counts per partition key. The [`StateReconciler`] periodically pops
//! the smallest pending ordinal from the [`StateStore`] once its flushed counts add up to what was
//! expected, and hands it to a [`StatePublisher`].
//!
//! Acknowledgments are strictly ordered. A later checkpoint that is already complete waits behind
//! an earlier one that is not.

mod histogram;
mod histogram_store;
mod key_client;
mod publisher;
mod reconciler;
mod store;

use bulkload_id::{CheckpointOrdinal, PartitionKey};
use thiserror::Error;

pub use histogram::{Histogram, PartitionHistogram};
pub use histogram_store::StateHistogramStore;
pub use key_client::{
    InferredStateKeyClient, SelfDescribingStateKeyClient, StateKeyClient, state_key_client,
};
pub use publisher::{AcknowledgedCheckpoint, ChannelStatePublisher, StatePublisher};
pub use reconciler::StateReconciler;
pub use store::{PendingCheckpoint, StateStore};

#[derive(Debug, Error)]
pub enum Error {
    #[error("record for stream {stream} carries no checkpoint id")]
    MissingCheckpointId { stream: String },

    #[error("checkpoint names neither a checkpoint id nor any partition ids")]
    CheckpointWithoutId,

    #[error("checkpoint {checkpoint} carries no ordinal")]
    CheckpointWithoutOrdinal { checkpoint: String },

    #[error("checkpoint ordinal {0} is already pending")]
    DuplicateOrdinal(CheckpointOrdinal),

    #[error("checkpoint ordinal {0} is not pending")]
    NotPending(CheckpointOrdinal),

    #[error("cannot remove checkpoint ordinal {ordinal} while {smallest} is still pending")]
    OutOfOrderRemoval {
        ordinal: CheckpointOrdinal,
        smallest: CheckpointOrdinal,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Identifies one checkpoint: its arrival ordinal and the partitions its records went to
///
/// The partition keys are kept sorted and free of duplicates, so two keys built from the same set
/// in any order compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey {
    ordinal: CheckpointOrdinal,
    partition_keys: Vec<PartitionKey>,
}

impl StateKey {
    pub fn new(
        ordinal: CheckpointOrdinal,
        partition_keys: impl IntoIterator<Item = PartitionKey>,
    ) -> Self {
        let mut partition_keys: Vec<_> = partition_keys.into_iter().collect();
        partition_keys.sort_unstable();
        partition_keys.dedup();
        Self {
            ordinal,
            partition_keys,
        }
    }

    pub fn ordinal(&self) -> CheckpointOrdinal {
        self.ordinal
    }

    pub fn partition_keys(&self) -> &[PartitionKey] {
        &self.partition_keys
    }
}
