use std::{fmt::Debug, sync::Arc};

use bulkload_clap_blocks::dataflow::TransportMedium;
use bulkload_id::{OrdinalSequence, PartitionKey};

use super::{Error, Result, StateKey};
use crate::message::{CheckpointMessage, DestinationRecord};

/// Decides which checkpoint a record belongs to and how an arriving checkpoint is keyed
pub trait StateKeyClient: Debug + Send + Sync {
    /// The partition key `record` is counted under
    fn partition_key(&self, record: &DestinationRecord) -> Result<PartitionKey>;

    /// Key a checkpoint as it arrives
    fn state_key(&self, checkpoint: &CheckpointMessage) -> Result<StateKey>;
}

/// Pick the key client for the transport in use
pub fn state_key_client(medium: TransportMedium) -> Arc<dyn StateKeyClient> {
    match medium {
        TransportMedium::Stdio => Arc::new(InferredStateKeyClient::new()),
        TransportMedium::Socket => Arc::new(SelfDescribingStateKeyClient),
    }
}

/// Keys checkpoints by arrival order
///
/// All records that arrive between two checkpoints belong to the second one. Records are keyed
/// by the ordinal the next checkpoint will receive, and each checkpoint covers exactly that one
/// partition key.
#[derive(Debug, Default)]
pub struct InferredStateKeyClient {
    sequence: OrdinalSequence,
}

impl InferredStateKeyClient {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateKeyClient for InferredStateKeyClient {
    fn partition_key(&self, _record: &DestinationRecord) -> Result<PartitionKey> {
        Ok(self.sequence.current().into())
    }

    fn state_key(&self, _checkpoint: &CheckpointMessage) -> Result<StateKey> {
        let ordinal = self.sequence.advance();
        Ok(StateKey::new(ordinal, [ordinal.into()]))
    }
}

/// Trusts the checkpoint ids and ordinals the producer attaches
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfDescribingStateKeyClient;

impl StateKeyClient for SelfDescribingStateKeyClient {
    fn partition_key(&self, record: &DestinationRecord) -> Result<PartitionKey> {
        record
            .checkpoint_id
            .as_ref()
            .map(PartitionKey::from)
            .ok_or_else(|| Error::MissingCheckpointId {
                stream: record.stream.to_string(),
            })
    }

    fn state_key(&self, checkpoint: &CheckpointMessage) -> Result<StateKey> {
        let partition_keys: Vec<PartitionKey> = if checkpoint.partition_ids.is_empty() {
            let id = checkpoint
                .checkpoint_id
                .as_ref()
                .ok_or(Error::CheckpointWithoutId)?;
            vec![id.into()]
        } else {
            checkpoint.partition_ids.iter().map(Into::into).collect()
        };
        let ordinal = checkpoint
            .ordinal
            .ok_or_else(|| Error::CheckpointWithoutOrdinal {
                checkpoint: partition_keys
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
            })?;
        Ok(StateKey::new(ordinal, partition_keys))
    }
}
