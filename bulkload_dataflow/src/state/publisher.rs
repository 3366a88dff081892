use std::fmt::Debug;

use bulkload_id::CheckpointOrdinal;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::message::CheckpointMessage;

/// A checkpoint whose records are all durable
#[derive(Debug, Clone, PartialEq)]
pub struct AcknowledgedCheckpoint {
    pub ordinal: CheckpointOrdinal,
    /// Records flushed for this checkpoint, as counted by the dataflow
    pub committed_records: u64,
    pub message: CheckpointMessage,
}

/// Forwards acknowledged checkpoints upstream, in the order it is given them
pub trait StatePublisher: Debug + Send + Sync {
    fn publish(&self, checkpoint: AcknowledgedCheckpoint);
}

/// Publishes into an unbounded channel read by the orchestrator
#[derive(Debug)]
pub struct ChannelStatePublisher {
    tx: mpsc::UnboundedSender<AcknowledgedCheckpoint>,
}

impl ChannelStatePublisher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AcknowledgedCheckpoint>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StatePublisher for ChannelStatePublisher {
    fn publish(&self, checkpoint: AcknowledgedCheckpoint) {
        let ordinal = checkpoint.ordinal;
        let committed_records = checkpoint.committed_records;
        if self.tx.send(checkpoint).is_err() {
            warn!(%ordinal, "acknowledgment receiver is gone, dropping checkpoint");
            return;
        }
        info!(%ordinal, committed_records, "checkpoint acknowledged");
    }
}
