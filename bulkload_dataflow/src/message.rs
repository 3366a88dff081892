//! Inbound messages and the catalog of streams they may belong to.

use bulkload_id::{CheckpointId, CheckpointOrdinal, StreamDescriptor};
use bytes::Bytes;
use hashbrown::HashSet;
use serde::{Deserialize, Serialize};

/// One record to be written to the destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationRecord {
    pub stream: StreamDescriptor,
    /// The serialized payload. Decoding it is the loader's business.
    pub data: Bytes,
    /// Producer timestamp in milliseconds since the epoch
    pub emitted_at_ms: i64,
    /// The checkpoint this record belongs to, when the transport says so
    pub checkpoint_id: Option<CheckpointId>,
}

impl DestinationRecord {
    pub fn new(stream: StreamDescriptor, data: impl Into<Bytes>, emitted_at_ms: i64) -> Self {
        Self {
            stream,
            data: data.into(),
            emitted_at_ms,
            checkpoint_id: None,
        }
    }

    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<CheckpointId>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    /// Size of the payload as it arrived on the wire
    pub fn serialized_size_bytes(&self) -> u64 {
        self.data.len() as u64
    }
}

/// A producer's declaration that everything before it has been sent
///
/// A checkpoint with a `stream` covers that stream only. One without a stream is global and covers
/// all of them. Created once on arrival and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<CheckpointId>,
    /// Arrival ordinal assigned by a self-describing producer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordinal: Option<CheckpointOrdinal>,
    /// Checkpoint ids of the record groups this checkpoint covers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partition_ids: Vec<CheckpointId>,
    /// Records the producer sent for this checkpoint
    pub record_count: u64,
    /// Opaque producer state, handed back unchanged on acknowledgment
    #[serde(default)]
    pub state: serde_json::Value,
}

impl CheckpointMessage {
    /// A global checkpoint covering `record_count` records
    pub fn global(record_count: u64) -> Self {
        Self {
            stream: None,
            checkpoint_id: None,
            ordinal: None,
            partition_ids: vec![],
            record_count,
            state: serde_json::Value::Null,
        }
    }

    /// A checkpoint covering `record_count` records of `stream`
    pub fn for_stream(stream: StreamDescriptor, record_count: u64) -> Self {
        Self {
            stream: Some(stream),
            ..Self::global(record_count)
        }
    }

    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<CheckpointId>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    pub fn with_ordinal(mut self, ordinal: u64) -> Self {
        self.ordinal = Some(CheckpointOrdinal::new(ordinal));
        self
    }

    pub fn with_partition_ids<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<CheckpointId>,
    {
        self.partition_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_state(mut self, state: serde_json::Value) -> Self {
        self.state = state;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DestinationMessage {
    Record(DestinationRecord),
    Checkpoint(CheckpointMessage),
}

impl From<DestinationRecord> for DestinationMessage {
    fn from(record: DestinationRecord) -> Self {
        Self::Record(record)
    }
}

impl From<CheckpointMessage> for DestinationMessage {
    fn from(checkpoint: CheckpointMessage) -> Self {
        Self::Checkpoint(checkpoint)
    }
}

/// The streams a run is configured to write
#[derive(Debug, Clone, Default)]
pub struct DestinationCatalog {
    streams: HashSet<StreamDescriptor>,
}

impl DestinationCatalog {
    pub fn new(streams: impl IntoIterator<Item = StreamDescriptor>) -> Self {
        Self {
            streams: streams.into_iter().collect(),
        }
    }

    pub fn contains(&self, stream: &StreamDescriptor) -> bool {
        self.streams.contains(stream)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
