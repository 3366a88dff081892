//! Destination-side bulk-load dataflow.
//!
//! Records arrive through the [`Ingester`](ingest::Ingester), are buffered in memory-accounted
//! partitioned queues, and move through three pipeline stages: format, load and complete. Each
//! stage hands its work to a sink-specific [`Loader`]. When the complete stage finishes a part it
//! reports how many records of each partition key are now durable. The checkpoint subsystem in
//! [`state`] compares those counts with what the producer declared for every checkpoint and
//! acknowledges checkpoints strictly in the order they arrived.
//!
//! Every queue draws from a single process-wide [`ReservationManager`](memory::ReservationManager).
//! A slow sink therefore backs up into the queues and finally blocks the producer, instead of
//! growing memory without limit.

pub mod ingest;
pub mod memory;
pub mod message;
pub mod pipeline;
pub mod queue;
pub mod stages;
pub mod state;
pub mod watermark;

use std::fmt::Debug;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::DestinationRecord;
pub use crate::pipeline::BoxError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("memory error: {0}")]
    Memory(#[from] memory::Error),

    #[error("queue error: {0}")]
    Queue(#[from] queue::Error),

    #[error("pipeline stage error: {0}")]
    Stage(#[from] pipeline::StageError),

    #[error("checkpoint state error: {0}")]
    State(#[from] state::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The sink-specific side of the dataflow
///
/// Each method is driven by its own pipeline stage and may run concurrently with itself on other
/// lanes. A returned error fails the whole run: it is latched as the run's flush failure and
/// re-raised to whoever is feeding records in.
#[async_trait]
pub trait Loader: Debug + Send + Sync + 'static {
    /// A formatted batch of records, e.g. a file part, ready to be uploaded
    type Part: Debug + Send + 'static;

    /// Handle for an upload that has been written but not yet made visible
    type Upload: Debug + Send + 'static;

    /// Turn a batch of records into a part
    async fn format(&self, records: Vec<DestinationRecord>) -> Result<Self::Part, BoxError>;

    /// Write a part to the destination
    async fn load(&self, part: Self::Part) -> Result<Self::Upload, BoxError>;

    /// Make a loaded part durable. Once this returns the part's records count as flushed.
    async fn complete(&self, upload: Self::Upload) -> Result<(), BoxError>;
}
