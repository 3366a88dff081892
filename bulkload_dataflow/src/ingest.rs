//! The front door of the dataflow.
//!
//! An [`Ingester`] goes through three states: not started, running and closed. Records and
//! checkpoints are only accepted while it is running. Every call checks the run's flush failure
//! latch on the way in and on the way out. An error raised by a pipeline worker in the background
//! therefore surfaces on the caller's next call. A record or checkpoint for a stream outside the
//! catalog is fatal in the same way: the run refuses all further input and `close` re-raises it.

use std::{sync::Arc, time::Duration};

use bulkload_clap_blocks::dataflow::DataFlowConfig;
use bulkload_id::StreamDescriptor;
use bulkload_shutdown::{FlushFailure, ShutdownManager};
use hashbrown::HashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    Loader,
    memory::ReservationManager,
    message::{CheckpointMessage, DestinationCatalog, DestinationMessage, DestinationRecord},
    pipeline::StageError,
    queue,
    stages::{Dataflow, RecordEnvelope, start_dataflow},
    state::{
        self, StateHistogramStore, StateKeyClient, StatePublisher, StateReconciler, StateStore,
        state_key_client,
    },
    watermark::{MessageWatermarkTracker, spawn_stall_monitor},
};

/// Shortest interval the background tasks are woken at
const MIN_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum Error {
    #[error("ingester has not been started")]
    NotStarted,

    #[error("ingester has already been started")]
    AlreadyStarted,

    #[error("ingester is closed")]
    Closed,

    #[error("ingester has already been closed")]
    AlreadyClosed,

    #[error("stream {0} is not part of the configured catalog")]
    UnknownStream(StreamDescriptor),

    #[error("flush failed: {0}")]
    FlushFailure(Arc<StageError>),

    #[error("could not enqueue record: {0}")]
    Queue(#[from] queue::Error),

    #[error("checkpoint error: {0}")]
    State(#[from] state::Error),

    #[error("could not start the dataflow: {0}")]
    Dataflow(#[from] crate::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// What a closed run processed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub records_per_stream: HashMap<StreamDescriptor, u64>,
    pub acknowledged_checkpoints: u64,
    /// Checkpoints that never completed. Only non-zero if the producer declared more records than
    /// it sent.
    pub unacknowledged_checkpoints: usize,
}

impl IngestSummary {
    pub fn total_records(&self) -> u64 {
        self.records_per_stream.values().sum()
    }
}

#[derive(Debug)]
enum Lifecycle {
    NotStarted,
    Running(Running),
    Closed,
}

#[derive(Debug)]
struct Running {
    dataflow: Dataflow,
    background: ShutdownManager,
}

#[derive(Debug)]
pub struct Ingester<L: Loader> {
    config: DataFlowConfig,
    catalog: DestinationCatalog,
    loader: Arc<L>,
    memory: Arc<ReservationManager>,
    key_client: Arc<dyn StateKeyClient>,
    histograms: Arc<StateHistogramStore>,
    store: Arc<StateStore>,
    reconciler: Arc<StateReconciler>,
    watermark: Arc<MessageWatermarkTracker>,
    failure: FlushFailure<StageError>,
    /// First stream seen that is not part of the catalog
    unknown_stream: Mutex<Option<StreamDescriptor>>,
    record_counts: Mutex<HashMap<StreamDescriptor, u64>>,
    lifecycle: Mutex<Lifecycle>,
}

impl<L: Loader> Ingester<L> {
    pub fn new(
        config: DataFlowConfig,
        catalog: DestinationCatalog,
        loader: Arc<L>,
        publisher: Arc<dyn StatePublisher>,
    ) -> Self {
        let memory =
            ReservationManager::with_block_size(config.max_memory_bytes, config.memory_block_size_bytes);
        let histograms = Arc::new(StateHistogramStore::new());
        let store = Arc::new(StateStore::new());
        let reconciler = Arc::new(StateReconciler::new(
            Arc::clone(&store),
            Arc::clone(&histograms),
            publisher,
        ));
        Self {
            key_client: state_key_client(config.transport_medium),
            config,
            catalog,
            loader,
            memory,
            histograms,
            store,
            reconciler,
            watermark: Arc::new(MessageWatermarkTracker::new()),
            failure: FlushFailure::new(),
            unknown_stream: Mutex::new(None),
            record_counts: Mutex::new(HashMap::new()),
            lifecycle: Mutex::new(Lifecycle::NotStarted),
        }
    }

    /// The process-wide memory budget the queues draw from
    pub fn memory(&self) -> &Arc<ReservationManager> {
        &self.memory
    }

    pub fn watermark(&self) -> &Arc<MessageWatermarkTracker> {
        &self.watermark
    }

    /// Spawn the pipeline stages, the reconciler and the stall monitor
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        match &*lifecycle {
            Lifecycle::NotStarted => {}
            Lifecycle::Running(_) => return Err(Error::AlreadyStarted),
            Lifecycle::Closed => return Err(Error::Closed),
        }

        let dataflow = start_dataflow(
            &self.config,
            &self.memory,
            Arc::clone(&self.loader),
            Arc::clone(&self.histograms),
            self.failure.clone(),
        )?;

        let background = ShutdownManager::new();
        tokio::spawn(Arc::clone(&self.reconciler).run(
            self.config.reconcile_interval.max(MIN_INTERVAL),
            background.register(),
        ));
        spawn_stall_monitor(
            Arc::clone(&self.watermark),
            self.config.stall_threshold,
            (self.config.stall_threshold / 4).max(MIN_INTERVAL),
            background.register(),
        );

        *lifecycle = Lifecycle::Running(Running {
            dataflow,
            background,
        });
        info!(
            streams = self.catalog.len(),
            transport_medium = ?self.config.transport_medium,
            "ingester started"
        );
        Ok(())
    }

    /// Accept one inbound record or checkpoint
    ///
    /// Suspends while the destination lane is full or out of memory.
    pub async fn accept(&self, message: impl Into<DestinationMessage> + Send) -> Result<()> {
        let record_queue = match &*self.lifecycle.lock() {
            Lifecycle::Running(running) => Arc::clone(running.dataflow.record_queue()),
            Lifecycle::NotStarted => return Err(Error::NotStarted),
            Lifecycle::Closed => return Err(Error::Closed),
        };
        self.check_failure()?;

        match message.into() {
            DestinationMessage::Record(record) => {
                self.accept_record(&record_queue, record).await?;
            }
            DestinationMessage::Checkpoint(checkpoint) => self.accept_checkpoint(checkpoint)?,
        }

        self.check_failure()
    }

    async fn accept_record(
        &self,
        record_queue: &crate::stages::RecordQueue,
        record: DestinationRecord,
    ) -> Result<()> {
        self.check_stream(&record.stream)?;
        let partition_key = self.key_client.partition_key(&record)?;
        self.watermark.update(record.emitted_at_ms);
        *self
            .record_counts
            .lock()
            .entry(record.stream.clone())
            .or_default() += 1;

        let size_bytes = record.serialized_size_bytes() + self.config.record_overhead_bytes;
        let lane = partition_key.lane(record_queue.num_partitions());
        let envelope = RecordEnvelope {
            record,
            partition_key,
        };
        if let Err(e) = record_queue.publish_sized(envelope, size_bytes, lane).await {
            // a cancelled publish means a worker failed, report that instead
            self.check_failure()?;
            return Err(e.into());
        }
        Ok(())
    }

    fn accept_checkpoint(&self, checkpoint: CheckpointMessage) -> Result<()> {
        if let Some(stream) = &checkpoint.stream {
            self.check_stream(stream)?;
        }
        let key = self.key_client.state_key(&checkpoint)?;
        debug!(
            ordinal = %key.ordinal(),
            partitions = key.partition_keys().len(),
            record_count = checkpoint.record_count,
            "checkpoint received"
        );
        let record_count = checkpoint.record_count;
        // a rejected checkpoint must leave no expected count behind
        self.store.accept(key.clone(), checkpoint)?;
        self.histograms.accept_expected_counts(key, record_count);
        Ok(())
    }

    /// Flush everything accepted so far, stop the background tasks and report what was processed
    ///
    /// Fails with the flush failure if any worker failed, including while draining, or with the
    /// unknown stream that ended the run.
    pub async fn close(&self) -> Result<IngestSummary> {
        let running = {
            let mut lifecycle = self.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Closed) {
                Lifecycle::Running(running) => running,
                Lifecycle::NotStarted => {
                    *lifecycle = Lifecycle::NotStarted;
                    return Err(Error::NotStarted);
                }
                Lifecycle::Closed => return Err(Error::AlreadyClosed),
            }
        };
        info!("closing ingester, draining buffered records");

        running.dataflow.drain().await;
        running.background.shutdown();
        running.background.join().await;
        self.check_failure()?;

        // stages are drained, so whatever can complete has completed
        self.reconciler.flush_complete_states();
        let unacknowledged_checkpoints = self.store.len();
        if unacknowledged_checkpoints > 0 {
            warn!(
                unacknowledged_checkpoints,
                pending = ?self.store.pending_ordinals(),
                "closing with checkpoints that never completed"
            );
        }

        let summary = IngestSummary {
            records_per_stream: self.record_counts.lock().clone(),
            acknowledged_checkpoints: self.reconciler.acknowledged_count(),
            unacknowledged_checkpoints,
        };
        info!(
            total_records = summary.total_records(),
            acknowledged_checkpoints = summary.acknowledged_checkpoints,
            "ingester closed"
        );
        Ok(summary)
    }

    fn check_stream(&self, stream: &StreamDescriptor) -> Result<()> {
        if self.catalog.contains(stream) {
            return Ok(());
        }
        let mut unknown = self.unknown_stream.lock();
        let first = unknown.get_or_insert_with(|| stream.clone());
        error!(
            stream = %first,
            "stream is not part of the configured catalog, refusing further input"
        );
        Err(Error::UnknownStream(first.clone()))
    }

    fn check_failure(&self) -> Result<()> {
        self.failure.check().map_err(Error::FlushFailure)?;
        match &*self.unknown_stream.lock() {
            Some(stream) => Err(Error::UnknownStream(stream.clone())),
            None => Ok(()),
        }
    }
}
