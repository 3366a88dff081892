//! The format → load → complete pipeline.
//!
//! ```text
//!  records ──▶ [record queue] ──format──▶ [part queue] ──load──▶ [upload queue] ──complete──▶ flushed counts
//!              reserving, one               reserving, one          strict, one
//!              lane per partition           lane per upload worker  lane per upload worker
//! ```
//!
//! Format workers aggregate the records of their lane until the aggregate reaches the flush
//! threshold or gets too old, and only then give them to the [`Loader`]. The memory reserved for
//! those records stays held until the part is formatted, and the part then holds memory of its own
//! until it is loaded.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bulkload_clap_blocks::dataflow::DataFlowConfig;
use bulkload_id::PartitionKey;
use bulkload_shutdown::FlushFailure;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{
    BoxError, Loader, Result,
    memory::{Reservation, ReservationManager, Reserved},
    message::DestinationRecord,
    pipeline::{PipelineStage, StageError, StageHandle, StageWorker},
    queue::{
        ReservingQueueOptions, ResourceReservingPartitionedQueue, SizedPayload,
        StrictPartitionedQueue,
    },
    state::{PartitionHistogram, StateHistogramStore},
};

/// Shortest tick any periodic task runs at
const MIN_TICK: Duration = Duration::from_millis(10);

/// A record and the partition key it is counted under
#[derive(Debug)]
pub struct RecordEnvelope {
    pub record: DestinationRecord,
    pub partition_key: PartitionKey,
}

/// A formatted part and the records it covers, per partition key
#[derive(Debug)]
pub struct FormattedPart<P> {
    pub part: P,
    pub counts: PartitionHistogram,
    pub size_bytes: u64,
}

impl<P> SizedPayload for FormattedPart<P> {
    fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

/// A part written to the destination but not yet made durable
#[derive(Debug)]
pub struct LoadedPart<U> {
    pub upload: U,
    pub counts: PartitionHistogram,
}

pub type RecordQueue = ResourceReservingPartitionedQueue<RecordEnvelope>;

/// A running pipeline
#[derive(Debug)]
pub struct Dataflow {
    record_queue: Arc<RecordQueue>,
    stages: Vec<StageHandle>,
}

impl Dataflow {
    /// Where inbound records are published
    pub fn record_queue(&self) -> &Arc<RecordQueue> {
        &self.record_queue
    }

    /// Close the record queue and wait for every stage to drain
    pub async fn drain(self) {
        self.record_queue.close();
        for stage in self.stages {
            let name = stage.name();
            stage.join().await;
            debug!(stage = name, "stage drained");
        }
    }
}

/// Build the queues and spawn the three stages
///
/// Each reserving queue claims its share of `memory` up front. Flushed counts end up in
/// `histograms`. Every queue is cancelled by `failure`, so a failed worker stops blocked
/// publishers as well as its sibling workers.
pub fn start_dataflow<L: Loader>(
    config: &DataFlowConfig,
    memory: &Arc<ReservationManager>,
    loader: Arc<L>,
    histograms: Arc<StateHistogramStore>,
    failure: FlushFailure<StageError>,
) -> Result<Dataflow> {
    let num_partitions = config.num_partitions();
    let num_upload_workers = config.num_upload_workers();
    let cancel = failure.cancellation_token();

    // each format worker holds one aggregate while more records for it wait in its lane
    let record_queue = Arc::new(
        ResourceReservingPartitionedQueue::new(
            memory,
            ReservingQueueOptions {
                memory_ratio: config.record_queue_memory_ratio,
                num_workers: num_partitions * 2,
                num_partitions,
                declared_part_size_bytes: config.part_size_bytes,
                channel_capacity: config.channel_capacity(),
            },
        )?
        .with_cancellation(cancel.clone()),
    );
    let part_queue = Arc::new(
        ResourceReservingPartitionedQueue::<FormattedPart<L::Part>>::new(
            memory,
            ReservingQueueOptions {
                memory_ratio: config.part_queue_memory_ratio,
                num_workers: num_upload_workers,
                num_partitions: num_upload_workers,
                declared_part_size_bytes: config.part_size_bytes,
                channel_capacity: config.channel_capacity(),
            },
        )?
        .with_cancellation(cancel.clone()),
    );
    let upload_queue = Arc::new(
        StrictPartitionedQueue::<LoadedPart<L::Upload>>::new(
            num_upload_workers,
            config.channel_capacity(),
        )
        .with_cancellation(cancel),
    );

    let flush_threshold_bytes = part_queue
        .max_message_size_bytes()
        .min(record_queue.max_message_size_bytes());
    let max_age = config.aggregate_max_age;
    info!(
        num_partitions,
        num_upload_workers,
        flush_threshold_bytes,
        ?max_age,
        "starting dataflow"
    );

    let format = PipelineStage::<Reserved<RecordEnvelope>, FormattedPart<L::Part>>::new(
        "format",
        Arc::clone(&record_queue) as _,
        Arc::clone(&part_queue) as _,
        failure.clone(),
    )
    .with_tick_interval((max_age / 2).max(MIN_TICK))
    .spawn(|_| FormatWorker::new(Arc::clone(&loader), flush_threshold_bytes, max_age))?;

    let load = PipelineStage::<Reserved<FormattedPart<L::Part>>, LoadedPart<L::Upload>>::new(
        "load",
        Arc::clone(&part_queue) as _,
        Arc::clone(&upload_queue) as _,
        failure.clone(),
    )
    .spawn(|_| LoadWorker {
        loader: Arc::clone(&loader),
    })?;

    let complete = PipelineStage::<LoadedPart<L::Upload>, PartitionHistogram>::new(
        "complete",
        upload_queue as _,
        histograms as _,
        failure,
    )
    .spawn(|_| CompleteWorker {
        loader: Arc::clone(&loader),
    })?;

    Ok(Dataflow {
        record_queue,
        stages: vec![format, load, complete],
    })
}

/// Aggregates the records of one lane into parts
struct FormatWorker<L: Loader> {
    loader: Arc<L>,
    flush_threshold_bytes: u64,
    max_age: Duration,
    records: Vec<DestinationRecord>,
    counts: PartitionHistogram,
    held: Vec<Reservation>,
    size_bytes: u64,
    opened_at: Option<Instant>,
}

impl<L: Loader> FormatWorker<L> {
    fn new(loader: Arc<L>, flush_threshold_bytes: u64, max_age: Duration) -> Self {
        Self {
            loader,
            flush_threshold_bytes,
            max_age,
            records: vec![],
            counts: PartitionHistogram::new(),
            held: vec![],
            size_bytes: 0,
            opened_at: None,
        }
    }

    async fn flush(&mut self) -> Result<Option<FormattedPart<L::Part>>, BoxError> {
        if self.records.is_empty() {
            return Ok(None);
        }
        let records = std::mem::take(&mut self.records);
        let counts = std::mem::take(&mut self.counts);
        let size_bytes = std::mem::take(&mut self.size_bytes);
        self.opened_at = None;
        debug!(records = records.len(), size_bytes, "formatting part");
        let part = self.loader.format(records).await?;
        // the records are now represented by the part
        self.held.clear();
        Ok(Some(FormattedPart {
            part,
            counts,
            size_bytes,
        }))
    }
}

#[async_trait]
impl<L: Loader> StageWorker<Reserved<RecordEnvelope>, FormattedPart<L::Part>> for FormatWorker<L> {
    async fn accept(
        &mut self,
        input: Reserved<RecordEnvelope>,
    ) -> Result<Option<FormattedPart<L::Part>>, BoxError> {
        let (envelope, reservation) = input.into_parts();
        self.size_bytes += reservation.bytes();
        self.held.push(reservation);
        self.counts.increment(envelope.partition_key);
        self.records.push(envelope.record);
        self.opened_at.get_or_insert_with(Instant::now);

        if self.size_bytes >= self.flush_threshold_bytes {
            return self.flush().await;
        }
        Ok(None)
    }

    async fn on_tick(&mut self) -> Result<Option<FormattedPart<L::Part>>, BoxError> {
        match self.opened_at {
            Some(opened_at) if opened_at.elapsed() >= self.max_age => self.flush().await,
            _ => Ok(None),
        }
    }

    async fn finish(&mut self) -> Result<Option<FormattedPart<L::Part>>, BoxError> {
        self.flush().await
    }
}

struct LoadWorker<L: Loader> {
    loader: Arc<L>,
}

#[async_trait]
impl<L: Loader> StageWorker<Reserved<FormattedPart<L::Part>>, LoadedPart<L::Upload>>
    for LoadWorker<L>
{
    async fn accept(
        &mut self,
        input: Reserved<FormattedPart<L::Part>>,
    ) -> Result<Option<LoadedPart<L::Upload>>, BoxError> {
        // keep the part's memory held until the upload is done with it
        let (part, _reservation) = input.into_parts();
        let upload = self.loader.load(part.part).await?;
        Ok(Some(LoadedPart {
            upload,
            counts: part.counts,
        }))
    }
}

struct CompleteWorker<L: Loader> {
    loader: Arc<L>,
}

#[async_trait]
impl<L: Loader> StageWorker<LoadedPart<L::Upload>, PartitionHistogram> for CompleteWorker<L> {
    async fn accept(
        &mut self,
        input: LoadedPart<L::Upload>,
    ) -> Result<Option<PartitionHistogram>, BoxError> {
        self.loader.complete(input.upload).await?;
        Ok(Some(input.counts))
    }
}

#[cfg(test)]
mod tests {
    use bulkload_id::{CheckpointOrdinal, StreamDescriptor};

    use super::*;

    #[derive(Debug)]
    struct CountingLoader;

    #[async_trait]
    impl Loader for CountingLoader {
        type Part = usize;
        type Upload = usize;

        async fn format(&self, records: Vec<DestinationRecord>) -> Result<usize, BoxError> {
            Ok(records.len())
        }

        async fn load(&self, part: usize) -> Result<usize, BoxError> {
            Ok(part)
        }

        async fn complete(&self, _upload: usize) -> Result<(), BoxError> {
            Ok(())
        }
    }

    fn envelope(
        memory: &Arc<ReservationManager>,
        partition: &str,
        size: u64,
    ) -> Reserved<RecordEnvelope> {
        let record = DestinationRecord::new(StreamDescriptor::new(None, "s"), "x", 0);
        Reserved::new(
            RecordEnvelope {
                record,
                partition_key: partition.into(),
            },
            memory.try_reserve(size).unwrap(),
        )
    }

    #[tokio::test]
    async fn format_flushes_at_size_threshold() {
        let memory = ReservationManager::new(100);
        let mut worker = FormatWorker::new(Arc::new(CountingLoader), 10, Duration::from_secs(60));

        assert!(worker.accept(envelope(&memory, "a", 4)).await.unwrap().is_none());
        assert!(worker.accept(envelope(&memory, "b", 4)).await.unwrap().is_none());
        assert_eq!(memory.current_bytes(), 8);

        let part = worker
            .accept(envelope(&memory, "a", 4))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(part.part, 3);
        assert_eq!(part.size_bytes, 12);
        assert_eq!(part.counts.get(&"a".into()), 2);
        assert_eq!(part.counts.get(&"b".into()), 1);
        // record memory is released once the part exists
        assert_eq!(memory.current_bytes(), 0);

        assert!(worker.finish().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn format_flushes_old_aggregates_on_tick() {
        let memory = ReservationManager::new(100);
        let mut young = FormatWorker::new(Arc::new(CountingLoader), 100, Duration::from_secs(60));
        young.accept(envelope(&memory, "a", 1)).await.unwrap();
        assert!(young.on_tick().await.unwrap().is_none());

        let mut old = FormatWorker::new(Arc::new(CountingLoader), 100, Duration::ZERO);
        assert!(old.on_tick().await.unwrap().is_none(), "nothing to flush yet");
        old.accept(envelope(&memory, "a", 1)).await.unwrap();
        let part = old.on_tick().await.unwrap().unwrap();
        assert_eq!(part.part, 1);
    }

    #[tokio::test]
    async fn format_flushes_remainder_on_finish() {
        let memory = ReservationManager::new(100);
        let mut worker = FormatWorker::new(Arc::new(CountingLoader), 100, Duration::from_secs(60));
        worker.accept(envelope(&memory, "a", 5)).await.unwrap();
        worker.accept(envelope(&memory, "a", 5)).await.unwrap();
        let part = worker.finish().await.unwrap().unwrap();
        assert_eq!(part.part, 2);
        assert_eq!(part.counts.total(), 2);
        assert_eq!(memory.current_bytes(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn dataflow_delivers_flushed_counts() {
        let mut config = DataFlowConfig::with_defaults();
        config.max_memory_bytes = 1024 * 1024;
        config.num_partitions = std::num::NonZeroUsize::new(2);
        config.num_upload_workers = std::num::NonZeroUsize::new(2).unwrap();
        config.part_size_bytes = 64;

        let memory = ReservationManager::new(config.max_memory_bytes);
        let histograms = Arc::new(StateHistogramStore::new());
        let failure = FlushFailure::new();
        let dataflow = start_dataflow(
            &config,
            &memory,
            Arc::new(CountingLoader),
            Arc::clone(&histograms),
            failure.clone(),
        )
        .unwrap();

        let queue = Arc::clone(dataflow.record_queue());
        for i in 0..20u64 {
            let key = PartitionKey::from(if i % 2 == 0 { "even" } else { "odd" });
            let lane = key.lane(queue.num_partitions());
            let record = DestinationRecord::new(StreamDescriptor::new(None, "s"), "payload", 0);
            queue
                .publish_sized(
                    RecordEnvelope {
                        record,
                        partition_key: key,
                    },
                    16,
                    lane,
                )
                .await
                .unwrap();
        }
        dataflow.drain().await;

        assert!(failure.check().is_ok());
        let state_key = |partition: &str| {
            crate::state::StateKey::new(CheckpointOrdinal::new(1), [PartitionKey::from(partition)])
        };
        assert_eq!(histograms.flushed_count(&state_key("even")), 10);
        assert_eq!(histograms.flushed_count(&state_key("odd")), 10);
        // every queue gave its share back
        assert_eq!(queue.bytes_in_use(), 0);
    }
}
