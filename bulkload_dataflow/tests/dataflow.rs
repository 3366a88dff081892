use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use async_trait::async_trait;
use bulkload_clap_blocks::dataflow::{DataFlowConfig, TransportMedium};
use bulkload_dataflow::{
    BoxError, Loader,
    ingest::{Error, Ingester},
    memory,
    message::{CheckpointMessage, DestinationCatalog, DestinationRecord},
    pipeline::StageError,
    queue,
    state::{self, AcknowledgedCheckpoint, ChannelStatePublisher},
};
use bulkload_id::StreamDescriptor;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc::UnboundedReceiver;

const POISON: &str = "poison";

/// Keeps completed records in memory. Refuses to format a batch holding the poison payload.
#[derive(Debug, Default)]
struct InMemoryLoader {
    committed: Mutex<Vec<DestinationRecord>>,
}

#[async_trait]
impl Loader for InMemoryLoader {
    type Part = Vec<DestinationRecord>;
    type Upload = Vec<DestinationRecord>;

    async fn format(&self, records: Vec<DestinationRecord>) -> Result<Self::Part, BoxError> {
        if records.iter().any(|r| r.data == POISON) {
            return Err("refusing to format poisoned record".into());
        }
        Ok(records)
    }

    async fn load(&self, part: Self::Part) -> Result<Self::Upload, BoxError> {
        Ok(part)
    }

    async fn complete(&self, upload: Self::Upload) -> Result<(), BoxError> {
        self.committed.lock().extend(upload);
        Ok(())
    }
}

fn users() -> StreamDescriptor {
    StreamDescriptor::new(Some("public"), "users")
}

fn orders() -> StreamDescriptor {
    StreamDescriptor::new(Some("public"), "orders")
}

fn config(medium: TransportMedium) -> DataFlowConfig {
    let mut config = DataFlowConfig::with_defaults();
    config.max_memory_bytes = 1024 * 1024;
    config.num_partitions = NonZeroUsize::new(2);
    config.num_upload_workers = NonZeroUsize::new(2).unwrap();
    config.part_size_bytes = 256;
    config.record_overhead_bytes = 8;
    config.reconcile_interval = Duration::from_millis(10);
    config.transport_medium = medium;
    config
}

struct Run {
    ingester: Ingester<InMemoryLoader>,
    loader: Arc<InMemoryLoader>,
    acks: UnboundedReceiver<AcknowledgedCheckpoint>,
}

impl Run {
    fn new(config: DataFlowConfig) -> Self {
        let loader = Arc::new(InMemoryLoader::default());
        let (publisher, acks) = ChannelStatePublisher::new();
        let ingester = Ingester::new(
            config,
            DestinationCatalog::new([users(), orders()]),
            Arc::clone(&loader),
            Arc::new(publisher),
        );
        Self {
            ingester,
            loader,
            acks,
        }
    }

    fn started(config: DataFlowConfig) -> Self {
        let run = Self::new(config);
        run.ingester.start().unwrap();
        run
    }

    fn acked(&mut self) -> Vec<(u64, u64)> {
        let mut acked = vec![];
        while let Ok(ack) = self.acks.try_recv() {
            acked.push((ack.ordinal.as_u64(), ack.committed_records));
        }
        acked
    }
}

fn record(stream: StreamDescriptor, payload: &'static str) -> DestinationRecord {
    DestinationRecord::new(stream, payload, 1_700_000_000_000)
}

#[test_log::test(tokio::test)]
async fn inferred_checkpoints_are_acknowledged_in_order() {
    let mut run = Run::started(config(TransportMedium::Stdio));

    for _ in 0..5 {
        run.ingester.accept(record(users(), "u")).await.unwrap();
    }
    run.ingester
        .accept(CheckpointMessage::for_stream(users(), 5))
        .await
        .unwrap();
    for _ in 0..3 {
        run.ingester.accept(record(orders(), "o")).await.unwrap();
    }
    run.ingester
        .accept(CheckpointMessage::global(3))
        .await
        .unwrap();

    let summary = run.ingester.close().await.unwrap();

    assert_eq!(run.acked(), vec![(1, 5), (2, 3)]);
    assert_eq!(summary.acknowledged_checkpoints, 2);
    assert_eq!(summary.unacknowledged_checkpoints, 0);
    assert_eq!(summary.records_per_stream.get(&users()), Some(&5));
    assert_eq!(summary.records_per_stream.get(&orders()), Some(&3));
    assert_eq!(run.loader.committed.lock().len(), 8);
    assert_eq!(
        run.ingester.watermark().last_message_ms(),
        1_700_000_000_000
    );
    // every queue returned its share of the budget
    assert_eq!(run.ingester.memory().current_bytes(), 0);
}

#[test_log::test(tokio::test)]
async fn self_describing_checkpoints_track_their_own_records() {
    let mut run = Run::started(config(TransportMedium::Socket));

    // records of two checkpoints arrive interleaved
    for i in 0..6 {
        let id = if i % 2 == 0 { "c-1" } else { "c-2" };
        run.ingester
            .accept(record(users(), "u").with_checkpoint_id(id))
            .await
            .unwrap();
    }
    run.ingester
        .accept(
            CheckpointMessage::for_stream(users(), 3)
                .with_ordinal(1)
                .with_checkpoint_id("c-1"),
        )
        .await
        .unwrap();
    run.ingester
        .accept(
            CheckpointMessage::for_stream(users(), 3)
                .with_ordinal(2)
                .with_partition_ids(["c-2"]),
        )
        .await
        .unwrap();

    let summary = run.ingester.close().await.unwrap();
    assert_eq!(run.acked(), vec![(1, 3), (2, 3)]);
    assert_eq!(summary.total_records(), 6);
}

#[test_log::test(tokio::test)]
async fn incomplete_checkpoint_holds_back_later_ones() {
    let mut run = Run::started(config(TransportMedium::Stdio));

    // the producer declares one record more than it sends
    for _ in 0..4 {
        run.ingester.accept(record(users(), "u")).await.unwrap();
    }
    run.ingester
        .accept(CheckpointMessage::global(5))
        .await
        .unwrap();
    for _ in 0..2 {
        run.ingester.accept(record(users(), "u")).await.unwrap();
    }
    run.ingester
        .accept(CheckpointMessage::global(2))
        .await
        .unwrap();

    let summary = run.ingester.close().await.unwrap();
    assert!(run.acked().is_empty());
    assert_eq!(summary.acknowledged_checkpoints, 0);
    assert_eq!(summary.unacknowledged_checkpoints, 2);
    // the data itself was still written
    assert_eq!(run.loader.committed.lock().len(), 6);
}

#[test_log::test(tokio::test)]
async fn reconciler_acknowledges_before_close() {
    let mut config = config(TransportMedium::Stdio);
    // every record is its own part
    config.part_size_bytes = 1;
    let mut run = Run::started(config);

    run.ingester.accept(record(users(), "u")).await.unwrap();
    run.ingester
        .accept(CheckpointMessage::global(1))
        .await
        .unwrap();

    let ack = tokio::time::timeout(Duration::from_secs(5), run.acks.recv())
        .await
        .expect("checkpoint should be acknowledged by the periodic sweep")
        .unwrap();
    assert_eq!(ack.ordinal.as_u64(), 1);
    assert_eq!(ack.committed_records, 1);

    run.ingester.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn worker_failure_surfaces_to_the_caller() {
    let mut config = config(TransportMedium::Stdio);
    config.part_size_bytes = 1;
    let run = Run::started(config);

    let mut payloads = std::iter::once(POISON).chain(std::iter::repeat("u"));
    let err = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let payload = payloads.next().unwrap();
            match run.ingester.accept(record(users(), payload)).await {
                Ok(()) => tokio::time::sleep(Duration::from_millis(5)).await,
                Err(e) => break e,
            }
        }
    })
    .await
    .expect("the failure should reach the caller");

    let Error::FlushFailure(stage_error) = err else {
        panic!("unexpected error: {err}");
    };
    assert!(
        matches!(stage_error.as_ref(), StageError::Worker { stage: "format", .. }),
        "unexpected stage error: {stage_error}"
    );

    // the failure is terminal and close re-raises it
    assert!(matches!(
        run.ingester.accept(record(users(), "u")).await,
        Err(Error::FlushFailure(_))
    ));
    assert!(matches!(
        run.ingester.close().await,
        Err(Error::FlushFailure(_))
    ));
}

#[test_log::test(tokio::test)]
async fn unknown_stream_ends_the_run() {
    let run = Run::started(config(TransportMedium::Stdio));
    let stranger = StreamDescriptor::new(None, "stranger");

    run.ingester.accept(record(users(), "u")).await.unwrap();
    let err = run
        .ingester
        .accept(record(stranger.clone(), "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownStream(s) if s == stranger));

    // known streams are refused from now on
    let err = run.ingester.accept(record(users(), "u")).await.unwrap_err();
    assert!(matches!(err, Error::UnknownStream(s) if s == stranger));
    let err = run
        .ingester
        .accept(CheckpointMessage::global(1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownStream(s) if s == stranger));

    let err = run.ingester.close().await.unwrap_err();
    assert!(matches!(err, Error::UnknownStream(s) if s == stranger));
    assert!(matches!(run.ingester.close().await, Err(Error::AlreadyClosed)));
}

#[test_log::test(tokio::test)]
async fn checkpoint_for_unknown_stream_ends_the_run() {
    let mut run = Run::started(config(TransportMedium::Stdio));
    let stranger = StreamDescriptor::new(None, "stranger");

    let err = run
        .ingester
        .accept(CheckpointMessage::for_stream(stranger.clone(), 0))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownStream(s) if s == stranger));

    let err = run.ingester.close().await.unwrap_err();
    assert!(matches!(err, Error::UnknownStream(s) if s == stranger));
    assert!(run.acked().is_empty());
}

#[test_log::test(tokio::test)]
async fn duplicate_checkpoint_does_not_block_the_original() {
    let mut run = Run::started(config(TransportMedium::Socket));

    for _ in 0..3 {
        run.ingester
            .accept(record(users(), "u").with_checkpoint_id("c-1"))
            .await
            .unwrap();
    }
    let checkpoint = || {
        CheckpointMessage::global(3)
            .with_ordinal(1)
            .with_checkpoint_id("c-1")
    };
    run.ingester.accept(checkpoint()).await.unwrap();
    let err = run.ingester.accept(checkpoint()).await.unwrap_err();
    assert!(
        matches!(err, Error::State(state::Error::DuplicateOrdinal(o)) if o.as_u64() == 1),
        "unexpected error: {err}"
    );

    let summary = run.ingester.close().await.unwrap();
    assert_eq!(run.acked(), vec![(1, 3)]);
    assert_eq!(summary.acknowledged_checkpoints, 1);
    assert_eq!(summary.unacknowledged_checkpoints, 0);
}

#[test_log::test(tokio::test)]
async fn lifecycle_transitions_happen_once() {
    let run = Run::new(config(TransportMedium::Stdio));

    assert!(matches!(
        run.ingester.accept(record(users(), "u")).await,
        Err(Error::NotStarted)
    ));
    assert!(matches!(run.ingester.close().await, Err(Error::NotStarted)));

    run.ingester.start().unwrap();
    assert!(matches!(run.ingester.start(), Err(Error::AlreadyStarted)));

    run.ingester.close().await.unwrap();
    assert!(matches!(run.ingester.close().await, Err(Error::AlreadyClosed)));
    assert!(matches!(
        run.ingester.accept(record(users(), "u")).await,
        Err(Error::Closed)
    ));
    assert!(matches!(run.ingester.start(), Err(Error::Closed)));
}

#[test_log::test(tokio::test)]
async fn start_fails_without_memory() {
    let mut config = config(TransportMedium::Stdio);
    config.max_memory_bytes = 0;
    let run = Run::new(config);

    let err = run.ingester.start().unwrap_err();
    assert!(
        matches!(
            err,
            Error::Dataflow(bulkload_dataflow::Error::Queue(queue::Error::Memory(
                memory::Error::Exhausted { .. }
            )))
        ),
        "unexpected error: {err}"
    );
    // still startable in principle, nothing was left running
    assert!(matches!(
        run.ingester.accept(record(users(), "u")).await,
        Err(Error::NotStarted)
    ));
}
