//! Config for the bulk-load dataflow: memory budget, lane widths, and the periodic tasks.

use std::{ffi::OsString, num::NonZeroUsize, time::Duration};

/// How the upstream producer delivers records and checkpoints.
///
/// This decides how records are correlated with the checkpoint that covers them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum TransportMedium {
    /// Plain ordered stream. Checkpoint membership is inferred from arrival order.
    #[default]
    Stdio,

    /// Structured channel. Every record names the checkpoint it belongs to.
    Socket,
}

/// CLI config for the destination dataflow.
#[derive(Debug, Clone, clap::Parser)]
#[allow(missing_copy_implementations)]
pub struct DataFlowConfig {
    /// Process-wide memory budget, in bytes, shared by every queue in the dataflow.
    #[clap(
        long = "max-memory-bytes",
        env = "BULKLOAD_MAX_MEMORY_BYTES",
        default_value = "1073741824",
        action
    )]
    pub max_memory_bytes: u64,

    /// Largest block handed out by a single memory request.
    #[clap(
        long = "memory-block-size-bytes",
        env = "BULKLOAD_MEMORY_BLOCK_SIZE_BYTES",
        default_value = "10485760",
        action
    )]
    pub memory_block_size_bytes: u64,

    /// Number of parallel lanes records are spread across.
    ///
    /// Defaults to the number of logical cores on the system.
    #[clap(long = "num-partitions", env = "BULKLOAD_NUM_PARTITIONS", action)]
    pub num_partitions: Option<NonZeroUsize>,

    /// Number of concurrent upload workers in the load and complete stages.
    #[clap(
        long = "num-upload-workers",
        env = "BULKLOAD_NUM_UPLOAD_WORKERS",
        default_value = "4",
        action
    )]
    pub num_upload_workers: NonZeroUsize,

    /// Target size of a formatted part. Clamped down when the memory budget cannot hold one part
    /// per upload worker.
    #[clap(
        long = "part-size-bytes",
        env = "BULKLOAD_PART_SIZE_BYTES",
        default_value = "52428800",
        action
    )]
    pub part_size_bytes: u64,

    /// Fraction of the memory budget reserved for buffered inbound records.
    #[clap(
        long = "record-queue-memory-ratio",
        env = "BULKLOAD_RECORD_QUEUE_MEMORY_RATIO",
        default_value = "0.2",
        value_parser = parse_ratio,
        action
    )]
    pub record_queue_memory_ratio: f64,

    /// Fraction of the memory budget reserved for formatted parts waiting on upload.
    #[clap(
        long = "part-queue-memory-ratio",
        env = "BULKLOAD_PART_QUEUE_MEMORY_RATIO",
        default_value = "0.4",
        value_parser = parse_ratio,
        action
    )]
    pub part_queue_memory_ratio: f64,

    /// Number of messages each partition channel can hold before producers block.
    #[clap(
        long = "channel-capacity",
        env = "BULKLOAD_CHANNEL_CAPACITY",
        default_value = "1024",
        action
    )]
    pub channel_capacity: NonZeroUsize,

    /// Bytes added to each record's serialized size to cover its in-memory representation.
    #[clap(
        long = "record-overhead-bytes",
        env = "BULKLOAD_RECORD_OVERHEAD_BYTES",
        default_value = "96",
        action
    )]
    pub record_overhead_bytes: u64,

    /// How often completed checkpoints are reconciled and acknowledged.
    #[clap(
        long = "reconcile-interval",
        env = "BULKLOAD_RECONCILE_INTERVAL",
        default_value = "1s",
        value_parser = humantime::parse_duration,
    )]
    pub reconcile_interval: Duration,

    /// Oldest an aggregate may get before it is formatted regardless of its size.
    #[clap(
        long = "aggregate-max-age",
        env = "BULKLOAD_AGGREGATE_MAX_AGE",
        default_value = "5m",
        value_parser = humantime::parse_duration,
    )]
    pub aggregate_max_age: Duration,

    /// Time without inbound records after which the producer is reported as stalled.
    #[clap(
        long = "stall-threshold",
        env = "BULKLOAD_STALL_THRESHOLD",
        default_value = "10m",
        value_parser = humantime::parse_duration,
    )]
    pub stall_threshold: Duration,

    /// Transport the producer uses.
    #[clap(
        long = "transport-medium",
        env = "BULKLOAD_TRANSPORT_MEDIUM",
        default_value_t = TransportMedium::default(),
        value_enum,
        action
    )]
    pub transport_medium: TransportMedium,
}

impl DataFlowConfig {
    /// Config with every option at its default value
    pub fn with_defaults() -> Self {
        <Self as clap::Parser>::parse_from(std::iter::empty::<OsString>())
    }

    /// The configured lane count, or the number of logical cores when unset
    pub fn num_partitions(&self) -> usize {
        self.num_partitions
            .map(NonZeroUsize::get)
            .unwrap_or_else(num_cpus::get)
    }

    pub fn num_upload_workers(&self) -> usize {
        self.num_upload_workers.get()
    }

    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity.get()
    }
}

fn parse_ratio(s: &str) -> Result<f64, String> {
    let ratio: f64 = s.parse().map_err(|e| format!("invalid ratio '{s}': {e}"))?;
    if ratio > 0.0 && ratio <= 1.0 {
        Ok(ratio)
    } else {
        Err(format!("ratio must be in (0, 1], got {ratio}"))
    }
}
