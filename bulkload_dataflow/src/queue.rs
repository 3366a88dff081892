//! Bounded per-partition channels that connect pipeline stages.
//!
//! A [`StrictPartitionedQueue`] is a set of FIFO channels, one per partition, for small metadata
//! payloads. A [`ResourceReservingPartitionedQueue`] adds memory accounting on top: it claims a
//! share of the global budget when it is built, clamps the admitted message size to what that
//! share can hold for every concurrent worker, and makes publishers wait for memory as well as for
//! channel space.
//!
//! In both cases publishing into a full partition suspends the publisher. Nothing is dropped.

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::memory::{self, Reservation, ReservationManager, Reserved};

#[derive(Debug, Clone, Copy, Error)]
pub enum Error {
    #[error("partition {partition} out of range for a queue with {num_partitions} partitions")]
    PartitionOutOfRange {
        partition: usize,
        num_partitions: usize,
    },

    #[error("partition {0} has already been taken by a consumer")]
    AlreadyConsumed(usize),

    #[error("queue is closed")]
    Closed,

    #[error("publish cancelled")]
    Cancelled,

    #[error("memory reservation failed: {0}")]
    Memory(#[from] memory::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The producing side of a partitioned queue
#[async_trait]
pub trait PartitionedSink<T>: Debug + Send + Sync {
    /// Publish `value` into `partition`, suspending while the partition is full
    async fn publish(&self, value: T, partition: usize) -> Result<()>;

    /// Stop accepting values. Consumers drain what was already published and then see the end of
    /// their partition.
    fn close(&self);

    fn num_partitions(&self) -> usize;
}

/// The consuming side of a partitioned queue
pub trait PartitionedSource<T>: Debug + Send + Sync {
    /// Take the receiver for `partition`. Each partition has exactly one consumer.
    fn consume(&self, partition: usize) -> Result<PartitionReceiver<T>>;

    fn num_partitions(&self) -> usize;
}

/// Values whose memory footprint is known up front
pub trait SizedPayload {
    fn size_bytes(&self) -> u64;
}

/// Receives the values of a single partition in publish order
#[derive(Debug)]
pub struct PartitionReceiver<T> {
    partition: usize,
    rx: mpsc::Receiver<T>,
}

impl<T> PartitionReceiver<T> {
    pub fn partition(&self) -> usize {
        self.partition
    }

    /// The next value, or `None` once the queue is closed and this partition is drained
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

/// Unclamped FIFO-per-partition channels
pub struct StrictPartitionedQueue<T> {
    senders: RwLock<Option<Vec<mpsc::Sender<T>>>>,
    receivers: Mutex<Vec<Option<mpsc::Receiver<T>>>>,
    num_partitions: usize,
    cancel: CancellationToken,
}

impl<T: Send> StrictPartitionedQueue<T> {
    /// Create a queue with `num_partitions` channels that each hold up to `capacity` values
    pub fn new(num_partitions: usize, capacity: usize) -> Self {
        assert!(num_partitions > 0, "queue needs at least one partition");
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..num_partitions)
            .map(|_| {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (tx, Some(rx))
            })
            .unzip();
        Self {
            senders: RwLock::new(Some(senders)),
            receivers: Mutex::new(receivers),
            num_partitions,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort suspended and future publishes once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.senders.read().is_none()
    }

    fn sender(&self, partition: usize) -> Result<mpsc::Sender<T>> {
        let senders = self.senders.read();
        let senders = senders.as_ref().ok_or(Error::Closed)?;
        senders
            .get(partition)
            .cloned()
            .ok_or(Error::PartitionOutOfRange {
                partition,
                num_partitions: self.num_partitions,
            })
    }

    async fn publish_inner(&self, value: T, partition: usize) -> Result<()> {
        let tx = self.sender(partition)?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            res = tx.send(value) => res.map_err(|_| Error::Closed),
        }
    }

    fn close_inner(&self) {
        if self.senders.write().take().is_some() {
            debug!(num_partitions = self.num_partitions, "closed partitioned queue");
        }
    }

    fn consume_inner(&self, partition: usize) -> Result<PartitionReceiver<T>> {
        let mut receivers = self.receivers.lock();
        let slot = receivers
            .get_mut(partition)
            .ok_or(Error::PartitionOutOfRange {
                partition,
                num_partitions: self.num_partitions,
            })?;
        let rx = slot.take().ok_or(Error::AlreadyConsumed(partition))?;
        Ok(PartitionReceiver { partition, rx })
    }
}

impl<T> Debug for StrictPartitionedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrictPartitionedQueue")
            .field("num_partitions", &self.num_partitions)
            .field("closed", &self.senders.read().is_none())
            .finish()
    }
}

#[async_trait]
impl<T: Send + 'static> PartitionedSink<T> for StrictPartitionedQueue<T> {
    async fn publish(&self, value: T, partition: usize) -> Result<()> {
        self.publish_inner(value, partition).await
    }

    fn close(&self) {
        self.close_inner()
    }

    fn num_partitions(&self) -> usize {
        self.num_partitions
    }
}

impl<T: Send + 'static> PartitionedSource<T> for StrictPartitionedQueue<T> {
    fn consume(&self, partition: usize) -> Result<PartitionReceiver<T>> {
        self.consume_inner(partition)
    }

    fn num_partitions(&self) -> usize {
        self.num_partitions
    }
}

/// Largest message a reserving queue admits: the declared part size, unless the reserved memory
/// cannot hold one such message per concurrent worker.
pub fn clamped_message_size(
    declared_part_size_bytes: u64,
    available_bytes: u64,
    num_workers: usize,
) -> u64 {
    let per_worker = available_bytes / num_workers.max(1) as u64;
    declared_part_size_bytes.min(per_worker).max(1)
}

/// Partitioned channels whose messages hold memory from a dedicated share of the global budget
pub struct ResourceReservingPartitionedQueue<T> {
    inner: StrictPartitionedQueue<Reserved<T>>,
    budget: Arc<ReservationManager>,
    max_message_size_bytes: u64,
    /// The share of the global budget. Returned when the queue is dropped.
    claim: Reservation,
}

/// Sizing parameters for a [`ResourceReservingPartitionedQueue`]
#[derive(Debug, Clone, Copy)]
pub struct ReservingQueueOptions {
    /// Fraction of the global budget this queue may hold
    pub memory_ratio: f64,
    /// Workers that may each hold one message at a time
    pub num_workers: usize,
    pub num_partitions: usize,
    /// Size the caller would like each message to have
    pub declared_part_size_bytes: u64,
    /// Messages each partition channel holds before publishers block
    pub channel_capacity: usize,
}

impl<T: Send> ResourceReservingPartitionedQueue<T> {
    pub fn new(global: &Arc<ReservationManager>, options: ReservingQueueOptions) -> Result<Self> {
        let ReservingQueueOptions {
            memory_ratio,
            num_workers,
            num_partitions,
            declared_part_size_bytes,
            channel_capacity,
        } = options;
        let target_bytes = (global.max_bytes() as f64 * memory_ratio) as u64;
        let claim = global.claim(target_bytes)?;
        let available_bytes = claim.bytes();
        let max_message_size_bytes =
            clamped_message_size(declared_part_size_bytes, available_bytes, num_workers);
        info!(
            available_bytes,
            declared_part_size_bytes,
            max_message_size_bytes,
            num_workers,
            num_partitions,
            "created resource reserving queue"
        );
        Ok(Self {
            inner: StrictPartitionedQueue::new(num_partitions, channel_capacity),
            budget: ReservationManager::with_block_size(
                available_bytes,
                global.block_size_bytes(),
            ),
            max_message_size_bytes,
            claim,
        })
    }

    /// Abort suspended and future publishes once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.inner = self.inner.with_cancellation(token);
        self
    }

    pub fn max_message_size_bytes(&self) -> u64 {
        self.max_message_size_bytes
    }

    /// Bytes claimed from the global budget
    pub fn reserved_bytes(&self) -> u64 {
        self.claim.bytes()
    }

    /// Bytes currently held by messages in flight
    pub fn bytes_in_use(&self) -> i64 {
        self.budget.current_bytes()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Stop accepting values. Consumers drain what was already published.
    pub fn close(&self) {
        self.inner.close_inner()
    }

    pub fn num_partitions(&self) -> usize {
        self.inner.num_partitions
    }

    /// Publish `value` accounted at `size_bytes`, clamped to the max message size
    ///
    /// Suspends until the queue's memory share can hold the message and the partition has room.
    pub async fn publish_sized(&self, value: T, size_bytes: u64, partition: usize) -> Result<()> {
        if partition >= self.inner.num_partitions {
            return Err(Error::PartitionOutOfRange {
                partition,
                num_partitions: self.inner.num_partitions,
            });
        }
        let size_bytes = size_bytes.min(self.max_message_size_bytes);
        let reservation = tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => return Err(Error::Cancelled),
            res = self.budget.reserve(size_bytes) => res?,
        };
        self.inner
            .publish_inner(Reserved::new(value, reservation), partition)
            .await
    }
}

impl<T> Debug for ResourceReservingPartitionedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceReservingPartitionedQueue")
            .field("inner", &self.inner)
            .field("budget", &self.budget)
            .field("max_message_size_bytes", &self.max_message_size_bytes)
            .field("reserved_bytes", &self.claim.bytes())
            .finish()
    }
}

#[async_trait]
impl<T> PartitionedSink<T> for ResourceReservingPartitionedQueue<T>
where
    T: SizedPayload + Send + 'static,
{
    async fn publish(&self, value: T, partition: usize) -> Result<()> {
        let size_bytes = value.size_bytes();
        self.publish_sized(value, size_bytes, partition).await
    }

    fn close(&self) {
        Self::close(self)
    }

    fn num_partitions(&self) -> usize {
        Self::num_partitions(self)
    }
}

impl<T: Send + 'static> PartitionedSource<Reserved<T>> for ResourceReservingPartitionedQueue<T> {
    fn consume(&self, partition: usize) -> Result<PartitionReceiver<Reserved<T>>> {
        self.inner.consume_inner(partition)
    }

    fn num_partitions(&self) -> usize {
        Self::num_partitions(self)
    }
}
