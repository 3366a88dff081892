//! Generic driver that moves work from one partitioned queue to the next.
//!
//! A [`PipelineStage`] runs one worker per input partition. Each worker loops
//! consume → [`StageWorker::accept`] → publish until its partition is closed and drained, then
//! calls [`StageWorker::finish`] to emit whatever it still buffers. Once every worker has returned
//! the stage closes its output, which is how "no more input" travels down the pipeline.
//!
//! A worker error is sent to the shared [`FlushFailure`] latch. The latch cancels every other
//! worker at its next safe point, so the run fails fast instead of carrying on with a broken lane.

use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use bulkload_shutdown::FlushFailure;
use thiserror::Error;
use tokio::{
    task::{JoinHandle, JoinSet},
    time::{Interval, MissedTickBehavior},
};
use tracing::{debug, error, info};

use crate::queue::{self, PartitionReceiver, PartitionedSink, PartitionedSource};

/// Errors raised by sink-specific collaborators
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("{stage} worker for partition {partition} failed: {source}")]
    Worker {
        stage: &'static str,
        partition: usize,
        #[source]
        source: BoxError,
    },

    #[error("{stage} worker for partition {partition} could not publish its output: {source}")]
    Publish {
        stage: &'static str,
        partition: usize,
        #[source]
        source: queue::Error,
    },

    #[error("{stage} could not attach to its input: {source}")]
    Consume {
        stage: &'static str,
        #[source]
        source: queue::Error,
    },

    #[error("{stage} worker panicked: {message}")]
    Panicked {
        stage: &'static str,
        message: String,
    },
}

/// Per-partition operation run by a [`PipelineStage`]
///
/// A worker instance is owned by a single lane, so it can buffer across calls without locking.
#[async_trait]
pub trait StageWorker<I, O>: Send + 'static
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Handle one input, optionally producing an output
    async fn accept(&mut self, input: I) -> Result<Option<O>, BoxError>;

    /// Called on the stage's tick interval, if it has one
    async fn on_tick(&mut self) -> Result<Option<O>, BoxError> {
        Ok(None)
    }

    /// Called once after the input partition is closed and drained
    async fn finish(&mut self) -> Result<Option<O>, BoxError> {
        Ok(None)
    }
}

pub struct PipelineStage<I, O> {
    name: &'static str,
    input: Arc<dyn PartitionedSource<I>>,
    output: Arc<dyn PartitionedSink<O>>,
    failure: FlushFailure<StageError>,
    tick_interval: Option<Duration>,
}

impl<I, O> PipelineStage<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn new(
        name: &'static str,
        input: Arc<dyn PartitionedSource<I>>,
        output: Arc<dyn PartitionedSink<O>>,
        failure: FlushFailure<StageError>,
    ) -> Self {
        Self {
            name,
            input,
            output,
            failure,
            tick_interval: None,
        }
    }

    /// Give every worker an [`on_tick`][StageWorker::on_tick] call at this interval
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = Some(interval);
        self
    }

    /// Start one worker per input partition, building each with `make_worker(partition)`
    pub fn spawn<W, F>(self, mut make_worker: F) -> Result<StageHandle, StageError>
    where
        W: StageWorker<I, O>,
        F: FnMut(usize) -> W,
    {
        let Self {
            name,
            input,
            output,
            failure,
            tick_interval,
        } = self;

        let num_partitions = input.num_partitions();
        let num_outputs = output.num_partitions().max(1);
        let mut workers = JoinSet::new();
        for partition in 0..num_partitions {
            let rx = input
                .consume(partition)
                .map_err(|source| StageError::Consume {
                    stage: name,
                    source,
                })?;
            let lane = WorkerLane {
                stage: name,
                partition,
                output_partition: partition % num_outputs,
                output: Arc::clone(&output),
                failure: failure.clone(),
                tick_interval,
            };
            workers.spawn(lane.run(rx, make_worker(partition)));
        }
        info!(stage = name, num_partitions, "stage started");

        let handle = tokio::spawn(async move {
            while let Some(res) = workers.join_next().await {
                if let Err(e) = res {
                    error!(stage = name, %e, "stage worker did not complete");
                    failure.propagate(StageError::Panicked {
                        stage: name,
                        message: e.to_string(),
                    });
                }
            }
            // every worker is done, nothing else will be published downstream
            output.close();
            info!(stage = name, "stage finished");
        });

        Ok(StageHandle { name, handle })
    }
}

impl<I, O> Debug for PipelineStage<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineStage")
            .field("name", &self.name)
            .field("input", &self.input)
            .field("output", &self.output)
            .field("tick_interval", &self.tick_interval)
            .finish()
    }
}

/// Completes once every worker of a stage has returned and the stage's output is closed
#[derive(Debug)]
pub struct StageHandle {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl StageHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            error!(stage = self.name, %e, "stage driver task failed");
        }
    }
}

struct WorkerLane<O> {
    stage: &'static str,
    partition: usize,
    output_partition: usize,
    output: Arc<dyn PartitionedSink<O>>,
    failure: FlushFailure<StageError>,
    tick_interval: Option<Duration>,
}

enum Event<I> {
    Input(I),
    Tick,
}

impl<O: Send + 'static> WorkerLane<O> {
    async fn run<I, W>(self, mut rx: PartitionReceiver<I>, mut worker: W)
    where
        I: Send + 'static,
        W: StageWorker<I, O>,
    {
        debug!(stage = self.stage, partition = self.partition, "stage worker started");
        if let Err(e) = self.drive(&mut rx, &mut worker).await {
            let cancelled = self.failure.cancellation_token().is_cancelled();
            if cancelled {
                debug!(stage = self.stage, partition = self.partition, %e, "stage worker unwound after failure elsewhere");
            } else {
                error!(stage = self.stage, partition = self.partition, %e, "stage worker failed");
                self.failure.propagate(e);
            }
        } else {
            debug!(stage = self.stage, partition = self.partition, "stage worker finished");
        }
    }

    async fn drive<I, W>(
        &self,
        rx: &mut PartitionReceiver<I>,
        worker: &mut W,
    ) -> Result<(), StageError>
    where
        I: Send + 'static,
        W: StageWorker<I, O>,
    {
        let cancel = self.failure.cancellation_token();
        let mut ticker = self.tick_interval.map(|period| {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                input = rx.recv() => match input {
                    Some(input) => Event::Input(input),
                    None => break,
                },
                _ = next_tick(&mut ticker) => Event::Tick,
            };
            let output = match event {
                Event::Input(input) => worker.accept(input).await,
                Event::Tick => worker.on_tick().await,
            }
            .map_err(|source| self.worker_error(source))?;
            self.publish(output).await?;
        }

        let output = worker
            .finish()
            .await
            .map_err(|source| self.worker_error(source))?;
        self.publish(output).await
    }

    async fn publish(&self, output: Option<O>) -> Result<(), StageError> {
        let Some(output) = output else {
            return Ok(());
        };
        self.output
            .publish(output, self.output_partition)
            .await
            .map_err(|source| StageError::Publish {
                stage: self.stage,
                partition: self.partition,
                source,
            })
    }

    fn worker_error(&self, source: BoxError) -> StageError {
        StageError::Worker {
            stage: self.stage,
            partition: self.partition,
            source,
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
