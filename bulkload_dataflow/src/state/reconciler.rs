use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bulkload_shutdown::ShutdownToken;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::{AcknowledgedCheckpoint, StateHistogramStore, StatePublisher, StateStore};

/// Periodically acknowledges completed checkpoints, smallest ordinal first
#[derive(Debug)]
pub struct StateReconciler {
    store: Arc<StateStore>,
    histograms: Arc<StateHistogramStore>,
    publisher: Arc<dyn StatePublisher>,
    acknowledged: AtomicU64,
}

impl StateReconciler {
    pub fn new(
        store: Arc<StateStore>,
        histograms: Arc<StateHistogramStore>,
        publisher: Arc<dyn StatePublisher>,
    ) -> Self {
        Self {
            store,
            histograms,
            publisher,
            acknowledged: AtomicU64::new(0),
        }
    }

    /// Publish pending checkpoints from the front for as long as each one is complete
    ///
    /// Stops at the first incomplete checkpoint, even if later ones are already complete. Returns
    /// how many checkpoints were published.
    pub fn flush_complete_states(&self) -> usize {
        let mut published = 0;
        while let Some(pending) = self
            .store
            .pop_smallest_if(|key| self.histograms.is_complete(key))
        {
            let committed_records = self.histograms.remove(&pending.key);
            self.publisher.publish(AcknowledgedCheckpoint {
                ordinal: pending.key.ordinal(),
                committed_records,
                message: pending.message,
            });
            published += 1;
        }
        if published > 0 {
            self.acknowledged
                .fetch_add(published as u64, Ordering::Relaxed);
            debug!(
                published,
                still_pending = self.store.len(),
                "reconciled checkpoints"
            );
        }
        published
    }

    /// Checkpoints published since this reconciler was created
    pub fn acknowledged_count(&self) -> u64 {
        self.acknowledged.load(Ordering::Relaxed)
    }

    /// Sweep every `interval` until `shutdown` fires
    ///
    /// A sweep that has started always runs to the end before shutdown is acknowledged.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: ShutdownToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(?interval, "checkpoint reconciler started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait_for_shutdown() => break,
                _ = ticker.tick() => {}
            }
            self.flush_complete_states();
        }
        info!(
            acknowledged = self.acknowledged_count(),
            "checkpoint reconciler stopped"
        );
        shutdown.complete();
    }
}
