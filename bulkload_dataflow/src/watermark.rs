//! Producer liveness.

use std::{
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use bulkload_shutdown::ShutdownToken;
use chrono::Utc;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{info, warn};

/// Timestamp of the most recent inbound record
///
/// Uses the record's own timestamp rather than reading the clock on every record. A single writer
/// updates it while any number of readers check it.
#[derive(Debug)]
pub struct MessageWatermarkTracker {
    last_message_ms: AtomicI64,
}

impl MessageWatermarkTracker {
    /// A tracker that counts the time since its creation until the first update
    pub fn new() -> Self {
        Self::starting_at(Utc::now().timestamp_millis())
    }

    pub fn starting_at(last_message_ms: i64) -> Self {
        Self {
            last_message_ms: AtomicI64::new(last_message_ms),
        }
    }

    pub fn update(&self, emitted_at_ms: i64) {
        self.last_message_ms.store(emitted_at_ms, Ordering::Relaxed);
    }

    pub fn last_message_ms(&self) -> i64 {
        self.last_message_ms.load(Ordering::Relaxed)
    }

    pub fn millis_since_last_message(&self) -> i64 {
        self.millis_since_last_message_at(Utc::now().timestamp_millis())
    }

    pub fn millis_since_last_message_at(&self, now_ms: i64) -> i64 {
        now_ms - self.last_message_ms()
    }

    pub fn is_stalled(&self, threshold: Duration) -> bool {
        self.is_stalled_at(threshold, Utc::now().timestamp_millis())
    }

    pub fn is_stalled_at(&self, threshold: Duration, now_ms: i64) -> bool {
        self.millis_since_last_message_at(now_ms) > threshold.as_millis() as i64
    }
}

impl Default for MessageWatermarkTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Check the tracker every `check_interval` and warn once per stall
pub fn spawn_stall_monitor(
    tracker: Arc<MessageWatermarkTracker>,
    threshold: Duration,
    check_interval: Duration,
    shutdown: ShutdownToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stalled = false;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait_for_shutdown() => break,
                _ = ticker.tick() => {}
            }
            match (tracker.is_stalled(threshold), stalled) {
                (true, false) => {
                    warn!(
                        millis_since_last_message = tracker.millis_since_last_message(),
                        ?threshold,
                        "no records received from the producer, it may be stalled"
                    );
                    stalled = true;
                }
                (false, true) => {
                    info!("producer resumed sending records");
                    stalled = false;
                }
                _ => {}
            }
        }
        shutdown.complete();
    })
}
