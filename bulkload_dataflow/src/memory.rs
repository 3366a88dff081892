//! Process-wide memory budget shared by every queue in the dataflow.
//!
//! The [`ReservationManager`] hands out bytes in bounded blocks and never blocks on its own.
//! Callers that need to wait for headroom use [`ReservationManager::reserve`], which suspends until
//! enough bytes are released. Bytes are held by a [`Reservation`] guard and returned to the
//! manager when the guard is dropped, so the manager's counter always equals the sum of the live
//! guards.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Largest number of bytes granted by a single [`ReservationManager::request_memory`] call
pub const DEFAULT_BLOCK_SIZE_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Error)]
pub enum Error {
    #[error("requested {requested} bytes exceeds the memory budget of {max_bytes} bytes")]
    ExceedsBudget { requested: u64, max_bytes: u64 },

    #[error("no memory left to reserve in a budget of {max_bytes} bytes")]
    Exhausted { max_bytes: u64 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
pub struct ReservationManager {
    max_bytes: u64,
    block_size_bytes: u64,
    /// Signed so that an over-free is observable instead of wrapping.
    current_bytes: Mutex<i64>,
    freed: Notify,
}

impl ReservationManager {
    pub fn new(max_bytes: u64) -> Arc<Self> {
        Self::with_block_size(max_bytes, DEFAULT_BLOCK_SIZE_BYTES)
    }

    pub fn with_block_size(max_bytes: u64, block_size_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            max_bytes,
            block_size_bytes: block_size_bytes.max(1),
            current_bytes: Mutex::new(0),
            freed: Notify::new(),
        })
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn block_size_bytes(&self) -> u64 {
        self.block_size_bytes
    }

    pub fn current_bytes(&self) -> i64 {
        *self.current_bytes.lock()
    }

    /// Bytes that can still be handed out
    pub fn remaining_bytes(&self) -> u64 {
        headroom(self.max_bytes, *self.current_bytes.lock())
    }

    /// Grant up to one block of memory, limited by the remaining headroom.
    ///
    /// Returns `0` when the budget is exhausted. The caller owns the granted bytes and must give
    /// them back through [`free`][Self::free].
    pub fn request_memory(&self) -> u64 {
        let mut current = self.current_bytes.lock();
        let granted = headroom(self.max_bytes, *current).min(self.block_size_bytes);
        *current += granted as i64;
        granted
    }

    /// Return bytes to the budget.
    ///
    /// Freeing more than was reserved drives the counter negative. That is logged as an
    /// accounting anomaly and otherwise tolerated.
    pub fn free(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let mut current = self.current_bytes.lock();
        *current -= bytes as i64;
        if *current < 0 {
            warn!(
                current_bytes = *current,
                freed_bytes = bytes,
                max_bytes = self.max_bytes,
                "memory freed beyond what was reserved"
            );
        }
        drop(current);
        self.freed.notify_waiters();
    }

    /// Reserve exactly `bytes` if the headroom allows it, without waiting
    pub fn try_reserve(self: &Arc<Self>, bytes: u64) -> Option<Reservation> {
        let mut current = self.current_bytes.lock();
        if headroom(self.max_bytes, *current) < bytes {
            return None;
        }
        *current += bytes as i64;
        drop(current);
        Some(Reservation {
            manager: Arc::clone(self),
            bytes,
        })
    }

    /// Reserve exactly `bytes`, suspending until enough memory has been released
    ///
    /// Fails immediately if `bytes` could never fit in the budget.
    pub async fn reserve(self: &Arc<Self>, bytes: u64) -> Result<Reservation> {
        if bytes > self.max_bytes {
            return Err(Error::ExceedsBudget {
                requested: bytes,
                max_bytes: self.max_bytes,
            });
        }
        loop {
            let notified = self.freed.notified();
            tokio::pin!(notified);
            // register interest before checking so a free in between is not missed
            notified.as_mut().enable();
            if let Some(reservation) = self.try_reserve(bytes) {
                return Ok(reservation);
            }
            notified.await;
        }
    }

    /// Claim up to `target_bytes` through repeated block requests
    ///
    /// Returns whatever could be granted, which may be less than the target. Fails only if
    /// nothing at all could be granted.
    pub fn claim(self: &Arc<Self>, target_bytes: u64) -> Result<Reservation> {
        let mut granted = 0;
        while granted < target_bytes {
            let block = self.request_memory();
            if block == 0 {
                break;
            }
            granted += block;
        }
        // the last block may overshoot the target
        if granted > target_bytes {
            self.free(granted - target_bytes);
            granted = target_bytes;
        }
        if granted == 0 {
            return Err(Error::Exhausted {
                max_bytes: self.max_bytes,
            });
        }
        if granted < target_bytes {
            warn!(
                target_bytes,
                granted_bytes = granted,
                "claimed less memory than requested"
            );
        }
        debug!(granted_bytes = granted, "claimed memory");
        Ok(Reservation {
            manager: Arc::clone(self),
            bytes: granted,
        })
    }
}

fn headroom(max_bytes: u64, current: i64) -> u64 {
    (max_bytes as i64 - current).max(0) as u64
}

/// Bytes held against a [`ReservationManager`], released on drop
#[derive(Debug)]
pub struct Reservation {
    manager: Arc<ReservationManager>,
    bytes: u64,
}

impl Reservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.manager.free(self.bytes);
    }
}

/// A value together with the memory reserved on its behalf
#[derive(Debug)]
pub struct Reserved<T> {
    value: T,
    reservation: Reservation,
}

impl<T> Reserved<T> {
    pub fn new(value: T, reservation: Reservation) -> Self {
        Self { value, reservation }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn bytes(&self) -> u64 {
        self.reservation.bytes()
    }

    /// Separate the value from its reservation, e.g. to keep the memory held while the value is
    /// consumed
    pub fn into_parts(self) -> (T, Reservation) {
        (self.value, self.reservation)
    }

    /// Release the memory and keep the value
    pub fn into_inner(self) -> T {
        self.value
    }
}
