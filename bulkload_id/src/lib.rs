//! Identifier types shared by the bulk-load dataflow crates.
//!
//! Checkpoints are identified twice: by a [`CheckpointOrdinal`], the arrival sequence number that
//! fixes acknowledgment order, and by the [`PartitionKey`]s their records were routed under.

use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Arrival sequence number of a checkpoint. Acknowledgments are emitted in ascending ordinal
/// order.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
pub struct CheckpointOrdinal(u64);

impl CheckpointOrdinal {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for CheckpointOrdinal {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Display for CheckpointOrdinal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out [`CheckpointOrdinal`]s in increasing order, starting at 1.
///
/// This is owned by whoever assigns ordinals rather than being a process global, so two
/// pipelines in the same process never share a sequence.
#[derive(Debug)]
pub struct OrdinalSequence {
    next: AtomicU64,
}

impl OrdinalSequence {
    pub fn new() -> Self {
        Self::starting_at(CheckpointOrdinal::new(1))
    }

    pub fn starting_at(first: CheckpointOrdinal) -> Self {
        Self {
            next: AtomicU64::new(first.as_u64()),
        }
    }

    /// The ordinal the next call to [`advance`][Self::advance] will return
    pub fn current(&self) -> CheckpointOrdinal {
        CheckpointOrdinal(self.next.load(Ordering::SeqCst))
    }

    /// Take the current ordinal and move the sequence forward
    pub fn advance(&self) -> CheckpointOrdinal {
        CheckpointOrdinal(
            self.next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_add(1))
                .expect("Overflowed checkpoint ordinals"),
        )
    }
}

impl Default for OrdinalSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque checkpoint identifier carried by self-describing transports on every record.
#[derive(Debug, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
pub struct CheckpointId(Arc<str>);

impl CheckpointId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CheckpointId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for CheckpointId {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

impl Display for CheckpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies the group of records that share a checkpoint. Every record carrying the same key
/// is routed to the same pipeline lane.
#[derive(Debug, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
pub struct PartitionKey(Arc<str>);

impl PartitionKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The lane in `0..num_lanes` this key is routed to. Stable across runs and processes.
    ///
    /// # Panics
    /// Panics if `num_lanes` is zero.
    pub fn lane(&self, num_lanes: usize) -> usize {
        assert!(num_lanes > 0, "cannot route to zero lanes");
        (twox_hash::XxHash64::oneshot(0, self.0.as_bytes()) % num_lanes as u64) as usize
    }
}

impl From<&CheckpointId> for PartitionKey {
    fn from(value: &CheckpointId) -> Self {
        Self(Arc::clone(&value.0))
    }
}

impl From<CheckpointOrdinal> for PartitionKey {
    fn from(value: CheckpointOrdinal) -> Self {
        Self(value.to_string().into())
    }
}

impl From<&str> for PartitionKey {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Namespace and name of a configured destination stream
#[derive(Debug, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
pub struct StreamDescriptor {
    namespace: Option<Arc<str>>,
    name: Arc<str>,
}

impl StreamDescriptor {
    pub fn new(namespace: Option<&str>, name: impl Into<Arc<str>>) -> Self {
        Self {
            namespace: namespace.map(Into::into),
            name: name.into(),
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Display for StreamDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}.{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinal_sequence_starts_at_one() {
        let seq = OrdinalSequence::new();
        assert_eq!(seq.current(), CheckpointOrdinal::new(1));
        assert_eq!(seq.advance(), CheckpointOrdinal::new(1));
        assert_eq!(seq.advance(), CheckpointOrdinal::new(2));
        assert_eq!(seq.current(), CheckpointOrdinal::new(3));
    }

    #[test]
    fn partition_lane_is_stable_and_bounded() {
        let key = PartitionKey::from(&CheckpointId::from("checkpoint-17"));
        let lane = key.lane(8);
        assert!(lane < 8);
        for _ in 0..10 {
            assert_eq!(lane, key.clone().lane(8));
        }
        assert_eq!(key.lane(1), 0);
    }

    #[test]
    fn partition_key_from_ordinal() {
        let key = PartitionKey::from(CheckpointOrdinal::new(42));
        assert_eq!(key.as_str(), "42");
    }

    #[test]
    fn stream_descriptor_display() {
        assert_eq!(
            StreamDescriptor::new(Some("public"), "users").to_string(),
            "public.users"
        );
        assert_eq!(StreamDescriptor::new(None, "users").to_string(), "users");
    }

    #[test]
    fn ids_round_trip_through_json() {
        let id = CheckpointId::from("abc");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"abc\"");
        let ordinal: CheckpointOrdinal = serde_json::from_str("7").unwrap();
        assert_eq!(ordinal, CheckpointOrdinal::new(7));
    }
}
