use std::collections::BTreeMap;

use bulkload_id::CheckpointOrdinal;
use parking_lot::Mutex;

use super::{Error, Result, StateKey};
use crate::message::CheckpointMessage;

/// A checkpoint waiting to be acknowledged
#[derive(Debug, Clone)]
pub struct PendingCheckpoint {
    pub key: StateKey,
    pub message: CheckpointMessage,
}

/// Checkpoints not yet acknowledged, ordered by ordinal
///
/// Entries leave only from the front: no ordinal is removed while a smaller one is still pending.
#[derive(Debug, Default)]
pub struct StateStore {
    pending: Mutex<BTreeMap<CheckpointOrdinal, PendingCheckpoint>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&self, key: StateKey, message: CheckpointMessage) -> Result<()> {
        let ordinal = key.ordinal();
        let mut pending = self.pending.lock();
        if pending.contains_key(&ordinal) {
            return Err(Error::DuplicateOrdinal(ordinal));
        }
        pending.insert(ordinal, PendingCheckpoint { key, message });
        Ok(())
    }

    /// Remove `ordinal`, which must be the smallest pending ordinal
    pub fn remove(&self, ordinal: CheckpointOrdinal) -> Result<PendingCheckpoint> {
        let mut pending = self.pending.lock();
        let smallest = *pending.keys().next().ok_or(Error::NotPending(ordinal))?;
        if smallest != ordinal {
            return Err(if pending.contains_key(&ordinal) {
                Error::OutOfOrderRemoval { ordinal, smallest }
            } else {
                Error::NotPending(ordinal)
            });
        }
        pending.remove(&ordinal).ok_or(Error::NotPending(ordinal))
    }

    /// The key of the smallest pending ordinal
    pub fn peek_smallest(&self) -> Option<StateKey> {
        self.pending
            .lock()
            .first_key_value()
            .map(|(_, checkpoint)| checkpoint.key.clone())
    }

    /// Pop the smallest pending checkpoint if `is_complete` holds for its key
    ///
    /// The check and the removal happen under one lock, so a concurrent `accept` cannot slip in
    /// between.
    pub fn pop_smallest_if(
        &self,
        is_complete: impl FnOnce(&StateKey) -> bool,
    ) -> Option<PendingCheckpoint> {
        let mut pending = self.pending.lock();
        let entry = pending.first_entry()?;
        if is_complete(&entry.get().key) {
            Some(entry.remove())
        } else {
            None
        }
    }

    pub fn pending_ordinals(&self) -> Vec<CheckpointOrdinal> {
        self.pending.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ord(n: u64) -> CheckpointOrdinal {
        CheckpointOrdinal::new(n)
    }

    fn checkpoint(ordinal: u64) -> (StateKey, CheckpointMessage) {
        let ordinal = ord(ordinal);
        (
            StateKey::new(ordinal, [ordinal.into()]),
            CheckpointMessage::global(1),
        )
    }

    #[test]
    fn ordered_by_ordinal_regardless_of_insert_order() {
        let store = StateStore::new();
        for ordinal in [3, 1, 2] {
            let (key, message) = checkpoint(ordinal);
            store.accept(key, message).unwrap();
        }
        assert_eq!(
            store.pending_ordinals(),
            vec![ord(1), ord(2), ord(3)]
        );
        assert_eq!(
            store.peek_smallest().unwrap().ordinal(),
            ord(1)
        );
    }

    #[test]
    fn duplicate_ordinal_is_rejected() {
        let store = StateStore::new();
        let (key, message) = checkpoint(1);
        store.accept(key.clone(), message.clone()).unwrap();
        assert!(matches!(
            store.accept(key, message),
            Err(Error::DuplicateOrdinal(o)) if o == ord(1)
        ));
    }

    #[test]
    fn removal_only_from_the_front() {
        let store = StateStore::new();
        for ordinal in [1, 2] {
            let (key, message) = checkpoint(ordinal);
            store.accept(key, message).unwrap();
        }
        assert!(matches!(
            store.remove(ord(2)),
            Err(Error::OutOfOrderRemoval { ordinal, smallest })
                if ordinal == ord(2) && smallest == ord(1)
        ));
        assert!(matches!(store.remove(ord(7)), Err(Error::NotPending(_))));

        assert_eq!(store.remove(ord(1)).unwrap().key.ordinal(), ord(1));
        assert_eq!(store.remove(ord(2)).unwrap().key.ordinal(), ord(2));
        assert!(store.is_empty());
        assert!(matches!(store.remove(ord(2)), Err(Error::NotPending(_))));
    }

    #[test]
    fn pop_smallest_if_complete() {
        let store = StateStore::new();
        for ordinal in [1, 2] {
            let (key, message) = checkpoint(ordinal);
            store.accept(key, message).unwrap();
        }
        // ordinal 2 being complete does not matter while ordinal 1 is not
        assert!(store.pop_smallest_if(|k| k.ordinal() == ord(2)).is_none());
        assert_eq!(store.len(), 2);

        let popped = store.pop_smallest_if(|_| true).unwrap();
        assert_eq!(popped.key.ordinal(), ord(1));
        assert_eq!(store.len(), 1);
    }
}
