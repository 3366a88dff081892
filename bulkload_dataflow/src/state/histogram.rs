use std::hash::Hash;

use bulkload_id::PartitionKey;
use hashbrown::HashMap;

/// Non-negative counts per key
///
/// [`merge`][Self::merge] is key-wise addition, so merging is commutative and associative and
/// histograms built on different workers can be combined in any order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Histogram<K: Eq + Hash> {
    counts: HashMap<K, u64>,
}

/// Flushed record counts per partition key
pub type PartitionHistogram = Histogram<PartitionKey>;

impl<K: Eq + Hash> Histogram<K> {
    pub fn new() -> Self {
        Self {
            counts: HashMap::new(),
        }
    }

    pub fn increment(&mut self, key: K) {
        self.add(key, 1);
    }

    pub fn add(&mut self, key: K, count: u64) {
        *self.counts.entry(key).or_default() += count;
    }

    /// The count for `key`, zero if it was never seen
    pub fn get(&self, key: &K) -> u64 {
        self.counts.get(key).copied().unwrap_or_default()
    }

    pub fn remove(&mut self, key: &K) -> Option<u64> {
        self.counts.remove(key)
    }

    pub fn merge(&mut self, other: Self) {
        for (key, count) in other.counts {
            self.add(key, count);
        }
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

impl<K: Eq + Hash> Default for Histogram<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash> IntoIterator for Histogram<K> {
    type Item = (K, u64);
    type IntoIter = hashbrown::hash_map::IntoIter<K, u64>;

    fn into_iter(self) -> Self::IntoIter {
        self.counts.into_iter()
    }
}

impl<K: Eq + Hash> FromIterator<(K, u64)> for Histogram<K> {
    fn from_iter<T: IntoIterator<Item = (K, u64)>>(iter: T) -> Self {
        let mut histogram = Self::new();
        for (key, count) in iter {
            histogram.add(key, count);
        }
        histogram
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn merged(mut a: Histogram<u8>, b: Histogram<u8>) -> Histogram<u8> {
        a.merge(b);
        a
    }

    fn arb_histogram() -> impl Strategy<Value = Histogram<u8>> {
        prop::collection::vec((0u8..8, 0u64..1_000), 0..16)
            .prop_map(|pairs| pairs.into_iter().collect::<Histogram<u8>>())
    }

    proptest! {
        #[test]
        fn merge_is_commutative(a in arb_histogram(), b in arb_histogram()) {
            prop_assert_eq!(merged(a.clone(), b.clone()), merged(b, a));
        }

        #[test]
        fn merge_is_associative(
            a in arb_histogram(),
            b in arb_histogram(),
            c in arb_histogram(),
        ) {
            prop_assert_eq!(
                merged(merged(a.clone(), b.clone()), c.clone()),
                merged(a, merged(b, c))
            );
        }

        #[test]
        fn merge_preserves_total(a in arb_histogram(), b in arb_histogram()) {
            let expected = a.total() + b.total();
            prop_assert_eq!(merged(a, b).total(), expected);
        }
    }

    #[test]
    fn counts_per_partition() {
        let mut histogram = PartitionHistogram::new();
        histogram.increment("a".into());
        histogram.increment("a".into());
        histogram.add("b".into(), 5);
        assert_eq!(histogram.get(&"a".into()), 2);
        assert_eq!(histogram.get(&"b".into()), 5);
        assert_eq!(histogram.get(&"c".into()), 0);
        assert_eq!(histogram.total(), 7);

        assert_eq!(histogram.remove(&"a".into()), Some(2));
        assert_eq!(histogram.len(), 1);
    }
}
