//! Caller-owned keyed accumulator for per-step measurements.
//!
//! Create one per test step, feed it samples keyed by whatever the step
//! measures (a P-state, a guest, a device), and read sums and means back.
//! Nothing is shared between accumulators.

use std::collections::BTreeMap;

use serde::Serialize;

/// Running totals for one key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Tally {
    pub sum: f64,
    pub count: u64,
    pub min: f64,
    pub max: f64,
}

impl Tally {
    fn new(value: f64) -> Self {
        Self {
            sum: value,
            count: 1,
            min: value,
            max: value,
        }
    }

    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn merge(&mut self, other: &Tally) {
        self.sum += other.sum;
        self.count += other.count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn mean(&self) -> f64 {
        self.sum / self.count as f64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyedAccumulator<K: Ord> {
    tallies: BTreeMap<K, Tally>,
}

impl<K: Ord> Default for KeyedAccumulator<K> {
    fn default() -> Self {
        Self {
            tallies: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone> KeyedAccumulator<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: K, value: f64) {
        self.tallies
            .entry(key)
            .and_modify(|t| t.add(value))
            .or_insert_with(|| Tally::new(value));
    }

    pub fn get(&self, key: &K) -> Option<&Tally> {
        self.tallies.get(key)
    }

    pub fn sum(&self, key: &K) -> f64 {
        self.get(key).map(|t| t.sum).unwrap_or(0.0)
    }

    /// `None` for keys that never received a sample.
    pub fn mean(&self, key: &K) -> Option<f64> {
        self.get(key).map(Tally::mean)
    }

    /// Keys in ascending order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.tallies.keys()
    }

    pub fn len(&self) -> usize {
        self.tallies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tallies.is_empty()
    }

    /// Fold another accumulator's samples into this one.
    pub fn merge(&mut self, other: &KeyedAccumulator<K>) {
        for (key, tally) in &other.tallies {
            match self.tallies.get_mut(key) {
                Some(existing) => existing.merge(tally),
                None => {
                    self.tallies.insert(key.clone(), *tally);
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.tallies.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_and_mean_per_key() {
        let mut acc = KeyedAccumulator::new();
        acc.add("P0", 10.0);
        acc.add("P0", 20.0);
        acc.add("P1", 5.0);

        assert_eq!(acc.sum(&"P0"), 30.0);
        assert_eq!(acc.mean(&"P0"), Some(15.0));
        assert_eq!(acc.get(&"P0").unwrap().count, 2);
        assert_eq!(acc.get(&"P1").unwrap().max, 5.0);
        assert_eq!(acc.mean(&"P2"), None);
        assert_eq!(acc.sum(&"P2"), 0.0);
        assert_eq!(acc.keys().copied().collect::<Vec<_>>(), vec!["P0", "P1"]);
    }

    #[test]
    fn test_accumulators_are_independent() {
        let mut a = KeyedAccumulator::new();
        let mut b = KeyedAccumulator::new();
        a.add(1u32, 1.0);
        b.add(1u32, 3.0);
        b.add(2u32, 4.0);
        assert_eq!(a.sum(&1), 1.0);

        a.merge(&b);
        let tally = a.get(&1).unwrap();
        assert_eq!(tally.count, 2);
        assert_eq!(tally.min, 1.0);
        assert_eq!(tally.max, 3.0);
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 2);

        a.reset();
        assert!(a.is_empty());
    }
}
