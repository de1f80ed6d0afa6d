//! Sorting results: units, their spike trains and per-unit properties.

use std::collections::BTreeMap;

use serde_json::Value;

/// Identifier assigned to a unit by the sorter that produced it.
pub type UnitId = u32;

/// One putative neuron.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Unit {
    /// Spike times in samples, non-decreasing.
    pub spike_train: Vec<u64>,
    /// Free-form properties, e.g. `group`.
    pub properties: BTreeMap<String, Value>,
}

impl Unit {
    /// A unit with the given spike times (sorted on construction).
    pub fn new(mut spike_train: Vec<u64>) -> Self {
        spike_train.sort_unstable();
        Self {
            spike_train,
            properties: BTreeMap::new(),
        }
    }

    /// Builder-style property setter.
    pub fn with_property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }
}

/// Unit id to spike-train table produced by one sorter run.
///
/// Stages that consume a `Sorting` return a new one instead of editing it.
#[derive(Debug, Clone, PartialEq)]
pub struct Sorting {
    sample_rate: f64,
    units: BTreeMap<UnitId, Unit>,
}

impl Sorting {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            units: BTreeMap::new(),
        }
    }

    pub fn from_units<I>(sample_rate: f64, units: I) -> Self
    where
        I: IntoIterator<Item = (UnitId, Unit)>,
    {
        Self {
            sample_rate,
            units: units
                .into_iter()
                .map(|(id, mut unit)| {
                    unit.spike_train.sort_unstable();
                    (id, unit)
                })
                .collect(),
        }
    }

    /// Insert or replace a unit. Its spike train is kept sorted.
    pub fn insert(&mut self, id: UnitId, mut unit: Unit) {
        unit.spike_train.sort_unstable();
        self.units.insert(id, unit);
    }

    #[inline]
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn unit_ids(&self) -> Vec<UnitId> {
        self.units.keys().copied().collect()
    }

    #[inline]
    pub fn num_units(&self) -> usize {
        self.units.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    #[inline]
    pub fn contains(&self, id: UnitId) -> bool {
        self.units.contains_key(&id)
    }

    #[inline]
    pub fn unit(&self, id: UnitId) -> Option<&Unit> {
        self.units.get(&id)
    }

    pub fn spike_train(&self, id: UnitId) -> Option<&[u64]> {
        self.units.get(&id).map(|u| u.spike_train.as_slice())
    }

    pub fn property(&self, id: UnitId, key: &str) -> Option<&Value> {
        self.units.get(&id).and_then(|u| u.properties.get(key))
    }

    /// Units in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (UnitId, &Unit)> + '_ {
        self.units.iter().map(|(&id, u)| (id, u))
    }

    pub fn total_spikes(&self) -> usize {
        self.units.values().map(|u| u.spike_train.len()).sum()
    }

    /// First unit whose last spike lies at or beyond `num_samples`, with that
    /// spike.
    pub fn first_out_of_bounds(&self, num_samples: usize) -> Option<(UnitId, u64)> {
        self.units.iter().find_map(|(&id, u)| {
            u.spike_train
                .last()
                .filter(|&&last| last >= num_samples as u64)
                .map(|&last| (id, last))
        })
    }

    /// New sorting holding only the units accepted by `keep`.
    pub fn select<F>(&self, mut keep: F) -> Sorting
    where
        F: FnMut(UnitId, &Unit) -> bool,
    {
        Sorting {
            sample_rate: self.sample_rate,
            units: self
                .units
                .iter()
                .filter(|&(&id, u)| keep(id, u))
                .map(|(&id, u)| (id, u.clone()))
                .collect(),
        }
    }

    /// Resolve a unit's channel group from the first candidate property key
    /// that holds a non-negative integer.
    pub fn resolve_group(&self, id: UnitId, candidates: &[String]) -> Option<u32> {
        let unit = self.units.get(&id)?;
        candidates.iter().find_map(|key| {
            let value = unit.properties.get(key)?;
            value
                .as_u64()
                .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
                .and_then(|g| u32::try_from(g).ok())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Sorting {
        Sorting::from_units(
            1000.0,
            [
                (5, Unit::new(vec![30, 10, 20]).with_property("group", 2)),
                (9, Unit::new(vec![1]).with_property("ch_group", "4")),
            ],
        )
    }

    #[test]
    fn test_spike_trains_are_sorted() {
        let sorting = sample();
        assert_eq!(sorting.spike_train(5), Some(&[10u64, 20, 30][..]));
    }

    #[test]
    fn test_select_returns_new_sorting() {
        let sorting = sample();
        let kept = sorting.select(|id, _| id == 9);

        assert_eq!(kept.unit_ids(), vec![9]);
        assert_eq!(sorting.num_units(), 2);
    }

    #[test]
    fn test_first_out_of_bounds() {
        let sorting = sample();
        assert_eq!(sorting.first_out_of_bounds(31), None);
        assert_eq!(sorting.first_out_of_bounds(30), Some((5, 30)));
        assert_eq!(sorting.first_out_of_bounds(1), Some((5, 30)));
    }

    #[test]
    fn test_resolve_group_uses_first_matching_key() {
        let sorting = sample();
        let keys = vec!["group".to_string(), "ch_group".to_string()];

        assert_eq!(sorting.resolve_group(5, &keys), Some(2));
        assert_eq!(sorting.resolve_group(9, &keys), Some(4));
        assert_eq!(sorting.resolve_group(9, &keys[..1]), None);
        assert_eq!(sorting.resolve_group(77, &keys), None);
    }
}
