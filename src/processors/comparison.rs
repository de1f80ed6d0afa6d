//! Cross-sorter comparison: pairwise unit matching and multi-sorter
//! agreement.

use std::collections::{BTreeMap, BTreeSet};

use log::info;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::clustering::AtomicUnionFind;
use crate::core::sorting::{Sorting, Unit, UnitId};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComparisonParams {
    /// Spikes closer than this are the same event.
    pub delta_ms: f64,
    /// Minimum agreement score for a mapping.
    pub match_score: f64,
}

impl Default for ComparisonParams {
    fn default() -> Self {
        Self {
            delta_ms: 0.4,
            match_score: 0.5,
        }
    }
}

impl ComparisonParams {
    #[inline]
    pub fn delta_samples(&self, sample_rate: f64) -> u64 {
        (self.delta_ms * sample_rate / 1000.0).round() as u64
    }
}

/// Number of one-to-one spike matches within `delta` samples.
///
/// Both trains must be sorted.
pub fn count_matches(a: &[u64], b: &[u64], delta: u64) -> usize {
    let (mut i, mut j, mut count) = (0, 0, 0);
    while i < a.len() && j < b.len() {
        if a[i].abs_diff(b[j]) <= delta {
            count += 1;
            i += 1;
            j += 1;
        } else if a[i] < b[j] {
            i += 1;
        } else {
            j += 1;
        }
    }
    count
}

/// `matches / (n_a + n_b - matches)`.
#[inline]
pub fn agreement_score(matches: usize, n_a: usize, n_b: usize) -> f64 {
    let union = n_a + n_b - matches;
    if union == 0 {
        0.0
    } else {
        matches as f64 / union as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitMatch {
    pub unit_a: UnitId,
    pub unit_b: UnitId,
    pub matches: usize,
    pub score: f64,
}

/// Result of comparing sorting A against sorting B.
#[derive(Debug, Clone, PartialEq)]
pub struct PairComparison {
    /// A unit id to its matched B unit.
    pub mapping: BTreeMap<UnitId, UnitMatch>,
    pub unmapped_a: Vec<UnitId>,
    pub unmapped_b: Vec<UnitId>,
}

impl PairComparison {
    #[inline]
    pub fn best_match(&self, unit_a: UnitId) -> Option<UnitId> {
        self.mapping.get(&unit_a).map(|m| m.unit_b)
    }
}

/// Map every unit of `a` to the unit of `b` sharing the most spikes.
///
/// Ties go to the lowest B id. A mapping needs at least one shared spike
/// and an agreement score of at least `params.match_score`.
pub fn compare_two(a: &Sorting, b: &Sorting, params: &ComparisonParams) -> PairComparison {
    let delta = params.delta_samples(a.sample_rate());

    let best: Vec<(UnitId, Option<UnitMatch>)> = a
        .unit_ids()
        .into_par_iter()
        .map(|id_a| {
            let train_a = a.spike_train(id_a).unwrap_or_default();
            let mut best: Option<(UnitId, usize)> = None;
            // Ascending B ids; strict comparison keeps the lowest on ties
            for (id_b, unit_b) in b.iter() {
                let matches = count_matches(train_a, &unit_b.spike_train, delta);
                if best.map_or(true, |(_, m)| matches > m) {
                    best = Some((id_b, matches));
                }
            }

            let mapped = best.and_then(|(id_b, matches)| {
                let n_b = b.spike_train(id_b).map_or(0, <[u64]>::len);
                let score = agreement_score(matches, train_a.len(), n_b);
                (matches > 0 && score >= params.match_score).then_some(UnitMatch {
                    unit_a: id_a,
                    unit_b: id_b,
                    matches,
                    score,
                })
            });
            (id_a, mapped)
        })
        .collect();

    let mut mapping = BTreeMap::new();
    let mut unmapped_a = Vec::new();
    for (id, m) in best {
        match m {
            Some(m) => {
                mapping.insert(id, m);
            }
            None => unmapped_a.push(id),
        }
    }

    let targeted: BTreeSet<UnitId> = mapping.values().map(|m| m.unit_b).collect();
    let unmapped_b = b
        .unit_ids()
        .into_iter()
        .filter(|id| !targeted.contains(id))
        .collect();

    PairComparison {
        mapping,
        unmapped_a,
        unmapped_b,
    }
}

/// A unit found by several sorters.
#[derive(Debug, Clone, PartialEq)]
pub struct AgreementUnit {
    /// `(sorting name, unit id)` for every matched unit.
    pub members: Vec<(String, UnitId)>,
    /// Distinct sortings among the members.
    pub num_sortings: usize,
    /// Spike train and properties of the first member.
    pub representative: Unit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgreementResult {
    pub sorting_names: Vec<String>,
    pub units: Vec<AgreementUnit>,
    pub sample_rate: f64,
}

impl AgreementResult {
    /// Agreement units as a sorting with ids `0..n`, each carrying its
    /// `agreement_number`.
    pub fn agreement_sorting(&self) -> Sorting {
        Sorting::from_units(
            self.sample_rate,
            self.units.iter().enumerate().map(|(i, u)| {
                let unit = u
                    .representative
                    .clone()
                    .with_property("agreement_number", u.num_sortings as u64);
                (i as UnitId, unit)
            }),
        )
    }
}

/// Units that several sortings agree on.
///
/// Mutual best matches between every pair of sortings become edges; each
/// connected component spanning at least `minimum_matching` sortings is an
/// agreement unit.
pub fn compare_multiple(
    sortings: &[(String, Sorting)],
    minimum_matching: usize,
    params: &ComparisonParams,
) -> AgreementResult {
    // Node index for every (sorting, unit)
    let mut nodes: Vec<(usize, UnitId)> = Vec::new();
    let mut index: BTreeMap<(usize, UnitId), usize> = BTreeMap::new();
    for (s, (_, sorting)) in sortings.iter().enumerate() {
        for id in sorting.unit_ids() {
            index.insert((s, id), nodes.len());
            nodes.push((s, id));
        }
    }

    let pairs: Vec<(usize, usize)> = (0..sortings.len())
        .flat_map(|i| (i + 1..sortings.len()).map(move |j| (i, j)))
        .collect();

    let uf = AtomicUnionFind::new(nodes.len());
    pairs.par_iter().for_each(|&(i, j)| {
        let forward = compare_two(&sortings[i].1, &sortings[j].1, params);
        let backward = compare_two(&sortings[j].1, &sortings[i].1, params);
        for (&unit_a, m) in &forward.mapping {
            if backward.best_match(m.unit_b) == Some(unit_a) {
                uf.union(index[&(i, unit_a)], index[&(j, m.unit_b)]);
            }
        }
    });

    let mut components: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for n in 0..nodes.len() {
        components.entry(uf.find(n)).or_default().push(n);
    }

    let mut units: Vec<AgreementUnit> = components
        .into_values()
        .filter_map(|members| {
            let distinct: BTreeSet<usize> = members.iter().map(|&n| nodes[n].0).collect();
            if distinct.len() < minimum_matching {
                return None;
            }
            let (s0, id0) = nodes[members[0]];
            let representative = sortings[s0].1.unit(id0).cloned().unwrap_or_default();
            Some(AgreementUnit {
                members: members
                    .iter()
                    .map(|&n| (sortings[nodes[n].0].0.clone(), nodes[n].1))
                    .collect(),
                num_sortings: distinct.len(),
                representative,
            })
        })
        .collect();

    // Components listed by their first member
    units.sort_by_key(|u| {
        u.members
            .first()
            .and_then(|(name, id)| {
                sortings
                    .iter()
                    .position(|(n, _)| n == name)
                    .map(|s| (s, *id))
            })
    });

    info!(
        "Agreement over {} sortings: {} units matched by at least {}",
        sortings.len(),
        units.len(),
        minimum_matching
    );

    AgreementResult {
        sorting_names: sortings.iter().map(|(n, _)| n.clone()).collect(),
        units,
        sample_rate: sortings.first().map_or(0.0, |(_, s)| s.sample_rate()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorting(units: &[(UnitId, Vec<u64>)]) -> Sorting {
        Sorting::from_units(
            10_000.0,
            units.iter().map(|(id, train)| (*id, Unit::new(train.clone()))),
        )
    }

    #[test]
    fn test_count_matches_within_delta() {
        assert_eq!(count_matches(&[10, 20, 30], &[12, 25, 31], 2), 2);
        assert_eq!(count_matches(&[10, 11], &[10], 4), 1);
        assert_eq!(count_matches(&[], &[1], 4), 0);
    }

    #[test]
    fn test_compare_two_maps_and_reports_unmapped() {
        let a = sorting(&[(1, vec![100, 200, 300, 400]), (2, vec![5_000, 6_000])]);
        let b = sorting(&[(10, vec![101, 199, 302, 400]), (20, vec![9_000])]);

        let cmp = compare_two(&a, &b, &ComparisonParams::default());

        assert_eq!(cmp.best_match(1), Some(10));
        assert_eq!(cmp.mapping[&1].matches, 4);
        assert_eq!(cmp.mapping[&1].score, 1.0);
        assert_eq!(cmp.unmapped_a, vec![2]);
        assert_eq!(cmp.unmapped_b, vec![20]);
    }

    #[test]
    fn test_compare_two_tie_goes_to_lowest_b_id() {
        let a = sorting(&[(1, vec![100, 200])]);
        let b = sorting(&[(7, vec![100, 200]), (3, vec![100, 200])]);

        let cmp = compare_two(&a, &b, &ComparisonParams::default());

        assert_eq!(cmp.best_match(1), Some(3));
        assert_eq!(cmp.unmapped_b, vec![7]);
    }

    #[test]
    fn test_compare_two_score_threshold() {
        // 1 match of 1 + 4 spikes: score 0.25
        let a = sorting(&[(1, vec![100])]);
        let b = sorting(&[(2, vec![100, 1_000, 2_000, 3_000])]);

        let cmp = compare_two(&a, &b, &ComparisonParams::default());
        assert!(cmp.mapping.is_empty());
        assert_eq!(cmp.unmapped_a, vec![1]);

        let lenient = ComparisonParams {
            match_score: 0.2,
            ..ComparisonParams::default()
        };
        assert_eq!(compare_two(&a, &b, &lenient).best_match(1), Some(2));
    }

    #[test]
    fn test_compare_multiple_agreement() {
        let shared = vec![100, 500, 900, 1_300];
        let sortings = vec![
            (
                "klusta".to_string(),
                sorting(&[(0, shared.clone()), (1, vec![7_000, 8_000])]),
            ),
            (
                "dbscan".to_string(),
                sorting(&[(5, vec![101, 499, 900, 1_301])]),
            ),
            (
                "mountainsort4".to_string(),
                sorting(&[(2, vec![20_000]), (3, shared.clone())]),
            ),
        ];

        let result = compare_multiple(&sortings, 2, &ComparisonParams::default());

        assert_eq!(result.units.len(), 1);
        let unit = &result.units[0];
        assert_eq!(unit.num_sortings, 3);
        assert_eq!(
            unit.members,
            vec![
                ("klusta".to_string(), 0),
                ("dbscan".to_string(), 5),
                ("mountainsort4".to_string(), 3)
            ]
        );

        let agreement = result.agreement_sorting();
        assert_eq!(agreement.unit_ids(), vec![0]);
        assert_eq!(agreement.spike_train(0), Some(shared.as_slice()));
        assert_eq!(
            agreement.property(0, "agreement_number").and_then(|v| v.as_u64()),
            Some(3)
        );

        // Requiring all four sortings leaves nothing
        assert!(compare_multiple(&sortings, 4, &ComparisonParams::default())
            .units
            .is_empty());
    }
}
