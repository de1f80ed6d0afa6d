//! In-process spike sorter: threshold detection plus parallel DBSCAN.
//!
//! Each channel group is sorted independently:
//! - noise is estimated per channel from the median absolute deviation
//! - spikes are detected where the strongest channel crosses
//!   `detect_threshold` noise units at a local peak
//! - each detection is described by its normalised amplitude on up to
//!   [`FEATURE_DIMS`] channels of the group
//! - features are clustered with DBSCAN (`kiddo` KD-tree, `rayon`, atomic
//!   union-find); every cluster becomes a unit, noise points are dropped

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use kiddo::{ImmutableKdTree, SquaredEuclidean};
use log::{debug, info};
use rayon::prelude::*;
use serde_json::json;

use super::sorters::{to_params, AdapterError, ParamMap, SortJob, SorterAdapter, SorterProfile};
use crate::core::sorting::{Sorting, Unit, UnitId};
use crate::core::transforms::noise_level;

/// Feature vector width; groups with more channels use their first four.
pub const FEATURE_DIMS: usize = 4;

const KNOWN_PARAMS: [&str; 6] = [
    "detect_threshold",
    "detect_sign",
    "dead_time_ms",
    "eps",
    "min_samples",
    "noise_duration_s",
];

/// Atomic Union-Find data structure for lock-free parallel merging.
///
/// Uses path compression with atomic compare-and-swap operations to safely
/// merge sets from multiple threads without locks.
pub struct AtomicUnionFind {
    parent: Vec<AtomicUsize>,
}

impl AtomicUnionFind {
    /// Create a new union-find structure where each element is its own parent.
    #[inline]
    pub fn new(size: usize) -> Self {
        let parent = (0..size).map(AtomicUsize::new).collect();
        Self { parent }
    }

    /// Find the root of the set containing `x` with path compression.
    ///
    /// Relaxed ordering is enough: concurrent finds always converge to the
    /// same root.
    #[inline]
    pub fn find(&self, mut x: usize) -> usize {
        loop {
            let p = self.parent[x].load(Ordering::Relaxed);
            if p == x {
                return x;
            }
            let gp = self.parent[p].load(Ordering::Relaxed);
            if gp != p {
                // Losing this race is harmless
                let _ = self.parent[x].compare_exchange_weak(
                    p,
                    gp,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                );
            }
            x = p;
        }
    }

    /// Union the sets containing `x` and `y`.
    ///
    /// Returns true if a merge actually occurred, false if they were already
    /// in the same set.
    #[inline]
    pub fn union(&self, x: usize, y: usize) -> bool {
        loop {
            let root_x = self.find(x);
            let root_y = self.find(y);

            if root_x == root_y {
                return false;
            }

            // Smaller root points to the larger one
            let (small, large) = if root_x < root_y {
                (root_x, root_y)
            } else {
                (root_y, root_x)
            };

            match self.parent[small].compare_exchange_weak(
                small,
                large,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(_) => continue,
            }
        }
    }
}

/// DBSCAN over fixed-width feature vectors.
///
/// A core point has at least `min_samples` neighbours within `eps`
/// (itself included). Core points that are neighbours share a cluster;
/// border points join the cluster of their first core neighbour.
///
/// # Algorithm (Parallelized)
///
/// 1. **Build KD-tree**: O(n log n) construction using kiddo
/// 2. **Parallel neighbour finding**: rayon queries within `eps`
/// 3. **Lock-free cluster formation**: atomic union-find over core pairs
/// 4. **Label assignment**: cluster ids follow the first core point of each
///    cluster, so labels are deterministic regardless of thread scheduling
///
/// # Returns
///
/// Vector of cluster labels (-1 for noise points).
pub fn dbscan(features: &[[f32; FEATURE_DIMS]], eps: f32, min_samples: usize) -> Vec<i32> {
    let n = features.len();
    if n == 0 {
        return Vec::new();
    }

    // Every point is its own cluster
    if min_samples <= 1 {
        return (0..n as i32).collect();
    }

    let tree: ImmutableKdTree<f32, FEATURE_DIMS> = ImmutableKdTree::new_from_slice(features);
    let eps_sq = eps * eps;

    let neighbors: Vec<Vec<usize>> = features
        .par_iter()
        .map(|point| {
            tree.within::<SquaredEuclidean>(point, eps_sq)
                .iter()
                .map(|nn| nn.item as usize)
                .collect()
        })
        .collect();

    let is_core: Vec<bool> = neighbors
        .par_iter()
        .map(|neigh| neigh.len() >= min_samples)
        .collect();

    let uf = AtomicUnionFind::new(n);
    (0..n).into_par_iter().for_each(|i| {
        if is_core[i] {
            for &j in &neighbors[i] {
                if is_core[j] {
                    uf.union(i, j);
                }
            }
        }
    });

    let mut root_to_cluster: HashMap<usize, i32> = HashMap::new();
    let mut next_cluster_id: i32 = 0;
    for i in 0..n {
        if is_core[i] {
            root_to_cluster.entry(uf.find(i)).or_insert_with(|| {
                let id = next_cluster_id;
                next_cluster_id += 1;
                id
            });
        }
    }

    let mut labels = vec![-1i32; n];
    for i in 0..n {
        if is_core[i] {
            labels[i] = root_to_cluster[&uf.find(i)];
        } else if let Some(&j) = neighbors[i].iter().find(|&&j| is_core[j]) {
            labels[i] = root_to_cluster[&uf.find(j)];
        }
    }

    labels
}

/// Polarity of detected peaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectSign {
    Negative,
    Positive,
    Both,
}

impl DetectSign {
    /// `-1`, `1` or `0`, as sorters conventionally spell it.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -1 => Some(DetectSign::Negative),
            1 => Some(DetectSign::Positive),
            0 => Some(DetectSign::Both),
            _ => None,
        }
    }

    #[inline]
    fn apply(self, value: f32) -> f32 {
        match self {
            DetectSign::Negative => -value,
            DetectSign::Positive => value,
            DetectSign::Both => value.abs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    /// Threshold in noise units.
    pub threshold: f32,
    pub sign: DetectSign,
    /// Minimum distance between two detections in the same group.
    pub dead_samples: usize,
}

/// One detected event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub sample: usize,
    pub features: [f32; FEATURE_DIMS],
}

/// Detect peaks across the channels of one group.
///
/// `traces[i]` and `noise[i]` belong to the same channel. Channels with zero
/// noise are ignored.
pub fn detect_spikes(traces: &[Vec<f32>], noise: &[f32], params: &DetectionParams) -> Vec<Detection> {
    let n = traces.first().map_or(0, Vec::len);
    if n < 3 {
        return Vec::new();
    }

    let normalised = |c: usize, t: usize| -> f32 {
        if noise[c] > 0.0 {
            params.sign.apply(traces[c][t]) / noise[c]
        } else {
            0.0
        }
    };

    let strongest: Vec<f32> = (0..n)
        .map(|t| {
            (0..traces.len())
                .map(|c| normalised(c, t))
                .fold(f32::NEG_INFINITY, f32::max)
        })
        .collect();

    let mut detections = Vec::new();
    let mut last: Option<usize> = None;
    for t in 1..n - 1 {
        let m = strongest[t];
        if m < params.threshold || m < strongest[t - 1] || m <= strongest[t + 1] {
            continue;
        }
        if last.is_some_and(|l| t - l < params.dead_samples) {
            continue;
        }

        let mut features = [0.0f32; FEATURE_DIMS];
        for (c, f) in features.iter_mut().enumerate().take(traces.len()) {
            *f = normalised(c, t);
        }
        detections.push(Detection { sample: t, features });
        last = Some(t);
    }

    detections
}

/// Resolved parameters of the in-process sorter.
#[derive(Debug, Clone, PartialEq)]
struct DbscanSettings {
    detection: DetectionParams,
    eps: f32,
    min_samples: usize,
    noise_samples: usize,
}

impl DbscanSettings {
    fn from_profile(profile: &SorterProfile, sample_rate: f64) -> Result<Self, AdapterError> {
        if let Some(unknown) = profile
            .params
            .keys()
            .find(|k| !KNOWN_PARAMS.contains(&k.as_str()))
        {
            return Err(AdapterError::InvalidParameter {
                name: unknown.clone(),
                reason: format!("not a dbscan parameter (known: {})", KNOWN_PARAMS.join(", ")),
            });
        }

        let invalid = |name: &str, reason: &str| AdapterError::InvalidParameter {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        let threshold = profile.get_f64("detect_threshold", 5.0)?;
        if !(threshold > 0.0) {
            return Err(invalid("detect_threshold", "must be positive"));
        }
        let sign_code = profile.get_i64("detect_sign", -1)?;
        let sign = DetectSign::from_code(sign_code)
            .ok_or_else(|| invalid("detect_sign", "must be -1, 0 or 1"))?;
        let dead_time_ms = profile.get_f64("dead_time_ms", 1.0)?;
        if dead_time_ms < 0.0 {
            return Err(invalid("dead_time_ms", "must not be negative"));
        }
        let eps = profile.get_f64("eps", 2.5)?;
        if !(eps > 0.0) {
            return Err(invalid("eps", "must be positive"));
        }
        let min_samples = profile.get_i64("min_samples", 5)?;
        if min_samples < 2 {
            return Err(invalid("min_samples", "must be at least 2"));
        }
        let noise_duration_s = profile.get_f64("noise_duration_s", 10.0)?;
        if !(noise_duration_s > 0.0) {
            return Err(invalid("noise_duration_s", "must be positive"));
        }

        Ok(Self {
            detection: DetectionParams {
                threshold: threshold as f32,
                sign,
                dead_samples: (dead_time_ms * sample_rate / 1000.0).round() as usize,
            },
            eps: eps as f32,
            min_samples: min_samples as usize,
            noise_samples: (noise_duration_s * sample_rate).round() as usize,
        })
    }
}

/// The built-in sorter registered as `dbscan`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DbscanSorter;

impl DbscanSorter {
    pub fn default_params() -> ParamMap {
        to_params(json!({
            "detect_threshold": 5.0,
            "detect_sign": -1,
            "dead_time_ms": 1.0,
            "eps": 2.5,
            "min_samples": 5,
            "noise_duration_s": 10.0
        }))
    }

    /// Spike trains of one group, one per cluster, in cluster order.
    fn sort_group(
        job: &SortJob<'_>,
        settings: &DbscanSettings,
        group: u32,
        channels: &[usize],
    ) -> Result<Vec<Vec<u64>>, AdapterError> {
        let n = job.recording.num_samples();
        let traces = job.recording.read_channels(channels, 0..n)?;

        let noise_len = settings.noise_samples.clamp(1, n.max(1)).min(n);
        let noise: Vec<f32> = traces.iter().map(|t| noise_level(&t[..noise_len])).collect();

        let detections = detect_spikes(&traces, &noise, &settings.detection);
        let features: Vec<[f32; FEATURE_DIMS]> = detections.iter().map(|d| d.features).collect();
        let labels = dbscan(&features, settings.eps, settings.min_samples);

        let mut clusters: BTreeMap<i32, Vec<u64>> = BTreeMap::new();
        for (detection, &label) in detections.iter().zip(&labels) {
            if label >= 0 {
                clusters.entry(label).or_default().push(detection.sample as u64);
            }
        }

        debug!(
            "group {}: {} detections, {} clusters, {} noise",
            group,
            detections.len(),
            clusters.len(),
            labels.iter().filter(|&&l| l < 0).count()
        );

        Ok(clusters.into_values().collect())
    }
}

impl SorterAdapter for DbscanSorter {
    fn kind(&self) -> String {
        "in-process threshold detection + DBSCAN".to_string()
    }

    fn run(&self, job: &SortJob<'_>) -> Result<Sorting, AdapterError> {
        let settings = DbscanSettings::from_profile(job.profile, job.recording.sample_rate())?;

        let groups: Vec<(u32, Vec<usize>)> = job
            .groups
            .iter()
            .map(|(g, channels)| {
                let visible: Vec<usize> = channels
                    .iter()
                    .copied()
                    .filter(|&c| job.recording.is_visible(c))
                    .collect();
                (g, visible)
            })
            .filter(|(_, channels)| !channels.is_empty())
            .collect();

        let sort_one = |(group, channels): &(u32, Vec<usize>)| {
            Self::sort_group(job, &settings, *group, channels).map(|trains| (*group, trains))
        };

        let per_group: Vec<(u32, Vec<Vec<u64>>)> = if job.parallel {
            groups.par_iter().map(sort_one).collect::<Result<_, _>>()?
        } else {
            groups.iter().map(sort_one).collect::<Result<_, _>>()?
        };

        let mut units: Vec<(UnitId, Unit)> = Vec::new();
        for (group, trains) in per_group {
            for train in trains {
                let id = units.len() as UnitId;
                let unit = Unit::new(train).with_property(job.grouping_property, group);
                units.push((id, unit));
            }
        }

        info!(
            "dbscan found {} units over {} groups",
            units.len(),
            groups.len()
        );

        Ok(Sorting::from_units(job.recording.sample_rate(), units))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::channel_map::ChannelGroupMap;
    use crate::core::recording::RecordingSource;
    use tempfile::tempdir;

    /// Deterministic uniform noise in [-1, 1).
    fn lcg_noise(seed: u64, n: usize) -> Vec<f32> {
        let mut state = seed;
        (0..n)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                ((state >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
            })
            .collect()
    }

    fn inject(trace: &mut [f32], at: usize, amplitude: f32) {
        trace[at - 1] += 0.5 * amplitude;
        trace[at] += amplitude;
        trace[at + 1] += 0.5 * amplitude;
    }

    fn two_unit_recording() -> (RecordingSource, Vec<u64>, Vec<u64>) {
        let n = 20_000;
        let mut rows: Vec<Vec<f32>> = (0..4).map(|c| lcg_noise(c + 1, n)).collect();
        let a: Vec<u64> = (0..30).map(|k| 500 + 600 * k).collect();
        let b: Vec<u64> = (0..30).map(|k| 800 + 600 * k).collect();
        for &t in &a {
            inject(&mut rows[0], t as usize, -20.0);
            inject(&mut rows[1], t as usize, -10.0);
        }
        for &t in &b {
            inject(&mut rows[2], t as usize, -20.0);
            inject(&mut rows[3], t as usize, -10.0);
        }
        let rec = RecordingSource::from_rows(rows, 10_000.0).unwrap();
        let map = ChannelGroupMap::from_groups(&[vec![0, 1, 2, 3]]).unwrap();
        (rec.with_channel_groups(map).unwrap(), a, b)
    }

    #[test]
    fn test_atomic_union_find_basic() {
        let uf = AtomicUnionFind::new(5);

        assert_eq!(uf.find(0), 0);
        assert_eq!(uf.find(4), 4);

        assert!(uf.union(0, 1));
        assert_eq!(uf.find(0), uf.find(1));

        assert!(uf.union(2, 3));
        assert_eq!(uf.find(2), uf.find(3));
        assert_ne!(uf.find(0), uf.find(2));

        assert!(uf.union(1, 2));
        assert_eq!(uf.find(0), uf.find(3));

        // Same set
        assert!(!uf.union(0, 3));
    }

    #[test]
    fn test_dbscan_simple_clusters() {
        let features: Vec<[f32; 4]> = vec![
            [0.0, 0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [1.0, 1.0, 0.0, 0.0],
            [100.0, 100.0, 0.0, 0.0],
            [101.0, 100.0, 0.0, 0.0],
            [100.0, 101.0, 0.0, 0.0],
            [101.0, 101.0, 0.0, 0.0],
        ];

        let labels = dbscan(&features, 5.0, 2);

        assert_eq!(labels, vec![0, 0, 0, 0, 1, 1, 1, 1]);
    }

    #[test]
    fn test_dbscan_noise_points() {
        let features: Vec<[f32; 4]> = vec![
            [0.0, 0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [100.0, 100.0, 100.0, 100.0],
        ];

        let labels = dbscan(&features, 5.0, 3);

        assert!(labels[0] >= 0);
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[0], labels[2]);
        assert_eq!(labels[3], -1);
    }

    #[test]
    fn test_dbscan_empty_and_single() {
        assert!(dbscan(&[], 5.0, 3).is_empty());
        assert_eq!(dbscan(&[[0.0; 4]], 5.0, 2), vec![-1]);
    }

    #[test]
    fn test_detect_spikes_respects_dead_time() {
        let mut trace = vec![0.1f32, -0.1].repeat(50);
        inject(&mut trace, 20, -10.0);
        inject(&mut trace, 23, -10.0);
        inject(&mut trace, 60, -10.0);
        let params = DetectionParams {
            threshold: 5.0,
            sign: DetectSign::Negative,
            dead_samples: 10,
        };

        let detections = detect_spikes(&[trace], &[0.5], &params);

        let samples: Vec<usize> = detections.iter().map(|d| d.sample).collect();
        assert_eq!(samples, vec![20, 60]);
        assert!(detections[0].features[0] > 5.0);
        assert_eq!(detections[0].features[1], 0.0);
    }

    #[test]
    fn test_detect_sign_codes() {
        assert_eq!(DetectSign::from_code(-1), Some(DetectSign::Negative));
        assert_eq!(DetectSign::from_code(0), Some(DetectSign::Both));
        assert_eq!(DetectSign::from_code(2), None);
    }

    #[test]
    fn test_sorter_separates_two_units() {
        let (rec, a, b) = two_unit_recording();
        let groups = rec.channel_groups().unwrap().clone();
        let profile = SorterProfile::new("dbscan", DbscanSorter::default_params());
        let dir = tempdir().unwrap();

        for parallel in [true, false] {
            let job = SortJob {
                sorter: "dbscan",
                recording: &rec,
                groups: &groups,
                profile: &profile,
                output_dir: dir.path(),
                parallel,
                grouping_property: "group",
            };
            let sorting = DbscanSorter.run(&job).unwrap();

            assert_eq!(sorting.unit_ids(), vec![0, 1]);
            assert_eq!(sorting.spike_train(0), Some(a.as_slice()));
            assert_eq!(sorting.spike_train(1), Some(b.as_slice()));
            assert_eq!(sorting.resolve_group(1, &["group".to_string()]), Some(0));
        }
    }

    #[test]
    fn test_sorter_rejects_unknown_parameter() {
        let (rec, _, _) = two_unit_recording();
        let groups = rec.channel_groups().unwrap().clone();
        let mut params = DbscanSorter::default_params();
        params.insert("num_starting_clusters".to_string(), json!(50));
        let profile = SorterProfile::new("dbscan", params);
        let dir = tempdir().unwrap();
        let job = SortJob {
            sorter: "dbscan",
            recording: &rec,
            groups: &groups,
            profile: &profile,
            output_dir: dir.path(),
            parallel: false,
            grouping_property: "group",
        };

        match DbscanSorter.run(&job) {
            Err(AdapterError::InvalidParameter { name, .. }) => {
                assert_eq!(name, "num_starting_clusters")
            }
            other => panic!("Expected InvalidParameter, got {other:?}"),
        }
    }

    #[test]
    fn test_sorter_on_flat_recording_finds_nothing() {
        let rec = RecordingSource::from_rows(vec![vec![0.0; 1000]; 4], 10_000.0).unwrap();
        let groups = ChannelGroupMap::from_groups(&[vec![0, 1, 2, 3]]).unwrap();
        let rec = rec.with_channel_groups(groups.clone()).unwrap();
        let profile = SorterProfile::new("dbscan", DbscanSorter::default_params());
        let dir = tempdir().unwrap();
        let job = SortJob {
            sorter: "dbscan",
            recording: &rec,
            groups: &groups,
            profile: &profile,
            output_dir: dir.path(),
            parallel: true,
            grouping_property: "group",
        };

        assert!(DbscanSorter.run(&job).unwrap().is_empty());
    }
}
