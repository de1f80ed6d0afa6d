//! Quality-metric curation: drop units whose SNR fails a threshold.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::waveforms::{compute_template, Window};
use crate::core::recording::{RecordingError, RecordingSource};
use crate::core::sorting::{Sorting, UnitId};
use crate::core::transforms::noise_level;

/// Unit-scoped failures while computing a quality metric.
#[derive(Debug, Error)]
pub enum CurationError {
    #[error("unit {0} does not exist")]
    UnknownUnit(UnitId),

    #[error("unit {unit}: no channel group under properties [{keys}]")]
    UnresolvedGroup { unit: UnitId, keys: String },

    #[error("unit {unit}: group {group} has no visible channels")]
    EmptyGroup { unit: UnitId, group: u32 },

    #[error("unit {0}: no spike has a complete waveform window")]
    NoWaveforms(UnitId),

    #[error("unit {unit}: zero noise on channel {channel}")]
    ZeroNoise { unit: UnitId, channel: usize },

    #[error("recording error: {0}")]
    Recording(#[from] RecordingError),
}

/// Comparison that marks a unit for removal: a unit is removed when
/// `metric <sign> threshold` holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdSign {
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

impl ThresholdSign {
    #[inline]
    pub fn removes(self, metric: f64, threshold: f64) -> bool {
        match self {
            ThresholdSign::Less => metric < threshold,
            ThresholdSign::LessOrEqual => metric <= threshold,
            ThresholdSign::Greater => metric > threshold,
            ThresholdSign::GreaterOrEqual => metric >= threshold,
        }
    }
}

impl fmt::Display for ThresholdSign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThresholdSign::Less => "less",
            ThresholdSign::LessOrEqual => "less_or_equal",
            ThresholdSign::Greater => "greater",
            ThresholdSign::GreaterOrEqual => "greater_or_equal",
        };
        f.write_str(name)
    }
}

impl FromStr for ThresholdSign {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "less" => Ok(ThresholdSign::Less),
            "less_or_equal" => Ok(ThresholdSign::LessOrEqual),
            "greater" => Ok(ThresholdSign::Greater),
            "greater_or_equal" => Ok(ThresholdSign::GreaterOrEqual),
            other => Err(format!(
                "unknown threshold sign '{}' (expected less, less_or_equal, greater or greater_or_equal)",
                other
            )),
        }
    }
}

fn default_group_keys() -> Vec<String> {
    vec!["group".to_string(), "ch_group".to_string()]
}

/// Waveform and noise settings for SNR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnrParams {
    pub ms_before: f64,
    pub ms_after: f64,
    /// Spikes averaged per unit; `None` uses all of them.
    pub max_spikes_per_unit: Option<usize>,
    /// Leading stretch of the recording used for noise estimates.
    pub noise_duration_s: f64,
    /// Property keys tried in order to find a unit's group.
    pub group_keys: Vec<String>,
}

impl Default for SnrParams {
    fn default() -> Self {
        Self {
            ms_before: 3.0,
            ms_after: 3.0,
            max_spikes_per_unit: Some(1000),
            noise_duration_s: 10.0,
            group_keys: default_group_keys(),
        }
    }
}

/// Result of a curation pass.
#[derive(Debug)]
pub struct CurationOutcome {
    pub sorting: Sorting,
    /// Units removed by the threshold.
    pub removed: Vec<UnitId>,
    /// Units whose metric could not be computed; not retained.
    pub failures: Vec<(UnitId, CurationError)>,
    pub metrics: BTreeMap<UnitId, f64>,
}

/// Noise level (MAD / 0.6745) of every visible channel over the first
/// `duration_s` seconds.
pub fn channel_noise_levels(
    recording: &RecordingSource,
    duration_s: f64,
) -> Result<BTreeMap<usize, f32>, RecordingError> {
    let n = recording.num_samples();
    let len = ((duration_s * recording.sample_rate()).round() as usize).clamp(1, n.max(1)).min(n);

    recording
        .channel_ids()
        .par_iter()
        .map(|&c| -> Result<(usize, f32), RecordingError> {
            Ok((c, noise_level(&recording.read_channel(c, 0..len)?)))
        })
        .collect()
}

fn snr_with_noise(
    sorting: &Sorting,
    recording: &RecordingSource,
    unit: UnitId,
    params: &SnrParams,
    noise: &BTreeMap<usize, f32>,
) -> Result<f64, CurationError> {
    let spike_train = sorting
        .spike_train(unit)
        .ok_or(CurationError::UnknownUnit(unit))?;
    let group = sorting
        .resolve_group(unit, &params.group_keys)
        .ok_or_else(|| CurationError::UnresolvedGroup {
            unit,
            keys: params.group_keys.join(", "),
        })?;

    let channels: Vec<usize> = recording
        .channel_groups()
        .and_then(|map| map.channels_in(group).ok())
        .unwrap_or_default()
        .iter()
        .copied()
        .filter(|&c| recording.is_visible(c))
        .collect();
    if channels.is_empty() {
        return Err(CurationError::EmptyGroup { unit, group });
    }

    let window = Window::from_ms(recording.sample_rate(), params.ms_before, params.ms_after);
    let template = compute_template(
        recording,
        &channels,
        spike_train,
        window,
        params.max_spikes_per_unit,
    )?
    .ok_or(CurationError::NoWaveforms(unit))?;

    let best = template
        .best_channel_index()
        .ok_or(CurationError::NoWaveforms(unit))?;
    let channel = channels[best];
    let peak = template.peak_amplitudes()[best] as f64;
    let sigma = noise.get(&channel).copied().unwrap_or(0.0) as f64;
    if sigma <= 0.0 {
        return Err(CurationError::ZeroNoise { unit, channel });
    }

    Ok(peak / sigma)
}

/// SNR of one unit: peak of its mean waveform on the best channel of its
/// group divided by that channel's noise level.
pub fn compute_snr(
    sorting: &Sorting,
    recording: &RecordingSource,
    unit: UnitId,
    params: &SnrParams,
) -> Result<f64, CurationError> {
    let noise = channel_noise_levels(recording, params.noise_duration_s)?;
    snr_with_noise(sorting, recording, unit, params, &noise)
}

/// Keep the units whose metric does not meet the removal criterion.
///
/// Units without a metric are left alone. Returns the new sorting and the
/// removed ids.
pub fn filter_by_metric(
    sorting: &Sorting,
    metrics: &BTreeMap<UnitId, f64>,
    threshold: f64,
    sign: ThresholdSign,
) -> (Sorting, Vec<UnitId>) {
    let removed: Vec<UnitId> = metrics
        .iter()
        .filter(|&(&id, &m)| sorting.contains(id) && sign.removes(m, threshold))
        .map(|(&id, _)| id)
        .collect();
    let kept = sorting.select(|id, _| removed.binary_search(&id).is_err());
    (kept, removed)
}

/// Compute every unit's SNR and remove those matching `sign` / `threshold`.
///
/// A unit whose SNR cannot be computed is reported in `failures` and not
/// retained; the other units are still processed.
pub fn filter_by_snr(
    sorting: &Sorting,
    recording: &RecordingSource,
    threshold: f64,
    sign: ThresholdSign,
    params: &SnrParams,
) -> Result<CurationOutcome, RecordingError> {
    let noise = channel_noise_levels(recording, params.noise_duration_s)?;

    let results: Vec<(UnitId, Result<f64, CurationError>)> = sorting
        .unit_ids()
        .into_par_iter()
        .map(|id| (id, snr_with_noise(sorting, recording, id, params, &noise)))
        .collect();

    let mut metrics = BTreeMap::new();
    let mut failures = Vec::new();
    for (id, result) in results {
        match result {
            Ok(snr) => {
                metrics.insert(id, snr);
            }
            Err(e) => {
                warn!("Skipping unit {}: {}", id, e);
                failures.push((id, e));
            }
        }
    }

    let measured = sorting.select(|id, _| metrics.contains_key(&id));
    let (kept, removed) = filter_by_metric(&measured, &metrics, threshold, sign);

    info!(
        "SNR curation ({} {}): kept {} of {} units, removed {}, failed {}",
        sign,
        threshold,
        kept.num_units(),
        sorting.num_units(),
        removed.len(),
        failures.len()
    );

    Ok(CurationOutcome {
        sorting: kept,
        removed,
        failures,
        metrics,
    })
}
