//! Export of a sorting to phy's template-gui folder layout.
//!
//! Files written into the output folder:
//! - `params.py` and optionally `recording.dat` (sample-major float32 copy)
//! - `spike_times.npy`, `spike_clusters.npy`, `spike_templates.npy`,
//!   `amplitudes.npy` (one entry per spike, time ordered)
//! - `templates.npy` with shape `(units, window, channels)`
//! - `channel_map.npy`, `channel_positions.npy`, `channel_groups.npy`
//! - `cluster_group.tsv`, `cluster_channel_group.tsv`

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::waveforms::{compute_template, Window};
use crate::core::recording::{RecordingError, RecordingSource};
use crate::core::sorting::{Sorting, UnitId};
use crate::core::writers::{write_npy, write_text, write_tsv, WriteError};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("export IO error: {0}")]
    Io(#[from] WriteError),

    #[error("unit {unit}: no channel group under properties [{keys}]")]
    UnresolvedGroup { unit: UnitId, keys: String },

    #[error("unit {0}: id does not fit phy's int32 cluster ids")]
    UnitIdOutOfRange(UnitId),

    #[error("recording error: {0}")]
    Recording(#[from] RecordingError),
}

fn default_group_keys() -> Vec<String> {
    vec!["group".to_string(), "ch_group".to_string()]
}

/// Export settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportParams {
    pub ms_before: f64,
    pub ms_after: f64,
    pub max_channels_per_template: usize,
    /// Spikes averaged per template; `None` uses all of them.
    pub max_spikes_per_unit: Option<usize>,
    /// Write `recording.dat` next to the arrays.
    pub copy_recording: bool,
    /// Property keys tried in order to find a unit's group.
    pub group_keys: Vec<String>,
}

impl Default for ExportParams {
    fn default() -> Self {
        Self {
            ms_before: 0.2,
            ms_after: 0.8,
            max_channels_per_template: 8,
            max_spikes_per_unit: Some(1000),
            copy_recording: true,
            group_keys: default_group_keys(),
        }
    }
}

/// What an export produced.
#[derive(Debug)]
pub struct ExportReport {
    pub output_dir: PathBuf,
    pub exported: Vec<UnitId>,
    /// Units left out, with the reason.
    pub skipped: Vec<(UnitId, ExportError)>,
    pub num_spikes: usize,
}

impl ExportReport {
    /// Path of phy's `params.py`.
    pub fn params_path(&self) -> PathBuf {
        self.output_dir.join("params.py")
    }
}

/// One unit prepared for export.
struct UnitExport {
    id: UnitId,
    cluster: i32,
    group: u32,
    /// Dense `[sample][channel]` template over all exported channels.
    template: Vec<f32>,
    /// `(sample, amplitude)` per spike.
    spikes: Vec<(u64, f32)>,
}

/// Samples read per block when looking up spike amplitudes.
const AMPLITUDE_BLOCK: usize = 65_536;

/// Absolute value of `channel` at each spike. Spikes past the end of the
/// recording get 0.
fn spike_amplitudes(
    recording: &RecordingSource,
    channel: usize,
    spike_train: &[u64],
) -> Result<Vec<(u64, f32)>, RecordingError> {
    let n = recording.num_samples();
    let mut block: Vec<f32> = Vec::new();
    let mut block_start = 0usize;
    let mut amplitudes = Vec::with_capacity(spike_train.len());

    for &s in spike_train {
        let sample = match usize::try_from(s) {
            Ok(sample) if sample < n => sample,
            _ => {
                amplitudes.push((s, 0.0));
                continue;
            }
        };
        if sample < block_start || sample >= block_start + block.len() {
            block_start = sample;
            let end = n.min(sample.saturating_add(AMPLITUDE_BLOCK));
            block = recording.read_channel(channel, sample..end)?;
        }
        amplitudes.push((s, block[sample - block_start].abs()));
    }
    Ok(amplitudes)
}

fn prepare_unit(
    recording: &RecordingSource,
    sorting: &Sorting,
    (id, cluster, group): (UnitId, i32, u32),
    params: &ExportParams,
    window: Window,
    column: &BTreeMap<usize, usize>,
) -> Result<UnitExport, ExportError> {
    let spike_train = sorting.spike_train(id).unwrap_or_default();
    let channels: Vec<usize> = recording
        .channel_groups()
        .and_then(|map| map.channels_in(group).ok())
        .unwrap_or_default()
        .iter()
        .copied()
        .filter(|c| column.contains_key(c))
        .collect();
    let n_channels = column.len();
    let mut dense = vec![0.0f32; window.len() * n_channels];

    let template = compute_template(
        recording,
        &channels,
        spike_train,
        window,
        params.max_spikes_per_unit,
    )?;

    let best = match &template {
        Some(template) => {
            let peaks = template.peak_amplitudes();
            let mut order: Vec<usize> = (0..channels.len()).collect();
            order.sort_by(|&a, &b| peaks[b].total_cmp(&peaks[a]).then(a.cmp(&b)));
            order.truncate(params.max_channels_per_template);

            for &i in &order {
                let col = column[&channels[i]];
                for (t, &v) in template.data[i].iter().enumerate() {
                    dense[t * n_channels + col] = v;
                }
            }
            order.first().map(|&i| channels[i])
        }
        None => channels.first().copied(),
    };

    let spikes = match best {
        Some(channel) => spike_amplitudes(recording, channel, spike_train)?,
        None => spike_train.iter().map(|&s| (s, 0.0)).collect(),
    };

    Ok(UnitExport {
        id,
        cluster,
        group,
        template: dense,
        spikes,
    })
}

fn params_py(recording: &RecordingSource, copy_recording: bool) -> String {
    let dat_path = if copy_recording {
        "r'recording.dat'"
    } else {
        "[]"
    };
    format!(
        "dat_path = {}\nn_channels_dat = {}\ndtype = 'float32'\noffset = 0\nsample_rate = {:.1}\nhp_filtered = True\n",
        dat_path,
        recording.num_channels(),
        recording.sample_rate()
    )
}

/// Write `sorting` and `recording` as a phy template-gui folder.
///
/// Units whose group cannot be resolved, or whose id is not a valid phy
/// cluster id, are skipped and listed in the report. Failing to write any file aborts the export.
pub fn export_for_curation(
    recording: &RecordingSource,
    sorting: &Sorting,
    output_dir: &Path,
    params: &ExportParams,
) -> Result<ExportReport, ExportError> {
    fs::create_dir_all(output_dir).map_err(|e| WriteError::CreateDirectory {
        path: output_dir.display().to_string(),
        source: e,
    })?;

    let column: BTreeMap<usize, usize> = recording
        .channel_ids()
        .iter()
        .enumerate()
        .map(|(i, &c)| (c, i))
        .collect();
    let n_channels = column.len();
    let window = Window::from_ms(recording.sample_rate(), params.ms_before, params.ms_after);

    let mut skipped = Vec::new();
    let mut resolved = Vec::new();
    for id in sorting.unit_ids() {
        let cluster = match i32::try_from(id) {
            Ok(cluster) => cluster,
            Err(_) => {
                let err = ExportError::UnitIdOutOfRange(id);
                warn!("Not exporting unit {}: {}", id, err);
                skipped.push((id, err));
                continue;
            }
        };
        let group = sorting
            .resolve_group(id, &params.group_keys)
            .filter(|&g| {
                recording
                    .channel_groups()
                    .is_some_and(|map| map.contains_group(g))
            });
        match group {
            Some(g) => resolved.push((id, cluster, g)),
            None => {
                let err = ExportError::UnresolvedGroup {
                    unit: id,
                    keys: params.group_keys.join(", "),
                };
                warn!("Not exporting unit {}: {}", id, err);
                skipped.push((id, err));
            }
        }
    }

    let units: Vec<UnitExport> = resolved
        .par_iter()
        .map(|&unit| prepare_unit(recording, sorting, unit, params, window, &column))
        .collect::<Result<_, _>>()?;

    // Spikes in time order; ties by template index
    let mut spikes: Vec<(u64, usize, f32)> = units
        .iter()
        .enumerate()
        .flat_map(|(t, u)| u.spikes.iter().map(move |&(s, a)| (s, t, a)))
        .collect();
    spikes.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
    let n_spikes = spikes.len();
    debug!("Exporting {} spikes of {} units", n_spikes, units.len());

    let out = |name: &str| output_dir.join(name);

    write_npy(
        &out("spike_times.npy"),
        &[n_spikes],
        &spikes.iter().map(|s| s.0 as i64).collect::<Vec<_>>(),
    )?;
    write_npy(
        &out("spike_clusters.npy"),
        &[n_spikes],
        &spikes.iter().map(|s| units[s.1].cluster).collect::<Vec<_>>(),
    )?;
    write_npy(
        &out("spike_templates.npy"),
        &[n_spikes],
        &spikes.iter().map(|s| s.1 as i32).collect::<Vec<_>>(),
    )?;
    write_npy(
        &out("amplitudes.npy"),
        &[n_spikes],
        &spikes.iter().map(|s| s.2).collect::<Vec<_>>(),
    )?;

    let templates: Vec<f32> = units.iter().flat_map(|u| u.template.iter().copied()).collect();
    write_npy(
        &out("templates.npy"),
        &[units.len(), window.len(), n_channels],
        &templates,
    )?;

    write_npy(
        &out("channel_map.npy"),
        &[n_channels],
        &(0..n_channels as i32).collect::<Vec<_>>(),
    )?;
    let geometry = recording
        .channel_groups()
        .map(|map| map.geometry())
        .unwrap_or_default();
    let positions: Vec<f32> = recording
        .channel_ids()
        .iter()
        .flat_map(|c| geometry.get(c).copied().unwrap_or([0.0, 0.0]))
        .collect();
    write_npy(&out("channel_positions.npy"), &[n_channels, 2], &positions)?;
    let groups: Vec<i32> = recording
        .channel_ids()
        .iter()
        .map(|&c| recording.group_of(c).map_or(-1, |g| g as i32))
        .collect();
    write_npy(&out("channel_groups.npy"), &[n_channels], &groups)?;

    write_tsv(
        &out("cluster_group.tsv"),
        &["cluster_id", "group"],
        &units
            .iter()
            .map(|u| vec![u.id.to_string(), "unsorted".to_string()])
            .collect::<Vec<_>>(),
    )?;
    write_tsv(
        &out("cluster_channel_group.tsv"),
        &["cluster_id", "channel_group"],
        &units
            .iter()
            .map(|u| vec![u.id.to_string(), u.group.to_string()])
            .collect::<Vec<_>>(),
    )?;

    if params.copy_recording {
        recording.materialize(out("recording.dat"))?;
    }
    write_text(&out("params.py"), &params_py(recording, params.copy_recording))?;

    info!(
        "Exported {} units ({} spikes) to {} ({} skipped)",
        units.len(),
        n_spikes,
        output_dir.display(),
        skipped.len()
    );

    Ok(ExportReport {
        output_dir: output_dir.to_path_buf(),
        exported: units.iter().map(|u| u.id).collect(),
        skipped,
        num_spikes: n_spikes,
    })
}
