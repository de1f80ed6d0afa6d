//! Sorter registry, parameter profiles and invocation adapters.
//!
//! A sorter is selected by name. Each name maps to a [`SorterDescriptor`]
//! holding the algorithm's published parameter defaults and the adapter that
//! knows how to run it. Adding a sorter means registering a descriptor.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use super::clustering::DbscanSorter;
use crate::core::channel_map::{ChannelGroupMap, ChannelMapError};
use crate::core::loaders::load_spike_table_as;
use crate::core::recording::{RecordingError, RecordingSource};
use crate::core::sorting::Sorting;
use crate::core::writers::{write_prb, WriteError};

/// Parameter name to value.
pub type ParamMap = BTreeMap<String, Value>;

/// Spike table an external sorter must leave in its output folder.
pub const SPIKE_TABLE_FILE: &str = "spike_table.csv";

/// Errors raised while selecting, configuring or running a sorter.
#[derive(Debug, Error)]
pub enum SorterError {
    #[error("unsupported sorter '{name}' (available: {available})")]
    Unsupported { name: String, available: String },

    #[error("sorter configuration error: {0}")]
    Configuration(String),

    #[error("sorter '{sorter}' failed: {diagnostic}")]
    Execution { sorter: String, diagnostic: String },

    #[error("sort runner already used (state: {0}); create a new runner to retry")]
    RunnerSpent(String),

    #[error("failed to persist sorting to '{path}': {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: WriteError,
    },
}

/// Failures reported by an adapter. The runner turns these into
/// [`SorterError::Execution`] with the text preserved.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("could not start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with {status}: {stderr}")]
    ExitStatus {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("expected output '{0}' was not produced")]
    MissingOutput(PathBuf),

    #[error("malformed output '{path}': {reason}")]
    MalformedOutput { path: PathBuf, reason: String },

    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("failed to prepare sorter inputs: {0}")]
    Prepare(String),

    #[error("recording error: {0}")]
    Recording(#[from] RecordingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<WriteError> for AdapterError {
    fn from(e: WriteError) -> Self {
        AdapterError::Prepare(e.to_string())
    }
}

impl From<ChannelMapError> for AdapterError {
    fn from(e: ChannelMapError) -> Self {
        AdapterError::Prepare(e.to_string())
    }
}

/// Resolved parameter set for one sorter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SorterProfile {
    pub sorter: String,
    pub params: ParamMap,
}

impl SorterProfile {
    pub fn new(sorter: &str, params: ParamMap) -> Self {
        Self {
            sorter: sorter.to_string(),
            params,
        }
    }

    /// Defaults with `overrides` merged on top. Override values win on
    /// collision; keys absent from the defaults are kept as given.
    pub fn with_overrides(&self, overrides: &ParamMap) -> SorterProfile {
        let mut params = self.params.clone();
        for (key, value) in overrides {
            params.insert(key.clone(), value.clone());
        }
        SorterProfile {
            sorter: self.sorter.clone(),
            params,
        }
    }

    #[inline]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Numeric parameter, `default` when absent. Non-numeric values are an error.
    pub fn get_f64(&self, key: &str, default: f64) -> Result<f64, AdapterError> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(v) => v.as_f64().ok_or_else(|| AdapterError::InvalidParameter {
                name: key.to_string(),
                reason: format!("expected a number, got {}", v),
            }),
        }
    }

    /// Integer parameter, `default` when absent.
    pub fn get_i64(&self, key: &str, default: i64) -> Result<i64, AdapterError> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(v) => v.as_i64().ok_or_else(|| AdapterError::InvalidParameter {
                name: key.to_string(),
                reason: format!("expected an integer, got {}", v),
            }),
        }
    }
}

impl fmt::Display for SorterProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.sorter)?;
        for (key, value) in &self.params {
            writeln!(f, "  {} = {}", key, value)?;
        }
        Ok(())
    }
}

/// Everything an adapter needs for one invocation.
pub struct SortJob<'a> {
    pub sorter: &'a str,
    pub recording: &'a RecordingSource,
    pub groups: &'a ChannelGroupMap,
    pub profile: &'a SorterProfile,
    pub output_dir: &'a Path,
    pub parallel: bool,
    /// Unit property that carries the channel group of each unit.
    pub grouping_property: &'a str,
}

/// Runs one sorting algorithm.
pub trait SorterAdapter: Send + Sync {
    /// Short description used when listing sorters.
    fn kind(&self) -> String;

    fn run(&self, job: &SortJob<'_>) -> Result<Sorting, AdapterError>;
}

/// Registry entry for one sorter.
#[derive(Clone)]
pub struct SorterDescriptor {
    pub name: String,
    pub defaults: ParamMap,
    /// Whether the sorter is run in parallel unless configured otherwise.
    pub parallel_default: bool,
    pub adapter: Arc<dyn SorterAdapter>,
}

impl fmt::Debug for SorterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SorterDescriptor")
            .field("name", &self.name)
            .field("defaults", &self.defaults)
            .field("parallel_default", &self.parallel_default)
            .field("adapter", &self.adapter.kind())
            .finish()
    }
}

/// Name to descriptor mapping.
#[derive(Debug, Clone, Default)]
pub struct SorterRegistry {
    descriptors: BTreeMap<String, SorterDescriptor>,
}

pub(crate) fn to_params(value: Value) -> ParamMap {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        _ => ParamMap::new(),
    }
}

impl SorterRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the in-process `dbscan` sorter and command-line adapters
    /// for klusta, spyking-circus, herdingspikes and mountainsort4.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();

        registry.register(SorterDescriptor {
            name: "dbscan".to_string(),
            defaults: DbscanSorter::default_params(),
            parallel_default: true,
            adapter: Arc::new(DbscanSorter),
        });

        let external = [
            (
                "klusta",
                true,
                json!({
                    "adjacency_radius": null,
                    "threshold_strong_std_factor": 5,
                    "threshold_weak_std_factor": 2,
                    "detect_sign": -1,
                    "extract_s_before": 16,
                    "extract_s_after": 32,
                    "n_features_per_channel": 3,
                    "pca_n_waveforms_max": 10000,
                    "num_starting_clusters": 50,
                    "chunk_mb": 500,
                    "n_jobs_bin": 1
                }),
            ),
            (
                "spykingcircus",
                false,
                json!({
                    "detect_sign": -1,
                    "adjacency_radius": 100,
                    "detect_threshold": 6,
                    "template_width_ms": 3,
                    "filter": true,
                    "merge_spikes": true,
                    "auto_merge": 0.75,
                    "num_workers": null,
                    "whitening_max_elts": 1000,
                    "clustering_max_elts": 10000
                }),
            ),
            (
                "herdingspikes",
                false,
                json!({
                    "clustering_bandwidth": 5.5,
                    "clustering_alpha": 5.5,
                    "clustering_n_jobs": -1,
                    "clustering_bin_seeding": true,
                    "clustering_min_bin_freq": 16,
                    "left_cutout_time": 0.3,
                    "right_cutout_time": 1.8,
                    "detect_threshold": 20,
                    "probe_inner_radius": 70,
                    "probe_neighbor_radius": 90,
                    "probe_event_length": 0.26,
                    "probe_peak_jitter": 0.2,
                    "pca_ncomponents": 2,
                    "pca_whiten": true,
                    "freq_min": 300,
                    "freq_max": 6000,
                    "filter": true,
                    "pre_scale": true,
                    "pre_scale_value": 20
                }),
            ),
            (
                "mountainsort4",
                false,
                json!({
                    "detect_sign": -1,
                    "adjacency_radius": -1,
                    "freq_min": 300,
                    "freq_max": 6000,
                    "filter": true,
                    "whiten": true,
                    "curation": false,
                    "num_workers": null,
                    "clip_size": 50,
                    "detect_threshold": 3,
                    "detect_interval": 10,
                    "noise_overlap_threshold": 0.15
                }),
            ),
        ];

        for (name, parallel_default, defaults) in external {
            registry.register(SorterDescriptor {
                name: name.to_string(),
                defaults: to_params(defaults),
                parallel_default,
                adapter: Arc::new(ExternalCommandAdapter::new(name)),
            });
        }

        registry
    }

    /// Add or replace a descriptor.
    pub fn register(&mut self, descriptor: SorterDescriptor) {
        self.descriptors.insert(descriptor.name.clone(), descriptor);
    }

    /// Point a registered sorter at a different executable.
    pub fn set_command(&mut self, name: &str, program: &str) -> Result<(), SorterError> {
        let available = self.names().join(", ");
        let descriptor = self
            .descriptors
            .get_mut(name)
            .ok_or_else(|| SorterError::Unsupported {
                name: name.to_string(),
                available,
            })?;
        descriptor.adapter = Arc::new(ExternalCommandAdapter::new(program));
        Ok(())
    }

    pub fn names(&self) -> Vec<&str> {
        self.descriptors.keys().map(String::as_str).collect()
    }

    pub fn descriptor(&self, name: &str) -> Result<&SorterDescriptor, SorterError> {
        self.descriptors.get(name).ok_or_else(|| SorterError::Unsupported {
            name: name.to_string(),
            available: self.names().join(", "),
        })
    }

    /// Published defaults of a sorter.
    pub fn defaults_for(&self, name: &str) -> Result<SorterProfile, SorterError> {
        self.descriptor(name)
            .map(|d| SorterProfile::new(name, d.defaults.clone()))
    }
}

/// Runs a sorter as a child process.
///
/// Before launch the visible channels are copied to `recording.dat`
/// (sample-major float32), the grouping to `recording.prb` (channel indices
/// relative to the copy) and the profile to `params.json`. The program must
/// write [`SPIKE_TABLE_FILE`] into the output folder.
#[derive(Debug, Clone)]
pub struct ExternalCommandAdapter {
    program: String,
}

impl ExternalCommandAdapter {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }

    /// Grouping re-indexed to column positions in the copied recording.
    fn dat_channel_groups(
        recording: &RecordingSource,
        groups: &ChannelGroupMap,
    ) -> Result<ChannelGroupMap, AdapterError> {
        let position: BTreeMap<usize, usize> = recording
            .channel_ids()
            .iter()
            .enumerate()
            .map(|(i, &c)| (c, i))
            .collect();

        let mut remapped = Vec::with_capacity(groups.num_groups());
        for (group, channels) in groups.iter() {
            let cols = channels
                .iter()
                .map(|c| {
                    position.get(c).copied().ok_or_else(|| {
                        AdapterError::Prepare(format!("channel {} is not in the recording", c))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            remapped.push((group, cols));
        }
        Ok(ChannelGroupMap::from_indexed_groups(remapped)?)
    }
}

impl SorterAdapter for ExternalCommandAdapter {
    fn kind(&self) -> String {
        format!("external command '{}'", self.program)
    }

    fn run(&self, job: &SortJob<'_>) -> Result<Sorting, AdapterError> {
        fs::create_dir_all(job.output_dir)?;

        let dat_path = job.output_dir.join("recording.dat");
        let prb_path = job.output_dir.join("recording.prb");
        let params_path = job.output_dir.join("params.json");
        let table_path = job.output_dir.join(SPIKE_TABLE_FILE);

        let frames = job.recording.materialize(&dat_path)?;
        write_prb(&prb_path, &Self::dat_channel_groups(job.recording, job.groups)?)?;
        let params_json = serde_json::to_string_pretty(&job.profile.params)
            .map_err(|e| AdapterError::Prepare(e.to_string()))?;
        fs::write(&params_path, params_json)?;
        debug!("Prepared {} frames for {}", frames, self.program);

        let mut command = Command::new(&self.program);
        command
            .arg("--recording")
            .arg(&dat_path)
            .arg("--probe")
            .arg(&prb_path)
            .arg("--params")
            .arg(&params_path)
            .arg("--output")
            .arg(job.output_dir)
            .arg("--sample-rate")
            .arg(job.recording.sample_rate().to_string())
            .arg("--num-channels")
            .arg(job.recording.num_channels().to_string())
            .arg("--dtype")
            .arg("float32");
        if job.parallel {
            command.arg("--parallel");
        }

        info!("Launching {} for sorter {}", self.program, job.sorter);
        let output = command.output().map_err(|e| AdapterError::Spawn {
            program: self.program.clone(),
            source: e,
        })?;

        if !output.status.success() {
            return Err(AdapterError::ExitStatus {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        if !table_path.exists() {
            return Err(AdapterError::MissingOutput(table_path));
        }

        let sorting = load_spike_table_as(
            &table_path,
            job.recording.sample_rate(),
            job.grouping_property,
        )
        .map_err(|e| AdapterError::MalformedOutput {
            path: table_path.clone(),
            reason: e.to_string(),
        })?;

        let num_samples = job.recording.num_samples();
        if let Some((id, last)) = sorting.first_out_of_bounds(num_samples) {
            return Err(AdapterError::MalformedOutput {
                path: table_path,
                reason: format!(
                    "unit {} has a spike at sample {} beyond the {} recorded samples",
                    id, last, num_samples
                ),
            });
        }

        Ok(sorting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_for_unknown_sorter() {
        let registry = SorterRegistry::with_builtin();
        match registry.defaults_for("kilosort9") {
            Err(SorterError::Unsupported { name, available }) => {
                assert_eq!(name, "kilosort9");
                assert!(available.contains("klusta"));
            }
            other => panic!("Expected Unsupported, got {other:?}"),
        }
    }

    #[test]
    fn test_with_overrides_empty_is_identity() {
        let registry = SorterRegistry::with_builtin();
        for name in registry.names() {
            let defaults = registry.defaults_for(name).unwrap();
            assert_eq!(defaults.with_overrides(&ParamMap::new()), defaults);
        }
    }

    #[test]
    fn test_with_overrides_replaces_single_key() {
        let defaults = SorterRegistry::with_builtin().defaults_for("klusta").unwrap();

        for key in ["detect_sign", "not_a_klusta_param"] {
            let mut overrides = ParamMap::new();
            overrides.insert(key.to_string(), json!(1));

            let merged = defaults.with_overrides(&overrides);

            assert_eq!(merged.get(key), Some(&json!(1)));
            let mut expected = defaults.params.clone();
            expected.insert(key.to_string(), json!(1));
            assert_eq!(merged.params, expected);
        }
    }

    #[test]
    fn test_profile_numeric_accessors() {
        let mut params = ParamMap::new();
        params.insert("eps".to_string(), json!(2.5));
        params.insert("name".to_string(), json!("x"));
        let profile = SorterProfile::new("dbscan", params);

        assert_eq!(profile.get_f64("eps", 0.0).unwrap(), 2.5);
        assert_eq!(profile.get_f64("missing", 7.0).unwrap(), 7.0);
        assert!(matches!(
            profile.get_f64("name", 0.0),
            Err(AdapterError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_set_command_requires_registered_sorter() {
        let mut registry = SorterRegistry::with_builtin();
        assert!(registry.set_command("klusta", "/opt/klusta/run").is_ok());
        assert!(registry.set_command("nope", "x").is_err());
        assert!(registry
            .descriptor("klusta")
            .unwrap()
            .adapter
            .kind()
            .contains("/opt/klusta/run"));
    }

    #[test]
    fn test_dat_channel_groups_reindexes_visible_channels() {
        let rec = RecordingSource::from_rows(vec![vec![0.0; 4]; 12], 1000.0).unwrap();
        let map = ChannelGroupMap::from_indexed_groups([(1, vec![4, 5]), (2, vec![8, 9])]).unwrap();
        let rec = rec.with_channel_groups(map.clone()).unwrap();

        let remapped = ExternalCommandAdapter::dat_channel_groups(&rec, &map).unwrap();
        assert_eq!(remapped.channels_in(1).unwrap(), &[0, 1]);
        assert_eq!(remapped.channels_in(2).unwrap(), &[2, 3]);
    }

    #[cfg(unix)]
    mod external {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::{tempdir, TempDir};

        /// Write an executable shell script that sets `$out` to the value of
        /// `--output` before running `body`.
        fn script(dir: &TempDir, body: &str) -> String {
            let path = dir.path().join("fake-sorter.sh");
            let text = format!(
                "#!/bin/sh\n\
                 while [ $# -gt 0 ]; do\n\
                 \x20 case \"$1\" in\n\
                 \x20   --output) out=\"$2\" ;;\n\
                 \x20 esac\n\
                 \x20 shift\n\
                 done\n\
                 {}\n",
                body
            );
            fs::write(&path, text).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path.display().to_string()
        }

        fn recording() -> RecordingSource {
            let rec = RecordingSource::from_rows(vec![vec![0.0; 100]; 4], 1000.0).unwrap();
            rec.with_channel_groups(ChannelGroupMap::from_groups(&[vec![0, 1, 2, 3]]).unwrap())
                .unwrap()
        }

        fn run_script(body: &str) -> (TempDir, Result<Sorting, AdapterError>) {
            let dir = tempdir().unwrap();
            let program = script(&dir, body);
            let rec = recording();
            let groups = rec.channel_groups().unwrap().clone();
            let profile = SorterProfile::new("klusta", ParamMap::new());
            let output_dir = dir.path().join("results_klusta");
            let job = SortJob {
                sorter: "klusta",
                recording: &rec,
                groups: &groups,
                profile: &profile,
                output_dir: &output_dir,
                parallel: false,
                grouping_property: "tetrode",
            };
            let result = ExternalCommandAdapter::new(&program).run(&job);
            (dir, result)
        }

        #[test]
        fn test_script_output_is_loaded() {
            let (dir, result) = run_script(
                "printf 'unit_id,sample,group\\n4,30,0\\n4,10,0\\n2,99,0\\n' > \"$out/spike_table.csv\"",
            );
            let sorting = result.unwrap();

            assert_eq!(sorting.unit_ids(), vec![2, 4]);
            assert_eq!(sorting.spike_train(4), Some(&[10u64, 30][..]));
            assert_eq!(sorting.resolve_group(2, &["tetrode".to_string()]), Some(0));
            assert_eq!(sorting.sample_rate(), 1000.0);

            let inputs = dir.path().join("results_klusta");
            for file in ["recording.dat", "recording.prb", "params.json"] {
                assert!(inputs.join(file).exists(), "missing {}", file);
            }
        }

        #[test]
        fn test_nonzero_exit_keeps_stderr() {
            let (_dir, result) = run_script("echo 'boom: no clusters' >&2\nexit 3");
            match result {
                Err(AdapterError::ExitStatus { status, stderr, .. }) => {
                    assert!(status.contains('3'), "status was {}", status);
                    assert_eq!(stderr, "boom: no clusters");
                }
                other => panic!("Expected ExitStatus, got {other:?}"),
            }
        }

        #[test]
        fn test_missing_spike_table() {
            let (dir, result) = run_script("exit 0");
            match result {
                Err(AdapterError::MissingOutput(path)) => {
                    assert_eq!(path, dir.path().join("results_klusta").join(SPIKE_TABLE_FILE));
                }
                other => panic!("Expected MissingOutput, got {other:?}"),
            }
        }

        #[test]
        fn test_unparseable_spike_table() {
            let (_dir, result) = run_script(
                "printf 'unit_id,sample\\n1,not-a-sample\\n' > \"$out/spike_table.csv\"",
            );
            match result {
                Err(AdapterError::MalformedOutput { reason, .. }) => {
                    assert!(reason.contains("sample"), "reason was {}", reason);
                }
                other => panic!("Expected MalformedOutput, got {other:?}"),
            }
        }

        #[test]
        fn test_spike_past_recording_end() {
            let (_dir, result) = run_script(
                "printf 'unit_id,sample\\n1,5\\n1,100\\n' > \"$out/spike_table.csv\"",
            );
            match result {
                Err(AdapterError::MalformedOutput { reason, .. }) => {
                    assert!(reason.contains("sample 100"), "reason was {}", reason);
                }
                other => panic!("Expected MalformedOutput, got {other:?}"),
            }
        }
    }
}
