//! Configuration types for the spike-sorting pipeline.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::recording::{RecordingLayout, SampleDtype, TimeAxis};
use crate::processors::comparison::ComparisonParams;
use crate::processors::curation::{SnrParams, ThresholdSign};
use crate::processors::export::ExportParams;
use crate::processors::sorters::{to_params, ParamMap};

fn default_group_keys() -> Vec<String> {
    vec!["group".to_string(), "ch_group".to_string()]
}

fn default_true() -> bool {
    true
}

/// Raw recording file and its layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Binary trace file
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default = "default_dtype")]
    pub dtype: SampleDtype,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,

    /// Channels stored in the file
    #[serde(default = "default_num_channels")]
    pub num_channels: usize,

    #[serde(default = "default_time_axis")]
    pub time_axis: TimeAxis,

    /// Header bytes before the first sample
    #[serde(default)]
    pub offset_bytes: u64,
}

fn default_dtype() -> SampleDtype {
    SampleDtype::Int16
}

fn default_sample_rate() -> f64 {
    48_000.0
}

fn default_num_channels() -> usize {
    64
}

fn default_time_axis() -> TimeAxis {
    TimeAxis::SampleMajor
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            path: None,
            dtype: default_dtype(),
            sample_rate: default_sample_rate(),
            num_channels: default_num_channels(),
            time_axis: default_time_axis(),
            offset_bytes: 0,
        }
    }
}

impl RecordingConfig {
    pub fn layout(&self) -> RecordingLayout {
        RecordingLayout {
            dtype: self.dtype,
            sample_rate: self.sample_rate,
            num_channels: self.num_channels,
            time_axis: self.time_axis,
            offset_bytes: self.offset_bytes,
        }
    }
}

/// Channel grouping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    /// Tetrodes to sort (1-based)
    #[serde(default = "default_tetrodes")]
    pub tetrodes: Vec<u32>,

    #[serde(default = "default_channels_per_tetrode")]
    pub channels_per_tetrode: usize,

    /// Drop the highest channel of every group (EEG on Axona systems)
    #[serde(default)]
    pub exclude_last_channel: bool,

    /// Read groups from a `.prb` file instead of the tetrode layout
    #[serde(default)]
    pub probe_file: Option<PathBuf>,
}

fn default_tetrodes() -> Vec<u32> {
    (1..=16).collect()
}

fn default_channels_per_tetrode() -> usize {
    4
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            tetrodes: default_tetrodes(),
            channels_per_tetrode: default_channels_per_tetrode(),
            exclude_last_channel: false,
            probe_file: None,
        }
    }
}

/// Band-pass filter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessingConfig {
    #[serde(default = "default_freq_min")]
    pub freq_min: f64,

    #[serde(default = "default_freq_max")]
    pub freq_max: f64,
}

fn default_freq_min() -> f64 {
    300.0
}

fn default_freq_max() -> f64 {
    6000.0
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            freq_min: default_freq_min(),
            freq_max: default_freq_max(),
        }
    }
}

/// Sorter selection and parameter overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortingConfig {
    #[serde(default = "default_sorter")]
    pub sorter: String,

    /// `None` uses each sorter's own default
    #[serde(default)]
    pub parallel: Option<bool>,

    /// Per-sorter parameter overrides applied on top of the defaults
    #[serde(default = "default_sorter_overrides")]
    pub params: BTreeMap<String, ParamMap>,

    /// Executable per external sorter, when not on `PATH` under its name
    #[serde(default)]
    pub commands: BTreeMap<String, String>,

    /// Unit property holding the channel group
    #[serde(default = "default_grouping_property")]
    pub grouping_property: String,
}

fn default_sorter() -> String {
    "klusta".to_string()
}

fn default_grouping_property() -> String {
    "group".to_string()
}

/// Lab overrides for tetrode data.
fn default_sorter_overrides() -> BTreeMap<String, ParamMap> {
    let mut overrides = BTreeMap::new();
    overrides.insert(
        "klusta".to_string(),
        to_params(json!({
            "detect_sign": 1,
            "extract_s_before": 10,
            "extract_s_after": 40,
            "num_starting_clusters": 50,
            "threshold_strong_std_factor": 4.5
        })),
    );
    overrides.insert(
        "spykingcircus".to_string(),
        to_params(json!({
            "detect_sign": 1,
            "adjacency_radius": 0.2,
            "detect_threshold": 4.5,
            "template_width_ms": 3,
            "filter": false,
            "num_workers": 8
        })),
    );
    overrides.insert(
        "herdingspikes".to_string(),
        to_params(json!({ "filter": false })),
    );
    overrides
}

impl Default for SortingConfig {
    fn default() -> Self {
        Self {
            sorter: default_sorter(),
            parallel: None,
            params: default_sorter_overrides(),
            commands: BTreeMap::new(),
            grouping_property: default_grouping_property(),
        }
    }
}

impl SortingConfig {
    /// Overrides configured for `sorter`, empty when none.
    pub fn overrides_for(&self, sorter: &str) -> ParamMap {
        self.params.get(sorter).cloned().unwrap_or_default()
    }
}

/// SNR curation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_snr_threshold")]
    pub threshold: f64,

    /// Removal criterion: a unit goes when `snr <sign> threshold`
    #[serde(default = "default_threshold_sign")]
    pub sign: ThresholdSign,

    #[serde(default = "default_curation_window_ms")]
    pub ms_before: f64,

    #[serde(default = "default_curation_window_ms")]
    pub ms_after: f64,

    #[serde(default = "default_max_spikes_per_unit")]
    pub max_spikes_per_unit: Option<usize>,

    /// Seconds of recording used for noise estimates
    #[serde(default = "default_noise_duration")]
    pub noise_duration_s: f64,

    #[serde(default = "default_group_keys")]
    pub group_keys: Vec<String>,
}

fn default_snr_threshold() -> f64 {
    5.0
}

fn default_threshold_sign() -> ThresholdSign {
    ThresholdSign::Less
}

fn default_curation_window_ms() -> f64 {
    3.0
}

fn default_max_spikes_per_unit() -> Option<usize> {
    Some(1000)
}

fn default_noise_duration() -> f64 {
    10.0
}

impl Default for CurationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_snr_threshold(),
            sign: default_threshold_sign(),
            ms_before: default_curation_window_ms(),
            ms_after: default_curation_window_ms(),
            max_spikes_per_unit: default_max_spikes_per_unit(),
            noise_duration_s: default_noise_duration(),
            group_keys: default_group_keys(),
        }
    }
}

impl CurationConfig {
    pub fn snr_params(&self) -> SnrParams {
        SnrParams {
            ms_before: self.ms_before,
            ms_after: self.ms_after,
            max_spikes_per_unit: self.max_spikes_per_unit,
            noise_duration_s: self.noise_duration_s,
            group_keys: self.group_keys.clone(),
        }
    }
}

/// phy export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(default = "default_export_ms_before")]
    pub ms_before: f64,

    #[serde(default = "default_export_ms_after")]
    pub ms_after: f64,

    #[serde(default = "default_max_channels_per_template")]
    pub max_channels_per_template: usize,

    #[serde(default = "default_max_spikes_per_unit")]
    pub max_spikes_per_unit: Option<usize>,

    /// Copy the filtered recording into the phy folder
    #[serde(default = "default_true")]
    pub copy_recording: bool,

    #[serde(default = "default_group_keys")]
    pub group_keys: Vec<String>,
}

fn default_export_ms_before() -> f64 {
    0.2
}

fn default_export_ms_after() -> f64 {
    0.8
}

fn default_max_channels_per_template() -> usize {
    8
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            ms_before: default_export_ms_before(),
            ms_after: default_export_ms_after(),
            max_channels_per_template: default_max_channels_per_template(),
            max_spikes_per_unit: default_max_spikes_per_unit(),
            copy_recording: true,
            group_keys: default_group_keys(),
        }
    }
}

impl ExportConfig {
    pub fn export_params(&self) -> ExportParams {
        ExportParams {
            ms_before: self.ms_before,
            ms_after: self.ms_after,
            max_channels_per_template: self.max_channels_per_template,
            max_spikes_per_unit: self.max_spikes_per_unit,
            copy_recording: self.copy_recording,
            group_keys: self.group_keys.clone(),
        }
    }
}

/// Cross-sorter agreement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonConfig {
    #[serde(default = "default_delta_ms")]
    pub delta_ms: f64,

    #[serde(default = "default_match_score")]
    pub match_score: f64,

    /// Sortings that must agree on a unit
    #[serde(default = "default_minimum_matching")]
    pub minimum_matching: usize,
}

fn default_delta_ms() -> f64 {
    0.4
}

fn default_match_score() -> f64 {
    0.5
}

fn default_minimum_matching() -> usize {
    2
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        Self {
            delta_ms: default_delta_ms(),
            match_score: default_match_score(),
            minimum_matching: default_minimum_matching(),
        }
    }
}

impl ComparisonConfig {
    pub fn params(&self) -> ComparisonParams {
        ComparisonParams {
            delta_ms: self.delta_ms,
            match_score: self.match_score,
        }
    }
}

/// Where results go.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// `default` names folders after the sorter
    #[serde(default = "default_folder_name")]
    pub folder_name: String,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_folder_name() -> String {
    "default".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            folder_name: default_folder_name(),
        }
    }
}

impl OutputConfig {
    /// Sorter output folder: `results_<sorter>` or `<folder_name>`.
    pub fn sorter_dir(&self, sorter: &str) -> PathBuf {
        if self.folder_name == "default" {
            self.base_dir.join(format!("results_{}", sorter))
        } else {
            self.base_dir.join(&self.folder_name)
        }
    }

    /// phy folder: `phy_<sorter>` or `<folder_name>_phy`.
    pub fn phy_dir(&self, sorter: &str) -> PathBuf {
        if self.folder_name == "default" {
            self.base_dir.join(format!("phy_{}", sorter))
        } else {
            self.base_dir.join(format!("{}_phy", self.folder_name))
        }
    }
}

/// How the pipeline treats the sorting stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Sort from scratch
    #[default]
    Run,
    /// Resolve and report the sorter profile, touch nothing
    DryRun,
    /// Reuse a persisted sorting when present
    Resume,
}

/// Main pipeline configuration combining all sub-configs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub recording: RecordingConfig,

    #[serde(default)]
    pub channels: ChannelsConfig,

    #[serde(default)]
    pub preprocessing: PreprocessingConfig,

    #[serde(default)]
    pub sorting: SortingConfig,

    #[serde(default)]
    pub curation: CurationConfig,

    #[serde(default)]
    pub export: ExportConfig,

    #[serde(default)]
    pub comparison: ComparisonConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub mode: RunMode,

    /// Open phy on the exported folder when done
    #[serde(default)]
    pub view_on_complete: bool,
}

impl PipelineConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: PipelineConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}
