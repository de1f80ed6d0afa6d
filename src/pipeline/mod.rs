//! End-to-end driver: channel map, recording, filtering, sorting, curation,
//! export and optional viewing.
//!
//! A [`Pipeline`] is built from an explicit [`PipelineConfig`] and a
//! [`SorterRegistry`] and is consumed by [`Pipeline::run`]. Every failure is
//! reported with the stage it happened in and the sorter being run.

use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use std::time::Instant;

use log::{debug, info, warn};
use thiserror::Error;

use crate::config::{PipelineConfig, RunMode};
use crate::core::channel_map::{ChannelGroupMap, ChannelMapError};
use crate::core::loaders::{load_prb, LoaderError};
use crate::core::recording::{RecordingError, RecordingSource};
use crate::core::sorting::Sorting;
use crate::core::writers::{write_prb, WriteError};
use crate::processors::curation::filter_by_snr;
use crate::processors::export::{export_for_curation, ExportError, ExportReport};
use crate::processors::preprocessing::{bandpass, exclude_channels, last_channel_per_group, PreprocessError};
use crate::processors::runner::{load_checkpoint, SortRequest, SortRunner};
use crate::processors::sorters::{SorterError, SorterProfile, SorterRegistry};

/// Channel map artifact written into the sorter output folder.
pub const CHANNEL_MAP_FILE: &str = "channel_map.prb";

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ChannelMap,
    Recording,
    Preprocessing,
    Sorting,
    Curation,
    Export,
    View,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::ChannelMap => "channel map",
            Stage::Recording => "recording",
            Stage::Preprocessing => "preprocessing",
            Stage::Sorting => "sorting",
            Stage::Curation => "curation",
            Stage::Export => "export",
            Stage::View => "view",
        };
        f.write_str(name)
    }
}

/// Underlying cause of a stage failure.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("{0}")]
    Configuration(String),

    #[error(transparent)]
    ChannelMap(#[from] ChannelMapError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Recording(#[from] RecordingError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Preprocess(#[from] PreprocessError),

    #[error(transparent)]
    Sorter(#[from] SorterError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error("could not launch phy: {0}")]
    View(std::io::Error),
}

/// A failure with its stage and sorter.
#[derive(Debug, Error)]
#[error("{stage} stage failed for sorter '{sorter}': {source}")]
pub struct PipelineError {
    pub stage: Stage,
    pub sorter: String,
    #[source]
    pub source: StageError,
}

/// Counts and locations of a completed run.
#[derive(Debug)]
pub struct PipelineSummary {
    pub sorter: String,
    pub sorter_dir: PathBuf,
    pub phy_dir: PathBuf,
    /// Sorting came from a persisted checkpoint
    pub resumed: bool,
    pub units_sorted: usize,
    pub units_curated: usize,
    pub units_removed: usize,
    pub curation_failures: usize,
    pub export: ExportReport,
    pub elapsed_secs: f64,
}

#[derive(Debug)]
pub enum PipelineOutcome {
    /// Nothing was run; the profile that would be used.
    DryRun {
        profile: SorterProfile,
        sorter_dir: PathBuf,
        phy_dir: PathBuf,
    },
    /// A stage left zero units; later stages were skipped.
    NoUnits { stage: Stage, sorter_dir: PathBuf },
    Completed(PipelineSummary),
}

/// One configured pipeline run.
pub struct Pipeline {
    config: PipelineConfig,
    registry: SorterRegistry,
    recording: Option<RecordingSource>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, registry: SorterRegistry) -> Self {
        Self {
            config,
            registry,
            recording: None,
        }
    }

    /// Use an already opened recording instead of `config.recording.path`.
    pub fn with_recording(mut self, recording: RecordingSource) -> Self {
        self.recording = Some(recording);
        self
    }

    #[inline]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn channel_map(&self) -> Result<ChannelGroupMap, StageError> {
        let channels = &self.config.channels;
        match &channels.probe_file {
            Some(path) => Ok(load_prb(path)?),
            None => Ok(ChannelGroupMap::for_tetrodes(
                &channels.tetrodes,
                channels.channels_per_tetrode,
            )?),
        }
    }

    fn open_recording(
        &self,
        injected: Option<RecordingSource>,
    ) -> Result<RecordingSource, StageError> {
        if let Some(recording) = injected {
            return Ok(recording);
        }
        let path = self.config.recording.path.as_ref().ok_or_else(|| {
            StageError::Configuration("no recording path configured".to_string())
        })?;
        Ok(RecordingSource::open_binary(path, &self.config.recording.layout())?)
    }

    pub fn run(mut self) -> Result<PipelineOutcome, PipelineError> {
        let start = Instant::now();
        let injected = self.recording.take();
        let sorter = self.config.sorting.sorter.clone();
        let at = |stage: Stage| {
            let sorter = sorter.clone();
            move |source: StageError| PipelineError {
                stage,
                sorter,
                source,
            }
        };

        for (name, program) in &self.config.sorting.commands {
            self.registry
                .set_command(name, program)
                .map_err(|e| at(Stage::Sorting)(e.into()))?;
        }

        let mut runner = SortRunner::new(&self.registry, &sorter)
            .map_err(|e| at(Stage::Sorting)(e.into()))?;
        let profile = runner
            .resolve_profile(&self.config.sorting.overrides_for(&sorter))
            .map_err(|e| at(Stage::Sorting)(e.into()))?;
        debug!("Resolved profile:\n{}", profile);

        let sorter_dir = self.config.output.sorter_dir(&sorter);
        let phy_dir = self.config.output.phy_dir(&sorter);

        // Stage 1: channel map
        let map = self.channel_map().map_err(at(Stage::ChannelMap))?;
        info!(
            "Channel map: {} groups, {} channels",
            map.num_groups(),
            map.len()
        );

        if self.config.mode == RunMode::DryRun {
            info!("Dry run: {} would run with {} parameters", sorter, profile.params.len());
            return Ok(PipelineOutcome::DryRun {
                profile,
                sorter_dir,
                phy_dir,
            });
        }

        write_prb(&sorter_dir.join(CHANNEL_MAP_FILE), &map)
            .map_err(|e| at(Stage::ChannelMap)(e.into()))?;

        // Stage 2: recording
        let stage_start = Instant::now();
        let raw = self
            .open_recording(injected)
            .and_then(|rec| Ok(rec.with_channel_groups(map)?))
            .map_err(at(Stage::Recording))?;
        info!(
            "Recording: {} channels x {} samples at {} Hz ({:.1}s) [{:.2?}]",
            raw.num_channels(),
            raw.num_samples(),
            raw.sample_rate(),
            raw.duration_secs(),
            stage_start.elapsed()
        );

        // Stage 3: preprocessing
        let stage_start = Instant::now();
        let pre = &self.config.preprocessing;
        let mut recording = bandpass(&raw, pre.freq_min, pre.freq_max)
            .map_err(|e| at(Stage::Preprocessing)(e.into()))?;
        if self.config.channels.exclude_last_channel {
            let extra = last_channel_per_group(&recording);
            info!("Excluding last channel of each group: {:?}", extra);
            recording = exclude_channels(&recording, &extra)
                .map_err(|e| at(Stage::Preprocessing)(e.into()))?;
        }
        info!("Preprocessing done [{:.2?}]", stage_start.elapsed());

        // Stage 4: sorting
        let stage_start = Instant::now();
        let checkpoint = if self.config.mode == RunMode::Resume {
            load_checkpoint(
                &sorter_dir,
                &recording,
                &self.config.sorting.grouping_property,
            )
                .map_err(|e| at(Stage::Sorting)(e.into()))?
        } else {
            None
        };
        let resumed = checkpoint.is_some();
        let sorting: Sorting = match checkpoint {
            Some(sorting) => {
                info!(
                    "Resuming from {} with {} units",
                    sorter_dir.display(),
                    sorting.num_units()
                );
                sorting
            }
            None => {
                let request = SortRequest {
                    recording: &recording,
                    profile: &profile,
                    output_dir: &sorter_dir,
                    parallel: self.config.sorting.parallel,
                    grouping_property: &self.config.sorting.grouping_property,
                };
                runner
                    .run(&request)
                    .map_err(|e| at(Stage::Sorting)(e.into()))?
            }
        };
        info!(
            "Sorting: {} units [{:.2?}]",
            sorting.num_units(),
            stage_start.elapsed()
        );

        if sorting.is_empty() {
            warn!("{} found no units", sorter);
            return Ok(PipelineOutcome::NoUnits {
                stage: Stage::Sorting,
                sorter_dir,
            });
        }
        let units_sorted = sorting.num_units();

        // Stage 5: curation
        let (curated, units_removed, curation_failures) = if self.config.curation.enabled {
            let stage_start = Instant::now();
            let cur = &self.config.curation;
            let outcome = filter_by_snr(
                &sorting,
                &recording,
                cur.threshold,
                cur.sign,
                &cur.snr_params(),
            )
            .map_err(|e| at(Stage::Curation)(e.into()))?;
            info!(
                "Curation: {} units kept [{:.2?}]",
                outcome.sorting.num_units(),
                stage_start.elapsed()
            );
            (outcome.sorting, outcome.removed.len(), outcome.failures.len())
        } else {
            (sorting, 0, 0)
        };

        if curated.is_empty() {
            warn!("No units left after curation");
            return Ok(PipelineOutcome::NoUnits {
                stage: Stage::Curation,
                sorter_dir,
            });
        }

        // Stage 6: export
        let stage_start = Instant::now();
        let export = export_for_curation(
            &recording,
            &curated,
            &phy_dir,
            &self.config.export.export_params(),
        )
        .map_err(|e| at(Stage::Export)(e.into()))?;
        info!("Export done [{:.2?}]", stage_start.elapsed());

        // Stage 7: view
        if self.config.view_on_complete {
            let status = Command::new("phy")
                .arg("template-gui")
                .arg(export.params_path())
                .status()
                .map_err(|e| at(Stage::View)(StageError::View(e)))?;
            if !status.success() {
                warn!("phy exited with {}", status);
            }
        }

        Ok(PipelineOutcome::Completed(PipelineSummary {
            sorter: sorter.clone(),
            sorter_dir,
            phy_dir,
            resumed,
            units_sorted,
            units_curated: curated.num_units(),
            units_removed,
            curation_failures,
            export,
            elapsed_secs: start.elapsed().as_secs_f64(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::ChannelMap.to_string(), "channel map");
        assert_eq!(Stage::Sorting.to_string(), "sorting");
    }

    #[test]
    fn test_error_mentions_stage_and_sorter() {
        let err = PipelineError {
            stage: Stage::Sorting,
            sorter: "klusta".to_string(),
            source: StageError::Configuration("boom".to_string()),
        };
        assert_eq!(err.to_string(), "sorting stage failed for sorter 'klusta': boom");
    }

    #[test]
    fn test_missing_recording_path() {
        let dir = tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.sorting.sorter = "dbscan".to_string();
        config.output.base_dir = dir.path().to_path_buf();

        let err = Pipeline::new(config, SorterRegistry::with_builtin())
            .run()
            .unwrap_err();

        assert_eq!(err.stage, Stage::Recording);
        assert!(matches!(err.source, StageError::Configuration(_)));
    }

    #[test]
    fn test_overlapping_probe_is_a_channel_map_failure() {
        let dir = tempdir().unwrap();
        let probe = dir.path().join("overlap.prb");
        std::fs::write(
            &probe,
            "channel_groups = {0: {'channels': [0, 1]}, 1: {'channels': [1, 2]}}\n",
        )
        .unwrap();
        let mut config = PipelineConfig::default();
        config.sorting.sorter = "dbscan".to_string();
        config.channels.probe_file = Some(probe);
        config.output.base_dir = dir.path().to_path_buf();

        let err = Pipeline::new(config, SorterRegistry::with_builtin())
            .run()
            .unwrap_err();

        assert_eq!(err.stage, Stage::ChannelMap);
        assert_eq!(err.sorter, "dbscan");
    }
}
