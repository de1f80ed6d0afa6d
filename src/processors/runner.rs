//! Single-use execution of one sorter over one recording.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{info, warn};

use super::sorters::{ParamMap, SortJob, SorterError, SorterProfile, SorterRegistry};
use crate::core::loaders::{load_spike_table_as, LoaderError};
use crate::core::recording::RecordingSource;
use crate::core::sorting::Sorting;
use crate::core::writers::write_spike_table_as;

/// Spike table persisted after a successful run, reused by resume.
pub const SORTING_CHECKPOINT: &str = "sorting.csv";

/// Lifecycle of a [`SortRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortState {
    Idle,
    Running,
    Completed,
    Failed(String),
}

impl fmt::Display for SortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortState::Idle => write!(f, "idle"),
            SortState::Running => write!(f, "running"),
            SortState::Completed => write!(f, "completed"),
            SortState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Inputs of one sorting run.
#[derive(Debug, Clone)]
pub struct SortRequest<'a> {
    pub recording: &'a RecordingSource,
    pub profile: &'a SorterProfile,
    pub output_dir: &'a Path,
    /// `None` uses the sorter's registered default.
    pub parallel: Option<bool>,
    /// Property key carrying each unit's channel group.
    pub grouping_property: &'a str,
}

/// Runs one sorter once.
///
/// A runner that reached `Completed` or `Failed` refuses further runs;
/// retrying needs a fresh runner.
pub struct SortRunner<'r> {
    registry: &'r SorterRegistry,
    sorter: String,
    state: SortState,
}

impl<'r> SortRunner<'r> {
    /// Fails with [`SorterError::Unsupported`] for unregistered sorters.
    pub fn new(registry: &'r SorterRegistry, sorter: &str) -> Result<Self, SorterError> {
        registry.descriptor(sorter)?;
        Ok(Self {
            registry,
            sorter: sorter.to_string(),
            state: SortState::Idle,
        })
    }

    #[inline]
    pub fn sorter(&self) -> &str {
        &self.sorter
    }

    #[inline]
    pub fn state(&self) -> &SortState {
        &self.state
    }

    /// The sorter's published defaults with `overrides` applied.
    pub fn resolve_profile(&self, overrides: &ParamMap) -> Result<SorterProfile, SorterError> {
        Ok(self.registry.defaults_for(&self.sorter)?.with_overrides(overrides))
    }

    fn fail(&mut self, diagnostic: String) -> SorterError {
        self.state = SortState::Failed(diagnostic.clone());
        SorterError::Execution {
            sorter: self.sorter.clone(),
            diagnostic,
        }
    }

    pub fn run(&mut self, request: &SortRequest<'_>) -> Result<Sorting, SorterError> {
        if self.state != SortState::Idle {
            return Err(SorterError::RunnerSpent(self.state.to_string()));
        }
        if request.profile.sorter != self.sorter {
            return Err(SorterError::Configuration(format!(
                "profile is for '{}' but the runner is for '{}'",
                request.profile.sorter, self.sorter
            )));
        }

        let groups = match request.recording.channel_groups() {
            Some(map) if !map.is_empty() => map,
            _ => {
                return Err(SorterError::Configuration(
                    "recording has no channel groups; apply a channel map before sorting"
                        .to_string(),
                ))
            }
        };

        let descriptor = self.registry.descriptor(&self.sorter)?;
        let parallel = request.parallel.unwrap_or(descriptor.parallel_default);
        let adapter = descriptor.adapter.clone();

        self.state = SortState::Running;
        info!(
            "Running {} on {} channels in {} groups (parallel: {})",
            self.sorter,
            request.recording.num_channels(),
            groups.num_groups(),
            parallel
        );
        let start = Instant::now();

        if let Err(e) = fs::create_dir_all(request.output_dir) {
            return Err(self.fail(format!(
                "cannot create output folder '{}': {}",
                request.output_dir.display(),
                e
            )));
        }

        let job = SortJob {
            sorter: &self.sorter,
            recording: request.recording,
            groups,
            profile: request.profile,
            output_dir: request.output_dir,
            parallel,
            grouping_property: request.grouping_property,
        };

        let mut sorting = match adapter.run(&job) {
            Ok(sorting) => sorting,
            Err(e) => {
                warn!("{} failed: {}", self.sorter, e);
                return Err(self.fail(e.to_string()));
            }
        };

        // Single-group sorts need no group column from the sorter
        if let Some(only) = (groups.num_groups() == 1).then(|| groups.groups().next()).flatten() {
            let missing: Vec<_> = sorting
                .iter()
                .filter(|(_, unit)| !unit.properties.contains_key(request.grouping_property))
                .map(|(id, unit)| (id, unit.clone()))
                .collect();
            for (id, unit) in missing {
                sorting.insert(id, unit.with_property(request.grouping_property, only));
            }
        }

        let checkpoint = request.output_dir.join(SORTING_CHECKPOINT);
        if let Err(source) = write_spike_table_as(&checkpoint, &sorting, request.grouping_property) {
            self.state = SortState::Failed(source.to_string());
            return Err(SorterError::Persist {
                path: checkpoint,
                source,
            });
        }

        self.state = SortState::Completed;
        info!(
            "{} finished in {:.1}s: {} units, {} spikes",
            self.sorter,
            start.elapsed().as_secs_f64(),
            sorting.num_units(),
            sorting.total_spikes()
        );

        Ok(sorting)
    }
}

/// Path of the resume checkpoint inside a sorter output folder.
pub fn checkpoint_path(output_dir: &Path) -> PathBuf {
    output_dir.join(SORTING_CHECKPOINT)
}

/// Load a previously persisted sorting, `None` when there is none.
///
/// The checkpoint must fit the recording it is resumed against: a spike at
/// or past the last recorded sample rejects the whole file.
pub fn load_checkpoint(
    output_dir: &Path,
    recording: &RecordingSource,
    grouping_property: &str,
) -> Result<Option<Sorting>, LoaderError> {
    let path = checkpoint_path(output_dir);
    if !path.exists() {
        return Ok(None);
    }
    let sorting = load_spike_table_as(&path, recording.sample_rate(), grouping_property)?;
    let num_samples = recording.num_samples();
    if let Some((unit, sample)) = sorting.first_out_of_bounds(num_samples) {
        return Err(LoaderError::SampleOutOfRange {
            path,
            unit,
            sample,
            num_samples,
        });
    }
    Ok(Some(sorting))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::channel_map::ChannelGroupMap;
    use crate::core::sorting::Unit;
    use crate::processors::sorters::{AdapterError, SorterAdapter, SorterDescriptor};
    use std::sync::Arc;
    use tempfile::tempdir;

    struct FixedSorter;

    impl SorterAdapter for FixedSorter {
        fn kind(&self) -> String {
            "fixed".to_string()
        }

        fn run(&self, job: &SortJob<'_>) -> Result<Sorting, AdapterError> {
            Ok(Sorting::from_units(
                job.recording.sample_rate(),
                [(7, Unit::new(vec![30, 10])), (3, Unit::new(vec![5]))],
            ))
        }
    }

    struct CrashingSorter;

    impl SorterAdapter for CrashingSorter {
        fn kind(&self) -> String {
            "crashing".to_string()
        }

        fn run(&self, _job: &SortJob<'_>) -> Result<Sorting, AdapterError> {
            Err(AdapterError::ExitStatus {
                program: "crash".to_string(),
                status: "exit status: 3".to_string(),
                stderr: "segfault in clustering".to_string(),
            })
        }
    }

    fn registry() -> SorterRegistry {
        let mut registry = SorterRegistry::new();
        for (name, adapter) in [
            ("fixed", Arc::new(FixedSorter) as Arc<dyn SorterAdapter>),
            ("crash", Arc::new(CrashingSorter) as Arc<dyn SorterAdapter>),
        ] {
            registry.register(SorterDescriptor {
                name: name.to_string(),
                defaults: ParamMap::new(),
                parallel_default: false,
                adapter,
            });
        }
        registry
    }

    fn grouped_recording() -> RecordingSource {
        let rec = RecordingSource::from_rows(vec![vec![0.0; 100]; 4], 1000.0).unwrap();
        rec.with_channel_groups(ChannelGroupMap::from_groups(&[vec![0, 1, 2, 3]]).unwrap())
            .unwrap()
    }

    #[test]
    fn test_unknown_sorter_is_unsupported() {
        let registry = registry();
        assert!(matches!(
            SortRunner::new(&registry, "kilosort"),
            Err(SorterError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_successful_run_preserves_ids_and_persists() {
        let registry = registry();
        let dir = tempdir().unwrap();
        let rec = grouped_recording();
        let mut runner = SortRunner::new(&registry, "fixed").unwrap();
        let profile = runner.resolve_profile(&ParamMap::new()).unwrap();

        let request = SortRequest {
            recording: &rec,
            profile: &profile,
            output_dir: dir.path(),
            parallel: None,
            grouping_property: "group",
        };
        let sorting = runner.run(&request).unwrap();

        assert_eq!(runner.state(), &SortState::Completed);
        assert_eq!(sorting.unit_ids(), vec![3, 7]);
        assert_eq!(sorting.spike_train(7), Some(&[10u64, 30][..]));
        assert_eq!(sorting.resolve_group(7, &["group".to_string()]), Some(0));

        let reloaded = load_checkpoint(dir.path(), &rec, "group").unwrap().unwrap();
        assert_eq!(reloaded, sorting);

        // Spent runner
        assert!(matches!(runner.run(&request), Err(SorterError::RunnerSpent(_))));
    }

    #[test]
    fn test_crashing_sorter_fails_with_name_and_diagnostic() {
        let registry = registry();
        let dir = tempdir().unwrap();
        let rec = grouped_recording();
        let mut runner = SortRunner::new(&registry, "crash").unwrap();
        let profile = runner.resolve_profile(&ParamMap::new()).unwrap();
        let request = SortRequest {
            recording: &rec,
            profile: &profile,
            output_dir: dir.path(),
            parallel: Some(true),
            grouping_property: "group",
        };

        match runner.run(&request) {
            Err(SorterError::Execution { sorter, diagnostic }) => {
                assert_eq!(sorter, "crash");
                assert!(diagnostic.contains("segfault in clustering"));
            }
            other => panic!("Expected Execution error, got {other:?}"),
        }
        assert!(matches!(runner.state(), SortState::Failed(_)));
        assert!(!checkpoint_path(dir.path()).exists());

        // A fresh runner may retry
        assert_eq!(
            SortRunner::new(&registry, "crash").unwrap().state(),
            &SortState::Idle
        );
    }

    #[test]
    fn test_recording_without_groups_is_a_configuration_error() {
        let registry = registry();
        let dir = tempdir().unwrap();
        let rec = RecordingSource::from_rows(vec![vec![0.0; 10]; 2], 1000.0).unwrap();
        let mut runner = SortRunner::new(&registry, "fixed").unwrap();
        let profile = runner.resolve_profile(&ParamMap::new()).unwrap();
        let request = SortRequest {
            recording: &rec,
            profile: &profile,
            output_dir: dir.path(),
            parallel: None,
            grouping_property: "group",
        };

        assert!(matches!(
            runner.run(&request),
            Err(SorterError::Configuration(_))
        ));
        assert_eq!(runner.state(), &SortState::Idle);
    }

    #[test]
    fn test_missing_checkpoint_is_none() {
        let dir = tempdir().unwrap();
        let rec = grouped_recording();
        assert!(load_checkpoint(dir.path(), &rec, "group").unwrap().is_none());
    }

    #[test]
    fn test_checkpoint_beyond_recording_is_rejected() {
        let dir = tempdir().unwrap();
        let rec = grouped_recording();
        fs::write(
            checkpoint_path(dir.path()),
            "unit_id,sample,group\n1,40,0\n2,18446744073709551615,0\n",
        )
        .unwrap();

        match load_checkpoint(dir.path(), &rec, "group") {
            Err(LoaderError::SampleOutOfRange {
                unit,
                sample,
                num_samples,
                ..
            }) => {
                assert_eq!(unit, 2);
                assert_eq!(sample, u64::MAX);
                assert_eq!(num_samples, 100);
            }
            other => panic!("Expected SampleOutOfRange, got {other:?}"),
        }
    }

    #[test]
    fn test_custom_grouping_property_survives_checkpoint() {
        let registry = registry();
        let dir = tempdir().unwrap();
        let rec = grouped_recording();
        let mut runner = SortRunner::new(&registry, "fixed").unwrap();
        let profile = runner.resolve_profile(&ParamMap::new()).unwrap();
        let request = SortRequest {
            recording: &rec,
            profile: &profile,
            output_dir: dir.path(),
            parallel: None,
            grouping_property: "tetrode",
        };
        let sorting = runner.run(&request).unwrap();
        assert_eq!(sorting.resolve_group(7, &["tetrode".to_string()]), Some(0));

        let reloaded = load_checkpoint(dir.path(), &rec, "tetrode").unwrap().unwrap();
        assert_eq!(reloaded.resolve_group(7, &["tetrode".to_string()]), Some(0));
        assert_eq!(reloaded.resolve_group(3, &["tetrode".to_string()]), Some(0));
        assert!(reloaded.property(7, "group").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_external_program_fails() {
        let mut registry = SorterRegistry::with_builtin();
        registry
            .set_command("klusta", "/nonexistent/bin/klusta-sorter")
            .unwrap();
        let dir = tempdir().unwrap();
        let rec = grouped_recording();
        let mut runner = SortRunner::new(&registry, "klusta").unwrap();
        let profile = runner.resolve_profile(&ParamMap::new()).unwrap();
        let request = SortRequest {
            recording: &rec,
            profile: &profile,
            output_dir: dir.path(),
            parallel: None,
            grouping_property: "group",
        };

        match runner.run(&request) {
            Err(SorterError::Execution { sorter, diagnostic }) => {
                assert_eq!(sorter, "klusta");
                assert!(diagnostic.contains("klusta-sorter"));
            }
            other => panic!("Expected Execution error, got {other:?}"),
        }
        // Inputs were prepared before launch
        assert!(dir.path().join("params.json").exists());
        assert!(dir.path().join("recording.dat").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_external_stderr_reaches_diagnostic() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let program = dir.path().join("klusta-crash.sh");
        fs::write(&program, "#!/bin/sh\necho 'memory error in masked EM' >&2\nexit 2\n").unwrap();
        fs::set_permissions(&program, fs::Permissions::from_mode(0o755)).unwrap();

        let mut registry = SorterRegistry::with_builtin();
        registry
            .set_command("klusta", &program.display().to_string())
            .unwrap();
        let rec = grouped_recording();
        let mut runner = SortRunner::new(&registry, "klusta").unwrap();
        let profile = runner.resolve_profile(&ParamMap::new()).unwrap();
        let output_dir = dir.path().join("results_klusta");
        let request = SortRequest {
            recording: &rec,
            profile: &profile,
            output_dir: &output_dir,
            parallel: None,
            grouping_property: "group",
        };

        match runner.run(&request) {
            Err(SorterError::Execution { sorter, diagnostic }) => {
                assert_eq!(sorter, "klusta");
                assert!(diagnostic.contains("memory error in masked EM"));
            }
            other => panic!("Expected Execution error, got {other:?}"),
        }
        assert!(matches!(runner.state(), SortState::Failed(_)));
        assert!(!checkpoint_path(&output_dir).exists());
    }
}
