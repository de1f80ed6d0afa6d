//! Command-line interface for the spike-sorting pipeline.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::RunMode;
use crate::core::channel_map::ChannelGroupMap;
use crate::core::loaders::load_spike_table;
use crate::core::writers::{write_prb, write_spike_table};
use crate::pipeline::{Pipeline, PipelineOutcome, Stage};
use crate::processors::comparison::compare_multiple;
use crate::processors::runner::checkpoint_path;
use crate::processors::sorters::SorterRegistry;
use crate::PipelineConfig;

#[derive(Parser)]
#[command(name = "spike-pipeline")]
#[command(about = "Tetrode spike-sorting pipeline", version)]
pub struct Cli {
    /// Path to YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Filter, sort, curate and export a recording for phy
    Run {
        /// Raw binary recording
        recording: Option<PathBuf>,
        /// Sorter to run
        #[arg(short, long)]
        sorter: Option<String>,
        /// Tetrodes to sort (1-based, comma separated)
        #[arg(short, long, value_delimiter = ',')]
        tetrodes: Option<Vec<u32>>,
        /// Drop the last channel of every tetrode
        #[arg(long)]
        exclude_last_channel: bool,
        /// Directory receiving the sorter and phy folders
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
        /// Output folder name (`default` names it after the sorter)
        #[arg(long)]
        folder_name: Option<String>,
        /// SNR below which units are removed
        #[arg(long)]
        snr_threshold: Option<f64>,
        /// Skip SNR curation
        #[arg(long)]
        no_curation: bool,
        /// Force parallel sorting across tetrodes
        #[arg(long)]
        parallel: bool,
        /// Report the resolved sorter parameters without running
        #[arg(long, conflicts_with = "resume")]
        dry_run: bool,
        /// Reuse a previous sorting from the output folder
        #[arg(long)]
        resume: bool,
        /// Open phy on the exported folder when done
        #[arg(long)]
        view: bool,
    },

    /// Print a sorter's parameters after config overrides
    Params {
        /// Sorter name
        sorter: String,
    },

    /// List available sorters
    Sorters,

    /// Write a tetrode channel map as a .prb probe file
    ChannelMap {
        /// Output .prb file
        output: PathBuf,
        /// Tetrodes to include (1-based, comma separated)
        #[arg(short, long, value_delimiter = ',')]
        tetrodes: Option<Vec<u32>>,
        /// Channels per tetrode
        #[arg(long)]
        channels_per_tetrode: Option<usize>,
    },

    /// Find units that several sorters agree on
    Compare {
        /// Sorter output folders (or spike table CSVs)
        #[arg(required = true, num_args = 2..)]
        sortings: Vec<PathBuf>,
        /// Sampling rate of the sorted recording
        #[arg(long)]
        sample_rate: Option<f64>,
        /// Sortings that must agree on a unit
        #[arg(short, long)]
        minimum_matching: Option<usize>,
        /// Write the agreement units as a spike table CSV
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Line printed when a run stops without units.
fn no_units_message(stage: Stage) -> String {
    format!("no units found after the {} stage", stage)
}

/// Print a summary box
fn print_summary(title: &str, items: &[(&str, String)]) {
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║ {:<62} ║", title);
    println!("╠══════════════════════════════════════════════════════════════╣");
    for (key, value) in items {
        let display_value = if value.chars().count() > 39 {
            format!("{}...", value.chars().take(36).collect::<String>())
        } else {
            value.clone()
        };
        println!("║ {:<20}: {:<39} ║", key, display_value);
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
}

pub fn run() {
    let cli = Cli::parse();

    // Initialize logging based on verbosity (must come first)
    env_logger::Builder::new()
        .filter_level(match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .format_timestamp_secs()
        .init();

    let result = load_config(cli.config.as_deref()).and_then(|config| match cli.command {
        Commands::Run {
            recording,
            sorter,
            tetrodes,
            exclude_last_channel,
            output_dir,
            folder_name,
            snr_threshold,
            no_curation,
            parallel,
            dry_run,
            resume,
            view,
        } => {
            let mut config = config;
            if let Some(path) = recording {
                config.recording.path = Some(path);
            }
            if let Some(sorter) = sorter {
                config.sorting.sorter = sorter;
            }
            if let Some(tetrodes) = tetrodes {
                config.channels.tetrodes = tetrodes;
            }
            if exclude_last_channel {
                config.channels.exclude_last_channel = true;
            }
            if let Some(dir) = output_dir {
                config.output.base_dir = dir;
            }
            if let Some(name) = folder_name {
                config.output.folder_name = name;
            }
            if let Some(threshold) = snr_threshold {
                config.curation.threshold = threshold;
            }
            if no_curation {
                config.curation.enabled = false;
            }
            if parallel {
                config.sorting.parallel = Some(true);
            }
            if dry_run {
                config.mode = RunMode::DryRun;
            } else if resume {
                config.mode = RunMode::Resume;
            }
            if view {
                config.view_on_complete = true;
            }
            cmd_run(config)
        }
        Commands::Params { sorter } => cmd_params(&sorter, &config),
        Commands::Sorters => cmd_sorters(),
        Commands::ChannelMap {
            output,
            tetrodes,
            channels_per_tetrode,
        } => cmd_channel_map(&output, tetrodes, channels_per_tetrode, &config),
        Commands::Compare {
            sortings,
            sample_rate,
            minimum_matching,
            output,
        } => cmd_compare(&sortings, sample_rate, minimum_matching, output.as_deref(), &config),
    });

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => {
            let config = PipelineConfig::from_yaml(path)?;
            info!("Loaded config from: {}", path.display());
            Ok(config)
        }
        None => Ok(PipelineConfig::default()),
    }
}

fn cmd_run(config: PipelineConfig) -> Result<()> {
    let start = Instant::now();
    let sorter = config.sorting.sorter.clone();

    println!("Running spike-sorting pipeline...");
    if let Some(path) = &config.recording.path {
        println!("Recording: {}", path.display());
    }
    println!("Sorter: {}", sorter);
    println!("Tetrodes: {:?}", config.channels.tetrodes);

    let spinner = create_spinner(&format!("Sorting with {}...", sorter));
    let outcome = Pipeline::new(config, SorterRegistry::with_builtin()).run();
    spinner.finish_and_clear();

    match outcome.with_context(|| format!("Pipeline failed for sorter '{}'", sorter))? {
        PipelineOutcome::DryRun {
            profile,
            sorter_dir,
            phy_dir,
        } => {
            println!("DRY RUN: nothing was written");
            print!("{}", profile);
            print_summary(
                "Dry Run",
                &[
                    ("Sorter", sorter),
                    ("Parameters", profile.params.len().to_string()),
                    ("Sorter folder", sorter_dir.display().to_string()),
                    ("Phy folder", phy_dir.display().to_string()),
                ],
            );
        }
        PipelineOutcome::NoUnits { stage, sorter_dir } => {
            println!("{}", no_units_message(stage));
            print_summary(
                "Pipeline Stopped",
                &[
                    ("Sorter", sorter),
                    ("Stage", stage.to_string()),
                    ("Sorter folder", sorter_dir.display().to_string()),
                    ("Duration", format!("{:.2?}", start.elapsed())),
                ],
            );
        }
        PipelineOutcome::Completed(summary) => {
            print_summary(
                "Pipeline Complete",
                &[
                    ("Sorter", summary.sorter.clone()),
                    ("Resumed", summary.resumed.to_string()),
                    ("Units sorted", summary.units_sorted.to_string()),
                    ("Units removed", summary.units_removed.to_string()),
                    ("SNR failures", summary.curation_failures.to_string()),
                    ("Units exported", summary.export.exported.len().to_string()),
                    ("Units skipped", summary.export.skipped.len().to_string()),
                    ("Spikes exported", summary.export.num_spikes.to_string()),
                    ("Sorter folder", summary.sorter_dir.display().to_string()),
                    ("Phy folder", summary.phy_dir.display().to_string()),
                    ("Duration", format!("{:.2?}", start.elapsed())),
                ],
            );
        }
    }
    Ok(())
}

fn cmd_params(sorter: &str, config: &PipelineConfig) -> Result<()> {
    let registry = SorterRegistry::with_builtin();
    let defaults = registry.defaults_for(sorter)?;
    let profile = defaults.with_overrides(&config.sorting.overrides_for(sorter));

    print!("{}", profile);
    let overridden: Vec<&str> = profile
        .params
        .iter()
        .filter(|(key, value)| defaults.get(key) != Some(*value))
        .map(|(key, _)| key.as_str())
        .collect();
    if !overridden.is_empty() {
        println!("Overridden by config: {}", overridden.join(", "));
    }
    Ok(())
}

fn cmd_sorters() -> Result<()> {
    let registry = SorterRegistry::with_builtin();
    for name in registry.names() {
        let descriptor = registry.descriptor(name)?;
        println!(
            "{:<16} {:<40} parallel by default: {}",
            name,
            descriptor.adapter.kind(),
            descriptor.parallel_default
        );
    }
    Ok(())
}

fn cmd_channel_map(
    output: &Path,
    tetrodes: Option<Vec<u32>>,
    channels_per_tetrode: Option<usize>,
    config: &PipelineConfig,
) -> Result<()> {
    let tetrodes = tetrodes.unwrap_or_else(|| config.channels.tetrodes.clone());
    let per_tetrode = channels_per_tetrode.unwrap_or(config.channels.channels_per_tetrode);

    let map = ChannelGroupMap::for_tetrodes(&tetrodes, per_tetrode)?;
    write_prb(output, &map)
        .with_context(|| format!("Failed to write probe file: {}", output.display()))?;

    print_summary(
        "Channel Map Written",
        &[
            ("Output file", output.display().to_string()),
            ("Tetrodes", format!("{:?}", tetrodes)),
            ("Groups", map.num_groups().to_string()),
            ("Channels", map.len().to_string()),
        ],
    );
    Ok(())
}

fn cmd_compare(
    paths: &[PathBuf],
    sample_rate: Option<f64>,
    minimum_matching: Option<usize>,
    output: Option<&Path>,
    config: &PipelineConfig,
) -> Result<()> {
    let start = Instant::now();
    let sample_rate = sample_rate.unwrap_or(config.recording.sample_rate);
    let minimum_matching = minimum_matching.unwrap_or(config.comparison.minimum_matching);
    if minimum_matching == 0 {
        bail!("minimum matching must be at least 1");
    }

    let mut sortings = Vec::with_capacity(paths.len());
    for path in paths {
        let table = if path.is_dir() {
            checkpoint_path(path)
        } else {
            path.clone()
        };
        let sorting = load_spike_table(&table, sample_rate)
            .with_context(|| format!("Failed to load sorting: {}", table.display()))?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        info!("{}: {} units", name, sorting.num_units());
        sortings.push((name, sorting));
    }

    let spinner = create_spinner("Matching units across sortings...");
    let result = compare_multiple(&sortings, minimum_matching, &config.comparison.params());
    spinner.finish_and_clear();

    for (i, unit) in result.units.iter().enumerate() {
        let members: Vec<String> = unit
            .members
            .iter()
            .map(|(name, id)| format!("{}:{}", name, id))
            .collect();
        println!("unit {:>3}  agreement {}  [{}]", i, unit.num_sortings, members.join(", "));
    }

    if let Some(output) = output {
        write_spike_table(output, &result.agreement_sorting())
            .with_context(|| format!("Failed to write agreement table: {}", output.display()))?;
    }

    let mut items = vec![
        ("Sortings", sortings.len().to_string()),
        ("Minimum matching", minimum_matching.to_string()),
        ("Agreement units", result.units.len().to_string()),
    ];
    if let Some(output) = output {
        items.push(("Output CSV", output.display().to_string()));
    }
    items.push(("Duration", format!("{:.2?}", start.elapsed())));
    print_summary("Comparison Complete", &items);
    Ok(())
}
