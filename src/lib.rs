//! Offline spike-sorting pipeline for tetrode recordings.
//!
//! This crate provides tools for:
//! - Grouping recording channels into tetrodes and reading raw binary traces
//! - Zero-phase band-pass filtering and channel exclusion
//! - Running the in-process DBSCAN sorter or external sorters behind one
//!   adapter interface
//! - SNR-based unit curation and export to the phy template-gui format
//! - Cross-sorter unit matching and agreement
//!
//! # Example
//!
//! ```no_run
//! use spike_pipeline::{Pipeline, PipelineConfig, PipelineOutcome, SorterRegistry};
//!
//! let mut config = PipelineConfig::default();
//! config.recording.path = Some("session.bin".into());
//! config.sorting.sorter = "dbscan".to_string();
//!
//! match Pipeline::new(config, SorterRegistry::with_builtin()).run().unwrap() {
//!     PipelineOutcome::Completed(summary) => println!("{} units", summary.units_curated),
//!     other => println!("{:?}", other),
//! }
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod pipeline;
pub mod processors;

pub use config::{
    ChannelsConfig, ComparisonConfig, CurationConfig, ExportConfig, OutputConfig,
    PipelineConfig, PreprocessingConfig, RecordingConfig, RunMode, SortingConfig,
};
pub use core::{ChannelGroupMap, RecordingSource, Sorting, Unit, UnitId};
pub use pipeline::{Pipeline, PipelineError, PipelineOutcome, PipelineSummary, Stage};
pub use processors::{SorterProfile, SorterRegistry};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
