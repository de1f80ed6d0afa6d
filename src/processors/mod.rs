//! Pipeline stages operating on recordings and sortings.

pub mod clustering;
pub mod comparison;
pub mod curation;
pub mod export;
pub mod preprocessing;
pub mod runner;
pub mod sorters;
pub mod waveforms;

// Re-export key types for convenience
pub use clustering::{dbscan, detect_spikes, AtomicUnionFind, DbscanSorter, DetectSign};
pub use comparison::{
    compare_multiple, compare_two, AgreementResult, AgreementUnit, ComparisonParams,
    PairComparison, UnitMatch,
};
pub use curation::{
    compute_snr, filter_by_metric, filter_by_snr, CurationError, CurationOutcome, SnrParams,
    ThresholdSign,
};
pub use export::{export_for_curation, ExportError, ExportParams, ExportReport};
pub use preprocessing::{bandpass, exclude_channels, last_channel_per_group, PreprocessError};
pub use runner::{load_checkpoint, SortRequest, SortRunner, SortState, SORTING_CHECKPOINT};
pub use sorters::{
    AdapterError, ExternalCommandAdapter, ParamMap, SortJob, SorterAdapter, SorterDescriptor,
    SorterError, SorterProfile, SorterRegistry,
};
