//! Core data types and I/O operations.

pub mod channel_map;
pub mod loaders;
pub mod recording;
pub mod sorting;
pub mod transforms;
pub mod writers;

pub use channel_map::{ChannelGroupMap, ChannelMapError};
pub use loaders::{load_prb, load_spike_table, load_spike_table_as, LoaderError};
pub use recording::{
    BinaryTrace, InMemoryTrace, RecordingError, RecordingLayout, RecordingSource, SampleDtype,
    TimeAxis, TraceSource,
};
pub use sorting::{Sorting, Unit, UnitId};
pub use writers::{
    write_npy, write_prb, write_recording_dat, write_spike_table, write_spike_table_as, write_text,
    write_tsv, WriteError,
};
