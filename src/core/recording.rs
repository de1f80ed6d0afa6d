//! Random-access views over raw multichannel voltage traces.
//!
//! A [`RecordingSource`] pairs a [`TraceSource`] (where samples live) with the
//! sampling metadata and the set of channels currently visible to downstream
//! stages. Narrowing the channel set or attaching a channel grouping never
//! touches the underlying samples; stages that transform samples build a new
//! trace instead.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::channel_map::ChannelGroupMap;
use super::writers::{write_recording_dat, WriteError};

/// Errors that can occur while opening or reading a recording.
#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot open recording '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot read recording '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid recording layout: {0}")]
    InvalidLayout(String),

    #[error("file '{path}' holds {size} data bytes, not a multiple of the {frame_bytes}-byte frame")]
    SizeMismatch {
        path: PathBuf,
        size: u64,
        frame_bytes: u64,
    },

    #[error("channel {channel} is outside the recording's {num_channels} channels")]
    ChannelOutOfRange { channel: usize, num_channels: usize },

    #[error("channel {0} is not visible in this recording")]
    ChannelNotVisible(usize),

    #[error("time range {start}..{end} exceeds the {num_samples} available samples")]
    TimeRangeOutOfBounds {
        start: usize,
        end: usize,
        num_samples: usize,
    },

    #[error("channel buffers have mismatched lengths ({expected} vs {found})")]
    LengthMismatch { expected: usize, found: usize },

    #[error("trace file lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, RecordingError>;

/// Fixed-width sample encoding (little endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleDtype {
    Int16,
    Uint16,
    Int32,
    Float32,
}

impl SampleDtype {
    /// Width of one sample in bytes.
    #[inline]
    pub fn size(self) -> usize {
        match self {
            SampleDtype::Int16 | SampleDtype::Uint16 => 2,
            SampleDtype::Int32 | SampleDtype::Float32 => 4,
        }
    }

    /// numpy-style dtype name, as written to phy's `params.py`.
    pub fn numpy_name(self) -> &'static str {
        match self {
            SampleDtype::Int16 => "int16",
            SampleDtype::Uint16 => "uint16",
            SampleDtype::Int32 => "int32",
            SampleDtype::Float32 => "float32",
        }
    }

    #[inline]
    fn decode(self, bytes: &[u8]) -> f32 {
        match self {
            SampleDtype::Int16 => i16::from_le_bytes([bytes[0], bytes[1]]) as f32,
            SampleDtype::Uint16 => u16::from_le_bytes([bytes[0], bytes[1]]) as f32,
            SampleDtype::Int32 => {
                i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32
            }
            SampleDtype::Float32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }
}

/// Orientation of the time axis in the binary file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeAxis {
    /// All samples of channel 0, then all samples of channel 1, ...
    ChannelMajor,
    /// Interleaved frames: one sample of every channel per time step.
    SampleMajor,
}

/// Out-of-band description of a raw binary trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingLayout {
    pub dtype: SampleDtype,
    pub sample_rate: f64,
    pub num_channels: usize,
    pub time_axis: TimeAxis,
    #[serde(default)]
    pub offset_bytes: u64,
}

impl RecordingLayout {
    fn validate(&self) -> Result<()> {
        if !(self.sample_rate > 0.0) || !self.sample_rate.is_finite() {
            return Err(RecordingError::InvalidLayout(format!(
                "sample rate must be positive, got {}",
                self.sample_rate
            )));
        }
        if self.num_channels == 0 {
            return Err(RecordingError::InvalidLayout(
                "channel count must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Backing storage for sample data, addressed by original channel index.
pub trait TraceSource: Send + Sync + fmt::Debug {
    /// Number of samples per channel.
    fn num_samples(&self) -> usize;

    /// Samples `start..end` of one channel.
    fn read(&self, channel: usize, start: usize, end: usize) -> Result<Vec<f32>>;

    /// Samples `start..end` of several channels, in the order requested.
    fn read_many(&self, channels: &[usize], start: usize, end: usize) -> Result<Vec<Vec<f32>>> {
        channels.iter().map(|&c| self.read(c, start, end)).collect()
    }
}

fn check_range(start: usize, end: usize, num_samples: usize) -> Result<()> {
    if start > end || end > num_samples {
        return Err(RecordingError::TimeRangeOutOfBounds {
            start,
            end,
            num_samples,
        });
    }
    Ok(())
}

/// Read-only trace over a binary file using positioned reads.
pub struct BinaryTrace {
    path: PathBuf,
    file: Mutex<File>,
    layout: RecordingLayout,
    num_samples: usize,
}

impl fmt::Debug for BinaryTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryTrace")
            .field("path", &self.path)
            .field("layout", &self.layout)
            .field("num_samples", &self.num_samples)
            .finish()
    }
}

impl BinaryTrace {
    /// Open a binary trace and check its size against the layout.
    pub fn open<P: AsRef<Path>>(path: P, layout: &RecordingLayout) -> Result<Self> {
        layout.validate()?;
        let path = path.as_ref();
        let open_err = |source| RecordingError::Open {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(open_err)?;
        let size = file.metadata().map_err(open_err)?.len();

        let data_bytes = size.saturating_sub(layout.offset_bytes);
        let frame_bytes = (layout.dtype.size() * layout.num_channels) as u64;
        if size < layout.offset_bytes || data_bytes % frame_bytes != 0 {
            return Err(RecordingError::SizeMismatch {
                path: path.to_path_buf(),
                size: data_bytes,
                frame_bytes,
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            layout: layout.clone(),
            num_samples: (data_bytes / frame_bytes) as usize,
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn layout(&self) -> &RecordingLayout {
        &self.layout
    }

    fn read_bytes(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut file = self.file.lock().map_err(|_| RecordingError::LockPoisoned)?;
        let read_err = |source| RecordingError::Read {
            path: self.path.clone(),
            source,
        };
        file.seek(SeekFrom::Start(offset)).map_err(read_err)?;
        file.read_exact(&mut buf).map_err(read_err)?;
        Ok(buf)
    }

    fn check_channel(&self, channel: usize) -> Result<()> {
        if channel >= self.layout.num_channels {
            return Err(RecordingError::ChannelOutOfRange {
                channel,
                num_channels: self.layout.num_channels,
            });
        }
        Ok(())
    }

    /// Decode the interleaved frames `start..end` and pull out `channels`.
    fn read_frames(&self, channels: &[usize], start: usize, end: usize) -> Result<Vec<Vec<f32>>> {
        let width = self.layout.dtype.size();
        let frame = width * self.layout.num_channels;
        let offset = self.layout.offset_bytes + (start * frame) as u64;
        let bytes = self.read_bytes(offset, (end - start) * frame)?;

        let mut out: Vec<Vec<f32>> = channels
            .iter()
            .map(|_| Vec::with_capacity(end - start))
            .collect();
        for frame_bytes in bytes.chunks_exact(frame) {
            for (dst, &c) in out.iter_mut().zip(channels) {
                dst.push(self.layout.dtype.decode(&frame_bytes[c * width..(c + 1) * width]));
            }
        }
        Ok(out)
    }
}

impl TraceSource for BinaryTrace {
    fn num_samples(&self) -> usize {
        self.num_samples
    }

    fn read(&self, channel: usize, start: usize, end: usize) -> Result<Vec<f32>> {
        self.read_many(&[channel], start, end)
            .map(|mut rows| rows.pop().unwrap_or_default())
    }

    fn read_many(&self, channels: &[usize], start: usize, end: usize) -> Result<Vec<Vec<f32>>> {
        check_range(start, end, self.num_samples)?;
        for &c in channels {
            self.check_channel(c)?;
        }

        match self.layout.time_axis {
            TimeAxis::SampleMajor => self.read_frames(channels, start, end),
            TimeAxis::ChannelMajor => {
                let width = self.layout.dtype.size();
                channels
                    .iter()
                    .map(|&c| {
                        let offset = self.layout.offset_bytes
                            + ((c * self.num_samples + start) * width) as u64;
                        let bytes = self.read_bytes(offset, (end - start) * width)?;
                        Ok(bytes
                            .chunks_exact(width)
                            .map(|b| self.layout.dtype.decode(b))
                            .collect())
                    })
                    .collect()
            }
        }
    }
}

/// Trace held in memory, one buffer per channel.
#[derive(Debug, Clone)]
pub struct InMemoryTrace {
    channels: BTreeMap<usize, Vec<f32>>,
    num_samples: usize,
}

impl InMemoryTrace {
    /// Build from per-channel buffers keyed by channel index.
    pub fn new(channels: BTreeMap<usize, Vec<f32>>) -> Result<Self> {
        let num_samples = channels.values().next().map_or(0, Vec::len);
        for buf in channels.values() {
            if buf.len() != num_samples {
                return Err(RecordingError::LengthMismatch {
                    expected: num_samples,
                    found: buf.len(),
                });
            }
        }
        Ok(Self {
            channels,
            num_samples,
        })
    }

    /// Build from buffers for channels `0..n`.
    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self> {
        Self::new(rows.into_iter().enumerate().collect())
    }
}

impl TraceSource for InMemoryTrace {
    fn num_samples(&self) -> usize {
        self.num_samples
    }

    fn read(&self, channel: usize, start: usize, end: usize) -> Result<Vec<f32>> {
        check_range(start, end, self.num_samples)?;
        self.channels
            .get(&channel)
            .map(|buf| buf[start..end].to_vec())
            .ok_or(RecordingError::ChannelOutOfRange {
                channel,
                num_channels: self.channels.len(),
            })
    }
}

/// A trace plus sampling metadata and the channel set visible downstream.
#[derive(Debug, Clone)]
pub struct RecordingSource {
    sample_rate: f64,
    total_channels: usize,
    visible: Vec<usize>,
    groups: Option<ChannelGroupMap>,
    trace: Arc<dyn TraceSource>,
}

impl RecordingSource {
    /// Wrap a trace; all `total_channels` channels start out visible.
    pub fn from_trace(
        trace: Arc<dyn TraceSource>,
        sample_rate: f64,
        total_channels: usize,
    ) -> Result<Self> {
        if !(sample_rate > 0.0) || !sample_rate.is_finite() {
            return Err(RecordingError::InvalidLayout(format!(
                "sample rate must be positive, got {}",
                sample_rate
            )));
        }
        if total_channels == 0 {
            return Err(RecordingError::InvalidLayout(
                "channel count must be positive".to_string(),
            ));
        }
        Ok(Self {
            sample_rate,
            total_channels,
            visible: (0..total_channels).collect(),
            groups: None,
            trace,
        })
    }

    /// Open a raw binary file described by `layout`.
    pub fn open_binary<P: AsRef<Path>>(path: P, layout: &RecordingLayout) -> Result<Self> {
        let trace = BinaryTrace::open(path, layout)?;
        Self::from_trace(Arc::new(trace), layout.sample_rate, layout.num_channels)
    }

    /// In-memory recording with channels `0..rows.len()`.
    pub fn from_rows(rows: Vec<Vec<f32>>, sample_rate: f64) -> Result<Self> {
        let n = rows.len();
        Self::from_trace(Arc::new(InMemoryTrace::from_rows(rows)?), sample_rate, n)
    }

    #[inline]
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    #[inline]
    pub fn num_samples(&self) -> usize {
        self.trace.num_samples()
    }

    pub fn duration_secs(&self) -> f64 {
        self.num_samples() as f64 / self.sample_rate
    }

    /// Channel count of the underlying storage.
    #[inline]
    pub fn total_channels(&self) -> usize {
        self.total_channels
    }

    /// Currently visible channel ids, in ascending order.
    #[inline]
    pub fn channel_ids(&self) -> &[usize] {
        &self.visible
    }

    #[inline]
    pub fn num_channels(&self) -> usize {
        self.visible.len()
    }

    #[inline]
    pub fn is_visible(&self, channel: usize) -> bool {
        self.visible.binary_search(&channel).is_ok()
    }

    #[inline]
    pub fn channel_groups(&self) -> Option<&ChannelGroupMap> {
        self.groups.as_ref()
    }

    /// Group id attached to a visible channel, if a grouping is applied.
    pub fn group_of(&self, channel: usize) -> Option<u32> {
        self.groups.as_ref().and_then(|g| g.group_of(channel).ok())
    }

    /// Narrow to the channels of `map` and attach their group identity.
    pub fn with_channel_groups(&self, map: ChannelGroupMap) -> Result<Self> {
        if let Some(max) = map.max_channel() {
            if max >= self.total_channels {
                return Err(RecordingError::ChannelOutOfRange {
                    channel: max,
                    num_channels: self.total_channels,
                });
            }
        }
        let visible: BTreeSet<usize> = map.channels().into_iter().collect();
        Ok(Self {
            visible: visible.into_iter().collect(),
            groups: Some(map),
            ..self.clone()
        })
    }

    /// Same metadata, new visible set and grouping.
    pub(crate) fn with_visible(&self, visible: Vec<usize>, groups: Option<ChannelGroupMap>) -> Self {
        Self {
            visible,
            groups,
            ..self.clone()
        }
    }

    /// Storage behind this view, including channels outside it.
    pub(crate) fn trace(&self) -> Arc<dyn TraceSource> {
        Arc::clone(&self.trace)
    }

    /// Same metadata and channel view, samples served from another trace.
    pub(crate) fn with_trace(&self, trace: Arc<dyn TraceSource>) -> Self {
        Self {
            trace,
            ..self.clone()
        }
    }

    fn check_visible(&self, channel: usize) -> Result<()> {
        if !self.is_visible(channel) {
            return Err(RecordingError::ChannelNotVisible(channel));
        }
        Ok(())
    }

    /// Write the visible channels to `path` as sample-major `float32`.
    /// Returns the number of frames written.
    pub fn materialize<P: AsRef<Path>>(&self, path: P) -> std::result::Result<usize, WriteError> {
        write_recording_dat(path.as_ref(), self)
    }

    /// Samples of one visible channel.
    pub fn read_channel(&self, channel: usize, range: Range<usize>) -> Result<Vec<f32>> {
        self.check_visible(channel)?;
        self.trace.read(channel, range.start, range.end)
    }

    /// Samples of several visible channels, one row per channel.
    pub fn read_channels(&self, channels: &[usize], range: Range<usize>) -> Result<Vec<Vec<f32>>> {
        for &c in channels {
            self.check_visible(c)?;
        }
        self.trace.read_many(channels, range.start, range.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_i16(path: &Path, values: &[i16]) {
        let mut file = File::create(path).unwrap();
        for v in values {
            file.write_all(&v.to_le_bytes()).unwrap();
        }
    }

    fn layout(time_axis: TimeAxis) -> RecordingLayout {
        RecordingLayout {
            dtype: SampleDtype::Int16,
            sample_rate: 1000.0,
            num_channels: 2,
            time_axis,
            offset_bytes: 0,
        }
    }

    #[test]
    fn test_sample_major_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trace.bin");
        // frames: (ch0, ch1)
        write_i16(&path, &[1, 10, 2, 20, 3, 30, 4, 40]);

        let rec = RecordingSource::open_binary(&path, &layout(TimeAxis::SampleMajor)).unwrap();
        assert_eq!(rec.num_samples(), 4);
        assert_eq!(rec.read_channel(1, 1..3).unwrap(), vec![20.0, 30.0]);
        assert_eq!(
            rec.read_channels(&[1, 0], 0..2).unwrap(),
            vec![vec![10.0, 20.0], vec![1.0, 2.0]]
        );
    }

    #[test]
    fn test_channel_major_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trace.bin");
        write_i16(&path, &[1, 2, 3, 4, 10, 20, 30, 40]);

        let rec = RecordingSource::open_binary(&path, &layout(TimeAxis::ChannelMajor)).unwrap();
        assert_eq!(rec.read_channel(0, 2..4).unwrap(), vec![3.0, 4.0]);
        assert_eq!(rec.read_channel(1, 0..4).unwrap(), vec![10.0, 20.0, 30.0, 40.0]);
    }

    #[test]
    fn test_offset_and_size_check() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trace.bin");
        write_i16(&path, &[7, 1, 10, 2, 20]);

        let mut lay = layout(TimeAxis::SampleMajor);
        assert!(matches!(
            RecordingSource::open_binary(&path, &lay),
            Err(RecordingError::SizeMismatch { .. })
        ));

        lay.offset_bytes = 2;
        let rec = RecordingSource::open_binary(&path, &lay).unwrap();
        assert_eq!(rec.read_channel(0, 0..2).unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_missing_file_names_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session_A17.bin");

        match RecordingSource::open_binary(&path, &layout(TimeAxis::SampleMajor)) {
            Err(err @ RecordingError::Open { .. }) => {
                assert!(err.to_string().contains("session_A17.bin"));
            }
            other => panic!("Expected Open error, got {other:?}"),
        }
    }

    #[test]
    fn test_out_of_bounds_reads() {
        let rec = RecordingSource::from_rows(vec![vec![0.0; 10]], 100.0).unwrap();
        assert!(matches!(
            rec.read_channel(0, 5..11),
            Err(RecordingError::TimeRangeOutOfBounds { .. })
        ));
        assert!(matches!(
            rec.read_channel(3, 0..1),
            Err(RecordingError::ChannelNotVisible(3))
        ));
    }

    #[test]
    fn test_with_channel_groups_narrows_visible_set() {
        let rec = RecordingSource::from_rows(vec![vec![0.0; 4]; 8], 100.0).unwrap();
        let map = ChannelGroupMap::from_groups(&[vec![4, 5], vec![1]]).unwrap();

        let grouped = rec.with_channel_groups(map).unwrap();
        assert_eq!(grouped.channel_ids(), &[1, 4, 5]);
        assert_eq!(grouped.group_of(5), Some(0));
        assert_eq!(grouped.group_of(1), Some(1));
        // Original view untouched
        assert_eq!(rec.num_channels(), 8);
        assert!(rec.channel_groups().is_none());
    }

    #[test]
    fn test_with_channel_groups_rejects_unknown_channels() {
        let rec = RecordingSource::from_rows(vec![vec![0.0; 4]; 4], 100.0).unwrap();
        let map = ChannelGroupMap::from_groups(&[vec![2, 3, 4]]).unwrap();

        assert!(matches!(
            rec.with_channel_groups(map),
            Err(RecordingError::ChannelOutOfRange { channel: 4, .. })
        ));
    }

    #[test]
    fn test_invalid_sample_rate() {
        assert!(RecordingSource::from_rows(vec![vec![0.0]], 0.0).is_err());
    }
}
