//! Signal conditioning stages that derive new recordings.
//!
//! Every stage returns a new [`RecordingSource`]; the input is left untouched.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, info};
use thiserror::Error;

use crate::core::recording::{RecordingError, RecordingSource, TraceSource};
use crate::core::transforms::{bandpass_sections, filtfilt, BiquadCoeffs};

/// Filter settling margin, in periods of the high-pass cutoff.
const PAD_CUTOFF_PERIODS: f64 = 10.0;

/// Errors that can occur during preprocessing.
#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("invalid band {low_hz} Hz - {high_hz} Hz: {reason}")]
    InvalidBand {
        low_hz: f64,
        high_hz: f64,
        reason: String,
    },

    #[error("channel {0} is not visible and cannot be excluded")]
    ChannelNotVisible(usize),
}

/// Zero-phase band-passed view of another trace, filtered on read.
///
/// Every read filters the requested span plus `pad` samples on each side,
/// clamped to the recording, so windowed reads agree with a whole-trace
/// filter and nothing is held in memory between reads.
#[derive(Debug)]
pub struct FilteredTrace {
    inner: Arc<dyn TraceSource>,
    sections: [BiquadCoeffs; 2],
    pad: usize,
}

impl FilteredTrace {
    pub fn new(inner: Arc<dyn TraceSource>, sample_rate: f64, low_hz: f64, high_hz: f64) -> Self {
        Self {
            inner,
            sections: bandpass_sections(sample_rate, low_hz, high_hz),
            pad: (PAD_CUTOFF_PERIODS * sample_rate / low_hz).ceil() as usize,
        }
    }

    /// Samples read on each side of a requested span.
    pub fn pad(&self) -> usize {
        self.pad
    }
}

impl TraceSource for FilteredTrace {
    fn num_samples(&self) -> usize {
        self.inner.num_samples()
    }

    fn read(&self, channel: usize, start: usize, end: usize) -> Result<Vec<f32>, RecordingError> {
        self.read_many(&[channel], start, end)
            .map(|mut rows| rows.pop().unwrap_or_default())
    }

    fn read_many(
        &self,
        channels: &[usize],
        start: usize,
        end: usize,
    ) -> Result<Vec<Vec<f32>>, RecordingError> {
        let n = self.inner.num_samples();
        if start > end || end > n {
            return Err(RecordingError::TimeRangeOutOfBounds {
                start,
                end,
                num_samples: n,
            });
        }
        if start == end {
            return self.inner.read_many(channels, start, end);
        }

        let from = start.saturating_sub(self.pad);
        let to = end.saturating_add(self.pad).min(n);
        let rows = self.inner.read_many(channels, from, to)?;
        Ok(rows
            .iter()
            .map(|raw| filtfilt(&self.sections, raw)[start - from..end - from].to_vec())
            .collect())
    }
}

/// Band-pass every visible channel with a zero-phase Butterworth filter.
///
/// The result keeps the channel view and grouping of `recording` and filters
/// lazily through a [`FilteredTrace`].
pub fn bandpass(
    recording: &RecordingSource,
    low_hz: f64,
    high_hz: f64,
) -> Result<RecordingSource, PreprocessError> {
    let invalid = |reason: &str| PreprocessError::InvalidBand {
        low_hz,
        high_hz,
        reason: reason.to_string(),
    };

    if !(low_hz > 0.0) {
        return Err(invalid("low cutoff must be positive"));
    }
    if low_hz >= high_hz {
        return Err(invalid("low cutoff must be below high cutoff"));
    }
    let nyquist = recording.sample_rate() / 2.0;
    if high_hz >= nyquist {
        return Err(invalid(&format!("high cutoff must be below Nyquist ({} Hz)", nyquist)));
    }

    let trace = FilteredTrace::new(recording.trace(), recording.sample_rate(), low_hz, high_hz);
    debug!(
        "bandpass {}-{} Hz over {} channels x {} samples, {} samples of padding per read",
        low_hz,
        high_hz,
        recording.num_channels(),
        recording.num_samples(),
        trace.pad()
    );
    info!(
        "Band-passing {} channels at {}-{} Hz",
        recording.num_channels(),
        low_hz,
        high_hz
    );

    Ok(recording.with_trace(Arc::new(trace)))
}

/// Remove channels from the visible set, recomputing group membership.
///
/// Surviving channels keep their original group ids; a group left with no
/// channels disappears from the grouping.
pub fn exclude_channels(
    recording: &RecordingSource,
    channel_ids: &[usize],
) -> Result<RecordingSource, PreprocessError> {
    for &channel in channel_ids {
        if !recording.is_visible(channel) {
            return Err(PreprocessError::ChannelNotVisible(channel));
        }
    }

    let removed: HashSet<usize> = channel_ids.iter().copied().collect();
    let visible: Vec<usize> = recording
        .channel_ids()
        .iter()
        .copied()
        .filter(|c| !removed.contains(c))
        .collect();
    let groups = recording
        .channel_groups()
        .map(|map| map.without_channels(&removed));

    info!(
        "Excluded {} channels, {} remain",
        removed.len(),
        visible.len()
    );

    Ok(recording.with_visible(visible, groups))
}

/// The highest-numbered visible channel of each group.
///
/// On Axona tetrode recordings this is the channel repurposed for EEG.
pub fn last_channel_per_group(recording: &RecordingSource) -> Vec<usize> {
    recording
        .channel_groups()
        .map(|map| {
            map.iter()
                .filter_map(|(_, channels)| {
                    channels
                        .iter()
                        .copied()
                        .filter(|&c| recording.is_visible(c))
                        .max()
                })
                .collect()
        })
        .unwrap_or_default()
}
