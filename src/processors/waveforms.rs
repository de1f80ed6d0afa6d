//! Spike-aligned waveform snippets and unit templates.

use crate::core::recording::{RecordingError, RecordingSource};

/// Samples before and after each spike covered by a snippet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub before: usize,
    pub after: usize,
}

impl Window {
    pub fn from_ms(sample_rate: f64, ms_before: f64, ms_after: f64) -> Self {
        Self {
            before: (ms_before * sample_rate / 1000.0).round() as usize,
            after: (ms_after * sample_rate / 1000.0).round() as usize,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.before + self.after
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Mean waveform of one unit on a set of channels.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub channels: Vec<usize>,
    /// `data[i][t]`: channel `channels[i]`, window sample `t`.
    pub data: Vec<Vec<f32>>,
    /// Spikes that contributed to the mean.
    pub num_spikes: usize,
}

impl Template {
    /// Largest absolute value on each channel.
    pub fn peak_amplitudes(&self) -> Vec<f32> {
        self.data
            .iter()
            .map(|row| row.iter().fold(0.0f32, |m, v| m.max(v.abs())))
            .collect()
    }

    /// Index into `channels` of the channel with the largest peak.
    pub fn best_channel_index(&self) -> Option<usize> {
        self.peak_amplitudes()
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1).then(b.0.cmp(&a.0)))
            .map(|(i, _)| i)
    }

    /// Signed template value at the spike time on each channel.
    pub fn amplitude_at(&self, offset: usize) -> Vec<f32> {
        self.data
            .iter()
            .map(|row| row.get(offset).copied().unwrap_or(0.0))
            .collect()
    }
}

/// Evenly spaced subset of at most `max` spikes, keeping the first one.
pub fn subsample_spikes(spike_train: &[u64], max: Option<usize>) -> Vec<u64> {
    match max {
        Some(max) if max > 0 && spike_train.len() > max => {
            let step = spike_train.len().div_ceil(max);
            spike_train.iter().step_by(step).copied().collect()
        }
        _ => spike_train.to_vec(),
    }
}

/// Snippets around each spike, `[spike][channel][sample]`.
///
/// Spikes whose window does not fit inside the recording are skipped.
pub fn extract_snippets(
    recording: &RecordingSource,
    channels: &[usize],
    spike_train: &[u64],
    window: Window,
) -> Result<Vec<Vec<Vec<f32>>>, RecordingError> {
    let n = recording.num_samples();
    spike_train
        .iter()
        .filter_map(|&s| usize::try_from(s).ok())
        .filter(|&s| {
            s >= window.before && s.checked_add(window.after).is_some_and(|end| end <= n)
        })
        .map(|s| recording.read_channels(channels, s - window.before..s + window.after))
        .collect()
}

/// Mean waveform over (a subset of) a unit's spikes. `None` when no spike
/// has a complete window.
pub fn compute_template(
    recording: &RecordingSource,
    channels: &[usize],
    spike_train: &[u64],
    window: Window,
    max_spikes: Option<usize>,
) -> Result<Option<Template>, RecordingError> {
    let spikes = subsample_spikes(spike_train, max_spikes);
    let snippets = extract_snippets(recording, channels, &spikes, window)?;
    if snippets.is_empty() {
        return Ok(None);
    }

    let mut sum = vec![vec![0.0f64; window.len()]; channels.len()];
    for snippet in &snippets {
        for (acc, row) in sum.iter_mut().zip(snippet) {
            for (a, &v) in acc.iter_mut().zip(row) {
                *a += v as f64;
            }
        }
    }

    let count = snippets.len() as f64;
    Ok(Some(Template {
        channels: channels.to_vec(),
        data: sum
            .into_iter()
            .map(|row| row.into_iter().map(|v| (v / count) as f32).collect())
            .collect(),
        num_spikes: snippets.len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording() -> RecordingSource {
        let mut ch0 = vec![0.0f32; 100];
        let mut ch1 = vec![0.0f32; 100];
        for &t in &[20usize, 50] {
            ch0[t] = -8.0;
            ch1[t] = 2.0;
        }
        ch0[50] = -4.0;
        RecordingSource::from_rows(vec![ch0, ch1], 1000.0).unwrap()
    }

    #[test]
    fn test_window_from_ms() {
        let w = Window::from_ms(30_000.0, 0.2, 0.8);
        assert_eq!(w, Window { before: 6, after: 24 });
        assert_eq!(w.len(), 30);
    }

    #[test]
    fn test_template_is_mean_of_snippets() {
        let rec = recording();
        let window = Window { before: 2, after: 3 };

        let template = compute_template(&rec, &[0, 1], &[20, 50], window, None)
            .unwrap()
            .unwrap();

        assert_eq!(template.num_spikes, 2);
        assert_eq!(template.data[0][2], -6.0);
        assert_eq!(template.data[1][2], 2.0);
        assert_eq!(template.best_channel_index(), Some(0));
        assert_eq!(template.amplitude_at(2), vec![-6.0, 2.0]);
    }

    #[test]
    fn test_edge_spikes_are_skipped() {
        let rec = recording();
        let window = Window { before: 5, after: 5 };

        let snippets = extract_snippets(&rec, &[0], &[2, 20, 98], window).unwrap();
        assert_eq!(snippets.len(), 1);
        assert!(compute_template(&rec, &[0], &[1, 99], window, None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_spike_at_max_sample_is_skipped() {
        let rec = recording();
        let window = Window { before: 2, after: 3 };

        let snippets = extract_snippets(&rec, &[0, 1], &[20, u64::MAX], window).unwrap();
        assert_eq!(snippets.len(), 1);
        assert!(compute_template(&rec, &[0], &[u64::MAX], window, None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_subsample_spikes() {
        let train: Vec<u64> = (0..10).collect();
        assert_eq!(subsample_spikes(&train, Some(4)), vec![0, 3, 6, 9]);
        assert_eq!(subsample_spikes(&train, None).len(), 10);
        assert_eq!(subsample_spikes(&train, Some(20)).len(), 10);
    }
}
