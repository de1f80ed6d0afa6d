//! Per-channel signal transforms: IIR filtering and robust noise estimates.
//!
//! Filters operate in `f64` internally and return `f32` buffers; inputs are
//! never modified in place.

/// Scale factor turning a median absolute deviation into a Gaussian sigma.
pub const MAD_TO_SIGMA: f64 = 0.6745;

/// Second-order section coefficients, normalised so that `a0 == 1`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BiquadCoeffs {
    pub b: [f64; 3],
    pub a: [f64; 3],
}

impl BiquadCoeffs {
    /// Second-order Butterworth low-pass (bilinear transform).
    pub fn butterworth_lowpass(sample_rate: f64, cutoff: f64) -> Self {
        let k = (std::f64::consts::PI * cutoff / sample_rate).tan();
        let k2 = k * k;
        let sqrt2 = std::f64::consts::SQRT_2;
        let norm = 1.0 / (1.0 + sqrt2 * k + k2);

        Self {
            b: [k2 * norm, 2.0 * k2 * norm, k2 * norm],
            a: [1.0, 2.0 * (k2 - 1.0) * norm, (1.0 - sqrt2 * k + k2) * norm],
        }
    }

    /// Second-order Butterworth high-pass (bilinear transform).
    pub fn butterworth_highpass(sample_rate: f64, cutoff: f64) -> Self {
        let k = (std::f64::consts::PI * cutoff / sample_rate).tan();
        let k2 = k * k;
        let sqrt2 = std::f64::consts::SQRT_2;
        let norm = 1.0 / (1.0 + sqrt2 * k + k2);

        Self {
            b: [norm, -2.0 * norm, norm],
            a: [1.0, 2.0 * (k2 - 1.0) * norm, (1.0 - sqrt2 * k + k2) * norm],
        }
    }
}

/// Biquad section in transposed direct form II.
#[derive(Clone, Debug)]
pub struct Biquad {
    coeffs: BiquadCoeffs,
    state: [f64; 2],
}

impl Biquad {
    pub fn new(coeffs: BiquadCoeffs) -> Self {
        Self {
            coeffs,
            state: [0.0, 0.0],
        }
    }

    /// Process a single sample.
    #[inline]
    pub fn filter(&mut self, input: f64) -> f64 {
        let BiquadCoeffs { b, a } = self.coeffs;
        let output = b[0] * input + self.state[0];
        self.state[0] = b[1] * input - a[1] * output + self.state[1];
        self.state[1] = b[2] * input - a[2] * output;
        output
    }

    /// Prime the state for a constant input `x` so the output starts settled.
    fn prime(&mut self, x: f64) {
        let BiquadCoeffs { b, a } = self.coeffs;
        let gain = (b[0] + b[1] + b[2]) / (1.0 + a[1] + a[2]);
        let y = gain * x;
        self.state[1] = b[2] * x - a[2] * y;
        self.state[0] = b[1] * x - a[1] * y + self.state[1];
    }

    pub fn reset(&mut self) {
        self.state = [0.0, 0.0];
    }
}

fn run_cascade(sections: &[BiquadCoeffs], data: &mut [f64]) {
    for coeffs in sections {
        let mut section = Biquad::new(*coeffs);
        if let Some(&first) = data.first() {
            section.prime(first);
        }
        for x in data.iter_mut() {
            *x = section.filter(*x);
        }
    }
}

/// Zero-phase filtering: run the cascade forward, then backward.
pub fn filtfilt(sections: &[BiquadCoeffs], samples: &[f32]) -> Vec<f32> {
    let mut data: Vec<f64> = samples.iter().map(|&x| x as f64).collect();
    run_cascade(sections, &mut data);
    data.reverse();
    run_cascade(sections, &mut data);
    data.reverse();
    data.into_iter().map(|x| x as f32).collect()
}

/// Butterworth band-pass cascade: high-pass at `low_hz`, low-pass at `high_hz`.
pub fn bandpass_sections(sample_rate: f64, low_hz: f64, high_hz: f64) -> [BiquadCoeffs; 2] {
    [
        BiquadCoeffs::butterworth_highpass(sample_rate, low_hz),
        BiquadCoeffs::butterworth_lowpass(sample_rate, high_hz),
    ]
}

/// Zero-phase Butterworth band-pass (high-pass at `low_hz`, low-pass at `high_hz`).
pub fn bandpass_zero_phase(samples: &[f32], sample_rate: f64, low_hz: f64, high_hz: f64) -> Vec<f32> {
    filtfilt(&bandpass_sections(sample_rate, low_hz, high_hz), samples)
}

/// Median of a slice (mean of the two middle values for even lengths).
pub fn median(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Robust noise level: median absolute deviation from the median, scaled to sigma.
pub fn noise_level(samples: &[f32]) -> f32 {
    let center = median(samples);
    let deviations: Vec<f32> = samples.iter().map(|x| (x - center).abs()).collect();
    (median(&deviations) as f64 / MAD_TO_SIGMA) as f32
}
