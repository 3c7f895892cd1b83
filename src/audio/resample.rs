//! Anti-aliased sample rate conversion for the recognition path.
//!
//! A fixed 101-tap Hamming-windowed FIR low-pass at the target Nyquist runs
//! ahead of linear interpolation, so 44.1 kHz microphone audio collapses to
//! 16 kHz without aliasing the sibilants the phoneme model cares about. The
//! whole path is deterministic: identical input always yields identical
//! output.

use std::f64::consts::PI;

/// Filter order; odd so the group delay is a whole number of samples.
const FILTER_TAPS: usize = 101;

/// Convert `input` from `from_rate` to `to_rate`.
///
/// Output samples are clamped to the 16-bit range. Equal rates, a zero rate,
/// or empty input pass the samples through untouched.
pub fn resample(input: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if input.is_empty() || from_rate == 0 || to_rate == 0 || from_rate == to_rate {
        return input.to_vec();
    }

    let ratio = f64::from(from_rate) / f64::from(to_rate);
    let out_len = (input.len() as f64 / ratio) as usize;
    let filtered = low_pass(input, from_rate, to_rate);

    let mut output = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src = i as f64 * ratio;
        let idx = src as usize;
        let frac = src - idx as f64;

        let sample = if idx + 1 < filtered.len() {
            (1.0 - frac) * filtered[idx] + frac * filtered[idx + 1]
        } else {
            filtered[idx]
        };

        output.push(sample.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16);
    }
    output
}

/// Convert 16-bit samples to float amplitude in `[-1, 1)`.
pub fn samples_to_float(input: &[i16]) -> Vec<f32> {
    input.iter().map(|&s| f32::from(s) / 32_768.0).collect()
}

/// FIR low-pass at the target Nyquist, zero-padded at both edges to cancel
/// the filter group delay. Each call filters in isolation, so the padding
/// leaves a short startup and teardown transient at the edges instead of
/// carrying convolution state between quanta.
fn low_pass(input: &[i16], from_rate: u32, to_rate: u32) -> Vec<f64> {
    // Corner at the target Nyquist, as a fraction of the source rate. When
    // upsampling the corner caps at the source Nyquist and the filter
    // reduces to identity.
    let normalized_cutoff = (f64::from(to_rate) / (2.0 * f64::from(from_rate))).min(0.5);
    let coeffs = fir_low_pass_coefficients(normalized_cutoff, FILTER_TAPS);

    let mut padded = vec![0.0f64; input.len() + FILTER_TAPS - 1];
    for (i, &sample) in input.iter().enumerate() {
        padded[i + (FILTER_TAPS - 1) / 2] = f64::from(sample);
    }

    let mut filtered = vec![0.0f64; input.len()];
    for (i, out) in filtered.iter_mut().enumerate() {
        let mut acc = 0.0;
        for (j, coeff) in coeffs.iter().enumerate() {
            acc += padded[i + j] * coeff;
        }
        *out = acc;
    }
    filtered
}

/// Hamming-windowed sinc taps normalized to unit DC gain.
fn fir_low_pass_coefficients(cutoff: f64, taps: usize) -> Vec<f64> {
    let m = (taps - 1) as f64;
    let mut coeffs = Vec::with_capacity(taps);

    for i in 0..taps {
        let n = i as f64 - m / 2.0;
        let sinc = if n == 0.0 {
            2.0 * cutoff
        } else {
            (2.0 * PI * cutoff * n).sin() / (PI * n)
        };
        let window = 0.54 - 0.46 * (2.0 * PI * i as f64 / m).cos();
        coeffs.push(sinc * window);
    }

    let sum: f64 = coeffs.iter().sum();
    if sum != 0.0 {
        for coeff in coeffs.iter_mut() {
            *coeff /= sum;
        }
    }
    coeffs
}

#[cfg(test)]
pub(super) fn sine_wave(freq: f64, rate: u32, samples: usize, amplitude: f64) -> Vec<i16> {
    (0..samples)
        .map(|i| {
            let t = i as f64 / f64::from(rate);
            (amplitude * (2.0 * PI * freq * t).sin()) as i16
        })
        .collect()
}

#[cfg(test)]
pub(super) fn zero_crossings(samples: &[i16]) -> usize {
    samples
        .windows(2)
        .filter(|pair| (pair[0] < 0) != (pair[1] < 0))
        .count()
}
