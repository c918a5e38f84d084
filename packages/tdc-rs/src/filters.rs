//! Digital filter implementations
//!
//! Causal Butterworth IIR filters built from second-order sections (biquads).
//! State is kept per channel so a signal can be filtered chunk by chunk with
//! exactly the same output as a single pass.

use crate::error::{Result, TdcError};
use ndarray::ArrayViewMut2;
use std::f64::consts::PI;

/// Second-order section (biquad) coefficients
/// Transfer function: H(z) = (b0 + b1*z^-1 + b2*z^-2) / (1 + a1*z^-1 + a2*z^-2)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoeffs {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

/// State for a single biquad section (Direct Form II Transposed)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct BiquadState {
    z1: f64,
    z2: f64,
}

/// Single biquad filter section
#[derive(Debug, Clone)]
pub struct BiquadFilter {
    coeffs: BiquadCoeffs,
    state: BiquadState,
}

impl BiquadFilter {
    pub fn new(coeffs: BiquadCoeffs) -> Self {
        Self {
            coeffs,
            state: BiquadState::default(),
        }
    }

    #[inline]
    pub fn process(&mut self, input: f64) -> f64 {
        let output = self.coeffs.b0 * input + self.state.z1;
        self.state.z1 = self.coeffs.b1 * input - self.coeffs.a1 * output + self.state.z2;
        self.state.z2 = self.coeffs.b2 * input - self.coeffs.a2 * output;
        output
    }

    pub fn reset(&mut self) {
        self.state = BiquadState::default();
    }

    /// Load the state this section holds after a long run of constant
    /// `input`; returns the matching constant output
    fn settle(&mut self, input: f64) -> f64 {
        let c = &self.coeffs;
        let gain = (c.b0 + c.b1 + c.b2) / (1.0 + c.a1 + c.a2);
        let output = gain * input;
        self.state.z2 = c.b2 * input - c.a2 * output;
        self.state.z1 = c.b1 * input - c.a1 * output + self.state.z2;
        output
    }
}

/// Cascaded second-order sections filter
#[derive(Debug, Clone)]
pub struct SosFilter {
    sections: Vec<BiquadFilter>,
}

impl SosFilter {
    pub fn new(sections: Vec<BiquadCoeffs>) -> Self {
        Self {
            sections: sections.into_iter().map(BiquadFilter::new).collect(),
        }
    }

    #[inline]
    pub fn process(&mut self, input: f64) -> f64 {
        let mut output = input;
        for section in &mut self.sections {
            output = section.process(output);
        }
        output
    }

    /// Filter a signal and return a new vector, advancing the state
    pub fn filter(&mut self, signal: &[f32]) -> Vec<f32> {
        signal.iter().map(|&s| self.process(s as f64) as f32).collect()
    }

    pub fn reset(&mut self) {
        for section in &mut self.sections {
            section.reset();
        }
    }

    /// Steady state for a constant `input`, so a signal resuming at that
    /// level produces no step response
    pub fn settle(&mut self, input: f64) {
        let mut level = input;
        for section in &mut self.sections {
            level = section.settle(level);
        }
    }

    pub fn n_sections(&self) -> usize {
        self.sections.len()
    }
}

/// Butterworth filter designer (bilinear transform with prewarping)
pub struct ButterworthFilter;

impl ButterworthFilter {
    pub fn lowpass(cutoff: f64, sample_rate: f64, order: usize) -> SosFilter {
        let wn = Self::prewarp(cutoff, sample_rate);
        SosFilter::new(Self::design_lowpass(wn, order))
    }

    pub fn highpass(cutoff: f64, sample_rate: f64, order: usize) -> SosFilter {
        let wn = Self::prewarp(cutoff, sample_rate);
        SosFilter::new(Self::design_highpass(wn, order))
    }

    pub fn bandpass(low: f64, high: f64, sample_rate: f64, order: usize) -> SosFilter {
        let mut sections = Self::design_highpass(Self::prewarp(low, sample_rate), order);
        sections.extend(Self::design_lowpass(Self::prewarp(high, sample_rate), order));
        SosFilter::new(sections)
    }

    fn prewarp(freq: f64, sample_rate: f64) -> f64 {
        (PI * freq / sample_rate).tan()
    }

    /// Damping term of the k-th conjugate pole pair: s^2 + q*s + 1
    fn pole_pair_damping(k: usize, order: usize) -> f64 {
        let theta = PI * (2.0 * k as f64 + 1.0) / (2.0 * order as f64);
        2.0 * theta.sin()
    }

    fn design_lowpass(wn: f64, order: usize) -> Vec<BiquadCoeffs> {
        let mut sections = Vec::with_capacity((order + 1) / 2);
        let wn2 = wn * wn;

        for k in 0..order / 2 {
            let q = Self::pole_pair_damping(k, order);
            let denom = 1.0 + q * wn + wn2;
            sections.push(BiquadCoeffs {
                b0: wn2 / denom,
                b1: 2.0 * wn2 / denom,
                b2: wn2 / denom,
                a1: 2.0 * (wn2 - 1.0) / denom,
                a2: (1.0 - q * wn + wn2) / denom,
            });
        }

        // Odd order: one real pole left
        if order % 2 == 1 {
            let k_coeff = wn / (1.0 + wn);
            sections.push(BiquadCoeffs {
                b0: k_coeff,
                b1: k_coeff,
                b2: 0.0,
                a1: (wn - 1.0) / (wn + 1.0),
                a2: 0.0,
            });
        }

        sections
    }

    fn design_highpass(wn: f64, order: usize) -> Vec<BiquadCoeffs> {
        let mut sections = Vec::with_capacity((order + 1) / 2);
        let wn2 = wn * wn;

        for k in 0..order / 2 {
            let q = Self::pole_pair_damping(k, order);
            let denom = 1.0 + q * wn + wn2;
            sections.push(BiquadCoeffs {
                b0: 1.0 / denom,
                b1: -2.0 / denom,
                b2: 1.0 / denom,
                a1: 2.0 * (wn2 - 1.0) / denom,
                a2: (1.0 - q * wn + wn2) / denom,
            });
        }

        if order % 2 == 1 {
            let k_coeff = 1.0 / (1.0 + wn);
            sections.push(BiquadCoeffs {
                b0: k_coeff,
                b1: -k_coeff,
                b2: 0.0,
                a1: (wn - 1.0) / (wn + 1.0),
                a2: 0.0,
            });
        }

        sections
    }
}

/// One filter per channel, sharing the same design
#[derive(Debug, Clone)]
pub struct FilterBank {
    channels: Vec<SosFilter>,
    /// Channels to settle on their next finite sample
    unsettled: Vec<bool>,
}

impl FilterBank {
    /// High-pass, or band-pass when a low-pass cutoff is given
    pub fn design(
        highpass: f64,
        lowpass: Option<f64>,
        sample_rate: f64,
        order: usize,
        n_channels: usize,
    ) -> Result<Self> {
        let nyquist = sample_rate / 2.0;
        if highpass <= 0.0 || highpass >= nyquist {
            return Err(TdcError::Configuration(format!(
                "High-pass cutoff ({} Hz) must be below Nyquist ({} Hz)",
                highpass, nyquist
            )));
        }

        let prototype = match lowpass {
            Some(low) => {
                if low <= highpass || low >= nyquist {
                    return Err(TdcError::Configuration(format!(
                        "Low-pass cutoff ({} Hz) must lie between {} and {} Hz",
                        low, highpass, nyquist
                    )));
                }
                ButterworthFilter::bandpass(highpass, low, sample_rate, order)
            }
            None => ButterworthFilter::highpass(highpass, sample_rate, order),
        };

        Ok(Self {
            channels: vec![prototype; n_channels],
            unsettled: vec![false; n_channels],
        })
    }

    pub fn n_channels(&self) -> usize {
        self.channels.len()
    }

    /// Filter a `[samples × channels]` block in place, advancing every state
    pub fn process_block(&mut self, mut block: ArrayViewMut2<f32>) {
        let channels = self.channels.iter_mut().zip(self.unsettled.iter_mut());
        for (mut column, (filter, unsettled)) in block.columns_mut().into_iter().zip(channels) {
            for sample in column.iter_mut() {
                if *unsettled && sample.is_finite() {
                    filter.settle(*sample as f64);
                    *unsettled = false;
                }
                *sample = filter.process(*sample as f64) as f32;
            }
        }
    }

    /// Zero every state, as at the start of a segment
    pub fn reset(&mut self) {
        for filter in &mut self.channels {
            filter.reset();
        }
        self.unsettled.fill(false);
    }

    /// Drop the state after a discontinuity; each channel restarts in steady
    /// state at its next finite sample
    pub fn restart(&mut self) {
        for filter in &mut self.channels {
            filter.reset();
        }
        self.unsettled.fill(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn rms(signal: &[f32]) -> f32 {
        (signal.iter().map(|x| x * x).sum::<f32>() / signal.len() as f32).sqrt()
    }

    #[test]
    fn test_highpass_blocks_dc() {
        let mut filter = ButterworthFilter::highpass(300.0, 10_000.0, 4);
        let out = filter.filter(&vec![1.0; 2000]);
        assert!(out[1999].abs() < 1e-3, "DC leaked: {}", out[1999]);
    }

    #[test]
    fn test_highpass_passes_spike_band() {
        let fs = 10_000.0;
        let mut filter = ButterworthFilter::highpass(300.0, fs, 4);
        let signal: Vec<f32> = (0..4000)
            .map(|i| (2.0 * PI * 2000.0 * i as f64 / fs).sin() as f32)
            .collect();
        let out = filter.filter(&signal);
        let ratio = rms(&out[1000..]) / rms(&signal[1000..]);
        assert!(ratio > 0.95 && ratio < 1.05, "gain {}", ratio);
    }

    #[test]
    fn test_odd_order_lowpass_is_stable() {
        let mut filter = ButterworthFilter::lowpass(1000.0, 10_000.0, 3);
        assert_eq!(filter.n_sections(), 2);
        let out = filter.filter(&vec![1.0; 500]);
        assert!((out[499] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_bank_chunked_equals_single_pass() {
        let signal = Array2::from_shape_fn((1000, 2), |(i, c)| {
            ((i as f32 * 0.37 + c as f32).sin() * 10.0) + (i % 7) as f32
        });

        let mut whole = signal.clone();
        let mut bank = FilterBank::design(300.0, Some(3000.0), 10_000.0, 4, 2).unwrap();
        bank.process_block(whole.view_mut());

        let mut chunked = signal.clone();
        let mut bank = FilterBank::design(300.0, Some(3000.0), 10_000.0, 4, 2).unwrap();
        for start in (0..1000).step_by(137) {
            let end = (start + 137).min(1000);
            bank.process_block(chunked.slice_mut(ndarray::s![start..end, ..]));
        }

        assert_eq!(whole, chunked);
    }

    #[test]
    fn test_settled_filter_has_no_step_response() {
        let mut highpass = ButterworthFilter::highpass(300.0, 10_000.0, 4);
        highpass.settle(50.0);
        let out = highpass.filter(&vec![50.0; 200]);
        assert!(out.iter().all(|v| v.abs() < 1e-3), "rms {}", rms(&out));

        let mut lowpass = ButterworthFilter::lowpass(1000.0, 10_000.0, 3);
        lowpass.settle(2.0);
        let out = lowpass.filter(&vec![2.0; 50]);
        assert!(out.iter().all(|v| (v - 2.0).abs() < 1e-3));
    }

    #[test]
    fn test_restart_settles_on_next_finite_sample() {
        let mut bank = FilterBank::design(300.0, None, 10_000.0, 4, 2).unwrap();
        let mut block = Array2::from_elem((100, 2), 50.0f32);
        block[[0, 1]] = f32::NAN;
        bank.restart();
        bank.process_block(block.view_mut());
        assert!(block.column(0).iter().all(|v| v.abs() < 1e-3));
        // Channel 1 waits past the NaN and settles on the next sample
        assert!(block[[0, 1]].is_nan());
        assert!(block.slice(ndarray::s![1.., 1]).iter().all(|v| v.abs() < 1e-3));
    }

    #[test]
    fn test_invalid_cutoffs() {
        assert!(FilterBank::design(6000.0, None, 10_000.0, 2, 1).is_err());
        assert!(FilterBank::design(300.0, Some(200.0), 10_000.0, 2, 1).is_err());
    }
}
