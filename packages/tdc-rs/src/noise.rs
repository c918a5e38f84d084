//! Noise estimation
//!
//! Robust per-channel location and scale (median, MAD scaled to a Gaussian
//! sigma) of the filtered signal over an initial window. The profile turns a
//! relative threshold into an absolute one and drives signal normalisation.

use crate::config::PreprocessorParams;
use crate::dataio::{read_with_retry, segment_info, RetryPolicy, SignalStore};
use crate::error::{Result, TdcError};
use crate::preprocessor::SignalPreprocessor;
use crate::types::SignalKind;
use ndarray::{ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Consistency constant between MAD and the standard deviation of a Gaussian
pub const MAD_TO_SIGMA: f32 = 1.4826;

/// Per-channel baseline of the filtered signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseProfile {
    pub median: Vec<f32>,
    pub mad: Vec<f32>,
}

impl NoiseProfile {
    /// Compute the profile of a `[samples × channels]` block
    pub fn from_block(block: ArrayView2<f32>) -> Result<Self> {
        if block.nrows() == 0 {
            return Err(TdcError::InsufficientData {
                requested: 1,
                available: 0,
            });
        }

        let mut median = Vec::with_capacity(block.ncols());
        let mut mad = Vec::with_capacity(block.ncols());

        for (channel, column) in block.axis_iter(Axis(1)).enumerate() {
            let mut values: Vec<f32> = column.iter().copied().filter(|v| v.is_finite()).collect();
            if values.is_empty() {
                return Err(TdcError::NumericInstability(format!(
                    "Channel {} has no finite sample in the noise window",
                    channel
                )));
            }
            let (m, d) = median_mad(&mut values);
            let scale = if d > f32::EPSILON {
                d
            } else {
                log::warn!("Channel {} has zero MAD, using unit scale", channel);
                1.0
            };
            median.push(m);
            mad.push(scale);
        }

        Ok(Self { median, mad })
    }

    pub fn n_channels(&self) -> usize {
        self.mad.len()
    }

    /// Absolute per-channel threshold for a relative one
    pub fn absolute_thresholds(&self, relative: f32) -> Vec<f32> {
        self.median
            .iter()
            .zip(&self.mad)
            .map(|(m, d)| m + relative * d)
            .collect()
    }
}

/// Median and Gaussian-equivalent MAD. Reorders `values`.
pub fn median_mad(values: &mut [f32]) -> (f32, f32) {
    let median = median_in_place(values);
    for v in values.iter_mut() {
        *v = (*v - median).abs();
    }
    let mad = median_in_place(values) * MAD_TO_SIGMA;
    (median, mad)
}

pub(crate) fn median_in_place(values: &mut [f32]) -> f32 {
    let n = values.len();
    if n == 0 {
        return f32::NAN;
    }
    let mid = n / 2;
    let (lower, upper, _) = values.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
    let upper = *upper;
    if n % 2 == 1 {
        upper
    } else {
        let lower_max = lower.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        0.5 * (lower_max + upper)
    }
}

/// Runs the preprocessing filters over an initial window and measures noise
pub struct NoiseEstimator;

impl NoiseEstimator {
    /// Estimate the profile from the first `duration` seconds of a segment.
    ///
    /// A duration longer than the segment is clamped with a warning.
    pub fn estimate(
        store: &dyn SignalStore,
        retry: &RetryPolicy,
        segment: usize,
        channel_group: usize,
        duration: f64,
        params: &PreprocessorParams,
    ) -> Result<NoiseProfile> {
        let (sample_rate, available) = segment_info(store, segment)?;
        let requested = (duration * sample_rate).round().max(0.0) as usize;

        let length = clamp_to_available(requested, available)?;
        let n_channels = store.group_size(channel_group).map_err(|e| TdcError::Io {
            segment,
            attempts: 1,
            message: e.to_string(),
        })?;

        log::info!(
            "Estimating noise on segment {} over {} samples ({} channels)",
            segment,
            length,
            n_channels
        );

        let mut preprocessor = SignalPreprocessor::new(params, sample_rate, n_channels)?;
        let mut filtered = Vec::with_capacity(length * n_channels);
        let mut rows = 0;
        let mut start = 0;
        while start < length {
            let end = (start + params.chunk_size).min(length);
            let raw = read_with_retry(
                store,
                retry,
                segment,
                channel_group,
                start..end,
                SignalKind::Raw,
            )?;
            match preprocessor.process(raw) {
                Ok(chunk) => {
                    rows += chunk.data.nrows();
                    filtered.extend(chunk.data.iter().copied());
                }
                Err(TdcError::NumericInstability(reason)) => {
                    log::warn!("Skipping chunk in noise window: {}", reason);
                }
                Err(e) => return Err(e),
            }
            start = end;
        }

        let block = ArrayView2::from_shape((rows, n_channels), &filtered)
            .map_err(|e| TdcError::NumericInstability(e.to_string()))?;
        NoiseProfile::from_block(block)
    }
}

/// Clamp a requested sample count to what the segment holds
pub(crate) fn clamp_to_available(requested: usize, available: usize) -> Result<usize> {
    if available == 0 {
        return Err(TdcError::InsufficientData {
            requested,
            available,
        });
    }
    if requested > available {
        log::warn!(
            "{}",
            TdcError::InsufficientData {
                requested,
                available
            }
        );
        log::warn!("Clamping to the {} available samples", available);
        return Ok(available);
    }
    Ok(requested.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_median_even_and_odd() {
        assert_eq!(median_in_place(&mut [3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median_in_place(&mut [4.0, 1.0, 3.0, 2.0]), 2.5);
    }

    #[test]
    fn test_median_mad_ignores_outliers() {
        let mut values = vec![1.0, 2.0, 3.0, 4.0, 5.0, 1000.0, -1000.0];
        let (median, mad) = median_mad(&mut values);
        assert_eq!(median, 3.0);
        assert!((mad - 2.0 * MAD_TO_SIGMA).abs() < 1e-5);
    }

    #[test]
    fn test_profile_and_thresholds() {
        let block = Array2::from_shape_fn((101, 2), |(i, c)| (i as f32 - 50.0) * (c + 1) as f32);
        let profile = NoiseProfile::from_block(block.view()).unwrap();
        assert_eq!(profile.median, vec![0.0, 0.0]);
        let thresholds = profile.absolute_thresholds(4.0);
        assert!((thresholds[1] - 2.0 * thresholds[0]).abs() < 1e-3);
    }

    #[test]
    fn test_clamp_warns_instead_of_failing() {
        assert_eq!(clamp_to_available(500, 200).unwrap(), 200);
        assert_eq!(clamp_to_available(100, 200).unwrap(), 100);
        assert!(clamp_to_available(100, 0).is_err());
    }
}
