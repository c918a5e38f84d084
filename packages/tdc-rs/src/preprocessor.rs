//! Chunked signal preprocessing
//!
//! 1. Causal Butterworth high-pass (or band-pass), state carried across chunks
//! 2. Optional common-reference removal (per-sample median across channels)
//! 3. Normalisation to MAD units once a noise profile is attached
//!
//! Every step is either causal with carried state or instantaneous, so
//! feeding a segment in any chunking yields bit-identical output.

use crate::config::PreprocessorParams;
use crate::error::{Result, TdcError};
use crate::filters::FilterBank;
use crate::noise::{median_in_place, NoiseProfile};
use ndarray::{concatenate, s, Array2, Axis};

/// Output of one `process` call
#[derive(Debug, Clone)]
pub struct ProcessedChunk {
    /// Absolute index of the first sample of `data`
    pub start: usize,
    /// Preprocessed samples for the new chunk, `[samples × channels]`
    pub data: Array2<f32>,
    /// Up to `backward_span` preprocessed samples preceding `start`
    pub backward: Array2<f32>,
}

impl ProcessedChunk {
    pub fn end(&self) -> usize {
        self.start + self.data.nrows()
    }

    /// Absolute index of the first row of `backward`
    pub fn backward_start(&self) -> usize {
        self.start - self.backward.nrows()
    }

    /// History followed by the new samples, with its absolute start index
    pub fn with_history(&self) -> (usize, Array2<f32>) {
        let joined = concatenate(Axis(0), &[self.backward.view(), self.data.view()])
            .unwrap_or_else(|_| self.data.clone());
        (self.backward_start(), joined)
    }
}

/// Streaming preprocessor for one (segment, channel group)
#[derive(Debug, Clone)]
pub struct SignalPreprocessor {
    filters: FilterBank,
    common_ref_removal: bool,
    normalization: Option<NoiseProfile>,
    backward_span: usize,
    history: Array2<f32>,
    position: usize,
}

impl SignalPreprocessor {
    pub fn new(params: &PreprocessorParams, sample_rate: f64, n_channels: usize) -> Result<Self> {
        let filters = FilterBank::design(
            params.highpass_freq,
            params.lowpass_freq,
            sample_rate,
            params.filter_order,
            n_channels,
        )?;

        Ok(Self {
            filters,
            common_ref_removal: params.common_ref_removal,
            normalization: None,
            backward_span: params.backward_span,
            history: Array2::zeros((0, n_channels)),
            position: 0,
        })
    }

    /// Normalise output to `(x - median) / mad` with the given profile
    pub fn with_noise(mut self, profile: NoiseProfile) -> Result<Self> {
        if profile.n_channels() != self.filters.n_channels() {
            return Err(TdcError::Configuration(format!(
                "Noise profile has {} channels, preprocessor has {}",
                profile.n_channels(),
                self.filters.n_channels()
            )));
        }
        self.normalization = Some(profile);
        Ok(self)
    }

    pub fn n_channels(&self) -> usize {
        self.filters.n_channels()
    }

    /// Absolute index of the next sample to be fed
    pub fn position(&self) -> usize {
        self.position
    }

    /// Process the next contiguous raw chunk.
    ///
    /// A chunk producing non-finite values yields `NumericInstability`; the
    /// stream position still advances, so the caller can skip it and
    /// continue. The filters restart in steady state at the next chunk's
    /// first sample.
    pub fn process(&mut self, raw: Array2<f32>) -> Result<ProcessedChunk> {
        if raw.ncols() != self.n_channels() {
            return Err(TdcError::Configuration(format!(
                "Chunk has {} channels, expected {}",
                raw.ncols(),
                self.n_channels()
            )));
        }

        let start = self.position;
        let n_samples = raw.nrows();
        self.position += n_samples;

        let mut data = raw;
        self.filters.process_block(data.view_mut());

        if self.common_ref_removal && data.ncols() > 1 {
            let mut scratch = vec![0.0f32; data.ncols()];
            for mut row in data.rows_mut() {
                for (dst, v) in scratch.iter_mut().zip(row.iter()) {
                    *dst = *v;
                }
                let reference = median_in_place(&mut scratch);
                row.mapv_inplace(|v| v - reference);
            }
        }

        if let Some(profile) = &self.normalization {
            for (mut column, (median, mad)) in data
                .columns_mut()
                .into_iter()
                .zip(profile.median.iter().zip(&profile.mad))
            {
                column.mapv_inplace(|v| (v - median) / mad);
            }
        }

        if data.iter().any(|v| !v.is_finite()) {
            log::warn!(
                "Non-finite values in chunk [{}..{}], restarting filters",
                start,
                start + n_samples
            );
            self.filters.restart();
            self.history = Array2::zeros((0, self.n_channels()));
            return Err(TdcError::NumericInstability(format!(
                "chunk [{}..{}] produced non-finite samples",
                start,
                start + n_samples
            )));
        }

        let backward = self.history.clone();
        self.push_history(&data);

        Ok(ProcessedChunk {
            start,
            data,
            backward,
        })
    }

    fn push_history(&mut self, data: &Array2<f32>) {
        if self.backward_span == 0 {
            return;
        }
        let joined = if data.nrows() >= self.backward_span {
            data.slice(s![data.nrows() - self.backward_span.., ..]).to_owned()
        } else {
            let joined = concatenate(Axis(0), &[self.history.view(), data.view()])
                .unwrap_or_else(|_| data.clone());
            let keep = joined.nrows().min(self.backward_span);
            joined.slice(s![joined.nrows() - keep.., ..]).to_owned()
        };
        self.history = joined;
    }

    /// Forget filter state and history, restarting at sample 0
    pub fn reset(&mut self) {
        self.filters.reset();
        self.history = Array2::zeros((0, self.n_channels()));
        self.position = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(chunk_size: usize, common_ref_removal: bool) -> PreprocessorParams {
        PreprocessorParams {
            chunk_size,
            backward_span: 64,
            highpass_freq: 300.0,
            lowpass_freq: None,
            filter_order: 4,
            common_ref_removal,
        }
    }

    fn signal() -> Array2<f32> {
        Array2::from_shape_fn((3000, 3), |(i, c)| {
            let t = i as f32;
            (t * 0.9 + c as f32).sin() * 5.0 + (t * 0.01).sin() * 50.0 + c as f32
        })
    }

    fn run_chunked(raw: &Array2<f32>, chunk: usize, profile: &NoiseProfile) -> Array2<f32> {
        let mut pre = SignalPreprocessor::new(&params(chunk, true), 10_000.0, 3)
            .unwrap()
            .with_noise(profile.clone())
            .unwrap();
        let mut parts = Vec::new();
        let mut start = 0;
        while start < raw.nrows() {
            let end = (start + chunk).min(raw.nrows());
            let out = pre.process(raw.slice(s![start..end, ..]).to_owned()).unwrap();
            assert_eq!(out.start, start);
            assert!(out.backward.nrows() <= 64);
            parts.push(out.data);
            start = end;
        }
        let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
        concatenate(Axis(0), &views).unwrap()
    }

    #[test]
    fn test_chunking_is_transparent() {
        let raw = signal();
        let profile = NoiseProfile {
            median: vec![0.1, 0.2, 0.3],
            mad: vec![2.0, 3.0, 4.0],
        };
        let whole = run_chunked(&raw, 3000, &profile);
        for chunk in [100, 257, 1024] {
            let chunked = run_chunked(&raw, chunk, &profile);
            assert_eq!(whole, chunked, "chunk size {}", chunk);
        }
    }

    #[test]
    fn test_common_reference_zeroes_shared_signal() {
        let raw = Array2::from_shape_fn((500, 3), |(i, _)| (i as f32 * 0.7).sin());
        let mut pre = SignalPreprocessor::new(&params(500, true), 10_000.0, 3).unwrap();
        let out = pre.process(raw).unwrap();
        assert!(out.data.iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn test_history_tracks_previous_samples() {
        let raw = signal();
        let mut pre = SignalPreprocessor::new(&params(100, false), 10_000.0, 3).unwrap();
        let first = pre.process(raw.slice(s![0..100, ..]).to_owned()).unwrap();
        let second = pre.process(raw.slice(s![100..200, ..]).to_owned()).unwrap();
        assert_eq!(second.backward_start(), 36);
        assert_eq!(second.backward, first.data.slice(s![36.., ..]));
        let (origin, joined) = second.with_history();
        assert_eq!(origin, 36);
        assert_eq!(joined.nrows(), 164);
    }

    #[test]
    fn test_non_finite_chunk_is_reported_and_skippable() {
        let mut raw = signal();
        raw[[150, 1]] = f32::NAN;
        let mut pre = SignalPreprocessor::new(&params(100, false), 10_000.0, 3).unwrap();
        assert!(pre.process(raw.slice(s![0..100, ..]).to_owned()).is_ok());
        let err = pre.process(raw.slice(s![100..200, ..]).to_owned()).unwrap_err();
        assert!(matches!(err, TdcError::NumericInstability(_)));
        let next = pre.process(raw.slice(s![200..300, ..]).to_owned()).unwrap();
        assert_eq!(next.start, 200);
        assert!(next.data.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_skipped_chunk_leaves_no_step_response() {
        // Large DC offset with small in-band activity
        let mut raw = Array2::from_shape_fn((4000, 2), |(i, c)| {
            let t = i as f32;
            50.0 + 0.3 * (t * 1.3 + c as f32 * 0.5).sin() + 0.2 * (t * 2.9).sin()
        });
        let run = |raw: &Array2<f32>| {
            let mut pre = SignalPreprocessor::new(&params(500, false), 10_000.0, 2).unwrap();
            let mut tail = Vec::new();
            for start in (0..4000).step_by(500) {
                match pre.process(raw.slice(s![start..start + 500, ..]).to_owned()) {
                    Ok(chunk) if start >= 2500 => tail.extend(chunk.data.iter().copied()),
                    _ => {}
                }
            }
            tail.iter().fold(0.0f32, |acc, v| acc.max(v.abs()))
        };

        let clean = run(&raw);
        raw[[2200, 0]] = f32::NAN;
        let skipped = run(&raw);
        assert!(clean < 1.0, "clean {}", clean);
        assert!(skipped < clean + 1.0, "skipped {} clean {}", skipped, clean);
    }
}
