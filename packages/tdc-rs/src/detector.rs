//! Peak detection
//!
//! A sample is a peak when its rectified envelope (maximum across channels
//! after flipping to the polarity of interest) exceeds the threshold, is
//! strictly greater than every sample up to `span` before it and at least as
//! large as every sample up to `span` after it. Equal maxima inside one span
//! therefore resolve to the earliest index, and two peaks are always more
//! than `span` samples apart.
//!
//! The streaming detector defers every position whose right neighbourhood is
//! not yet known and evaluates it once the next chunk arrives, so chunked
//! detection gives the same peaks as [`detect_peaks`] on the whole segment.

use crate::config::DetectorParams;
use crate::types::{Peak, PeakSign};
use ndarray::ArrayView2;

#[derive(Debug, Clone, Copy, PartialEq)]
struct EnvelopeSample {
    value: f32,
    channel: usize,
}

fn envelope(block: ArrayView2<f32>, sign: PeakSign) -> Vec<EnvelopeSample> {
    block
        .rows()
        .into_iter()
        .map(|row| {
            let mut best = EnvelopeSample {
                value: f32::NEG_INFINITY,
                channel: 0,
            };
            for (channel, &v) in row.iter().enumerate() {
                let r = sign.rectify(v);
                if r > best.value {
                    best = EnvelopeSample { value: r, channel };
                }
            }
            best
        })
        .collect()
}

/// Whether `env[i]` is a peak, looking at most `span` samples each way and
/// never outside `env`
fn is_local_peak(env: &[EnvelopeSample], i: usize, span: usize, threshold: f32) -> bool {
    let value = env[i].value;
    if !(value > threshold) {
        return false;
    }
    let left = i.saturating_sub(span);
    if env[left..i].iter().any(|s| s.value >= value) {
        return false;
    }
    let right = (i + span + 1).min(env.len());
    !env[i + 1..right].iter().any(|s| s.value > value)
}

/// Single-pass reference detection over a whole `[samples × channels]` block
pub fn detect_peaks(
    signal: ArrayView2<f32>,
    segment: usize,
    sign: PeakSign,
    threshold: f32,
    span: usize,
) -> Vec<Peak> {
    let env = envelope(signal, sign);
    let mut peaks = Vec::new();
    let mut last: Option<usize> = None;
    for i in 0..env.len() {
        if is_local_peak(&env, i, span, threshold) && last.map_or(true, |p| i - p >= span) {
            peaks.push(make_peak(segment, i, env[i], sign));
            last = Some(i);
        }
    }
    peaks
}

fn make_peak(segment: usize, index: usize, sample: EnvelopeSample, sign: PeakSign) -> Peak {
    Peak {
        segment,
        index,
        channel: Some(sample.channel),
        sign,
        amplitude: sample.value,
    }
}

/// Streaming detector for one segment
#[derive(Debug, Clone)]
pub struct PeakDetector {
    segment: usize,
    sign: PeakSign,
    threshold: f32,
    span: usize,
    /// Envelope from `carry_start` up to the last fed sample
    carry: Vec<EnvelopeSample>,
    carry_start: usize,
    /// First position not yet evaluated
    next: usize,
    last_accepted: Option<usize>,
}

impl PeakDetector {
    /// `threshold` is absolute, in the units of the fed signal
    pub fn new(segment: usize, sign: PeakSign, threshold: f32, span: usize) -> Self {
        Self {
            segment,
            sign,
            threshold,
            span: span.max(1),
            carry: Vec::new(),
            carry_start: 0,
            next: 0,
            last_accepted: None,
        }
    }

    /// Detector for a normalised signal, where the relative threshold is
    /// already in noise units
    pub fn from_params(segment: usize, params: &DetectorParams, sample_rate: f64) -> Self {
        Self::new(
            segment,
            params.peak_sign,
            params.relative_threshold,
            params.peak_span.to_samples(sample_rate),
        )
    }

    pub fn span(&self) -> usize {
        self.span
    }

    /// Feed the chunk starting at absolute index `start` and return the
    /// peaks that became decidable.
    ///
    /// A gap before `start` (a skipped chunk) flushes pending positions as if
    /// the segment had ended there.
    pub fn process(&mut self, start: usize, chunk: ArrayView2<f32>) -> Vec<Peak> {
        let mut peaks = Vec::new();
        let fed_end = self.carry_start + self.carry.len();
        if start != fed_end {
            log::debug!(
                "Detector on segment {} jumped from {} to {}",
                self.segment,
                fed_end,
                start
            );
            peaks.extend(self.flush());
            self.carry.clear();
            self.carry_start = start;
            self.next = start;
        }

        self.carry.extend(envelope(chunk, self.sign));
        let end = self.carry_start + self.carry.len();
        let decidable = end.saturating_sub(self.span);
        self.evaluate_until(decidable, &mut peaks);

        // Keep what the pending positions still need on their left
        let keep_from = self.next.saturating_sub(self.span).max(self.carry_start);
        self.carry.drain(..keep_from - self.carry_start);
        self.carry_start = keep_from;

        peaks
    }

    /// Evaluate the positions left at the end of the segment
    pub fn flush(&mut self) -> Vec<Peak> {
        let mut peaks = Vec::new();
        let end = self.carry_start + self.carry.len();
        self.evaluate_until(end, &mut peaks);
        peaks
    }

    fn evaluate_until(&mut self, until: usize, peaks: &mut Vec<Peak>) {
        while self.next < until {
            let i = self.next - self.carry_start;
            if is_local_peak(&self.carry, i, self.span, self.threshold)
                && self.last_accepted.map_or(true, |p| self.next - p >= self.span)
            {
                peaks.push(make_peak(self.segment, self.next, self.carry[i], self.sign));
                self.last_accepted = Some(self.next);
            }
            self.next += 1;
        }
    }

    /// Restart at sample 0 of the segment
    pub fn reset(&mut self) {
        self.carry.clear();
        self.carry_start = 0;
        self.next = 0;
        self.last_accepted = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{s, Array2};

    fn spiky(len: usize, positions: &[(usize, usize, f32)]) -> Array2<f32> {
        let mut signal = Array2::<f32>::zeros((len, 3));
        for (i, mut row) in signal.rows_mut().into_iter().enumerate() {
            row[0] = ((i as f32) * 1.3).sin() * 0.5;
        }
        for &(pos, channel, amp) in positions {
            signal[[pos, channel]] = -amp;
            if pos > 0 {
                signal[[pos - 1, channel]] = -amp * 0.5;
            }
            signal[[pos + 1, channel]] = -amp * 0.4;
        }
        signal
    }

    fn streamed(signal: &Array2<f32>, chunk: usize, span: usize) -> Vec<Peak> {
        let mut detector = PeakDetector::new(0, PeakSign::Negative, 4.0, span);
        let mut peaks = Vec::new();
        let mut start = 0;
        while start < signal.nrows() {
            let end = (start + chunk).min(signal.nrows());
            peaks.extend(detector.process(start, signal.slice(s![start..end, ..])));
            start = end;
        }
        peaks.extend(detector.flush());
        peaks
    }

    #[test]
    fn test_detects_negative_peaks_on_best_channel() {
        let signal = spiky(200, &[(50, 1, 10.0), (120, 2, 7.0)]);
        let peaks = detect_peaks(signal.view(), 0, PeakSign::Negative, 4.0, 5);
        assert_eq!(peaks.len(), 2);
        assert_eq!(peaks[0].index, 50);
        assert_eq!(peaks[0].channel, Some(1));
        assert_eq!(peaks[0].amplitude, 10.0);
        assert_eq!(peaks[1].index, 120);
    }

    #[test]
    fn test_min_span_keeps_larger_peak() {
        let signal = spiky(100, &[(40, 0, 6.0), (43, 1, 9.0)]);
        let peaks = detect_peaks(signal.view(), 0, PeakSign::Negative, 4.0, 5);
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].index, 43);
    }

    #[test]
    fn test_tie_resolves_to_earliest() {
        let mut signal = Array2::<f32>::zeros((50, 1));
        signal[[20, 0]] = -8.0;
        signal[[22, 0]] = -8.0;
        let peaks = detect_peaks(signal.view(), 0, PeakSign::Negative, 4.0, 4);
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].index, 20);
    }

    #[test]
    fn test_streaming_matches_single_pass() {
        let positions: Vec<_> = (0..40).map(|k| (13 + k * 47, k % 3, 5.0 + (k % 4) as f32)).collect();
        let signal = spiky(2000, &positions);
        let reference = detect_peaks(signal.view(), 0, PeakSign::Negative, 4.0, 6);
        assert_eq!(reference.len(), 40);
        for chunk in [1, 7, 46, 47, 48, 500, 2000] {
            assert_eq!(streamed(&signal, chunk, 6), reference, "chunk size {}", chunk);
        }
    }

    #[test]
    fn test_peak_on_last_sample_is_flushed() {
        let mut signal = Array2::<f32>::zeros((30, 1));
        signal[[29, 0]] = -6.0;
        let peaks = streamed(&signal, 10, 3);
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].index, 29);
    }
}
