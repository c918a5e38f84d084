use serde::{Deserialize, Serialize};

/// Label carried by spikes moved to the trash. Trashed spikes stay in the
/// dataset but never contribute to a centroid.
pub const LABEL_TRASH: i64 = -1;

/// Label of detected peaks that were not drawn into the waveform pool
pub const LABEL_UNCLASSIFIED: i64 = -10;

/// Polarity of the spikes to detect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeakSign {
    #[serde(alias = "-")]
    Negative,
    #[serde(alias = "+")]
    Positive,
}

impl PeakSign {
    /// Flip a sample so that the polarity of interest is positive
    #[inline]
    pub fn rectify(self, value: f32) -> f32 {
        match self {
            PeakSign::Negative => -value,
            PeakSign::Positive => value,
        }
    }
}

impl Default for PeakSign {
    fn default() -> Self {
        Self::Negative
    }
}

/// Which flavour of signal to read from the storage collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Raw,
    Processed,
}

/// A detected threshold crossing, prior to labelling
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    pub segment: usize,
    /// Absolute sample index inside the segment
    pub index: usize,
    /// Channel holding the extremum; `None` for a purely global detection
    pub channel: Option<usize>,
    pub sign: PeakSign,
    /// Rectified amplitude at the peak, in normalised units
    pub amplitude: f32,
}

/// Waveform window around a peak: `n_left` samples before the peak sample
/// and `n_right` samples from it (peak included).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowGeometry {
    pub n_left: usize,
    pub n_right: usize,
}

impl WindowGeometry {
    pub fn new(n_left: usize, n_right: usize) -> Self {
        Self { n_left, n_right }
    }

    pub fn width(&self) -> usize {
        self.n_left + self.n_right
    }

    /// Sample range covered by a window centred on `index`, if it does not
    /// fall off the front of the segment
    pub fn span_at(&self, index: usize) -> Option<std::ops::Range<usize>> {
        let start = index.checked_sub(self.n_left)?;
        Some(start..index + self.n_right)
    }
}

/// One accepted spike in the Peeler output
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Spike {
    pub segment: usize,
    /// Absolute sample index of the template peak
    pub index: usize,
    pub label: i64,
    /// Sub-sample offset in `[-0.5, 0.5]`
    pub jitter: f32,
    pub amplitude: f32,
}

/// Row of the peak list: (segment, index, time, label)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeakRow {
    pub segment: usize,
    pub index: usize,
    pub time: f64,
    pub label: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_span() {
        let geometry = WindowGeometry::new(5, 10);
        assert_eq!(geometry.width(), 15);
        assert_eq!(geometry.span_at(20), Some(15..30));
        assert_eq!(geometry.span_at(3), None);
    }

    #[test]
    fn test_peak_sign_from_symbol() {
        let sign: PeakSign = serde_json::from_str("\"-\"").unwrap();
        assert_eq!(sign, PeakSign::Negative);
        assert_eq!(sign.rectify(-3.0), 3.0);
    }
}
