//! Configuration surface
//!
//! Every stage reads its own parameter block; `SorterConfig` aggregates them
//! and is what gets loaded from JSON. Defaults follow a 4-channel tetrode
//! style recording sampled around 10-30 kHz.

use crate::dataio::RetryPolicy;
use crate::error::{Result, TdcError};
use crate::types::{PeakSign, WindowGeometry};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Signal preprocessor parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessorParams {
    /// Samples per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Filtered history kept in front of every chunk (samples)
    #[serde(default = "default_backward_span")]
    pub backward_span: usize,

    /// High-pass cutoff (Hz)
    #[serde(default = "default_highpass_freq")]
    pub highpass_freq: f64,

    /// Optional low-pass cutoff (Hz), turning the filter into a band-pass
    #[serde(default)]
    pub lowpass_freq: Option<f64>,

    /// Butterworth order
    #[serde(default = "default_filter_order")]
    pub filter_order: usize,

    /// Subtract the per-sample median across channels
    #[serde(default)]
    pub common_ref_removal: bool,
}

fn default_chunk_size() -> usize {
    1024
}
fn default_backward_span() -> usize {
    256
}
fn default_highpass_freq() -> f64 {
    300.0
}
fn default_filter_order() -> usize {
    4
}

impl Default for PreprocessorParams {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            backward_span: default_backward_span(),
            highpass_freq: default_highpass_freq(),
            lowpass_freq: None,
            filter_order: default_filter_order(),
            common_ref_removal: false,
        }
    }
}

/// Minimum distance between two peaks
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeakSpan {
    Seconds(f64),
    Samples(usize),
}

impl PeakSpan {
    pub fn to_samples(self, sample_rate: f64) -> usize {
        match self {
            PeakSpan::Seconds(s) => ((s * sample_rate).round() as usize).max(1),
            PeakSpan::Samples(n) => n.max(1),
        }
    }
}

/// Peak detector parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorParams {
    #[serde(default)]
    pub peak_sign: PeakSign,

    /// Threshold as a multiple of the noise MAD
    #[serde(default = "default_relative_threshold")]
    pub relative_threshold: f32,

    #[serde(default = "default_peak_span")]
    pub peak_span: PeakSpan,
}

fn default_relative_threshold() -> f32 {
    5.0
}
fn default_peak_span() -> PeakSpan {
    PeakSpan::Seconds(0.0005)
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            peak_sign: PeakSign::default(),
            relative_threshold: default_relative_threshold(),
            peak_span: default_peak_span(),
        }
    }
}

/// How peaks are picked for the catalogue sample pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingMode {
    /// Evenly spaced over the full peak list
    Uniform,
    /// Evenly spaced within each segment, quota proportional to its peak count
    Stratified,
}

/// Waveform extraction parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaveformParams {
    #[serde(default = "default_n_left")]
    pub n_left: usize,

    #[serde(default = "default_n_right")]
    pub n_right: usize,

    /// Upper bound on the number of waveforms kept in the pool
    #[serde(default = "default_nb_max")]
    pub nb_max: usize,

    #[serde(default = "default_sampling")]
    pub sampling: SamplingMode,
}

fn default_n_left() -> usize {
    20
}
fn default_n_right() -> usize {
    30
}
fn default_nb_max() -> usize {
    10_000
}
fn default_sampling() -> SamplingMode {
    SamplingMode::Uniform
}

impl Default for WaveformParams {
    fn default() -> Self {
        Self {
            n_left: default_n_left(),
            n_right: default_n_right(),
            nb_max: default_nb_max(),
            sampling: default_sampling(),
        }
    }
}

impl WaveformParams {
    pub fn geometry(&self) -> WindowGeometry {
        WindowGeometry::new(self.n_left, self.n_right)
    }

    fn width_with(&self, search: usize) -> usize {
        self.n_left + self.n_right + 2 * search
    }
}

/// Feature projection selector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ProjectionMethod {
    Pca { n_components: usize },
    PeakMax,
}

impl Default for ProjectionMethod {
    fn default() -> Self {
        Self::Pca { n_components: 5 }
    }
}

/// Clustering selector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ClusteringMethod {
    Kmeans {
        n_clusters: usize,
        #[serde(default = "default_max_iter")]
        max_iter: usize,
        #[serde(default = "default_seed")]
        seed: u64,
    },
    Gmm {
        n_components: usize,
        #[serde(default = "default_max_iter")]
        max_iter: usize,
        #[serde(default = "default_seed")]
        seed: u64,
    },
    Density {
        eps: f64,
        #[serde(default = "default_min_samples")]
        min_samples: usize,
    },
}

fn default_max_iter() -> usize {
    300
}
fn default_seed() -> u64 {
    42
}
fn default_min_samples() -> usize {
    5
}

impl Default for ClusteringMethod {
    fn default() -> Self {
        Self::Kmeans {
            n_clusters: 8,
            max_iter: default_max_iter(),
            seed: default_seed(),
        }
    }
}

/// Template construction parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogueParams {
    /// Peak amplitude (noise units) above which a channel belongs to the
    /// template support
    #[serde(default = "default_support_threshold")]
    pub support_threshold: f32,

    /// Clusters with fewer members produce no template
    #[serde(default = "default_min_cluster_size")]
    pub min_cluster_size: usize,
}

fn default_support_threshold() -> f32 {
    2.0
}
fn default_min_cluster_size() -> usize {
    5
}

impl Default for CatalogueParams {
    fn default() -> Self {
        Self {
            support_threshold: default_support_threshold(),
            min_cluster_size: default_min_cluster_size(),
        }
    }
}

/// Peeler parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeelerParams {
    /// Maximum number of detect-and-subtract passes per chunk
    #[serde(default = "default_n_peel_level")]
    pub n_peel_level: usize,

    /// Minimum normalised matching score, in noise-sigma units
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f32,

    #[serde(default = "default_amplitude_min")]
    pub amplitude_min: f32,

    #[serde(default = "default_amplitude_max")]
    pub amplitude_max: f32,

    /// Lags explored on each side of a residual peak
    #[serde(default = "default_alignment_search")]
    pub alignment_search: usize,
}

fn default_n_peel_level() -> usize {
    2
}
fn default_match_threshold() -> f32 {
    5.0
}
fn default_amplitude_min() -> f32 {
    0.6
}
fn default_amplitude_max() -> f32 {
    1.6
}
fn default_alignment_search() -> usize {
    2
}

impl Default for PeelerParams {
    fn default() -> Self {
        Self {
            n_peel_level: default_n_peel_level(),
            match_threshold: default_match_threshold(),
            amplitude_min: default_amplitude_min(),
            amplitude_max: default_amplitude_max(),
            alignment_search: default_alignment_search(),
        }
    }
}

/// Complete configuration for a sorting session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SorterConfig {
    /// Channel group processed by this session
    #[serde(default)]
    pub channel_group: usize,
    #[serde(default)]
    pub preprocessor: PreprocessorParams,
    #[serde(default)]
    pub detector: DetectorParams,
    #[serde(default)]
    pub waveforms: WaveformParams,
    #[serde(default)]
    pub projection: ProjectionMethod,
    #[serde(default)]
    pub clustering: ClusteringMethod,
    #[serde(default)]
    pub catalogue: CatalogueParams,
    #[serde(default)]
    pub peeler: PeelerParams,
    /// Read retry policy against the signal store
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl SorterConfig {
    pub fn from_json_str(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Context the Peeler needs in front of a candidate peak
    pub fn peeler_context(&self, sample_rate: f64) -> usize {
        let span = self.detector.peak_span.to_samples(sample_rate);
        self.waveforms.width_with(self.peeler.alignment_search) + 2 * span + 2
    }

    /// Reject contradictory parameters before any processing starts
    pub fn validate(&self, sample_rate: f64) -> Result<()> {
        let pre = &self.preprocessor;
        let nyquist = sample_rate / 2.0;

        if sample_rate <= 0.0 || !sample_rate.is_finite() {
            return Err(TdcError::Configuration(format!(
                "Sample rate must be positive, got {}",
                sample_rate
            )));
        }
        if pre.chunk_size == 0 {
            return Err(TdcError::Configuration("chunk_size must be > 0".to_string()));
        }
        if pre.filter_order == 0 {
            return Err(TdcError::Configuration("filter_order must be > 0".to_string()));
        }
        if pre.highpass_freq <= 0.0 || pre.highpass_freq >= nyquist {
            return Err(TdcError::Configuration(format!(
                "High-pass cutoff ({} Hz) must lie in (0, {}) Hz",
                pre.highpass_freq, nyquist
            )));
        }
        if let Some(lowpass) = pre.lowpass_freq {
            if lowpass <= pre.highpass_freq || lowpass >= nyquist {
                return Err(TdcError::Configuration(format!(
                    "Low-pass cutoff ({} Hz) must lie in ({}, {}) Hz",
                    lowpass, pre.highpass_freq, nyquist
                )));
            }
        }

        if self.detector.relative_threshold <= 0.0 {
            return Err(TdcError::Configuration(
                "relative_threshold must be positive".to_string(),
            ));
        }
        let span = self.detector.peak_span.to_samples(sample_rate);
        if pre.backward_span < 2 * span {
            return Err(TdcError::Configuration(format!(
                "backward_span ({}) must cover twice the peak span ({})",
                pre.backward_span, span
            )));
        }

        let width = self.waveforms.geometry().width();
        if self.waveforms.n_left == 0 || self.waveforms.n_right == 0 {
            return Err(TdcError::Configuration(
                "Waveform margins must both be > 0".to_string(),
            ));
        }
        if width > pre.chunk_size {
            return Err(TdcError::Configuration(format!(
                "Waveform window ({} samples) exceeds chunk size ({})",
                width, pre.chunk_size
            )));
        }

        match &self.projection {
            ProjectionMethod::Pca { n_components } if *n_components == 0 => {
                return Err(TdcError::Configuration(
                    "n_components must be > 0".to_string(),
                ));
            }
            _ => {}
        }
        match &self.clustering {
            ClusteringMethod::Kmeans { n_clusters: 0, .. }
            | ClusteringMethod::Gmm { n_components: 0, .. } => {
                return Err(TdcError::Configuration(
                    "Cluster count must be > 0".to_string(),
                ));
            }
            ClusteringMethod::Density { eps, .. } if *eps <= 0.0 => {
                return Err(TdcError::Configuration("eps must be positive".to_string()));
            }
            _ => {}
        }

        if self.catalogue.support_threshold <= 0.0 {
            return Err(TdcError::Configuration(
                "support_threshold must be positive".to_string(),
            ));
        }

        let peeler = &self.peeler;
        if peeler.n_peel_level == 0 {
            return Err(TdcError::Configuration("n_peel_level must be > 0".to_string()));
        }
        if peeler.amplitude_min <= 0.0 || peeler.amplitude_min >= peeler.amplitude_max {
            return Err(TdcError::Configuration(format!(
                "Amplitude bounds [{}, {}] are invalid",
                peeler.amplitude_min, peeler.amplitude_max
            )));
        }
        let context = self.peeler_context(sample_rate);
        if pre.backward_span < context {
            return Err(TdcError::Configuration(format!(
                "backward_span ({}) is shorter than the peeling context ({})",
                pre.backward_span, context
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SorterConfig::default();
        assert!(config.validate(20_000.0).is_ok());
    }

    #[test]
    fn test_window_larger_than_chunk_rejected() {
        let mut config = SorterConfig::default();
        config.preprocessor.chunk_size = 32;
        let err = config.validate(20_000.0).unwrap_err();
        assert!(matches!(err, TdcError::Configuration(_)));
    }

    #[test]
    fn test_cutoff_above_nyquist_rejected() {
        let mut config = SorterConfig::default();
        config.preprocessor.highpass_freq = 6_000.0;
        assert!(config.validate(10_000.0).is_err());
    }

    #[test]
    fn test_json_with_partial_fields() {
        let json = r#"{
            "preprocessor": { "chunk_size": 512, "highpass_freq": 400.0 },
            "detector": { "peak_sign": "-", "relative_threshold": 4.0, "peak_span": { "samples": 5 } },
            "projection": { "method": "pca", "n_components": 3 },
            "clustering": { "method": "kmeans", "n_clusters": 3 }
        }"#;
        let config = SorterConfig::from_json_str(json).unwrap();
        assert_eq!(config.preprocessor.chunk_size, 512);
        assert_eq!(config.preprocessor.backward_span, 256);
        assert_eq!(config.detector.peak_span, PeakSpan::Samples(5));
        assert_eq!(config.projection, ProjectionMethod::Pca { n_components: 3 });
        assert!(matches!(
            config.clustering,
            ClusteringMethod::Kmeans { n_clusters: 3, max_iter: 300, seed: 42 }
        ));
    }

    #[test]
    fn test_peak_span_seconds() {
        assert_eq!(PeakSpan::Seconds(0.0005).to_samples(20_000.0), 10);
        assert_eq!(PeakSpan::Samples(0).to_samples(20_000.0), 1);
    }
}
