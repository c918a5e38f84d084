//! Feature projection of waveforms
//!
//! Waveforms are handled flattened (`[waveform × (sample·channel)]`, samples
//! major). A projector is fit once on the pool and keeps its basis so any
//! later subset is projected consistently.

use crate::config::ProjectionMethod;
use crate::error::{Result, TdcError};
use crate::types::WindowGeometry;
use crate::waveforms::WaveformPool;
use nalgebra::{linalg::SymmetricEigen, DMatrix};
use ndarray::{Array1, Array2, ArrayView2, Axis};

/// Dimensionality reduction strategy
pub trait Projector: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn is_fitted(&self) -> bool;

    /// Number of features produced per waveform
    fn n_features(&self) -> usize;

    fn fit(&mut self, data: ArrayView2<f32>) -> Result<()>;

    fn transform(&self, data: ArrayView2<f32>) -> Result<Array2<f32>>;

    /// Fit on `data` unless a basis already exists, then project it
    fn fit_or_apply(&mut self, data: ArrayView2<f32>) -> Result<Array2<f32>> {
        if !self.is_fitted() {
            self.fit(data)?;
        }
        self.transform(data)
    }
}

/// Build the projector selected in the configuration
pub fn build_projector(
    method: &ProjectionMethod,
    geometry: WindowGeometry,
    n_channels: usize,
) -> Box<dyn Projector> {
    match method {
        ProjectionMethod::Pca { n_components } => Box::new(Pca::new(*n_components)),
        ProjectionMethod::PeakMax => Box::new(PeakMax::new(geometry, n_channels)),
    }
}

/// Project only the pool rows listed in `selection`, in that order
pub fn project_selection(
    projector: &dyn Projector,
    pool: &WaveformPool,
    selection: &[usize],
) -> Result<Array2<f32>> {
    if !projector.is_fitted() {
        return Err(TdcError::Configuration(format!(
            "Projector '{}' must be fitted before projecting a selection",
            projector.name()
        )));
    }
    if let Some(&bad) = selection.iter().find(|&&k| k >= pool.len()) {
        return Err(TdcError::Configuration(format!(
            "Selection index {} outside pool of {}",
            bad,
            pool.len()
        )));
    }
    let flat = pool.flattened();
    projector.transform(flat.select(Axis(0), selection).view())
}

/// Principal component projection
#[derive(Debug, Clone)]
pub struct Pca {
    n_components: usize,
    mean: Option<Array1<f64>>,
    /// `[component × dimension]`, unit rows
    components: Array2<f64>,
    explained_variance: Vec<f64>,
}

impl Pca {
    pub fn new(n_components: usize) -> Self {
        Self {
            n_components,
            mean: None,
            components: Array2::zeros((0, 0)),
            explained_variance: Vec::new(),
        }
    }

    pub fn components(&self) -> &Array2<f64> {
        &self.components
    }

    pub fn explained_variance(&self) -> &[f64] {
        &self.explained_variance
    }
}

impl Projector for Pca {
    fn name(&self) -> &'static str {
        "pca"
    }

    fn is_fitted(&self) -> bool {
        self.mean.is_some()
    }

    fn n_features(&self) -> usize {
        self.components.nrows()
    }

    fn fit(&mut self, data: ArrayView2<f32>) -> Result<()> {
        let rows: Vec<usize> = data
            .outer_iter()
            .enumerate()
            .filter(|(_, row)| row.iter().all(|v| v.is_finite()))
            .map(|(k, _)| k)
            .collect();
        if rows.len() < data.nrows() {
            log::warn!(
                "PCA fit skipping {} non-finite waveform(s)",
                data.nrows() - rows.len()
            );
        }
        if rows.len() < 2 {
            return Err(TdcError::InsufficientData {
                requested: 2,
                available: rows.len(),
            });
        }

        let n = rows.len();
        let dim = data.ncols();
        let mut k = self.n_components;
        if k > dim.min(n) {
            log::warn!(
                "{}",
                TdcError::InsufficientData {
                    requested: k,
                    available: dim.min(n)
                }
            );
            k = dim.min(n);
        }

        let x = data.select(Axis(0), &rows).mapv(|v| v as f64);
        let mean = x.mean_axis(Axis(0)).ok_or_else(|| {
            TdcError::NumericInstability("empty matrix in PCA fit".to_string())
        })?;
        let centered = &x - &mean;
        let cov = centered.t().dot(&centered) / (n as f64 - 1.0);

        let eigen = SymmetricEigen::new(DMatrix::from_fn(dim, dim, |i, j| cov[[i, j]]));
        let mut order: Vec<usize> = (0..dim).collect();
        order.sort_by(|&a, &b| {
            eigen.eigenvalues[b]
                .total_cmp(&eigen.eigenvalues[a])
                .then(a.cmp(&b))
        });

        let mut components = Array2::zeros((k, dim));
        let mut explained_variance = Vec::with_capacity(k);
        for (row, &idx) in order.iter().take(k).enumerate() {
            let vector = eigen.eigenvectors.column(idx);
            // Deterministic sign: largest-magnitude entry positive
            let pivot = vector
                .iter()
                .copied()
                .fold(0.0f64, |acc, v| if v.abs() > acc.abs() { v } else { acc });
            let sign = if pivot < 0.0 { -1.0 } else { 1.0 };
            for (j, v) in vector.iter().enumerate() {
                components[[row, j]] = sign * v;
            }
            explained_variance.push(eigen.eigenvalues[idx].max(0.0));
        }

        if components.iter().any(|v: &f64| !v.is_finite()) {
            return Err(TdcError::NumericInstability(
                "PCA basis is not finite".to_string(),
            ));
        }

        log::info!("PCA fitted: {} components over {} waveforms", k, n);
        self.mean = Some(mean);
        self.components = components;
        self.explained_variance = explained_variance;
        Ok(())
    }

    fn transform(&self, data: ArrayView2<f32>) -> Result<Array2<f32>> {
        let mean = self.mean.as_ref().ok_or_else(|| {
            TdcError::Configuration("PCA used before fit".to_string())
        })?;
        if data.ncols() != mean.len() {
            return Err(TdcError::Configuration(format!(
                "PCA fitted on {} dimensions, got {}",
                mean.len(),
                data.ncols()
            )));
        }
        let centered = data.mapv(|v| v as f64) - mean;
        let mut features = centered.dot(&self.components.t()).mapv(|v| v as f32);
        for (k, mut row) in features.outer_iter_mut().enumerate() {
            if row.iter().any(|v| !v.is_finite()) {
                log::warn!("Waveform {} projects to non-finite features, zeroed", k);
                row.fill(0.0);
            }
        }
        Ok(features)
    }
}

/// Value of every channel at the peak sample
#[derive(Debug, Clone)]
pub struct PeakMax {
    peak_offset: usize,
    n_channels: usize,
}

impl PeakMax {
    pub fn new(geometry: WindowGeometry, n_channels: usize) -> Self {
        Self {
            peak_offset: geometry.n_left,
            n_channels,
        }
    }
}

impl Projector for PeakMax {
    fn name(&self) -> &'static str {
        "peak_max"
    }

    fn is_fitted(&self) -> bool {
        true
    }

    fn n_features(&self) -> usize {
        self.n_channels
    }

    fn fit(&mut self, _data: ArrayView2<f32>) -> Result<()> {
        Ok(())
    }

    fn transform(&self, data: ArrayView2<f32>) -> Result<Array2<f32>> {
        let from = self.peak_offset * self.n_channels;
        let to = from + self.n_channels;
        if data.ncols() < to {
            return Err(TdcError::Configuration(format!(
                "Waveforms of {} values have no peak sample at offset {}",
                data.ncols(),
                self.peak_offset
            )));
        }
        Ok(data.slice(ndarray::s![.., from..to]).to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn line_pool() -> WaveformPool {
        // Every waveform is a scaled copy of one shape, plus a tiny offset
        let geometry = WindowGeometry::new(2, 3);
        let waveforms = Array3::from_shape_fn((30, 5, 2), |(k, s, c)| {
            let shape = [0.0, -1.0, -4.0, 2.0, 1.0][s] * (1.0 + c as f32);
            shape * (k as f32 - 15.0) + ((k + s + c) % 3) as f32 * 1e-3
        });
        WaveformPool::new(geometry, (0..30).collect(), waveforms).unwrap()
    }

    #[test]
    fn test_pca_finds_dominant_direction() {
        let pool = line_pool();
        let mut pca = Pca::new(3);
        let features = pca.fit_or_apply(pool.flattened().view()).unwrap();
        assert_eq!(features.dim(), (30, 3));

        let variance = pca.explained_variance();
        assert!(variance[0] > 1e3 * variance[1].max(1e-12));

        // First feature is monotonic in the scale factor
        let first: Vec<f32> = features.column(0).to_vec();
        let increasing = first.windows(2).all(|w| w[1] > w[0]);
        let decreasing = first.windows(2).all(|w| w[1] < w[0]);
        assert!(increasing || decreasing);
    }

    #[test]
    fn test_selection_reuses_basis() {
        let pool = line_pool();
        let mut pca = Pca::new(2);
        let all = pca.fit_or_apply(pool.flattened().view()).unwrap();
        let subset = project_selection(&pca, &pool, &[4, 17]).unwrap();
        for (row, k) in [4usize, 17].iter().enumerate() {
            for c in 0..2 {
                let expected = all[[*k, c]];
                assert!((subset[[row, c]] - expected).abs() < 1e-4 * expected.abs().max(1.0));
            }
        }
        assert!(project_selection(&pca, &pool, &[30]).is_err());
    }

    #[test]
    fn test_unfitted_selection_rejected() {
        let pool = line_pool();
        let pca = Pca::new(2);
        assert!(matches!(
            project_selection(&pca, &pool, &[0]),
            Err(TdcError::Configuration(_))
        ));
    }

    #[test]
    fn test_components_clamped_to_data() {
        let pool = line_pool();
        let mut pca = Pca::new(50);
        pca.fit(pool.flattened().view()).unwrap();
        assert_eq!(pca.n_features(), 10);
    }

    #[test]
    fn test_peak_max_reads_peak_sample() {
        let pool = line_pool();
        let projector = build_projector(&ProjectionMethod::PeakMax, pool.geometry(), 2);
        let features = projector.transform(pool.flattened().view()).unwrap();
        assert_eq!(features.dim(), (30, 2));
        assert_eq!(features[[0, 1]], pool.waveform(0)[[2, 1]]);
    }
}
