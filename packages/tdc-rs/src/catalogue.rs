//! Catalogue: the frozen template set consumed by the Peeler
//!
//! A catalogue is immutable once built. Stores hand out `Arc<Catalogue>`
//! snapshots and assign monotonically increasing versions; a reader never
//! sees a catalogue that is still being written.

use crate::config::PreprocessorParams;
use crate::error::{Result, TdcError};
use crate::noise::NoiseProfile;
use crate::types::{PeakSign, WindowGeometry};
use crate::waveforms::MIN_WINDOW_WIDTH;
use chrono::{DateTime, Utc};
use ndarray::{Array2, ArrayView2, Axis};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use uuid::Uuid;

/// Centroid waveform of one cluster, `[sample × channel]` in noise units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub label: i64,
    pub waveform: Array2<f32>,
    /// d/dt of the waveform (central differences)
    pub first_derivative: Array2<f32>,
    /// d²/dt² of the waveform
    pub second_derivative: Array2<f32>,
    /// Channels where the waveform rises above the support threshold
    pub support: Vec<bool>,
    /// Squared norm over the support channels
    pub norm_sq: f32,
    /// Number of waveforms the template was built from
    pub n_members: usize,
}

impl Template {
    pub fn new(label: i64, waveform: Array2<f32>, n_members: usize, support_threshold: f32) -> Result<Self> {
        if waveform.nrows() < MIN_WINDOW_WIDTH || waveform.ncols() == 0 {
            return Err(TdcError::Configuration(format!(
                "Template of shape {:?} is too small",
                waveform.dim()
            )));
        }
        if waveform.iter().any(|v| !v.is_finite()) {
            return Err(TdcError::NumericInstability(format!(
                "template {} is not finite",
                label
            )));
        }

        let peak_per_channel: Vec<f32> = waveform
            .axis_iter(Axis(1))
            .map(|column| column.iter().fold(0.0f32, |acc, v| acc.max(v.abs())))
            .collect();
        let mut support: Vec<bool> = peak_per_channel
            .iter()
            .map(|&p| p > support_threshold)
            .collect();
        if !support.iter().any(|&s| s) {
            // Keep the strongest channel so the template can still be matched
            let strongest = peak_per_channel
                .iter()
                .enumerate()
                .fold(0, |best, (c, &p)| if p > peak_per_channel[best] { c } else { best });
            support[strongest] = true;
        }

        let (first_derivative, second_derivative) = derivatives(waveform.view());
        let norm_sq = masked_energy(waveform.view(), &support);

        Ok(Self {
            label,
            waveform,
            first_derivative,
            second_derivative,
            support,
            norm_sq,
            n_members,
        })
    }

    pub fn width(&self) -> usize {
        self.waveform.nrows()
    }

    pub fn support_channels(&self) -> Vec<usize> {
        self.support
            .iter()
            .enumerate()
            .filter(|(_, &s)| s)
            .map(|(c, _)| c)
            .collect()
    }

    /// Waveform delayed by `jitter` samples (second-order Taylor expansion)
    pub fn shifted(&self, jitter: f32) -> Array2<f32> {
        let half_sq = 0.5 * jitter * jitter;
        let mut out = self.waveform.clone();
        out.zip_mut_with(&self.first_derivative, |w, d1| *w -= jitter * d1);
        out.zip_mut_with(&self.second_derivative, |w, d2| *w += half_sq * d2);
        out
    }
}

fn derivatives(waveform: ArrayView2<f32>) -> (Array2<f32>, Array2<f32>) {
    let n = waveform.nrows();
    let mut d1 = Array2::zeros(waveform.dim());
    let mut d2 = Array2::zeros(waveform.dim());
    for c in 0..waveform.ncols() {
        for t in 0..n {
            d1[[t, c]] = if t == 0 {
                waveform[[1, c]] - waveform[[0, c]]
            } else if t == n - 1 {
                waveform[[n - 1, c]] - waveform[[n - 2, c]]
            } else {
                0.5 * (waveform[[t + 1, c]] - waveform[[t - 1, c]])
            };
            if t > 0 && t < n - 1 {
                d2[[t, c]] = waveform[[t + 1, c]] - 2.0 * waveform[[t, c]] + waveform[[t - 1, c]];
            }
        }
    }
    (d1, d2)
}

pub(crate) fn masked_energy(block: ArrayView2<f32>, mask: &[bool]) -> f32 {
    block
        .axis_iter(Axis(1))
        .zip(mask)
        .filter(|(_, &m)| m)
        .map(|(column, _)| column.iter().map(|v| v * v).sum::<f32>())
        .sum()
}

/// Versioned, immutable template set plus what the Peeler needs to
/// reproduce the signal the templates were measured on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalogue {
    /// Assigned by the store on save; 0 until then
    pub version: u64,
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub channel_group: usize,
    pub sample_rate: f64,
    pub geometry: WindowGeometry,
    pub peak_sign: PeakSign,
    /// Detection threshold in noise units
    pub relative_threshold: f32,
    /// Minimum peak separation (samples)
    pub peak_span: usize,
    pub preprocessor: PreprocessorParams,
    pub noise: NoiseProfile,
    /// Ordered by label
    pub templates: Vec<Template>,
}

impl Catalogue {
    pub fn labels(&self) -> Vec<i64> {
        self.templates.iter().map(|t| t.label).collect()
    }

    pub fn template(&self, label: i64) -> Option<&Template> {
        self.templates.iter().find(|t| t.label == label)
    }

    pub fn n_channels(&self) -> usize {
        self.noise.n_channels()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// Which catalogue to load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogueVersion {
    Latest,
    Version(u64),
}

/// Catalogue persistence. `save` is atomic: concurrent readers observe
/// either the previous latest version or the complete new one.
pub trait CatalogueStore: Send + Sync {
    /// Persist a new version and return its number
    fn save(&self, catalogue: &Catalogue) -> Result<u64>;

    fn load(&self, version: CatalogueVersion) -> Result<Arc<Catalogue>>;

    /// Available versions, ascending
    fn versions(&self) -> Result<Vec<u64>>;
}

/// Catalogues kept in memory
#[derive(Debug, Default)]
pub struct InMemoryCatalogueStore {
    versions: RwLock<BTreeMap<u64, Arc<Catalogue>>>,
}

impl InMemoryCatalogueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CatalogueStore for InMemoryCatalogueStore {
    fn save(&self, catalogue: &Catalogue) -> Result<u64> {
        let mut versions = self.versions.write();
        let version = versions.keys().next_back().map_or(1, |v| v + 1);
        let mut frozen = catalogue.clone();
        frozen.version = version;
        versions.insert(version, Arc::new(frozen));
        Ok(version)
    }

    fn load(&self, version: CatalogueVersion) -> Result<Arc<Catalogue>> {
        let versions = self.versions.read();
        let found = match version {
            CatalogueVersion::Latest => versions.values().next_back(),
            CatalogueVersion::Version(v) => versions.get(&v),
        };
        found
            .cloned()
            .ok_or_else(|| TdcError::CatalogueNotFound(format!("{:?}", version)))
    }

    fn versions(&self) -> Result<Vec<u64>> {
        Ok(self.versions.read().keys().copied().collect())
    }
}

const FILE_PREFIX: &str = "catalogue_v";
const FILE_SUFFIX: &str = ".json";

/// One JSON file per version in a directory, written through a temporary
/// file and renamed into place
#[derive(Debug)]
pub struct FileCatalogueStore {
    dir: PathBuf,
    writer: Mutex<()>,
}

impl FileCatalogueStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            writer: Mutex::new(()),
        })
    }

    fn path_for(&self, version: u64) -> PathBuf {
        self.dir
            .join(format!("{}{:06}{}", FILE_PREFIX, version, FILE_SUFFIX))
    }
}

fn parse_version(name: &str) -> Option<u64> {
    name.strip_prefix(FILE_PREFIX)?
        .strip_suffix(FILE_SUFFIX)?
        .parse()
        .ok()
}

impl CatalogueStore for FileCatalogueStore {
    fn save(&self, catalogue: &Catalogue) -> Result<u64> {
        let _guard = self.writer.lock();
        let version = self.versions()?.last().map_or(1, |v| v + 1);
        let mut frozen = catalogue.clone();
        frozen.version = version;

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer(&mut tmp, &frozen)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        let path = self.path_for(version);
        tmp.persist(&path).map_err(|e| TdcError::Storage(e.error))?;

        log::info!(
            "Saved catalogue v{} ({} templates) to {}",
            version,
            frozen.templates.len(),
            path.display()
        );
        Ok(version)
    }

    fn load(&self, version: CatalogueVersion) -> Result<Arc<Catalogue>> {
        let number = match version {
            CatalogueVersion::Latest => self
                .versions()?
                .last()
                .copied()
                .ok_or_else(|| TdcError::CatalogueNotFound(self.dir.display().to_string()))?,
            CatalogueVersion::Version(v) => v,
        };
        let path = self.path_for(number);
        if !path.exists() {
            return Err(TdcError::CatalogueNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(&path)?;
        let catalogue: Catalogue = serde_json::from_str(&content)?;
        Ok(Arc::new(catalogue))
    }

    fn versions(&self) -> Result<Vec<u64>> {
        let mut versions: Vec<u64> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().and_then(parse_version))
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }
}
