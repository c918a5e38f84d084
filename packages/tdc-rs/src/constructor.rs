//! Catalogue construction session
//!
//! [`CatalogueConstructor`] owns every intermediate product of catalogue
//! construction (noise profile, peak list, waveform pool, projector, labels)
//! and exposes the pipeline as discrete commands:
//!
//! ```text
//! estimate_signals_noise -> run_signalprocessor -> extract_some_waveforms
//!   -> [find_good_limits] -> project -> find_clusters -> [edits]
//!   -> make_catalogue / save_catalogue
//! ```
//!
//! Commands take `&self`; the session state sits behind a single mutex so
//! concurrent callers are serialised and a reader never sees a half-applied
//! edit. Re-running an earlier step discards the products that depended on
//! it.

use crate::catalogue::{Catalogue, CatalogueStore, Template};
use crate::cluster::ClusterEngine;
use crate::config::{ClusteringMethod, SorterConfig, WaveformParams};
use crate::dataio::{read_with_retry, segment_info, write_with_retry, SignalStore};
use crate::detector::PeakDetector;
use crate::error::{Result, TdcError};
use crate::features::{build_projector, project_selection, Projector};
use crate::noise::{NoiseEstimator, NoiseProfile};
use crate::preprocessor::SignalPreprocessor;
use crate::profile_scope;
use crate::types::{Peak, PeakRow, SignalKind, WindowGeometry, LABEL_UNCLASSIFIED};
use crate::waveforms::{extract_waveforms, find_good_limits, select_peaks, WaveformPool};
use chrono::Utc;
use ndarray::Array2;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Session {
    noise: Option<NoiseProfile>,
    peaks: Vec<Peak>,
    /// Samples of each segment written back by the last signal processor run
    processed_lens: Vec<usize>,
    pool: Option<WaveformPool>,
    projector: Option<Box<dyn Projector>>,
    engine: Option<ClusterEngine>,
}

impl Session {
    fn noise(&self) -> Result<&NoiseProfile> {
        self.noise.as_ref().ok_or_else(|| missing("estimate_signals_noise"))
    }

    fn pool(&self) -> Result<&WaveformPool> {
        self.pool.as_ref().ok_or_else(|| missing("extract_some_waveforms"))
    }

    fn engine(&self) -> Result<&ClusterEngine> {
        self.engine.as_ref().ok_or_else(|| missing("project"))
    }

    fn engine_mut(&mut self) -> Result<&mut ClusterEngine> {
        self.engine.as_mut().ok_or_else(|| missing("project"))
    }
}

fn missing(step: &str) -> TdcError {
    TdcError::Configuration(format!("Run {} first", step))
}

/// Interactive catalogue construction over one channel group
pub struct CatalogueConstructor {
    store: Arc<dyn SignalStore>,
    config: SorterConfig,
    sample_rate: f64,
    n_channels: usize,
    segment_lens: Vec<usize>,
    session: Mutex<Session>,
}

impl CatalogueConstructor {
    /// Open a session; the configuration is validated against the store's
    /// sample rate before anything runs
    pub fn new(store: Arc<dyn SignalStore>, config: SorterConfig) -> Result<Self> {
        let n_segments = store.segment_count();
        if n_segments == 0 {
            return Err(TdcError::InsufficientData {
                requested: 1,
                available: 0,
            });
        }

        let mut sample_rate = None;
        let mut segment_lens = Vec::with_capacity(n_segments);
        for segment in 0..n_segments {
            let (rate, len) = segment_info(store.as_ref(), segment)?;
            match sample_rate {
                None => sample_rate = Some(rate),
                Some(expected) if expected != rate => {
                    return Err(TdcError::Configuration(format!(
                        "Segment {} sampled at {} Hz, segment 0 at {} Hz",
                        segment, rate, expected
                    )));
                }
                Some(_) => {}
            }
            segment_lens.push(len);
        }
        let sample_rate = sample_rate.unwrap_or_default();
        config.validate(sample_rate)?;

        let n_channels = store.group_size(config.channel_group).map_err(|e| {
            TdcError::Configuration(format!("Channel group {}: {}", config.channel_group, e))
        })?;

        log::info!(
            "Catalogue constructor on group {}: {} segment(s), {} channels at {} Hz",
            config.channel_group,
            n_segments,
            n_channels,
            sample_rate
        );
        Ok(Self {
            store,
            config,
            sample_rate,
            n_channels,
            segment_lens,
            session: Mutex::new(Session::default()),
        })
    }

    pub fn config(&self) -> &SorterConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn n_channels(&self) -> usize {
        self.n_channels
    }

    /// Measure the noise over the first `duration` seconds of `segment`.
    /// Invalidates everything built on a previous estimate.
    pub fn estimate_signals_noise(&self, segment: usize, duration: f64) -> Result<NoiseProfile> {
        profile_scope!("estimate_signals_noise");
        let profile = NoiseEstimator::estimate(
            self.store.as_ref(),
            &self.config.retry,
            segment,
            self.config.channel_group,
            duration,
            &self.config.preprocessor,
        )?;
        let mut session = self.session.lock();
        *session = Session {
            noise: Some(profile.clone()),
            ..Session::default()
        };
        Ok(profile)
    }

    pub fn noise(&self) -> Option<NoiseProfile> {
        self.session.lock().noise.clone()
    }

    /// Preprocess and detect over the first `duration` seconds of every
    /// segment (all of it when `None`), writing the processed signal back
    /// to the store. Segments run in parallel. Returns the peak count.
    pub fn run_signalprocessor(&self, duration: Option<f64>) -> Result<usize> {
        profile_scope!("run_signalprocessor");
        let noise = self.session.lock().noise()?.clone();

        let per_segment: Vec<(Vec<Peak>, usize)> = (0..self.segment_lens.len())
            .into_par_iter()
            .map(|segment| self.process_segment(segment, duration, &noise))
            .collect::<Result<_>>()?;
        let (per_segment, processed_lens): (Vec<Vec<Peak>>, Vec<usize>) =
            per_segment.into_iter().unzip();
        let peaks: Vec<Peak> = per_segment.into_iter().flatten().collect();

        log::info!(
            "Detected {} peaks over {} segment(s)",
            peaks.len(),
            self.segment_lens.len()
        );
        let count = peaks.len();
        let mut session = self.session.lock();
        session.peaks = peaks;
        session.processed_lens = processed_lens;
        session.pool = None;
        session.projector = None;
        session.engine = None;
        Ok(count)
    }

    fn process_segment(
        &self,
        segment: usize,
        duration: Option<f64>,
        noise: &NoiseProfile,
    ) -> Result<(Vec<Peak>, usize)> {
        let store = self.store.as_ref();
        let group = self.config.channel_group;
        let retry = &self.config.retry;
        let len = self.segment_lens[segment];
        let end = match duration {
            Some(seconds) => {
                let requested = (seconds * self.sample_rate).round().max(0.0) as usize;
                requested.min(len)
            }
            None => len,
        };

        let mut preprocessor =
            SignalPreprocessor::new(&self.config.preprocessor, self.sample_rate, self.n_channels)?
                .with_noise(noise.clone())?;
        let mut detector = PeakDetector::from_params(segment, &self.config.detector, self.sample_rate);
        let mut peaks = Vec::new();

        let mut start = 0;
        while start < end {
            let stop = (start + self.config.preprocessor.chunk_size).min(end);
            let raw = read_with_retry(store, retry, segment, group, start..stop, SignalKind::Raw)?;
            match preprocessor.process(raw) {
                Ok(chunk) => {
                    write_with_retry(store, retry, segment, group, chunk.start, chunk.data.view())?;
                    peaks.extend(detector.process(chunk.start, chunk.data.view()));
                }
                Err(TdcError::NumericInstability(reason)) => {
                    log::warn!("Segment {} chunk [{}..{}] skipped: {}", segment, start, stop, reason);
                    let zeros = Array2::<f32>::zeros((stop - start, self.n_channels));
                    write_with_retry(store, retry, segment, group, start, zeros.view())?;
                }
                Err(e) => return Err(e),
            }
            start = stop;
        }
        peaks.extend(detector.flush());

        log::debug!("Segment {}: {} peaks over {} samples", segment, peaks.len(), end);
        Ok((peaks, end))
    }

    pub fn peaks(&self) -> Vec<Peak> {
        self.session.lock().peaks.clone()
    }

    /// One row per detected peak. Peaks outside the waveform pool carry
    /// [`LABEL_UNCLASSIFIED`].
    pub fn peak_list(&self) -> Vec<PeakRow> {
        let session = self.session.lock();
        let mut labels = vec![LABEL_UNCLASSIFIED; session.peaks.len()];
        if let (Some(pool), Some(engine)) = (&session.pool, &session.engine) {
            for (&peak, &label) in pool.peak_indices().iter().zip(engine.labels()) {
                labels[peak] = label;
            }
        }
        session
            .peaks
            .iter()
            .zip(labels)
            .map(|(p, label)| PeakRow {
                segment: p.segment,
                index: p.index,
                time: p.index as f64 / self.sample_rate,
                label,
            })
            .collect()
    }

    /// Draw up to `params.nb_max` peaks and read their processed windows.
    /// Returns the pool size.
    pub fn extract_some_waveforms(&self, params: &WaveformParams) -> Result<usize> {
        profile_scope!("extract_some_waveforms");
        let mut session = self.session.lock();
        if session.peaks.is_empty() {
            return Err(TdcError::InsufficientData {
                requested: 1,
                available: 0,
            });
        }
        let geometry = params.geometry();
        // Windows may only read what the last run actually wrote
        let selected = select_peaks(
            &session.peaks,
            &session.processed_lens,
            geometry,
            params.nb_max,
            params.sampling,
        );
        let pool = extract_waveforms(
            self.store.as_ref(),
            &self.config.retry,
            self.config.channel_group,
            &session.peaks,
            &selected,
            geometry,
        )?;
        let count = pool.len();
        session.pool = Some(pool);
        session.projector = None;
        session.engine = None;
        Ok(count)
    }

    pub fn geometry(&self) -> Option<WindowGeometry> {
        self.session.lock().pool.as_ref().map(|p| p.geometry())
    }

    /// Narrow the window to the informative samples and crop the pool to
    /// it. Projection and labels are discarded.
    pub fn find_good_limits(
        &self,
        mad_threshold: f32,
        channel_percent: f32,
        min_left: usize,
        min_right: usize,
    ) -> Result<WindowGeometry> {
        let mut session = self.session.lock();
        let pool = session
            .pool
            .as_mut()
            .ok_or_else(|| missing("extract_some_waveforms"))?;
        let geometry = find_good_limits(pool, mad_threshold, channel_percent, min_left, min_right)?;
        pool.crop(geometry)?;
        session.projector = None;
        session.engine = None;
        Ok(geometry)
    }

    /// Fit the configured projector on the pool and project it. Existing
    /// labels survive a re-projection. Returns the feature count.
    pub fn project(&self) -> Result<usize> {
        profile_scope!("project");
        let mut session = self.session.lock();
        let pool = session.pool()?;
        let flat = pool.flattened();
        let mut projector =
            build_projector(&self.config.projection, pool.geometry(), pool.n_channels());
        let features = projector.fit_or_apply(flat.view())?;
        let n_features = features.ncols();

        match session.engine.as_mut() {
            Some(engine) => engine.set_features(features)?,
            None => session.engine = Some(ClusterEngine::new(features, flat)?),
        }
        log::info!(
            "Projected {} waveforms to {} features with {}",
            session.pool()?.len(),
            n_features,
            projector.name()
        );
        session.projector = Some(projector);
        Ok(n_features)
    }

    /// Features of the listed pool rows with the fitted basis
    pub fn project_selection(&self, selection: &[usize]) -> Result<Array2<f32>> {
        let session = self.session.lock();
        let projector = session.projector.as_deref().ok_or_else(|| missing("project"))?;
        project_selection(projector, session.pool()?, selection)
    }

    /// Cluster the pool with `method`, or the configured one
    pub fn find_clusters(&self, method: Option<&ClusteringMethod>) -> Result<usize> {
        profile_scope!("find_clusters");
        let method = method.unwrap_or(&self.config.clustering);
        let mut session = self.session.lock();
        let engine = session.engine_mut()?;
        engine.find_clusters(method.build().as_ref())?;
        Ok(engine.active_labels().len())
    }

    pub fn merge_cluster(&self, labels: &[i64]) -> Result<i64> {
        self.session.lock().engine_mut()?.merge(labels)
    }

    pub fn split_cluster(
        &self,
        label: i64,
        n: usize,
        method: Option<&ClusteringMethod>,
    ) -> Result<Vec<i64>> {
        let method = method.unwrap_or(&self.config.clustering);
        self.session.lock().engine_mut()?.split(label, n, method)
    }

    pub fn move_to_trash(&self, selection: &[bool]) -> Result<()> {
        self.session.lock().engine_mut()?.move_to_trash(selection)
    }

    pub fn change_spike_label(&self, selection: &[bool], label: i64) -> Result<()> {
        self.session
            .lock()
            .engine_mut()?
            .change_spike_label(selection, label)
    }

    pub fn order_clusters(&self) -> Result<()> {
        self.session.lock().engine_mut()?.order_by_power();
        Ok(())
    }

    pub fn cluster_counts(&self) -> Result<BTreeMap<i64, usize>> {
        Ok(self.session.lock().engine()?.cluster_counts())
    }

    /// Boolean selection over the pool
    pub fn select_peaks_of_clusters(&self, labels: &[i64]) -> Result<Vec<bool>> {
        Ok(self.session.lock().engine()?.select_peaks_of_clusters(labels))
    }

    /// Pool labels as a snapshot unaffected by later edits
    pub fn labels(&self) -> Result<Arc<Vec<i64>>> {
        Ok(self.session.lock().engine()?.snapshot())
    }

    /// Freeze the current clusters into an unversioned catalogue.
    ///
    /// Each active cluster with at least `min_cluster_size` members becomes
    /// a template built from its median waveform.
    pub fn make_catalogue(&self) -> Result<Catalogue> {
        profile_scope!("make_catalogue");
        let params = &self.config.catalogue;
        let mut session = self.session.lock();
        let noise = session.noise()?.clone();
        let geometry = session.pool()?.geometry();
        let width = geometry.width();

        let engine = session.engine_mut()?;
        let counts = engine.cluster_counts();
        let centroids = engine.centroids()?;

        let mut templates = Vec::new();
        for (&label, centroid) in centroids {
            let n_members = counts.get(&label).copied().unwrap_or(0);
            if n_members < params.min_cluster_size {
                log::warn!(
                    "Cluster {} has {} member(s), below {}: no template",
                    label,
                    n_members,
                    params.min_cluster_size
                );
                continue;
            }
            let waveform = Array2::from_shape_vec((width, self.n_channels), centroid.to_vec())
                .map_err(|e| TdcError::NumericInstability(e.to_string()))?;
            templates.push(Template::new(
                label,
                waveform,
                n_members,
                params.support_threshold,
            )?);
        }
        if templates.is_empty() {
            return Err(TdcError::DegenerateCluster(
                "no cluster is large enough for a template".to_string(),
            ));
        }

        log::info!(
            "Catalogue of {} template(s), window ({}, {})",
            templates.len(),
            geometry.n_left,
            geometry.n_right
        );
        Ok(Catalogue {
            version: 0,
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            channel_group: self.config.channel_group,
            sample_rate: self.sample_rate,
            geometry,
            peak_sign: self.config.detector.peak_sign,
            relative_threshold: self.config.detector.relative_threshold,
            peak_span: self.config.detector.peak_span.to_samples(self.sample_rate),
            preprocessor: self.config.preprocessor.clone(),
            noise,
            templates,
        })
    }

    /// Build the catalogue and persist it as a new version
    pub fn save_catalogue(&self, store: &dyn CatalogueStore) -> Result<u64> {
        let catalogue = self.make_catalogue()?;
        store.save(&catalogue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::{CatalogueVersion, InMemoryCatalogueStore};
    use crate::config::{ProjectionMethod, SamplingMode};
    use crate::dataio::InMemorySignalStore;
    use crate::types::LABEL_TRASH;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const RATE: f64 = 10_000.0;

    /// Two channels of noise with a large biphasic spike every 200 samples
    fn recording() -> InMemorySignalStore {
        recording_with(&[])
    }

    fn recording_with(extra: &[usize]) -> InMemorySignalStore {
        let mut rng = StdRng::seed_from_u64(3);
        let mut data = Array2::from_shape_fn((20_000, 2), |_| rng.random_range(-1.0f32..1.0));
        let regular = (0..95).map(|k| 300 + k * 200);
        for center in regular.chain(extra.iter().copied()) {
            for t in 0..17 {
                let x = (t as f32 - 8.0) / 1.5;
                let v = -14.0 * (1.0 - x * x) * (-(x * x) / 2.0).exp();
                data[[center + t - 8, 0]] += v;
                data[[center + t - 8, 1]] += 0.5 * v;
            }
        }
        InMemorySignalStore::new(vec![data], RATE)
    }

    fn config() -> SorterConfig {
        let mut config = SorterConfig::default();
        config.waveforms = WaveformParams {
            n_left: 10,
            n_right: 15,
            nb_max: 1000,
            sampling: SamplingMode::Uniform,
        };
        config.projection = ProjectionMethod::Pca { n_components: 3 };
        config.clustering = ClusteringMethod::Kmeans {
            n_clusters: 1,
            max_iter: 100,
            seed: 1,
        };
        config
    }

    fn constructor() -> CatalogueConstructor {
        CatalogueConstructor::new(Arc::new(recording()), config()).unwrap()
    }

    #[test]
    fn test_steps_require_their_inputs() {
        let cc = constructor();
        assert!(matches!(
            cc.run_signalprocessor(None),
            Err(TdcError::Configuration(_))
        ));
        assert!(cc.project().is_err());
        assert!(cc.make_catalogue().is_err());
    }

    #[test]
    fn test_full_session() {
        let _ = env_logger::builder().is_test(true).try_init();
        let cc = constructor();
        cc.estimate_signals_noise(0, 1.0).unwrap();
        let n_peaks = cc.run_signalprocessor(None).unwrap();
        assert!((90..=100).contains(&n_peaks), "{} peaks", n_peaks);

        let rows = cc.peak_list();
        assert_eq!(rows.len(), n_peaks);
        assert!(rows.iter().all(|r| r.label == LABEL_UNCLASSIFIED));
        assert!((rows[0].time - rows[0].index as f64 / RATE).abs() < 1e-12);

        let pooled = cc.extract_some_waveforms(&cc.config().waveforms.clone()).unwrap();
        assert!(pooled > 80);
        assert_eq!(cc.project().unwrap(), 3);
        assert_eq!(cc.find_clusters(None).unwrap(), 1);
        assert_eq!(cc.cluster_counts().unwrap()[&0], pooled);

        let store = InMemoryCatalogueStore::new();
        let version = cc.save_catalogue(&store).unwrap();
        let catalogue = store.load(CatalogueVersion::Latest).unwrap();
        assert_eq!(catalogue.version, version);
        assert_eq!(catalogue.templates.len(), 1);
        assert_eq!(catalogue.geometry, WindowGeometry::new(10, 15));
        // The centroid peaks on channel 0 at the window's alignment sample
        let template = &catalogue.templates[0];
        assert!(template.waveform[[10, 0]] < -5.0);
        assert!(template.support[0]);
    }

    #[test]
    fn test_trash_and_unclassified_rows() {
        let cc = constructor();
        cc.estimate_signals_noise(0, 1.0).unwrap();
        cc.run_signalprocessor(None).unwrap();
        let mut params = cc.config().waveforms.clone();
        params.nb_max = 20;
        cc.extract_some_waveforms(&params).unwrap();
        cc.project().unwrap();
        cc.find_clusters(None).unwrap();

        let mut selection = vec![false; 20];
        selection[0] = true;
        cc.move_to_trash(&selection).unwrap();

        let rows = cc.peak_list();
        assert_eq!(rows.iter().filter(|r| r.label == LABEL_TRASH).count(), 1);
        assert_eq!(rows.iter().filter(|r| r.label == 0).count(), 19);
        assert_eq!(
            rows.iter().filter(|r| r.label == LABEL_UNCLASSIFIED).count(),
            rows.len() - 20
        );

        cc.change_spike_label(&selection, 0).unwrap();
        assert_eq!(cc.cluster_counts().unwrap().get(&LABEL_TRASH), None);
    }

    #[test]
    fn test_small_clusters_produce_no_template() {
        let mut config = config();
        config.catalogue.min_cluster_size = 10_000;
        let cc = CatalogueConstructor::new(Arc::new(recording()), config).unwrap();
        cc.estimate_signals_noise(0, 1.0).unwrap();
        cc.run_signalprocessor(None).unwrap();
        cc.extract_some_waveforms(&cc.config().waveforms.clone()).unwrap();
        cc.project().unwrap();
        cc.find_clusters(None).unwrap();
        assert!(matches!(
            cc.make_catalogue(),
            Err(TdcError::DegenerateCluster(_))
        ));
    }

    #[test]
    fn test_pool_stays_inside_processed_range() {
        // One second processed; a spike sits just before the cut
        let cc = CatalogueConstructor::new(Arc::new(recording_with(&[9992])), config()).unwrap();
        cc.estimate_signals_noise(0, 1.0).unwrap();
        cc.run_signalprocessor(Some(1.0)).unwrap();
        let peaks = cc.peaks();
        assert!(peaks.iter().all(|p| p.index < 10_000));
        assert!(peaks.iter().any(|p| p.index + 15 > 10_000), "no peak near the cut");

        cc.extract_some_waveforms(&cc.config().waveforms.clone()).unwrap();
        let session = cc.session.lock();
        let pool = session.pool.as_ref().unwrap();
        for &k in pool.peak_indices() {
            assert!(peaks[k].index + 15 <= 10_000, "peak {} pooled", peaks[k].index);
        }
        for k in 0..pool.len() {
            let waveform = pool.waveform(k);
            let zero_rows = waveform
                .rows()
                .into_iter()
                .filter(|row| row.iter().all(|&v| v == 0.0))
                .count();
            assert_eq!(zero_rows, 0);
        }
    }
}
