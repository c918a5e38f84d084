//! Waveform extraction for catalogue construction

use crate::config::SamplingMode;
use crate::dataio::{read_with_retry, RetryPolicy, SignalStore};
use crate::error::{Result, TdcError};
use crate::noise::median_mad;
use crate::types::{Peak, SignalKind, WindowGeometry};
use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3, Axis};
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Sample of waveforms drawn from the detected peaks
///
/// `waveforms` is laid out `[waveform × sample × channel]`; row `k` belongs
/// to `peak_indices[k]` in the peak list the pool was drawn from.
#[derive(Debug, Clone)]
pub struct WaveformPool {
    geometry: WindowGeometry,
    peak_indices: Vec<usize>,
    waveforms: Array3<f32>,
}

impl WaveformPool {
    pub fn new(
        geometry: WindowGeometry,
        peak_indices: Vec<usize>,
        waveforms: Array3<f32>,
    ) -> Result<Self> {
        let (n, width, _) = waveforms.dim();
        if n != peak_indices.len() || width != geometry.width() {
            return Err(TdcError::Configuration(format!(
                "Pool of shape {:?} does not match {} peaks with window width {}",
                waveforms.dim(),
                peak_indices.len(),
                geometry.width()
            )));
        }
        Ok(Self {
            geometry,
            peak_indices,
            waveforms,
        })
    }

    pub fn len(&self) -> usize {
        self.peak_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peak_indices.is_empty()
    }

    pub fn geometry(&self) -> WindowGeometry {
        self.geometry
    }

    pub fn n_channels(&self) -> usize {
        self.waveforms.dim().2
    }

    pub fn peak_indices(&self) -> &[usize] {
        &self.peak_indices
    }

    pub fn waveforms(&self) -> ArrayView3<f32> {
        self.waveforms.view()
    }

    pub fn waveform(&self, k: usize) -> ArrayView2<f32> {
        self.waveforms.index_axis(Axis(0), k)
    }

    /// One row per waveform, samples then channels flattened
    pub fn flattened(&self) -> Array2<f32> {
        let (n, width, channels) = self.waveforms.dim();
        let mut flat = Array2::zeros((n, width * channels));
        for (mut row, waveform) in flat.rows_mut().into_iter().zip(self.waveforms.outer_iter()) {
            for (dst, v) in row.iter_mut().zip(waveform.iter()) {
                *dst = *v;
            }
        }
        flat
    }

    /// Shrink every waveform to a narrower window around the same peak
    pub fn crop(&mut self, geometry: WindowGeometry) -> Result<()> {
        if geometry.n_left > self.geometry.n_left || geometry.n_right > self.geometry.n_right {
            return Err(TdcError::Configuration(format!(
                "Cannot crop window ({}, {}) to wider ({}, {})",
                self.geometry.n_left, self.geometry.n_right, geometry.n_left, geometry.n_right
            )));
        }
        let from = self.geometry.n_left - geometry.n_left;
        let to = self.geometry.n_left + geometry.n_right;
        self.waveforms = self.waveforms.slice(s![.., from..to, ..]).to_owned();
        self.geometry = geometry;
        Ok(())
    }
}

/// Pick up to `nb_max` peaks whose full window lies inside their segment.
///
/// Returns indices into `peaks`, sorted.
pub fn select_peaks(
    peaks: &[Peak],
    segment_lens: &[usize],
    geometry: WindowGeometry,
    nb_max: usize,
    mode: SamplingMode,
) -> Vec<usize> {
    let fits = |p: &Peak| {
        let len = segment_lens.get(p.segment).copied().unwrap_or(0);
        geometry
            .span_at(p.index)
            .map_or(false, |range| range.end <= len)
    };
    let eligible: Vec<usize> = (0..peaks.len()).filter(|&i| fits(&peaks[i])).collect();
    let skipped = peaks.len() - eligible.len();
    if skipped > 0 {
        log::debug!("{} peaks too close to a segment boundary", skipped);
    }

    match mode {
        SamplingMode::Uniform => evenly_spaced(&eligible, nb_max),
        SamplingMode::Stratified => {
            let mut by_segment: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
            for &i in &eligible {
                by_segment.entry(peaks[i].segment).or_default().push(i);
            }
            let total = eligible.len().max(1);
            let mut selected = Vec::new();
            for members in by_segment.values() {
                let quota = ((nb_max as f64) * members.len() as f64 / total as f64).round() as usize;
                selected.extend(evenly_spaced(members, quota.max(1)));
            }
            selected.sort_unstable();
            selected.truncate(nb_max);
            selected
        }
    }
}

fn evenly_spaced(items: &[usize], count: usize) -> Vec<usize> {
    if items.len() <= count {
        return items.to_vec();
    }
    (0..count).map(|k| items[k * items.len() / count]).collect()
}

/// Read the processed windows of the selected peaks.
///
/// Segments are read in parallel; a window containing non-finite samples is
/// logged and left out of the pool.
pub fn extract_waveforms(
    store: &dyn SignalStore,
    retry: &RetryPolicy,
    channel_group: usize,
    peaks: &[Peak],
    selected: &[usize],
    geometry: WindowGeometry,
) -> Result<WaveformPool> {
    let n_channels = store.group_size(channel_group).map_err(|e| {
        TdcError::Configuration(format!("Channel group {}: {}", channel_group, e))
    })?;

    let mut by_segment: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for &i in selected {
        by_segment.entry(peaks[i].segment).or_default().push(i);
    }

    let per_segment: Vec<Vec<(usize, Array2<f32>)>> = by_segment
        .into_par_iter()
        .map(|(segment, members)| -> Result<Vec<(usize, Array2<f32>)>> {
            let mut out = Vec::with_capacity(members.len());
            for i in members {
                let Some(range) = geometry.span_at(peaks[i].index) else {
                    continue;
                };
                let window =
                    read_with_retry(store, retry, segment, channel_group, range, SignalKind::Processed)?;
                if window.iter().any(|v| !v.is_finite()) {
                    log::warn!(
                        "Skipping non-finite waveform at segment {} index {}",
                        segment,
                        peaks[i].index
                    );
                    continue;
                }
                out.push((i, window));
            }
            Ok(out)
        })
        .collect::<Result<_>>()?;

    let windows: Vec<(usize, Array2<f32>)> = per_segment.into_iter().flatten().collect();
    let mut waveforms = Array3::zeros((windows.len(), geometry.width(), n_channels));
    let mut peak_indices = Vec::with_capacity(windows.len());
    for (k, (i, window)) in windows.into_iter().enumerate() {
        waveforms.index_axis_mut(Axis(0), k).assign(&window);
        peak_indices.push(i);
    }

    log::info!(
        "Extracted {} waveforms of {} samples x {} channels",
        peak_indices.len(),
        geometry.width(),
        n_channels
    );
    WaveformPool::new(geometry, peak_indices, waveforms)
}

/// Narrowest window a template can be built from
pub const MIN_WINDOW_WIDTH: usize = 3;

/// Estimate the narrowest adequate window.
///
/// The MAD across the pool is computed for every (sample, channel). A sample
/// is informative when at least `channel_percent` of the channels exceed
/// `mad_threshold` there (the noise itself sits at 1 on a normalised
/// signal). Margins are cut to the first and last informative samples but
/// never below `min_left` / `min_right`, nor beyond the current window. The
/// result keeps at least one sample before the peak and a width of at least
/// [`MIN_WINDOW_WIDTH`].
pub fn find_good_limits(
    pool: &WaveformPool,
    mad_threshold: f32,
    channel_percent: f32,
    min_left: usize,
    min_right: usize,
) -> Result<WindowGeometry> {
    if pool.is_empty() {
        return Err(TdcError::InsufficientData {
            requested: 1,
            available: 0,
        });
    }

    let current = pool.geometry();
    let (n, width, channels) = pool.waveforms.dim();
    let needed = ((channel_percent * channels as f32).ceil() as usize).max(1);

    let mut scratch = vec![0.0f32; n];
    let informative: Vec<bool> = (0..width)
        .map(|sample| {
            let active = (0..channels)
                .filter(|&c| {
                    for (dst, v) in scratch
                        .iter_mut()
                        .zip(pool.waveforms.slice(s![.., sample, c]).iter())
                    {
                        *dst = *v;
                    }
                    median_mad(&mut scratch).1 > mad_threshold
                })
                .count();
            active >= needed
        })
        .collect();

    let first = informative.iter().position(|&b| b);
    let last = informative.iter().rposition(|&b| b);
    let (Some(first), Some(last)) = (first, last) else {
        log::warn!("No informative sample above MAD {}, keeping the window", mad_threshold);
        return Ok(current);
    };

    let mut n_left = current
        .n_left
        .saturating_sub(first)
        .max(min_left.max(1))
        .min(current.n_left);
    let mut n_right = (last + 1)
        .saturating_sub(current.n_left)
        .max(min_right.max(1))
        .min(current.n_right);
    while n_left + n_right < MIN_WINDOW_WIDTH {
        if n_right < current.n_right {
            n_right += 1;
        } else if n_left < current.n_left {
            n_left += 1;
        } else {
            break;
        }
    }

    log::info!(
        "Window limits ({}, {}) -> ({}, {})",
        current.n_left,
        current.n_right,
        n_left,
        n_right
    );
    Ok(WindowGeometry::new(n_left, n_right))
}
