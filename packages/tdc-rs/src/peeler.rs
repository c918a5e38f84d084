//! Peeler: template matching and subtraction over a whole recording
//!
//! Each segment is streamed chunk by chunk through the catalogue's
//! preprocessing into a residual buffer. Per chunk the segment peeler goes
//! `Streaming -> Peeling -> Advancing` and back, ending in `Done`:
//!
//! 1. Streaming: preprocess the chunk and append it to the residual.
//! 2. Peeling: up to `n_peel_level` passes. Each pass finds residual peaks
//!    in the positions owned by this chunk, scores every template at every
//!    lag within `alignment_search` (on the template's support channels
//!    only), then greedily accepts the best match, subtracts it and
//!    re-scores the candidates it overlaps.
//! 3. Advancing: emit the accepted spikes and drop residual history that no
//!    later candidate can reach.
//!
//! A chunk owns the positions whose full matching window and peak
//! neighbourhood are already buffered; the rest is deferred to the next
//! chunk, so every position is examined by exactly one chunk.
//!
//! Acceptance: normalised score `<r,t>/sqrt(<t,t>)` at least
//! `match_threshold` and amplitude `<r,t>/<t,t>` inside
//! `[amplitude_min, amplitude_max]`. Ties go to the earlier position, then
//! the lower label. Jitter is the vertex of a parabola through the scores at
//! the best lag and its two neighbours, clamped to half a sample; the
//! subtracted template is shifted by it with a second-order Taylor expansion.

use crate::catalogue::Catalogue;
use crate::config::PeelerParams;
use crate::dataio::{read_with_retry, segment_info, RetryPolicy, SignalStore};
use crate::detector::detect_peaks;
use crate::error::{Result, TdcError};
use crate::preprocessor::SignalPreprocessor;
use crate::profile_scope;
use crate::types::{SignalKind, Spike};
use ndarray::{concatenate, s, Array2, ArrayView2, Axis};
use rayon::prelude::*;
use std::ops::Range;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-segment state of a Peeler run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeelerState {
    Streaming,
    Peeling,
    Advancing,
    Done,
}

/// Best alignment of one template on one residual peak
#[derive(Debug, Clone, Copy, PartialEq)]
struct Match {
    /// Residual peak, buffer-local
    peak: usize,
    template: usize,
    label: i64,
    /// Template peak position, buffer-local
    center: usize,
    /// Normalised score
    score: f32,
}

/// Result of peeling one buffer
#[derive(Debug, Clone, Default)]
pub struct PeelOutcome {
    pub spikes: Vec<Spike>,
    /// Residual energy before peeling, then after every accepted subtraction
    pub energy: Vec<f64>,
    /// Passes actually run
    pub levels: usize,
}

/// Template matching against a residual buffer
#[derive(Debug, Clone)]
pub struct Matcher {
    catalogue: Arc<Catalogue>,
    params: PeelerParams,
    supports: Vec<Vec<usize>>,
}

impl Matcher {
    pub fn new(catalogue: Arc<Catalogue>, params: PeelerParams) -> Result<Self> {
        if catalogue.is_empty() {
            return Err(TdcError::Configuration(
                "Catalogue has no template".to_string(),
            ));
        }
        let width = catalogue.geometry.width();
        if let Some(t) = catalogue.templates.iter().find(|t| t.width() != width) {
            return Err(TdcError::Configuration(format!(
                "Template {} has width {}, catalogue window is {}",
                t.label,
                t.width(),
                width
            )));
        }
        let supports = catalogue
            .templates
            .iter()
            .map(|t| t.support_channels())
            .collect();
        Ok(Self {
            catalogue,
            params,
            supports,
        })
    }

    /// Samples a candidate needs after it before it can be decided
    pub fn lookahead(&self) -> usize {
        self.catalogue.geometry.n_right + self.params.alignment_search + 1 + self.catalogue.peak_span
    }

    /// Samples of history a candidate needs before it
    pub fn lookbehind(&self) -> usize {
        self.catalogue.geometry.n_left + self.params.alignment_search + 1 + self.catalogue.peak_span
    }

    /// Window of a template whose peak sits at `center`, if fully inside
    fn window(&self, center: isize, len: usize) -> Option<Range<usize>> {
        let geometry = self.catalogue.geometry;
        let start = center - geometry.n_left as isize;
        let end = center + geometry.n_right as isize;
        (start >= 0 && end as usize <= len).then(|| start as usize..end as usize)
    }

    /// `<r,t>` on the support channels
    fn dot(&self, residual: ArrayView2<f32>, template: usize, center: isize) -> Option<f32> {
        let range = self.window(center, residual.nrows())?;
        let waveform = &self.catalogue.templates[template].waveform;
        let block = residual.slice(s![range, ..]);
        let mut acc = 0.0f32;
        for &c in &self.supports[template] {
            for (r, t) in block.column(c).iter().zip(waveform.column(c).iter()) {
                acc += r * t;
            }
        }
        Some(acc)
    }

    fn best_match(&self, residual: ArrayView2<f32>, peak: usize) -> Option<Match> {
        let search = self.params.alignment_search as isize;
        let mut best: Option<Match> = None;
        for (k, template) in self.catalogue.templates.iter().enumerate() {
            if template.norm_sq <= f32::EPSILON {
                continue;
            }
            for lag in -search..=search {
                let center = peak as isize + lag;
                let Some(dot) = self.dot(residual, k, center) else {
                    continue;
                };
                if !dot.is_finite() {
                    log::warn!("Non-finite match score for template {}", template.label);
                    continue;
                }
                let score = dot / template.norm_sq.sqrt();
                let amplitude = dot / template.norm_sq;
                if score < self.params.match_threshold
                    || amplitude < self.params.amplitude_min
                    || amplitude > self.params.amplitude_max
                {
                    continue;
                }
                if best.map_or(true, |b| score > b.score) {
                    best = Some(Match {
                        peak,
                        template: k,
                        label: template.label,
                        center: center as usize,
                        score,
                    });
                }
            }
        }
        best
    }

    /// Parabolic vertex of the scores around the best lag
    fn jitter(&self, residual: ArrayView2<f32>, m: &Match) -> f32 {
        let center = m.center as isize;
        let (Some(before), Some(at), Some(after)) = (
            self.dot(residual, m.template, center - 1),
            self.dot(residual, m.template, center),
            self.dot(residual, m.template, center + 1),
        ) else {
            return 0.0;
        };
        let curvature = before - 2.0 * at + after;
        if curvature >= 0.0 {
            return 0.0;
        }
        (0.5 * (before - after) / curvature).clamp(-0.5, 0.5)
    }

    /// Subtract the least-squares scaled, jitter-shifted template.
    /// Returns the spike (buffer-local index) and the energy removed.
    fn subtract(&self, residual: &mut Array2<f32>, m: &Match) -> (usize, f32, f32, f64) {
        let jitter = self.jitter(residual.view(), m);
        let template = &self.catalogue.templates[m.template];
        let shifted = template.shifted(jitter);
        let Some(range) = self.window(m.center as isize, residual.nrows()) else {
            return (m.center, jitter, 0.0, 0.0);
        };

        let mut block = residual.slice_mut(s![range, ..]);
        let before: f64 = block.iter().map(|v| (*v as f64) * (*v as f64)).sum();
        let dot: f64 = block
            .iter()
            .zip(shifted.iter())
            .map(|(r, t)| *r as f64 * *t as f64)
            .sum();
        let norm: f64 = shifted.iter().map(|t| (*t as f64) * (*t as f64)).sum();
        if norm <= f64::EPSILON || !dot.is_finite() {
            return (m.center, jitter, 0.0, 0.0);
        }
        let amplitude = (dot / norm) as f32;
        block.zip_mut_with(&shifted, |r, t| *r -= amplitude * t);
        let after: f64 = block.iter().map(|v| (*v as f64) * (*v as f64)).sum();
        (m.center, jitter, amplitude, before - after)
    }

    /// Peel the buffer-local positions `own` of `residual`, whose row 0 is
    /// absolute sample `origin`
    pub fn peel(
        &self,
        residual: &mut Array2<f32>,
        origin: usize,
        own: Range<usize>,
        segment: usize,
    ) -> PeelOutcome {
        let mut energy: f64 = residual.iter().map(|v| (*v as f64) * (*v as f64)).sum();
        let mut outcome = PeelOutcome {
            energy: vec![energy],
            ..Default::default()
        };
        if own.is_empty() {
            return outcome;
        }

        let geometry = self.catalogue.geometry;
        let reach = geometry.width() + self.params.alignment_search + 1;

        for level in 0..self.params.n_peel_level {
            outcome.levels = level + 1;
            let peaks = detect_peaks(
                residual.view(),
                segment,
                self.catalogue.peak_sign,
                self.catalogue.relative_threshold,
                self.catalogue.peak_span,
            );
            let mut candidates: Vec<(usize, Option<Match>)> = peaks
                .into_iter()
                .map(|p| p.index)
                .filter(|p| own.contains(p))
                .map(|p| (p, self.best_match(residual.view(), p)))
                .collect();
            log::trace!(
                "Segment {} level {}: {} candidate(s) in [{}..{})",
                segment,
                level,
                candidates.len(),
                origin + own.start,
                origin + own.end
            );

            let mut accepted = 0;
            loop {
                let best = candidates
                    .iter()
                    .enumerate()
                    .filter_map(|(k, (_, m))| m.map(|m| (k, m)))
                    .min_by(|(_, a), (_, b)| {
                        b.score
                            .total_cmp(&a.score)
                            .then(a.peak.cmp(&b.peak))
                            .then(a.label.cmp(&b.label))
                    });
                let Some((k, m)) = best else {
                    break;
                };
                candidates.swap_remove(k);

                let (center, jitter, amplitude, removed) = self.subtract(residual, &m);
                energy -= removed;
                outcome.energy.push(energy);
                outcome.spikes.push(Spike {
                    segment,
                    index: origin + center,
                    label: m.label,
                    jitter,
                    amplitude,
                });
                accepted += 1;

                for (peak, slot) in candidates.iter_mut() {
                    if peak.abs_diff(center) < reach {
                        *slot = self.best_match(residual.view(), *peak);
                    }
                }
            }

            if accepted == 0 {
                break;
            }
        }

        outcome.spikes.sort_by(spike_order);
        outcome
    }
}

/// Peeling state of one segment: residual buffer and accepted spikes
#[derive(Debug, Clone)]
pub struct SegmentPeeler {
    segment: usize,
    state: PeelerState,
    matcher: Matcher,
    preprocessor: SignalPreprocessor,
    residual: Array2<f32>,
    /// Absolute index of residual row 0
    residual_start: usize,
    /// Positions below this are final
    ready_end: usize,
    keep: usize,
    spikes: Vec<Spike>,
    retain_spikes: bool,
}

fn spike_order(a: &Spike, b: &Spike) -> std::cmp::Ordering {
    a.index.cmp(&b.index).then(a.label.cmp(&b.label))
}

impl SegmentPeeler {
    pub fn new(segment: usize, catalogue: Arc<Catalogue>, params: PeelerParams) -> Result<Self> {
        let n_channels = catalogue.n_channels();
        let preprocessor =
            SignalPreprocessor::new(&catalogue.preprocessor, catalogue.sample_rate, n_channels)?
                .with_noise(catalogue.noise.clone())?;
        let matcher = Matcher::new(Arc::clone(&catalogue), params)?;
        let keep = catalogue.preprocessor.backward_span.max(matcher.lookbehind());

        Ok(Self {
            segment,
            state: PeelerState::Streaming,
            matcher,
            preprocessor,
            residual: Array2::zeros((0, n_channels)),
            residual_start: 0,
            ready_end: 0,
            keep,
            spikes: Vec::new(),
            retain_spikes: true,
        })
    }

    /// Whether finalised spikes are also kept in [`SegmentPeeler::spikes`].
    /// Live callers that consume the return value of `push_chunk` turn this
    /// off so memory does not grow with the recording.
    pub fn retain_spikes(mut self, retain: bool) -> Self {
        self.retain_spikes = retain;
        self
    }

    pub fn segment(&self) -> usize {
        self.segment
    }

    pub fn state(&self) -> PeelerState {
        self.state
    }

    /// Next raw sample expected
    pub fn position(&self) -> usize {
        self.preprocessor.position()
    }

    pub fn n_channels(&self) -> usize {
        self.preprocessor.n_channels()
    }

    /// Accepted spikes so far, sorted by index
    pub fn spikes(&self) -> &[Spike] {
        &self.spikes
    }

    fn transition(&mut self, next: PeelerState) {
        log::trace!(
            "Segment {}: {:?} -> {:?}",
            self.segment,
            self.state,
            next
        );
        self.state = next;
    }

    /// Feed the next raw chunk and return the spikes it finalised.
    ///
    /// With `is_last` every remaining position is resolved and the segment
    /// moves to `Done`.
    pub fn push_chunk(&mut self, raw: Array2<f32>, is_last: bool) -> Result<Vec<Spike>> {
        if self.state == PeelerState::Done {
            return Err(TdcError::Configuration(format!(
                "Segment {} is already fully peeled",
                self.segment
            )));
        }

        let start = self.preprocessor.position();
        let n_samples = raw.nrows();
        let data = match self.preprocessor.process(raw) {
            Ok(chunk) => chunk.data,
            Err(TdcError::NumericInstability(reason)) => {
                log::warn!(
                    "Segment {} chunk [{}..{}] skipped: {}",
                    self.segment,
                    start,
                    start + n_samples,
                    reason
                );
                Array2::zeros((n_samples, self.preprocessor.n_channels()))
            }
            Err(e) => return Err(e),
        };
        self.residual = concatenate(Axis(0), &[self.residual.view(), data.view()])
            .map_err(|e| TdcError::NumericInstability(e.to_string()))?;

        self.transition(PeelerState::Peeling);
        let buf_end = self.residual_start + self.residual.nrows();
        let ready_end = if is_last {
            buf_end
        } else {
            buf_end.saturating_sub(self.matcher.lookahead())
        }
        .max(self.ready_end);
        let own = (self.ready_end - self.residual_start)..(ready_end - self.residual_start);
        let outcome = self
            .matcher
            .peel(&mut self.residual, self.residual_start, own, self.segment);

        self.transition(PeelerState::Advancing);
        self.ready_end = ready_end;
        let keep_from = ready_end.saturating_sub(self.keep).max(self.residual_start);
        if keep_from > self.residual_start {
            self.residual = self
                .residual
                .slice(s![keep_from - self.residual_start.., ..])
                .to_owned();
            self.residual_start = keep_from;
        }

        let finalised = outcome.spikes;
        if !finalised.is_empty() {
            log::debug!(
                "Segment {}: {} spike(s) up to sample {}",
                self.segment,
                finalised.len(),
                ready_end
            );
        }
        if self.retain_spikes {
            if let Some(first) = finalised.first() {
                // Both runs are sorted; only the overlap near the seam needs merging
                let from = self.spikes.partition_point(|s| spike_order(s, first).is_le());
                self.spikes.extend_from_slice(&finalised);
                self.spikes[from..].sort_by(spike_order);
            }
        }

        self.transition(if is_last {
            PeelerState::Done
        } else {
            PeelerState::Streaming
        });
        Ok(finalised)
    }
}

/// Runs the segment peelers of a recording, resumably
pub struct Peeler {
    catalogue: Arc<Catalogue>,
    params: PeelerParams,
    retry: RetryPolicy,
    chunk_size: usize,
    segments: Vec<SegmentPeeler>,
}

impl Peeler {
    pub fn new(catalogue: Arc<Catalogue>, params: PeelerParams, retry: RetryPolicy) -> Result<Self> {
        let chunk_size = catalogue.preprocessor.chunk_size;
        if chunk_size == 0 {
            return Err(TdcError::Configuration("chunk_size must be > 0".to_string()));
        }
        if params.n_peel_level == 0 {
            return Err(TdcError::Configuration("n_peel_level must be > 0".to_string()));
        }
        Ok(Self {
            catalogue,
            params,
            retry,
            chunk_size,
            segments: Vec::new(),
        })
    }

    pub fn catalogue(&self) -> &Arc<Catalogue> {
        &self.catalogue
    }

    /// Peel the whole recording from scratch
    pub fn run(&mut self, store: &dyn SignalStore, cancel: &CancellationToken) -> Result<Vec<Spike>> {
        let groups = store.channel_groups();
        let group_size = groups
            .get(self.catalogue.channel_group)
            .map(|g| g.len())
            .ok_or_else(|| {
                TdcError::Configuration(format!(
                    "Unknown channel group {}",
                    self.catalogue.channel_group
                ))
            })?;
        if group_size != self.catalogue.n_channels() {
            return Err(TdcError::Configuration(format!(
                "Catalogue has {} channels, group {} has {}",
                self.catalogue.n_channels(),
                self.catalogue.channel_group,
                group_size
            )));
        }

        self.segments = (0..store.segment_count())
            .map(|seg| SegmentPeeler::new(seg, Arc::clone(&self.catalogue), self.params.clone()))
            .collect::<Result<_>>()?;
        log::info!(
            "Peeler run over {} segment(s) with catalogue v{} ({} templates)",
            self.segments.len(),
            self.catalogue.version,
            self.catalogue.templates.len()
        );
        self.resume(store, cancel)
    }

    /// Continue an interrupted run; completed chunks are not redone
    pub fn resume(&mut self, store: &dyn SignalStore, cancel: &CancellationToken) -> Result<Vec<Spike>> {
        profile_scope!("peeler");
        let chunk_size = self.chunk_size;
        let retry = self.retry;
        let group = self.catalogue.channel_group;
        let expected_rate = self.catalogue.sample_rate;

        let results: Vec<Result<()>> = self
            .segments
            .par_iter_mut()
            .map(|state| {
                run_segment(state, store, &retry, group, chunk_size, expected_rate, cancel)
            })
            .collect();

        if let Some(err) = results.into_iter().find_map(|r| r.err()) {
            return Err(err);
        }
        Ok(self.spikes())
    }

    /// Whether every segment is fully peeled
    pub fn is_done(&self) -> bool {
        !self.segments.is_empty() && self.segments.iter().all(|s| s.state == PeelerState::Done)
    }

    /// Accepted spikes of every segment, in segment order
    pub fn spikes(&self) -> Vec<Spike> {
        self.segments
            .iter()
            .flat_map(|s| s.spikes().iter().copied())
            .collect()
    }

    pub fn segment_spikes(&self, segment: usize) -> Option<&[Spike]> {
        self.segments.get(segment).map(|s| s.spikes())
    }
}

fn run_segment(
    state: &mut SegmentPeeler,
    store: &dyn SignalStore,
    retry: &RetryPolicy,
    group: usize,
    chunk_size: usize,
    expected_rate: f64,
    cancel: &CancellationToken,
) -> Result<()> {
    let segment = state.segment();
    let (sample_rate, len) = segment_info(store, segment)?;
    if (sample_rate - expected_rate).abs() > f64::EPSILON * expected_rate.abs().max(1.0) {
        return Err(TdcError::Configuration(format!(
            "Segment {} sampled at {} Hz, catalogue at {} Hz",
            segment, sample_rate, expected_rate
        )));
    }

    while state.state() != PeelerState::Done {
        if cancel.is_cancelled() {
            log::info!(
                "Peeler cancelled on segment {} at sample {}",
                segment,
                state.position()
            );
            return Err(TdcError::Cancelled);
        }
        let start = state.position();
        let end = (start + chunk_size).min(len);
        let raw = read_with_retry(store, retry, segment, group, start..end, SignalKind::Raw)?;
        state.push_chunk(raw, end == len)?;
    }
    log::info!(
        "Segment {} peeled: {} spike(s)",
        segment,
        state.spikes().len()
    );
    Ok(())
}
