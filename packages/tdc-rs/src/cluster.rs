//! Cluster engine
//!
//! Clustering algorithms sit behind the [`ClusterMethod`] trait. The
//! [`ClusterEngine`] owns the label of every pooled waveform and applies the
//! editing operations (merge, split, trash, relabel, order) on top of any
//! labelling. Labels live in a shared `Arc` and are copied on write, so a
//! snapshot handed out earlier never changes under its reader. Centroids are
//! cached per label and only recomputed for labels touched since.

use crate::config::ClusteringMethod;
use crate::error::{Result, TdcError};
use crate::noise::median_in_place;
use crate::types::LABEL_TRASH;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

/// A clustering strategy
pub trait ClusterMethod: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// One label per row of `features`: `>= 0` for a cluster, `LABEL_TRASH`
    /// for rows the method leaves unassigned
    fn fit_or_apply(&self, features: ArrayView2<f32>) -> Result<Vec<i64>>;
}

impl ClusteringMethod {
    /// Instantiate the configured strategy
    pub fn build(&self) -> Box<dyn ClusterMethod> {
        match *self {
            ClusteringMethod::Kmeans {
                n_clusters,
                max_iter,
                seed,
            } => Box::new(KMeans {
                n_clusters,
                max_iter,
                seed,
            }),
            ClusteringMethod::Gmm {
                n_components,
                max_iter,
                seed,
            } => Box::new(GaussianMixture {
                n_components,
                max_iter,
                seed,
            }),
            ClusteringMethod::Density { eps, min_samples } => {
                Box::new(DensityGrow { eps, min_samples })
            }
        }
    }

    /// Same strategy asking for `n` clusters (density methods ignore it)
    pub fn with_count(&self, n: usize) -> Self {
        match self.clone() {
            ClusteringMethod::Kmeans { max_iter, seed, .. } => ClusteringMethod::Kmeans {
                n_clusters: n,
                max_iter,
                seed,
            },
            ClusteringMethod::Gmm { max_iter, seed, .. } => ClusteringMethod::Gmm {
                n_components: n,
                max_iter,
                seed,
            },
            density => density,
        }
    }
}

fn to_f64(features: ArrayView2<f32>) -> Result<Array2<f64>> {
    if features.iter().any(|v| !v.is_finite()) {
        return Err(TdcError::NumericInstability(
            "non-finite feature vector".to_string(),
        ));
    }
    Ok(features.mapv(|v| v as f64))
}

fn sq_dist(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn clamp_count(requested: usize, rows: usize) -> Result<usize> {
    if rows == 0 {
        return Err(TdcError::InsufficientData {
            requested,
            available: 0,
        });
    }
    if requested > rows {
        log::warn!(
            "{}",
            TdcError::InsufficientData {
                requested,
                available: rows
            }
        );
        return Ok(rows);
    }
    Ok(requested.max(1))
}

/// Lloyd's k-means with k-means++ seeding
#[derive(Debug, Clone)]
pub struct KMeans {
    pub n_clusters: usize,
    pub max_iter: usize,
    pub seed: u64,
}

impl KMeans {
    fn init_centers(&self, data: &Array2<f64>, k: usize, rng: &mut StdRng) -> Array2<f64> {
        let n = data.nrows();
        let mut centers = Array2::zeros((k, data.ncols()));
        centers.row_mut(0).assign(&data.row(rng.random_range(0..n)));
        let mut nearest: Vec<f64> = data
            .outer_iter()
            .map(|row| sq_dist(row, centers.row(0)))
            .collect();

        for c in 1..k {
            let total: f64 = nearest.iter().sum();
            let pick = if total > 0.0 {
                let mut target = rng.random::<f64>() * total;
                let mut chosen = n - 1;
                for (i, d) in nearest.iter().enumerate() {
                    if target < *d {
                        chosen = i;
                        break;
                    }
                    target -= d;
                }
                chosen
            } else {
                rng.random_range(0..n)
            };
            centers.row_mut(c).assign(&data.row(pick));
            for (i, row) in data.outer_iter().enumerate() {
                nearest[i] = nearest[i].min(sq_dist(row, centers.row(c)));
            }
        }
        centers
    }

    /// Returns (assignment, centers)
    fn run(&self, data: &Array2<f64>) -> Result<(Vec<usize>, Array2<f64>)> {
        let k = clamp_count(self.n_clusters, data.nrows())?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut centers = self.init_centers(data, k, &mut rng);
        let mut assignment = vec![0usize; data.nrows()];

        for iteration in 0..self.max_iter.max(1) {
            let mut changed = iteration == 0;
            for (i, row) in data.outer_iter().enumerate() {
                let best = nearest_center(row, &centers);
                if best != assignment[i] {
                    assignment[i] = best;
                    changed = true;
                }
            }
            if !changed {
                log::debug!("k-means converged after {} iterations", iteration);
                break;
            }

            let mut sums = Array2::<f64>::zeros(centers.dim());
            let mut counts = vec![0usize; k];
            for (i, row) in data.outer_iter().enumerate() {
                let mut sum = sums.row_mut(assignment[i]);
                sum += &row;
                counts[assignment[i]] += 1;
            }
            for c in 0..k {
                if counts[c] > 0 {
                    let mean = sums.row(c).mapv(|v| v / counts[c] as f64);
                    centers.row_mut(c).assign(&mean);
                } else {
                    // Re-seed an empty cluster on the point farthest from its center
                    let far = data
                        .outer_iter()
                        .enumerate()
                        .map(|(i, row)| (i, sq_dist(row, centers.row(assignment[i]))))
                        .fold((0, f64::NEG_INFINITY), |acc, x| if x.1 > acc.1 { x } else { acc })
                        .0;
                    centers.row_mut(c).assign(&data.row(far));
                }
            }
        }

        Ok((assignment, centers))
    }
}

fn nearest_center(row: ArrayView1<f64>, centers: &Array2<f64>) -> usize {
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for (c, center) in centers.outer_iter().enumerate() {
        let d = sq_dist(row, center);
        if d < best_dist {
            best_dist = d;
            best = c;
        }
    }
    best
}

impl ClusterMethod for KMeans {
    fn name(&self) -> &'static str {
        "kmeans"
    }

    fn fit_or_apply(&self, features: ArrayView2<f32>) -> Result<Vec<i64>> {
        let data = to_f64(features)?;
        let (assignment, _) = self.run(&data)?;
        Ok(assignment.into_iter().map(|a| a as i64).collect())
    }
}

/// Diagonal-covariance Gaussian mixture fitted by EM, seeded with k-means
#[derive(Debug, Clone)]
pub struct GaussianMixture {
    pub n_components: usize,
    pub max_iter: usize,
    pub seed: u64,
}

const GMM_VARIANCE_FLOOR: f64 = 1e-6;
const GMM_TOLERANCE: f64 = 1e-6;

impl ClusterMethod for GaussianMixture {
    fn name(&self) -> &'static str {
        "gmm"
    }

    fn fit_or_apply(&self, features: ArrayView2<f32>) -> Result<Vec<i64>> {
        let data = to_f64(features)?;
        let (n, dim) = data.dim();
        let seeding = KMeans {
            n_clusters: self.n_components,
            max_iter: self.max_iter,
            seed: self.seed,
        };
        let (assignment, mut means) = seeding.run(&data)?;
        let k = means.nrows();

        let mut variances = Array2::<f64>::from_elem((k, dim), 1.0);
        let mut weights = vec![1.0 / k as f64; k];
        let mut resp = Array2::<f64>::zeros((n, k));
        for (i, &a) in assignment.iter().enumerate() {
            resp[[i, a]] = 1.0;
        }

        let mut previous = f64::NEG_INFINITY;
        for iteration in 0..self.max_iter.max(1) {
            // M-step
            for c in 0..k {
                let mass: f64 = resp.column(c).sum();
                if mass <= f64::EPSILON {
                    weights[c] = f64::EPSILON;
                    continue;
                }
                weights[c] = mass / n as f64;
                let mean = resp.column(c).dot(&data) / mass;
                let mut var = Array1::<f64>::zeros(dim);
                for (i, row) in data.outer_iter().enumerate() {
                    let diff = &row - &mean;
                    var.scaled_add(resp[[i, c]], &diff.mapv(|d| d * d));
                }
                var.mapv_inplace(|v| (v / mass).max(GMM_VARIANCE_FLOOR));
                means.row_mut(c).assign(&mean);
                variances.row_mut(c).assign(&var);
            }

            // E-step with log-sum-exp
            let mut log_likelihood = 0.0;
            for (i, row) in data.outer_iter().enumerate() {
                let mut logp = vec![0.0f64; k];
                for c in 0..k {
                    let mut acc = weights[c].ln();
                    for d in 0..dim {
                        let var = variances[[c, d]];
                        let diff = row[d] - means[[c, d]];
                        acc -= 0.5 * ((2.0 * std::f64::consts::PI * var).ln() + diff * diff / var);
                    }
                    logp[c] = acc;
                }
                let max = logp.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let norm = max + logp.iter().map(|l| (l - max).exp()).sum::<f64>().ln();
                log_likelihood += norm;
                for c in 0..k {
                    resp[[i, c]] = (logp[c] - norm).exp();
                }
            }

            if !log_likelihood.is_finite() {
                return Err(TdcError::NumericInstability(
                    "Gaussian mixture likelihood diverged".to_string(),
                ));
            }
            if (log_likelihood - previous).abs() < GMM_TOLERANCE * log_likelihood.abs().max(1.0) {
                log::debug!("GMM converged after {} iterations", iteration + 1);
                break;
            }
            previous = log_likelihood;
        }

        Ok(resp
            .outer_iter()
            .map(|r| {
                let mut best = 0;
                for c in 1..k {
                    if r[c] > r[best] {
                        best = c;
                    }
                }
                best as i64
            })
            .collect())
    }
}

/// Region growing over the ε-neighbourhood graph (DBSCAN-like).
/// Points reachable from no core point are left as `LABEL_TRASH`.
#[derive(Debug, Clone)]
pub struct DensityGrow {
    pub eps: f64,
    pub min_samples: usize,
}

impl ClusterMethod for DensityGrow {
    fn name(&self) -> &'static str {
        "density"
    }

    fn fit_or_apply(&self, features: ArrayView2<f32>) -> Result<Vec<i64>> {
        let data = to_f64(features)?;
        let n = data.nrows();
        let eps2 = self.eps * self.eps;

        let neighbours: Vec<Vec<usize>> = (0..n)
            .map(|i| {
                (0..n)
                    .filter(|&j| sq_dist(data.row(i), data.row(j)) <= eps2)
                    .collect()
            })
            .collect();
        let is_core = |i: usize| neighbours[i].len() >= self.min_samples.max(1);

        let mut labels = vec![LABEL_TRASH; n];
        let mut next = 0i64;
        for seed in 0..n {
            if labels[seed] != LABEL_TRASH || !is_core(seed) {
                continue;
            }
            labels[seed] = next;
            let mut queue = VecDeque::from([seed]);
            while let Some(p) = queue.pop_front() {
                if !is_core(p) {
                    continue;
                }
                for &q in &neighbours[p] {
                    if labels[q] == LABEL_TRASH {
                        labels[q] = next;
                        queue.push_back(q);
                    }
                }
            }
            next += 1;
        }

        log::debug!(
            "Density clustering: {} regions, {} unassigned",
            next,
            labels.iter().filter(|&&l| l == LABEL_TRASH).count()
        );
        Ok(labels)
    }
}

/// Label state of the waveform pool
#[derive(Debug, Clone)]
pub struct ClusterEngine {
    features: Array2<f32>,
    /// Flattened waveforms, used for centroids
    waveforms: Array2<f32>,
    labels: Arc<Vec<i64>>,
    centroids: BTreeMap<i64, Array1<f32>>,
    dirty: BTreeSet<i64>,
    next_label: i64,
}

impl ClusterEngine {
    /// Every row starts in cluster 0
    pub fn new(features: Array2<f32>, waveforms: Array2<f32>) -> Result<Self> {
        if features.nrows() != waveforms.nrows() {
            return Err(TdcError::Configuration(format!(
                "{} feature rows for {} waveforms",
                features.nrows(),
                waveforms.nrows()
            )));
        }
        let n = features.nrows();
        let mut engine = Self {
            features,
            waveforms,
            labels: Arc::new(vec![0; n]),
            centroids: BTreeMap::new(),
            dirty: BTreeSet::new(),
            next_label: 1,
        };
        engine.dirty.insert(0);
        Ok(engine)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[i64] {
        &self.labels
    }

    /// Shared snapshot of the current labels; later edits do not affect it
    pub fn snapshot(&self) -> Arc<Vec<i64>> {
        Arc::clone(&self.labels)
    }

    pub fn features(&self) -> ArrayView2<f32> {
        self.features.view()
    }

    /// Replace the feature vectors (after a new projection)
    pub fn set_features(&mut self, features: Array2<f32>) -> Result<()> {
        if features.nrows() != self.len() {
            return Err(TdcError::Configuration(format!(
                "{} feature rows for {} labelled waveforms",
                features.nrows(),
                self.len()
            )));
        }
        self.features = features;
        Ok(())
    }

    /// Labels with at least one member, trash excluded, ascending
    pub fn active_labels(&self) -> Vec<i64> {
        self.labels
            .iter()
            .copied()
            .filter(|&l| l != LABEL_TRASH)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn members(&self, label: i64) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, &l)| l == label)
            .map(|(i, _)| i)
            .collect()
    }

    /// Population of every label present, trash included
    pub fn cluster_counts(&self) -> BTreeMap<i64, usize> {
        let mut counts = BTreeMap::new();
        for &l in self.labels.iter() {
            *counts.entry(l).or_insert(0) += 1;
        }
        counts
    }

    /// Boolean selection of the rows carrying any of `labels`
    pub fn select_peaks_of_clusters(&self, labels: &[i64]) -> Vec<bool> {
        let wanted: BTreeSet<i64> = labels.iter().copied().collect();
        self.labels.iter().map(|l| wanted.contains(l)).collect()
    }

    fn ensure_active(&self, label: i64) -> Result<()> {
        if label == LABEL_TRASH || !self.labels.contains(&label) {
            return Err(TdcError::InvalidLabel(label));
        }
        Ok(())
    }

    fn check_selection(&self, selection: &[bool]) -> Result<()> {
        if selection.len() != self.len() {
            return Err(TdcError::Configuration(format!(
                "Selection of {} for {} spikes",
                selection.len(),
                self.len()
            )));
        }
        Ok(())
    }

    /// Commit a new label vector, invalidating every label it touches
    fn commit(&mut self, new_labels: Vec<i64>) {
        for (old, new) in self.labels.iter().zip(&new_labels) {
            if old != new {
                self.dirty.insert(*old);
                self.dirty.insert(*new);
            }
        }
        if let Some(&max) = new_labels.iter().max() {
            self.next_label = self.next_label.max(max + 1);
        }
        *Arc::make_mut(&mut self.labels) = new_labels;
        let present: BTreeSet<i64> = self.labels.iter().copied().collect();
        self.centroids.retain(|label, _| present.contains(label));
    }

    /// Run a clustering strategy over every non-trashed row and order the
    /// result by power
    pub fn find_clusters(&mut self, method: &dyn ClusterMethod) -> Result<()> {
        let rows: Vec<usize> = (0..self.len())
            .filter(|&i| self.labels[i] != LABEL_TRASH)
            .collect();
        let subset = self.features.select(Axis(0), &rows);
        let assignment = method.fit_or_apply(subset.view())?;

        let mut new_labels = (*self.labels).clone();
        for (&i, &a) in rows.iter().zip(&assignment) {
            new_labels[i] = a;
        }
        self.centroids.clear();
        self.dirty.clear();
        self.dirty.extend(new_labels.iter().copied());
        self.next_label = 0;
        self.commit(new_labels);
        self.order_by_power();

        log::info!(
            "{} found {} clusters over {} spikes",
            method.name(),
            self.active_labels().len(),
            rows.len()
        );
        Ok(())
    }

    /// Relabel active clusters to `0..m` by descending population, ties by
    /// ascending previous label. Trash is untouched.
    pub fn order_by_power(&mut self) {
        let counts = self.cluster_counts();
        let mut order: Vec<(i64, usize)> = counts
            .into_iter()
            .filter(|(l, _)| *l != LABEL_TRASH)
            .collect();
        order.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let mapping: BTreeMap<i64, i64> = order
            .iter()
            .enumerate()
            .map(|(new, (old, _))| (*old, new as i64))
            .collect();

        let remapped: Vec<i64> = self
            .labels
            .iter()
            .map(|l| mapping.get(l).copied().unwrap_or(*l))
            .collect();
        *Arc::make_mut(&mut self.labels) = remapped;

        self.centroids = std::mem::take(&mut self.centroids)
            .into_iter()
            .filter_map(|(l, c)| mapping.get(&l).map(|&new| (new, c)))
            .collect();
        self.dirty = self
            .dirty
            .iter()
            .map(|l| mapping.get(l).copied().unwrap_or(*l))
            .collect();
        self.next_label = mapping.len() as i64;
    }

    /// Collapse `labels` into the smallest of them
    pub fn merge(&mut self, labels: &[i64]) -> Result<i64> {
        let set: BTreeSet<i64> = labels.iter().copied().collect();
        for &l in &set {
            self.ensure_active(l)?;
        }
        let Some(&target) = set.iter().next() else {
            return Err(TdcError::DegenerateCluster(
                "merge needs at least one label".to_string(),
            ));
        };

        let new_labels = self
            .labels
            .iter()
            .map(|l| if set.contains(l) { target } else { *l })
            .collect();
        self.commit(new_labels);
        log::info!("Merged {:?} into {}", set, target);
        Ok(target)
    }

    /// Re-cluster the members of `label` into `n` sub-clusters with fresh
    /// labels, then order by power. Returns the labels now held by the
    /// former members.
    ///
    /// Fewer than two sub-clusters, or any sub-cluster with fewer than two
    /// members, leaves the labelling unchanged. Density methods find their
    /// own number of regions and ignore `n`.
    pub fn split(&mut self, label: i64, n: usize, method: &ClusteringMethod) -> Result<Vec<i64>> {
        self.ensure_active(label)?;
        if matches!(method, ClusteringMethod::Density { .. }) {
            log::warn!(
                "Density split of {} ignores the requested count of {}",
                label,
                n
            );
        }
        let members = self.members(label);
        let subset = self.features.select(Axis(0), &members);
        let strategy = method.with_count(n).build();
        let mut assignment = strategy.fit_or_apply(subset.view())?;
        attach_unassigned(&mut assignment, subset.view());

        let mut sizes: BTreeMap<i64, usize> = BTreeMap::new();
        for &a in &assignment {
            *sizes.entry(a).or_insert(0) += 1;
        }
        if sizes.len() < 2 {
            return Err(TdcError::DegenerateCluster(format!(
                "split of {} produced a single cluster",
                label
            )));
        }
        if let Some((sub, size)) = sizes.iter().find(|(_, &s)| s < 2) {
            return Err(TdcError::DegenerateCluster(format!(
                "split of {} produced sub-cluster {} with {} member(s)",
                label, sub, size
            )));
        }

        let fresh: BTreeMap<i64, i64> = sizes
            .keys()
            .enumerate()
            .map(|(k, &sub)| (sub, self.next_label + k as i64))
            .collect();
        let mut new_labels = (*self.labels).clone();
        for (&i, a) in members.iter().zip(&assignment) {
            new_labels[i] = fresh[a];
        }
        self.commit(new_labels);
        self.order_by_power();

        let result: BTreeSet<i64> = members.iter().map(|&i| self.labels[i]).collect();
        log::info!("Split {} into {:?}", label, result);
        Ok(result.into_iter().collect())
    }

    /// Move the selected spikes to the trash. Reversible with
    /// [`change_spike_label`](Self::change_spike_label).
    pub fn move_to_trash(&mut self, selection: &[bool]) -> Result<()> {
        self.check_selection(selection)?;
        let new_labels = self
            .labels
            .iter()
            .zip(selection)
            .map(|(&l, &sel)| if sel { LABEL_TRASH } else { l })
            .collect();
        self.commit(new_labels);
        Ok(())
    }

    /// Give the selected spikes an explicit label (existing, new, or trash)
    pub fn change_spike_label(&mut self, selection: &[bool], label: i64) -> Result<()> {
        self.check_selection(selection)?;
        if label < 0 && label != LABEL_TRASH {
            return Err(TdcError::InvalidLabel(label));
        }
        let new_labels = self
            .labels
            .iter()
            .zip(selection)
            .map(|(&l, &sel)| if sel { label } else { l })
            .collect();
        self.commit(new_labels);
        Ok(())
    }

    /// Median waveform of every active label, recomputing only labels
    /// edited since the last call
    pub fn centroids(&mut self) -> Result<&BTreeMap<i64, Array1<f32>>> {
        let active: BTreeSet<i64> = self.active_labels().into_iter().collect();
        let stale: Vec<i64> = active
            .iter()
            .copied()
            .filter(|l| self.dirty.contains(l) || !self.centroids.contains_key(l))
            .collect();

        for label in stale {
            let members = self.members(label);
            let centroid = median_rows(self.waveforms.view(), &members);
            if centroid.iter().any(|v| !v.is_finite()) {
                return Err(TdcError::NumericInstability(format!(
                    "centroid of cluster {} is not finite",
                    label
                )));
            }
            self.centroids.insert(label, centroid);
        }
        self.dirty.clear();
        Ok(&self.centroids)
    }

    /// Labels whose centroid is out of date
    pub fn stale_labels(&self) -> Vec<i64> {
        self.active_labels()
            .into_iter()
            .filter(|l| self.dirty.contains(l) || !self.centroids.contains_key(l))
            .collect()
    }
}

fn median_rows(data: ArrayView2<f32>, rows: &[usize]) -> Array1<f32> {
    let mut scratch = vec![0.0f32; rows.len()];
    Array1::from_shape_fn(data.ncols(), |d| {
        for (dst, &r) in scratch.iter_mut().zip(rows) {
            *dst = data[[r, d]];
        }
        median_in_place(&mut scratch)
    })
}

/// Give rows left unassigned by a density method the label of the nearest
/// assigned row
fn attach_unassigned(assignment: &mut [i64], features: ArrayView2<f32>) {
    let assigned: Vec<usize> = (0..assignment.len())
        .filter(|&i| assignment[i] != LABEL_TRASH)
        .collect();
    if assigned.is_empty() {
        return;
    }
    for i in 0..assignment.len() {
        if assignment[i] != LABEL_TRASH {
            continue;
        }
        let mut best = assigned[0];
        let mut best_dist = f32::INFINITY;
        for &j in &assigned {
            let d: f32 = features
                .row(i)
                .iter()
                .zip(features.row(j).iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum();
            if d < best_dist {
                best_dist = d;
                best = j;
            }
        }
        assignment[i] = assignment[best];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Three well separated 2-D blobs of 30, 20 and 10 points
    fn blobs() -> Array2<f32> {
        let centers = [(0.0, 0.0, 30), (10.0, 10.0, 20), (-10.0, 10.0, 10)];
        let mut rows = Vec::new();
        for (cx, cy, count) in centers {
            for k in 0..count {
                let dx = ((k * 7) % 5) as f32 * 0.1 - 0.2;
                let dy = ((k * 3) % 5) as f32 * 0.1 - 0.2;
                rows.push([cx + dx, cy + dy]);
            }
        }
        Array2::from_shape_fn((rows.len(), 2), |(i, d)| rows[i][d])
    }

    fn engine() -> ClusterEngine {
        let features = blobs();
        let waveforms = features.clone();
        ClusterEngine::new(features, waveforms).unwrap()
    }

    fn kmeans(n: usize) -> ClusteringMethod {
        ClusteringMethod::Kmeans {
            n_clusters: n,
            max_iter: 100,
            seed: 7,
        }
    }

    #[test]
    fn test_kmeans_orders_by_power() {
        let mut engine = engine();
        engine.find_clusters(kmeans(3).build().as_ref()).unwrap();
        let counts = engine.cluster_counts();
        assert_eq!(counts.get(&0), Some(&30));
        assert_eq!(counts.get(&1), Some(&20));
        assert_eq!(counts.get(&2), Some(&10));
        assert!(engine.labels()[..30].iter().all(|&l| l == 0));
    }

    #[test]
    fn test_gmm_and_density_recover_blobs() {
        let features = blobs();
        let gmm = ClusteringMethod::Gmm {
            n_components: 3,
            max_iter: 100,
            seed: 1,
        };
        let labels = gmm.build().fit_or_apply(features.view()).unwrap();
        assert_eq!(labels.iter().collect::<BTreeSet<_>>().len(), 3);
        assert!(labels[..30].iter().all(|&l| l == labels[0]));

        let density = ClusteringMethod::Density {
            eps: 1.0,
            min_samples: 3,
        };
        let labels = density.build().fit_or_apply(features.view()).unwrap();
        assert_eq!(labels[0], 0);
        assert_eq!(labels[30], 1);
        assert_eq!(labels[50], 2);
        assert!(!labels.contains(&LABEL_TRASH));
    }

    #[test]
    fn test_merge_then_split_preserves_members() {
        let mut engine = engine();
        engine.find_clusters(kmeans(3).build().as_ref()).unwrap();
        let before: BTreeSet<usize> = engine
            .members(1)
            .into_iter()
            .chain(engine.members(2))
            .collect();

        let target = engine.merge(&[2, 1]).unwrap();
        assert_eq!(target, 1);
        assert_eq!(engine.members(1).len(), 30);

        let parts = engine.split(1, 2, &kmeans(2)).unwrap();
        assert_eq!(parts.len(), 2);
        let after: BTreeSet<usize> = parts.iter().flat_map(|&l| engine.members(l)).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_degenerate_split_leaves_labels_unchanged() {
        let features = Array2::from_shape_fn((3, 1), |(i, _)| if i == 2 { 100.0 } else { i as f32 * 0.01 });
        let mut engine = ClusterEngine::new(features.clone(), features).unwrap();
        let snapshot = engine.snapshot();
        let err = engine.split(0, 2, &kmeans(2)).unwrap_err();
        assert!(matches!(err, TdcError::DegenerateCluster(_)));
        assert_eq!(engine.labels(), snapshot.as_slice());
    }

    #[test]
    fn test_trash_is_reversible_and_excluded_from_centroids() {
        let mut engine = engine();
        engine.find_clusters(kmeans(3).build().as_ref()).unwrap();
        let snapshot = engine.snapshot();

        let selection = engine.select_peaks_of_clusters(&[2]);
        engine.move_to_trash(&selection).unwrap();
        assert_eq!(engine.cluster_counts().get(&LABEL_TRASH), Some(&10));
        assert_eq!(engine.active_labels(), vec![0, 1]);
        assert!(engine.centroids().unwrap().get(&2).is_none());
        // The snapshot taken before the edit is untouched
        assert_eq!(snapshot.iter().filter(|&&l| l == 2).count(), 10);

        let trashed = engine.select_peaks_of_clusters(&[LABEL_TRASH]);
        engine.change_spike_label(&trashed, 2).unwrap();
        assert_eq!(engine.labels(), snapshot.as_slice());
    }

    #[test]
    fn test_centroids_are_recomputed_lazily() {
        let mut engine = engine();
        engine.find_clusters(kmeans(3).build().as_ref()).unwrap();
        let c0 = engine.centroids().unwrap()[&0].clone();
        assert!(c0[0].abs() < 0.5 && c0[1].abs() < 0.5);
        assert!(engine.stale_labels().is_empty());

        engine.merge(&[1, 2]).unwrap();
        assert_eq!(engine.stale_labels(), vec![1]);
        let centroids = engine.centroids().unwrap();
        assert_eq!(centroids[&0], c0);
        assert_eq!(centroids.len(), 2);
    }

    #[test]
    fn test_invalid_labels_rejected() {
        let mut engine = engine();
        assert!(matches!(engine.merge(&[0, 5]), Err(TdcError::InvalidLabel(5))));
        assert!(matches!(
            engine.change_spike_label(&vec![false; 60], -3),
            Err(TdcError::InvalidLabel(-3))
        ));
        assert!(engine.move_to_trash(&[true]).is_err());
    }

    #[test]
    fn test_density_split_follows_the_data() {
        let mut engine = engine();
        engine.find_clusters(kmeans(3).build().as_ref()).unwrap();
        engine.merge(&[1, 2]).unwrap();
        let density = ClusteringMethod::Density {
            eps: 1.0,
            min_samples: 3,
        };
        let parts = engine.split(1, 5, &density).unwrap();
        assert_eq!(parts.len(), 2);
        let counts = engine.cluster_counts();
        assert_eq!(counts.get(&1), Some(&20));
        assert_eq!(counts.get(&2), Some(&10));
    }
}
