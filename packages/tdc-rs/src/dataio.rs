//! Signal storage collaborator
//!
//! The pipeline never touches a file format directly: every chunk goes
//! through the `SignalStore` trait. Raw and processed signals are addressed
//! by (segment, channel group, sample range). Arrays are `[samples × channels]`.

use crate::error::{Result, TdcError};
use crate::types::SignalKind;
use ndarray::{Array2, ArrayView2, Axis};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Range;
use std::time::Duration;
use thiserror::Error;

/// Failures reported by a storage backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Unknown segment: {0}")]
    UnknownSegment(usize),

    #[error("Unknown channel group: {0}")]
    UnknownGroup(usize),

    #[error("Range {start}..{end} outside segment of {len} samples")]
    OutOfRange { start: usize, end: usize, len: usize },

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Only backend failures are worth a retry; addressing errors never heal
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Trait every signal repository must implement
pub trait SignalStore: Send + Sync {
    fn segment_count(&self) -> usize;

    /// Channel indices of every channel group
    fn channel_groups(&self) -> Vec<Vec<usize>>;

    fn sample_rate(&self, segment: usize) -> StoreResult<f64>;

    /// Number of samples in a segment
    fn segment_len(&self, segment: usize) -> StoreResult<usize>;

    /// Read a `[samples × group channels]` block
    fn read(
        &self,
        segment: usize,
        channel_group: usize,
        range: Range<usize>,
        kind: SignalKind,
    ) -> StoreResult<Array2<f32>>;

    /// Store preprocessed samples starting at `start`
    fn write_processed(
        &self,
        segment: usize,
        channel_group: usize,
        start: usize,
        samples: ArrayView2<f32>,
    ) -> StoreResult<()>;

    fn group_size(&self, channel_group: usize) -> StoreResult<usize> {
        self.channel_groups()
            .get(channel_group)
            .map(|g| g.len())
            .ok_or(StoreError::UnknownGroup(channel_group))
    }
}

/// Sample rate and length of a segment
pub fn segment_info(store: &dyn SignalStore, segment: usize) -> Result<(f64, usize)> {
    let to_io = |e: StoreError| TdcError::Io {
        segment,
        attempts: 1,
        message: e.to_string(),
    };
    let sample_rate = store.sample_rate(segment).map_err(to_io)?;
    let len = store.segment_len(segment).map_err(to_io)?;
    Ok((sample_rate, len))
}

/// Bounded exponential backoff applied at chunk granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(16);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

/// Read a chunk, retrying transient backend failures
pub fn read_with_retry(
    store: &dyn SignalStore,
    policy: &RetryPolicy,
    segment: usize,
    channel_group: usize,
    range: Range<usize>,
    kind: SignalKind,
) -> Result<Array2<f32>> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match store.read(segment, channel_group, range.clone(), kind) {
            Ok(block) => return Ok(block),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let wait = policy.backoff(attempt - 1);
                log::warn!(
                    "Read of segment {} [{}..{}] failed (attempt {}/{}): {}. Retrying in {:?}",
                    segment,
                    range.start,
                    range.end,
                    attempt,
                    max_attempts,
                    e,
                    wait
                );
                std::thread::sleep(wait);
            }
            Err(e) => {
                log::error!(
                    "Read of segment {} [{}..{}] abandoned after {} attempt(s): {}",
                    segment,
                    range.start,
                    range.end,
                    attempt,
                    e
                );
                return Err(TdcError::Io {
                    segment,
                    attempts: attempt,
                    message: e.to_string(),
                });
            }
        }
    }
}

/// Write processed samples, retrying transient backend failures
pub fn write_with_retry(
    store: &dyn SignalStore,
    policy: &RetryPolicy,
    segment: usize,
    channel_group: usize,
    start: usize,
    samples: ArrayView2<f32>,
) -> Result<()> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match store.write_processed(segment, channel_group, start, samples) {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                log::warn!(
                    "Write to segment {} at {} failed (attempt {}/{}): {}",
                    segment,
                    start,
                    attempt,
                    max_attempts,
                    e
                );
                std::thread::sleep(policy.backoff(attempt - 1));
            }
            Err(e) => {
                return Err(TdcError::Io {
                    segment,
                    attempts: attempt,
                    message: e.to_string(),
                })
            }
        }
    }
}

struct SegmentData {
    sample_rate: f64,
    raw: Array2<f32>,
    processed: RwLock<HashMap<usize, Array2<f32>>>,
}

/// Store keeping every segment in memory. Used by tests and small recordings.
pub struct InMemorySignalStore {
    segments: Vec<SegmentData>,
    channel_groups: Vec<Vec<usize>>,
}

impl InMemorySignalStore {
    /// All channels in a single group
    pub fn new(segments: Vec<Array2<f32>>, sample_rate: f64) -> Self {
        let n_channels = segments.first().map(|s| s.ncols()).unwrap_or(0);
        Self::with_groups(segments, sample_rate, vec![(0..n_channels).collect()])
    }

    pub fn with_groups(
        segments: Vec<Array2<f32>>,
        sample_rate: f64,
        channel_groups: Vec<Vec<usize>>,
    ) -> Self {
        let segments = segments
            .into_iter()
            .map(|raw| SegmentData {
                sample_rate,
                raw,
                processed: RwLock::new(HashMap::new()),
            })
            .collect();

        Self {
            segments,
            channel_groups,
        }
    }

    fn segment(&self, segment: usize) -> StoreResult<&SegmentData> {
        self.segments
            .get(segment)
            .ok_or(StoreError::UnknownSegment(segment))
    }

    fn group(&self, channel_group: usize) -> StoreResult<&[usize]> {
        self.channel_groups
            .get(channel_group)
            .map(|g| g.as_slice())
            .ok_or(StoreError::UnknownGroup(channel_group))
    }
}

impl SignalStore for InMemorySignalStore {
    fn segment_count(&self) -> usize {
        self.segments.len()
    }

    fn channel_groups(&self) -> Vec<Vec<usize>> {
        self.channel_groups.clone()
    }

    fn sample_rate(&self, segment: usize) -> StoreResult<f64> {
        Ok(self.segment(segment)?.sample_rate)
    }

    fn segment_len(&self, segment: usize) -> StoreResult<usize> {
        Ok(self.segment(segment)?.raw.nrows())
    }

    fn read(
        &self,
        segment: usize,
        channel_group: usize,
        range: Range<usize>,
        kind: SignalKind,
    ) -> StoreResult<Array2<f32>> {
        let data = self.segment(segment)?;
        let channels = self.group(channel_group)?;
        let len = data.raw.nrows();
        if range.start > range.end || range.end > len {
            return Err(StoreError::OutOfRange {
                start: range.start,
                end: range.end,
                len,
            });
        }

        match kind {
            SignalKind::Raw => {
                let rows = data.raw.slice(ndarray::s![range, ..]);
                Ok(rows.select(Axis(1), channels))
            }
            SignalKind::Processed => {
                let processed = data.processed.read();
                match processed.get(&channel_group) {
                    Some(block) => Ok(block.slice(ndarray::s![range, ..]).to_owned()),
                    None => Ok(Array2::zeros((range.len(), channels.len()))),
                }
            }
        }
    }

    fn write_processed(
        &self,
        segment: usize,
        channel_group: usize,
        start: usize,
        samples: ArrayView2<f32>,
    ) -> StoreResult<()> {
        let data = self.segment(segment)?;
        let n_channels = self.group(channel_group)?.len();
        let len = data.raw.nrows();
        let end = start + samples.nrows();
        if end > len || samples.ncols() != n_channels {
            return Err(StoreError::OutOfRange { start, end, len });
        }

        let mut processed = data.processed.write();
        let block = processed
            .entry(channel_group)
            .or_insert_with(|| Array2::zeros((len, n_channels)));
        block.slice_mut(ndarray::s![start..end, ..]).assign(&samples);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ramp_store() -> InMemorySignalStore {
        let raw = Array2::from_shape_fn((100, 4), |(i, c)| (i * 10 + c) as f32);
        InMemorySignalStore::with_groups(vec![raw], 1000.0, vec![vec![0, 1], vec![2, 3]])
    }

    struct FlakyStore {
        inner: InMemorySignalStore,
        failures_left: AtomicU32,
    }

    impl SignalStore for FlakyStore {
        fn segment_count(&self) -> usize {
            self.inner.segment_count()
        }
        fn channel_groups(&self) -> Vec<Vec<usize>> {
            self.inner.channel_groups()
        }
        fn sample_rate(&self, segment: usize) -> StoreResult<f64> {
            self.inner.sample_rate(segment)
        }
        fn segment_len(&self, segment: usize) -> StoreResult<usize> {
            self.inner.segment_len(segment)
        }
        fn read(
            &self,
            segment: usize,
            channel_group: usize,
            range: Range<usize>,
            kind: SignalKind,
        ) -> StoreResult<Array2<f32>> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("disk busy".to_string()));
            }
            self.inner.read(segment, channel_group, range, kind)
        }
        fn write_processed(
            &self,
            segment: usize,
            channel_group: usize,
            start: usize,
            samples: ArrayView2<f32>,
        ) -> StoreResult<()> {
            self.inner
                .write_processed(segment, channel_group, start, samples)
        }
    }

    #[test]
    fn test_read_group_columns() {
        let store = ramp_store();
        let block = store.read(0, 1, 5..7, SignalKind::Raw).unwrap();
        assert_eq!(block.shape(), &[2, 2]);
        assert_eq!(block[[0, 0]], 52.0);
        assert_eq!(block[[1, 1]], 63.0);
    }

    #[test]
    fn test_processed_roundtrip_and_range_check() {
        let store = ramp_store();
        let block = Array2::from_elem((10, 2), 1.5f32);
        store.write_processed(0, 0, 20, block.view()).unwrap();
        let back = store.read(0, 0, 18..32, SignalKind::Processed).unwrap();
        assert_eq!(back[[1, 0]], 0.0);
        assert_eq!(back[[2, 0]], 1.5);
        assert_eq!(back[[12, 1]], 0.0);

        let err = store.read(0, 0, 90..120, SignalKind::Raw).unwrap_err();
        assert!(matches!(err, StoreError::OutOfRange { .. }));
    }

    #[test]
    fn test_retry_recovers_transient_failure() {
        let store = FlakyStore {
            inner: ramp_store(),
            failures_left: AtomicU32::new(2),
        };
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        };
        let block = read_with_retry(&store, &policy, 0, 0, 0..4, SignalKind::Raw).unwrap();
        assert_eq!(block.nrows(), 4);
    }

    #[test]
    fn test_retry_exhaustion_surfaces_io_error() {
        let store = FlakyStore {
            inner: ramp_store(),
            failures_left: AtomicU32::new(5),
        };
        let policy = RetryPolicy {
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
        };
        let err = read_with_retry(&store, &policy, 0, 0, 0..4, SignalKind::Raw).unwrap_err();
        assert!(matches!(err, TdcError::Io { attempts: 2, .. }));
    }
}
