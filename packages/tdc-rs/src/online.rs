//! Live-acquisition adapter
//!
//! An acquisition thread pushes raw chunks into a bounded queue; a worker
//! thread peels them as one continuous segment. When peeling falls behind,
//! the queue fills and `push` blocks, slowing the producer down. The
//! residual buffer is trimmed after every chunk, so memory stays bounded
//! however long the acquisition runs.

use crate::catalogue::Catalogue;
use crate::config::PeelerParams;
use crate::error::{Result, TdcError};
use crate::peeler::SegmentPeeler;
use crate::profiling::ProfileScope;
use crate::types::Spike;
use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use ndarray::Array2;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Streaming Peeler fed chunk by chunk
pub struct OnlinePeeler {
    chunks: Option<Sender<Array2<f32>>>,
    spikes: Receiver<Spike>,
    worker: Option<JoinHandle<Result<()>>>,
    cancel: CancellationToken,
}

impl OnlinePeeler {
    /// Start the worker. `capacity` is the number of chunks that may wait
    /// before `push` blocks.
    pub fn start(
        catalogue: Arc<Catalogue>,
        params: PeelerParams,
        capacity: usize,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let sample_rate = catalogue.sample_rate;
        let mut peeler = SegmentPeeler::new(0, catalogue, params)?.retain_spikes(false);
        let (chunk_tx, chunk_rx) = bounded::<Array2<f32>>(capacity.max(1));
        let (spike_tx, spike_rx) = unbounded();
        let token = cancel.clone();

        let worker = std::thread::Builder::new()
            .name("tdc-online-peeler".to_string())
            .spawn(move || worker_loop(&mut peeler, chunk_rx, spike_tx, sample_rate, token))?;

        log::info!("Online peeler started (queue of {} chunks)", capacity.max(1));
        Ok(Self {
            chunks: Some(chunk_tx),
            spikes: spike_rx,
            worker: Some(worker),
            cancel,
        })
    }

    /// Queue a raw chunk, blocking while the queue is full
    pub fn push(&self, chunk: Array2<f32>) -> Result<()> {
        let sender = self.sender()?;
        sender.send(chunk).map_err(|_| self.stopped())
    }

    /// Queue a raw chunk without blocking; `Ok(false)` when the queue is full
    pub fn try_push(&self, chunk: Array2<f32>) -> Result<bool> {
        match self.sender()?.try_send(chunk) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Disconnected(_)) => Err(self.stopped()),
        }
    }

    /// Spikes finalised so far and not yet collected
    pub fn drain_spikes(&self) -> Vec<Spike> {
        self.spikes.try_iter().collect()
    }

    /// Stop accepting chunks, peel what remains and return the spikes not
    /// yet drained
    pub fn finish(mut self) -> Result<Vec<Spike>> {
        self.chunks.take();
        let outcome = match self.worker.take() {
            Some(handle) => handle.join().map_err(|_| {
                TdcError::NumericInstability("online peeler worker panicked".to_string())
            })?,
            None => Ok(()),
        };
        outcome?;
        Ok(self.drain_spikes())
    }

    fn sender(&self) -> Result<&Sender<Array2<f32>>> {
        self.chunks
            .as_ref()
            .ok_or_else(|| TdcError::Configuration("online peeler already finished".to_string()))
    }

    fn stopped(&self) -> TdcError {
        if self.cancel.is_cancelled() {
            TdcError::Cancelled
        } else {
            TdcError::Configuration("online peeler worker stopped".to_string())
        }
    }
}

impl Drop for OnlinePeeler {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.take() {
            self.cancel.cancel();
            self.chunks.take();
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    peeler: &mut SegmentPeeler,
    chunks: Receiver<Array2<f32>>,
    spikes: Sender<Spike>,
    sample_rate: f64,
    cancel: CancellationToken,
) -> Result<()> {
    let mut forwarded = 0usize;
    loop {
        if cancel.is_cancelled() {
            log::info!("Online peeler cancelled at sample {}", peeler.position());
            return Err(TdcError::Cancelled);
        }
        match chunks.recv_timeout(POLL_INTERVAL) {
            Ok(chunk) => {
                // Real time: a chunk must be peeled within its own duration
                let deadline = Duration::from_secs_f64(chunk.nrows() as f64 / sample_rate);
                let _scope = ProfileScope::with_deadline(
                    format!("online chunk at {}", peeler.position()),
                    deadline,
                );
                for spike in peeler.push_chunk(chunk, false)? {
                    forwarded += 1;
                    let _ = spikes.send(spike);
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    if cancel.is_cancelled() {
        return Err(TdcError::Cancelled);
    }

    let n_channels = peeler.n_channels();
    for spike in peeler.push_chunk(Array2::zeros((0, n_channels)), true)? {
        forwarded += 1;
        let _ = spikes.send(spike);
    }
    log::info!(
        "Online peeler finished: {} spike(s) over {} samples",
        forwarded,
        peeler.position()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::tests::{bump, catalogue_with};
    use crate::catalogue::Template;

    #[test]
    fn test_backpressure_and_flush() {
        let catalogue = Arc::new(catalogue_with(vec![
            Template::new(0, bump(15, 2, 12.0), 10, 2.0).unwrap(),
        ]));
        let online = OnlinePeeler::start(
            catalogue,
            PeelerParams::default(),
            2,
            CancellationToken::new(),
        )
        .unwrap();
        for _ in 0..10 {
            online.push(Array2::zeros((128, 2))).unwrap();
        }
        let spikes = online.finish().unwrap();
        assert!(spikes.is_empty());
    }

    #[test]
    fn test_cancelled_worker_rejects_chunks() {
        let catalogue = Arc::new(catalogue_with(vec![
            Template::new(0, bump(15, 2, 12.0), 10, 2.0).unwrap(),
        ]));
        let cancel = CancellationToken::new();
        let online =
            OnlinePeeler::start(catalogue, PeelerParams::default(), 1, cancel.clone()).unwrap();
        cancel.cancel();
        assert!(matches!(online.finish(), Err(TdcError::Cancelled)));
    }
}
