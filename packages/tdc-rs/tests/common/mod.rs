//! Synthetic recordings shared by the integration tests

#![allow(dead_code)]

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tdc_rs::{
    Catalogue, CatalogueConstructor, ClusteringMethod, InMemorySignalStore, SignalStore,
    SorterConfig,
};

pub const SAMPLE_RATE: f64 = 10_000.0;
pub const N_CHANNELS: usize = 4;

/// Half width of the injected waveforms
pub const HALF_WIDTH: usize = 10;

/// Peak amplitude of each unit on each channel (raw units, noise sigma 1)
pub const UNIT_PROFILES: [[f32; N_CHANNELS]; 3] = [
    [14.0, 7.0, 3.0, 0.0],
    [0.0, 3.0, 12.0, 9.0],
    [9.0, 9.0, 9.0, 9.0],
];

/// Relative firing share of each unit
const UNIT_SHARES: [f64; 3] = [0.5, 0.3, 0.2];

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Negative Ricker wavelet sampled at integer offsets, zero mean
pub fn ricker(x: f32, sigma: f32) -> f32 {
    let u = x / sigma;
    -(1.0 - u * u) * (-(u * u) / 2.0).exp()
}

/// `[2·HALF_WIDTH + 1 × channels]` waveform of a unit, peak at row `HALF_WIDTH`
pub fn unit_waveform(unit: usize) -> Array2<f32> {
    Array2::from_shape_fn((2 * HALF_WIDTH + 1, N_CHANNELS), |(t, c)| {
        UNIT_PROFILES[unit][c] * ricker(t as f32 - HALF_WIDTH as f32, 1.5)
    })
}

/// Standard normal sample (Box-Muller)
pub fn gaussian(rng: &mut StdRng) -> f32 {
    let u1: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.random::<f64>();
    ((-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()) as f32
}

pub fn noise(n_samples: usize, n_channels: usize, seed: u64) -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_fn((n_samples, n_channels), |_| gaussian(&mut rng))
}

/// Add `waveform` (peak row `HALF_WIDTH`) centred on `center`
pub fn inject(signal: &mut Array2<f32>, waveform: &Array2<f32>, center: usize) {
    let start = center - HALF_WIDTH;
    let mut block = signal.slice_mut(ndarray::s![start..start + waveform.nrows(), ..]);
    block += waveform;
}

/// Ground truth of a synthetic recording
pub struct Synthetic {
    pub signal: Array2<f32>,
    /// (sample index, unit), sorted by index
    pub events: Vec<(usize, usize)>,
}

impl Synthetic {
    pub fn store(&self) -> InMemorySignalStore {
        InMemorySignalStore::new(vec![self.signal.clone()], SAMPLE_RATE)
    }

    pub fn unit_count(&self, unit: usize) -> usize {
        self.events.iter().filter(|(_, u)| *u == unit).count()
    }
}

/// `seconds` of 4-channel noise with the three units firing at random,
/// events at least 100 samples apart
pub fn synthetic_recording(seconds: f64, seed: u64) -> Synthetic {
    let n_samples = (seconds * SAMPLE_RATE) as usize;
    let mut signal = noise(n_samples, N_CHANNELS, seed);
    let waveforms: Vec<Array2<f32>> = (0..3).map(unit_waveform).collect();

    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1));
    let mut events = Vec::new();
    let mut position = 500;
    while position + 500 < n_samples {
        let draw: f64 = rng.random();
        let unit = if draw < UNIT_SHARES[0] {
            0
        } else if draw < UNIT_SHARES[0] + UNIT_SHARES[1] {
            1
        } else {
            2
        };
        inject(&mut signal, &waveforms[unit], position);
        events.push((position, unit));
        position += 100 + rng.random_range(0..300);
    }

    Synthetic { signal, events }
}

/// Default configuration clustering into the three synthetic units
pub fn three_unit_config() -> SorterConfig {
    SorterConfig {
        clustering: ClusteringMethod::Kmeans {
            n_clusters: 3,
            max_iter: 300,
            seed: 42,
        },
        ..SorterConfig::default()
    }
}

/// Run catalogue construction end to end over `store`
pub fn build_catalogue(store: Arc<dyn SignalStore>, config: &SorterConfig) -> Catalogue {
    let constructor = CatalogueConstructor::new(store, config.clone()).unwrap();
    constructor.estimate_signals_noise(0, 5.0).unwrap();
    constructor.run_signalprocessor(None).unwrap();
    constructor
        .extract_some_waveforms(&config.waveforms)
        .unwrap();
    constructor.project().unwrap();
    constructor.find_clusters(None).unwrap();
    constructor.make_catalogue().unwrap()
}
