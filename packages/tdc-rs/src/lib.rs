pub mod catalogue;
pub mod cluster;
pub mod config;
pub mod constructor;
pub mod dataio;
pub mod detector;
pub mod error;
pub mod features;
pub mod filters;
pub mod noise;
pub mod online;
pub mod peeler;
pub mod preprocessor;
pub mod profiling;
pub mod types;
pub mod waveforms;

pub use catalogue::{
    Catalogue, CatalogueStore, CatalogueVersion, FileCatalogueStore, InMemoryCatalogueStore,
    Template,
};
pub use cluster::{ClusterEngine, ClusterMethod, DensityGrow, GaussianMixture, KMeans};
pub use config::{
    CatalogueParams, ClusteringMethod, DetectorParams, PeakSpan, PeelerParams, PreprocessorParams,
    ProjectionMethod, SamplingMode, SorterConfig, WaveformParams,
};
pub use constructor::CatalogueConstructor;
pub use dataio::{InMemorySignalStore, RetryPolicy, SignalStore, StoreError};
pub use detector::{detect_peaks, PeakDetector};
pub use error::{Result, TdcError};
pub use features::{PeakMax, Pca, Projector};
pub use noise::{NoiseEstimator, NoiseProfile};
pub use online::OnlinePeeler;
pub use peeler::{Matcher, PeelOutcome, Peeler, PeelerState, SegmentPeeler};
pub use preprocessor::{ProcessedChunk, SignalPreprocessor};
pub use types::*;
pub use waveforms::WaveformPool;
