//! Quantization, index construction and search.

pub mod builder;
pub mod coarse;
pub mod codebook;
pub mod counts;
pub mod distance;
pub mod kmeans;
pub mod search;

pub use builder::{BuildOutput, IndexBuilder};
pub use coarse::CoarseQuantizer;
pub use codebook::{Codebook, CodebookKind, TrainParams};
pub use counts::OccupancyCounts;
pub use search::SearchEngine;
