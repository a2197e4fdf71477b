//! Acquired data: the per-point sample buffer and the run dataset.

pub mod buffer;
pub mod dataset;

pub use buffer::{AcquisitionBuffer, BufferError, Sample};
pub use dataset::{Dataset, PointError, PointStatus, RunMetadata, ScanPoint};
