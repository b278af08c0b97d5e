//! # rotbin-common: Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`ModelConfig`]**: model hyper-parameters (serialised as JSON).
//! * **[`RotationDictionary`]**: the K cluster-center rotations.
//! * **[`geodesic_distance`]** / **[`aggregate`]**: angular error and the
//!   per-class median score.
//! * **[`PoseDataset`]** / **[`Loader`]**: sample loading & batching.

pub mod config;
pub mod data;
pub mod dictionary;
pub mod metric;

pub use config::{ModelConfig, ModelVariant};
pub use data::{BatchSource, BatchTensors, Loader, PoseDataset, RotationBatch, RotationSample};
pub use dictionary::RotationDictionary;
pub use metric::{aggregate, geodesic_distance, median, per_class_medians, RotationVector};
