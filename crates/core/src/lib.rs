//! # rotbin-core: Tensor Engine
//!
//! Every tensor primitive needed to train and run a bin-and-delta rotation
//! regressor:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`geodesic`] | differentiable `acos`, Rodrigues matrices, geodesic loss, reconstruction |
//! | [`model`] | `PoseModel` trait, `OneBinDeltaModel`, `OneDeltaPerBinModel`, `PoseNet` |
//!
//! Everything goes through `candle-core`/`candle-nn` and runs on CPU or CUDA.

pub mod geodesic;
pub mod model;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use geodesic::{acos, axis_angle_to_matrix, geodesic_angles, geodesic_loss, reconstruct};
pub use model::{
    ModelMode, ModelOutput, OneBinDeltaModel, OneDeltaPerBinModel, PoseModel, PoseNet,
};
