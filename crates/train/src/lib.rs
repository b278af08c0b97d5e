//! # rotbin-train: Training Engine
//!
//! Training loop, loss weighting and run orchestration for bin-and-delta
//! rotation regression:
//!
//! * **[`Trainer`]**: owns model + optimiser + loss state. One call to
//!   [`Trainer::step`] runs forward, both losses, backward, AdamW and the
//!   `s` update.
//! * **[`LossScheduler`]**: the adaptive log-scale `s` and its init/main weights.
//! * **[`LrScheduler`]**: per-epoch learning-rate decay.
//! * **[`session::run`]**: init epoch, main epochs, checkpoints, history.
//! * **[`MetricsSink`]**: where per-step scalars go (CSV, log, memory).

pub mod artifacts;
pub mod loss;
pub mod scheduler;
pub mod session;
pub mod sink;
pub mod trainer;

pub use artifacts::{History, RunArtifacts};
pub use loss::{LossMode, LossScheduler, REGRESSION_LOSS_FLOOR};
pub use scheduler::{LrDecay, LrScheduler};
pub use session::{run, RunOutcome};
pub use sink::{CsvSink, MemorySink, MetricsSink, TracingSink};
pub use trainer::{EpochSummary, Predictions, StepMetrics, Trainer, TrainerConfig};
