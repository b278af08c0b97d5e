//! Adaptive weighting between the bin-classification and regression losses.
//!
//! A single log-scale `s` tracks the magnitude of the regression loss and
//! sets an inverse-variance weight on it, keeping the two terms comparable
//! without hand tuning:
//!
//! | Mode | Combined loss | Update after the step | Weight |
//! |------|---------------|-----------------------|--------|
//! | [`LossMode::Init`] | `Lc + ½·e^(−2s)·Lr + s` | `s ← ½·ln Lr` | `½·e^(−2s)` |
//! | [`LossMode::Main`] | `Lc + e^(−s)·Lr + s` | `s ← ln Lr` | `e^(−s)` |
//!
//! `s` enters the combined loss as a constant; only the weight changes the
//! gradients.

use candle_core::Tensor;

/// Regression losses below this are raised to it before the logarithm.
pub const REGRESSION_LOSS_FLOOR: f64 = 1e-12;

/// Which training phase the loss belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossMode {
    /// Warm-up: `Lr` is the residual MSE.
    Init,
    /// Main phase: `Lr` is the mean geodesic error of the reconstructed rotation.
    Main,
}

impl LossMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Main => "main",
        }
    }
}

/// Owns `s`. One instance per training run; reset between phases.
#[derive(Debug, Clone, Default)]
pub struct LossScheduler {
    s: f64,
}

impl LossScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current log-scale.
    pub fn s(&self) -> f64 {
        self.s
    }

    /// Back to `s = 0` (phase boundary).
    pub fn reset(&mut self) {
        self.s = 0.0;
    }

    /// Weight on the regression term under the current `s`.
    pub fn weight(&self, mode: LossMode) -> f64 {
        match mode {
            LossMode::Init => 0.5 * (-2.0 * self.s).exp(),
            LossMode::Main => (-self.s).exp(),
        }
    }

    /// Scalar form of the combined loss.
    pub fn combined(&self, mode: LossMode, classification: f64, regression: f64) -> f64 {
        classification + self.weight(mode) * regression + self.s
    }

    /// Combined loss on scalar tensors, keeping the autograd graph of both terms.
    pub fn combine(
        &self,
        mode: LossMode,
        classification: &Tensor,
        regression: &Tensor,
    ) -> candle_core::Result<Tensor> {
        classification + regression.affine(self.weight(mode), self.s)?
    }

    /// Absorb the step's regression loss into `s`; returns the new weight.
    ///
    /// Fails on a non-finite loss. A loss at or below zero is floored to
    /// [`REGRESSION_LOSS_FLOOR`].
    pub fn update(&mut self, mode: LossMode, regression: f64) -> anyhow::Result<f64> {
        if !regression.is_finite() {
            anyhow::bail!(
                "non-finite {} regression loss ({regression}); adaptive weight state would be corrupted",
                mode.as_str()
            );
        }
        if regression < REGRESSION_LOSS_FLOOR {
            tracing::warn!(
                regression,
                floor = REGRESSION_LOSS_FLOOR,
                "Regression loss below floor; clamping before log"
            );
        }
        let lr = regression.max(REGRESSION_LOSS_FLOOR);
        self.s = match mode {
            LossMode::Init => 0.5 * lr.ln(),
            LossMode::Main => lr.ln(),
        };
        Ok(self.weight(mode))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
