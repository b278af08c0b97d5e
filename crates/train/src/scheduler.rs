//! Per-epoch learning-rate schedule.

/// Learning-rate schedule, advanced once per main-phase epoch.
#[derive(Clone, Debug)]
pub struct LrScheduler {
    epoch: usize,
    lr: f64,
    lr_min: f64,
    total_epochs: usize,
    decay: LrDecay,
}

/// Decay mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LrDecay {
    /// `lr / (1 + epoch)`.
    Inverse,
    /// Cosine from `lr` to `lr_min` over `total_epochs`.
    Cosine,
    None,
}

impl LrDecay {
    pub fn from_str(s: &str) -> Self {
        match s {
            "inverse" => Self::Inverse,
            "cosine" => Self::Cosine,
            _ => Self::None,
        }
    }
}

impl LrScheduler {
    pub fn new(lr: f64, lr_min: f64, total_epochs: usize, decay: LrDecay) -> Self {
        Self {
            epoch: 0,
            lr,
            lr_min,
            total_epochs,
            decay,
        }
    }

    /// Learning rate after the steps taken so far.
    pub fn current_lr(&self) -> f64 {
        match self.decay {
            LrDecay::Inverse => self.lr / (1.0 + self.epoch as f64),
            LrDecay::Cosine => {
                if self.total_epochs == 0 {
                    return self.lr;
                }
                let progress = self.epoch.min(self.total_epochs) as f64 / self.total_epochs as f64;
                let cos = (std::f64::consts::PI * progress).cos();
                self.lr_min + 0.5 * (self.lr - self.lr_min) * (1.0 + cos)
            }
            LrDecay::None => self.lr,
        }
    }

    pub fn advance(&mut self) {
        self.epoch += 1;
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
