//! Class-conditioned bin-and-delta pose heads over precomputed image features.
//!
//! A shared MLP trunk feeds two heads. Each head predicts an output block
//! for every class; the block belonging to the sample's label is selected,
//! so classes share the trunk but not the final projections.
//!
//! * [`OneBinDeltaModel`]: per-class bin logits `[K]` and one residual `[3]`.
//! * [`OneDeltaPerBinModel`]: per-class bin logits and a residual per bin
//!   `[K, 3]`; the residual of the model's own argmax bin is returned.

use candle_core::{Result, Tensor, D};
use candle_nn::{linear, Dropout, Linear, Module, ModuleT, VarBuilder};

use rotbin_common::{ModelConfig, ModelVariant};

/// Whether a forward pass is for training (dropout active) or inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelMode {
    Train,
    Eval,
}

impl ModelMode {
    pub fn is_train(self) -> bool {
        self == Self::Train
    }
}

/// One forward pass: `bin_logits` `(B, K)` and `residual` `(B, 3)`.
pub struct ModelOutput {
    pub bin_logits: Tensor,
    pub residual: Tensor,
}

/// A pose network. Parameters live in the `VarMap` the model was built from.
pub trait PoseModel {
    /// `features` `(B, F)` f32, `labels` `(B,)` u32.
    fn forward(&self, features: &Tensor, labels: &Tensor, mode: ModelMode) -> Result<ModelOutput>;

    /// Number of rotation bins `K`.
    fn num_bins(&self) -> usize;
}

// ── Building blocks ─────────────────────────────────────────────────────────

/// Pick each row's `width`-wide block for its label: `(B, C·width)` → `(B, width)`.
fn select_block(all: &Tensor, index: &Tensor, width: usize) -> Result<Tensor> {
    let (b, total) = all.dims2()?;
    let grouped = all.reshape((b, total / width, width))?;
    let idx = index
        .reshape((b, 1, 1))?
        .broadcast_as((b, 1, width))?
        .contiguous()?;
    grouped.gather(&idx, 1)?.squeeze(1)
}

/// Linear → ReLU → Dropout, repeated.
struct Trunk {
    layers: Vec<Linear>,
    dropout: Dropout,
}

impl Trunk {
    fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(config.hidden_dims.len());
        let mut in_dim = config.feature_dim;
        for (i, &out_dim) in config.hidden_dims.iter().enumerate() {
            layers.push(linear(in_dim, out_dim, vb.pp(format!("fc{i}")))?);
            in_dim = out_dim;
        }
        Ok(Self {
            layers,
            dropout: Dropout::new(config.dropout),
        })
    }

    fn forward(&self, x: &Tensor, mode: ModelMode) -> Result<Tensor> {
        let mut x = x.clone();
        for layer in &self.layers {
            x = layer.forward(&x)?.relu()?;
            x = self.dropout.forward_t(&x, mode.is_train())?;
        }
        Ok(x)
    }
}

/// Per-class bin logits.
struct BinHead {
    proj: Linear,
    num_bins: usize,
}

impl BinHead {
    fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let proj = linear(
            config.trunk_dim(),
            config.num_classes * config.dict_size,
            vb.pp("proj"),
        )?;
        Ok(Self {
            proj,
            num_bins: config.dict_size,
        })
    }

    fn forward(&self, h: &Tensor, labels: &Tensor) -> Result<Tensor> {
        select_block(&self.proj.forward(h)?, labels, self.num_bins)
    }
}

/// Per-class residual block of `width` values behind a small hidden layer.
struct ResidualHead {
    hidden: Linear,
    proj: Linear,
    width: usize,
}

impl ResidualHead {
    fn new(config: &ModelConfig, width: usize, vb: VarBuilder) -> Result<Self> {
        let hidden = linear(config.trunk_dim(), config.residual_hidden, vb.pp("hidden"))?;
        let proj = linear(
            config.residual_hidden,
            config.num_classes * width,
            vb.pp("proj"),
        )?;
        Ok(Self {
            hidden,
            proj,
            width,
        })
    }

    fn forward(&self, h: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let x = self.hidden.forward(h)?.relu()?;
        select_block(&self.proj.forward(&x)?, labels, self.width)
    }
}

// ── OneBinDeltaModel ────────────────────────────────────────────────────────

/// One residual per class, applied to whichever bin is chosen.
pub struct OneBinDeltaModel {
    trunk: Trunk,
    bin_head: BinHead,
    residual_head: ResidualHead,
}

impl OneBinDeltaModel {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            trunk: Trunk::new(config, vb.pp("trunk"))?,
            bin_head: BinHead::new(config, vb.pp("bin_head"))?,
            residual_head: ResidualHead::new(config, 3, vb.pp("res_head"))?,
        })
    }
}

impl PoseModel for OneBinDeltaModel {
    fn forward(&self, features: &Tensor, labels: &Tensor, mode: ModelMode) -> Result<ModelOutput> {
        let h = self.trunk.forward(features, mode)?;
        Ok(ModelOutput {
            bin_logits: self.bin_head.forward(&h, labels)?,
            residual: self.residual_head.forward(&h, labels)?,
        })
    }

    fn num_bins(&self) -> usize {
        self.bin_head.num_bins
    }
}

// ── OneDeltaPerBinModel ─────────────────────────────────────────────────────

/// A residual for every (class, bin) pair; the predicted bin's residual is used.
pub struct OneDeltaPerBinModel {
    trunk: Trunk,
    bin_head: BinHead,
    residual_head: ResidualHead,
}

impl OneDeltaPerBinModel {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            trunk: Trunk::new(config, vb.pp("trunk"))?,
            bin_head: BinHead::new(config, vb.pp("bin_head"))?,
            residual_head: ResidualHead::new(config, 3 * config.dict_size, vb.pp("res_head"))?,
        })
    }
}

impl PoseModel for OneDeltaPerBinModel {
    fn forward(&self, features: &Tensor, labels: &Tensor, mode: ModelMode) -> Result<ModelOutput> {
        let h = self.trunk.forward(features, mode)?;
        let bin_logits = self.bin_head.forward(&h, labels)?;
        let per_bin = self.residual_head.forward(&h, labels)?;
        let bins = bin_logits.argmax(D::Minus1)?;
        let residual = select_block(&per_bin, &bins, 3)?;
        Ok(ModelOutput {
            bin_logits,
            residual,
        })
    }

    fn num_bins(&self) -> usize {
        self.bin_head.num_bins
    }
}

// ── PoseNet ─────────────────────────────────────────────────────────────────

/// The configured model variant.
pub enum PoseNet {
    OneBinDelta(OneBinDeltaModel),
    OneDeltaPerBin(OneDeltaPerBinModel),
}

impl PoseNet {
    /// Construct from config. `vb` should be the root of the run's `VarMap`.
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        match config.variant {
            ModelVariant::OneBinDelta => Ok(Self::OneBinDelta(OneBinDeltaModel::new(config, vb)?)),
            ModelVariant::OneDeltaPerBin => {
                Ok(Self::OneDeltaPerBin(OneDeltaPerBinModel::new(config, vb)?))
            }
        }
    }
}

impl PoseModel for PoseNet {
    fn forward(&self, features: &Tensor, labels: &Tensor, mode: ModelMode) -> Result<ModelOutput> {
        match self {
            Self::OneBinDelta(m) => m.forward(features, labels, mode),
            Self::OneDeltaPerBin(m) => m.forward(features, labels, mode),
        }
    }

    fn num_bins(&self) -> usize {
        match self {
            Self::OneBinDelta(m) => m.num_bins(),
            Self::OneDeltaPerBin(m) => m.num_bins(),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
