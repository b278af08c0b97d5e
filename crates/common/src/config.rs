//! Model configuration for rotbin.
//!
//! Serialised as JSON next to every checkpoint. Every field has a default so
//! a minimal `{}` JSON produces the reference ObjectNet3D-sized model.

use serde::{Deserialize, Serialize};

/// Configuration for the bin-and-delta pose network.
///
/// Stored alongside weights for reproducible evaluation. Backwards-compatible:
/// missing fields fall back to their `#[serde(default)]` values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    // ── Dimensions ──────────────────────────────────────────────────────────
    /// Width of the precomputed image feature vector.
    #[serde(default = "default_feature_dim")]
    pub feature_dim: usize,
    /// Hidden widths of the shared trunk, in order.
    #[serde(default = "default_hidden_dims")]
    pub hidden_dims: Vec<usize>,
    /// Hidden width of the residual head.
    #[serde(default = "default_residual_hidden")]
    pub residual_hidden: usize,
    /// Number of object classes (labels are `0..num_classes`).
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    /// Number of rotation bins `K` (must match the dictionary artifact).
    #[serde(default = "default_dict_size")]
    pub dict_size: usize,

    // ── Architecture switches ───────────────────────────────────────────────
    /// Which residual head to build.
    #[serde(default)]
    pub variant: ModelVariant,
    /// Dropout probability applied after every trunk layer in train mode.
    #[serde(default = "default_dropout")]
    pub dropout: f32,

    // ── Labels ──────────────────────────────────────────────────────────────
    /// Optional human-readable class names, indexed by label. Used in logs.
    #[serde(default)]
    pub class_names: Vec<String>,
}

/// Residual-head variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    /// One residual per class, shared by every bin.
    #[default]
    OneBinDelta,
    /// One residual per (class, bin); the predicted bin's residual is used.
    OneDeltaPerBin,
}

impl ModelVariant {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "one_bin_delta" | "single" => Some(Self::OneBinDelta),
            "one_delta_per_bin" | "multires" => Some(Self::OneDeltaPerBin),
            _ => None,
        }
    }
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_feature_dim() -> usize {
    2048
}
fn default_hidden_dims() -> Vec<usize> {
    vec![1000, 500]
}
fn default_residual_hidden() -> usize {
    100
}
fn default_num_classes() -> usize {
    100
}
fn default_dict_size() -> usize {
    200
}
fn default_dropout() -> f32 {
    0.2
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            feature_dim: default_feature_dim(),
            hidden_dims: default_hidden_dims(),
            residual_hidden: default_residual_hidden(),
            num_classes: default_num_classes(),
            dict_size: default_dict_size(),
            variant: ModelVariant::default(),
            dropout: default_dropout(),
            class_names: Vec::new(),
        }
    }
}

impl ModelConfig {
    /// Width of the trunk output (the feature width when there are no hidden layers).
    pub fn trunk_dim(&self) -> usize {
        self.hidden_dims.last().copied().unwrap_or(self.feature_dim)
    }

    /// Display name for a label, falling back to its index.
    pub fn class_name(&self, label: usize) -> String {
        self.class_names
            .get(label)
            .cloned()
            .unwrap_or_else(|| format!("class-{label}"))
    }

    /// Reject configs that cannot build a model.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.feature_dim == 0 || self.num_classes == 0 || self.dict_size == 0 {
            anyhow::bail!(
                "feature_dim ({}), num_classes ({}) and dict_size ({}) must be positive",
                self.feature_dim,
                self.num_classes,
                self.dict_size
            );
        }
        if self.hidden_dims.iter().any(|&d| d == 0) || self.residual_hidden == 0 {
            anyhow::bail!("hidden widths must be positive");
        }
        if !(0.0..1.0).contains(&self.dropout) {
            anyhow::bail!("dropout must be in [0, 1), got {}", self.dropout);
        }
        if !self.class_names.is_empty() && self.class_names.len() != self.num_classes {
            anyhow::bail!(
                "class_names has {} entries but num_classes is {}",
                self.class_names.len(),
                self.num_classes
            );
        }
        Ok(())
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
