//! The rotation dictionary: K cluster-center rotations, fixed for a run.
//!
//! The centers come from an offline k-means pass over the training
//! rotations and are loaded from JSON, either a bare array of `[x, y, z]`
//! triples or an object with a `"centers"` field.

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::metric::{geodesic_distance, RotationVector};

/// Ordered, read-only set of K axis-angle rotation centers.
#[derive(Debug, Clone, PartialEq)]
pub struct RotationDictionary {
    centers: Vec<RotationVector>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DictionaryFile {
    Bare(Vec<RotationVector>),
    Wrapped { centers: Vec<RotationVector> },
}

#[derive(Serialize)]
struct DictionaryOut<'a> {
    centers: &'a [RotationVector],
}

impl RotationDictionary {
    /// Build from precomputed centers. Rejects an empty set and non-finite values.
    pub fn new(centers: Vec<RotationVector>) -> Result<Self> {
        if centers.is_empty() {
            anyhow::bail!("rotation dictionary is empty");
        }
        if let Some(i) = centers
            .iter()
            .position(|c| c.iter().any(|x| !x.is_finite()))
        {
            anyhow::bail!("rotation dictionary center {i} is not finite: {:?}", centers[i]);
        }
        Ok(Self { centers })
    }

    /// Load from a JSON artifact, optionally checking the number of centers.
    pub fn load(path: &Path, expected_size: Option<usize>) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("read dictionary {}", path.display()))?;
        let file: DictionaryFile = serde_json::from_str(&json)
            .with_context(|| format!("parse dictionary {}", path.display()))?;
        let centers = match file {
            DictionaryFile::Bare(c) | DictionaryFile::Wrapped { centers: c } => c,
        };
        let dict = Self::new(centers)?;
        if let Some(k) = expected_size {
            if dict.len() != k {
                anyhow::bail!(
                    "dictionary {} has {} centers, expected {k}",
                    path.display(),
                    dict.len()
                );
            }
        }
        tracing::debug!(path = %path.display(), size = dict.len(), "Loaded rotation dictionary");
        Ok(dict)
    }

    /// Save as `{"centers": [...]}`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&DictionaryOut {
            centers: &self.centers,
        })?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Number of centers `K`.
    pub fn len(&self) -> usize {
        self.centers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.centers.is_empty()
    }

    /// Center of bin `index`. Panics when `index >= K`.
    pub fn center(&self, index: usize) -> RotationVector {
        assert!(
            index < self.centers.len(),
            "bin index {index} out of range for dictionary of size {}",
            self.centers.len()
        );
        self.centers[index]
    }

    /// Bin whose center is geodesically closest to `rotation`.
    pub fn nearest(&self, rotation: &RotationVector) -> usize {
        self.centers
            .iter()
            .map(|c| geodesic_distance(c, rotation))
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    /// Centers as a `(K, 3)` f32 tensor.
    pub fn to_tensor(&self, device: &Device) -> candle_core::Result<Tensor> {
        let flat: Vec<f32> = self.centers.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (self.centers.len(), 3), device)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
