//! Data pipeline: sample loading, bin assignment, batching.
//!
//! Samples are JSONL records with precomputed image features:
//!
//! ```json
//! {"features": [...], "label": 3, "rotation": [0.1, -0.4, 1.2], "bin": 17, "residual": [...]}
//! ```
//!
//! `bin` and `residual` are optional; when absent they are assigned from the
//! rotation dictionary (nearest center, residual = rotation − center).
//!
//! * **[`PoseDataset`]**: validated in-memory samples.
//! * **[`Loader`]**: per-epoch batching, optionally reshuffled every epoch.
//! * **[`RotationBatch::to_tensors`]**: raw batch → Candle tensors.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result as AnyhowResult};
use candle_core::{Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;

use crate::dictionary::RotationDictionary;
use crate::metric::RotationVector;

// ── Samples ─────────────────────────────────────────────────────────────────

/// One training/evaluation example. Immutable once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct RotationSample {
    pub features: Vec<f32>,
    pub label: u32,
    pub bin: u32,
    pub residual: RotationVector,
    pub rotation: RotationVector,
}

impl RotationSample {
    /// Build a sample whose bin and residual come from `dictionary`.
    pub fn assign(
        features: Vec<f32>,
        label: u32,
        rotation: RotationVector,
        dictionary: &RotationDictionary,
    ) -> Self {
        let bin = dictionary.nearest(&rotation);
        let center = dictionary.center(bin);
        Self {
            features,
            label,
            bin: bin as u32,
            residual: [
                rotation[0] - center[0],
                rotation[1] - center[1],
                rotation[2] - center[2],
            ],
            rotation,
        }
    }
}

#[derive(Deserialize)]
struct SampleRecord {
    features: Vec<f32>,
    label: u32,
    rotation: RotationVector,
    #[serde(default)]
    bin: Option<u32>,
    #[serde(default)]
    residual: Option<RotationVector>,
}

// ── PoseDataset ─────────────────────────────────────────────────────────────

/// Validated in-memory set of [`RotationSample`]s.
#[derive(Debug, Clone)]
pub struct PoseDataset {
    samples: Vec<RotationSample>,
    feature_dim: usize,
}

impl PoseDataset {
    /// Wrap samples after checking widths, labels, bins and finiteness.
    pub fn from_samples(
        samples: Vec<RotationSample>,
        feature_dim: usize,
        num_classes: usize,
        dict_size: usize,
    ) -> AnyhowResult<Self> {
        for (i, s) in samples.iter().enumerate() {
            if s.features.len() != feature_dim {
                anyhow::bail!(
                    "sample {i}: expected {feature_dim} features, got {}",
                    s.features.len()
                );
            }
            if s.label as usize >= num_classes {
                anyhow::bail!("sample {i}: label {} >= num_classes {num_classes}", s.label);
            }
            if s.bin as usize >= dict_size {
                anyhow::bail!("sample {i}: bin {} >= dict_size {dict_size}", s.bin);
            }
            let finite = s
                .features
                .iter()
                .chain(&s.residual)
                .chain(&s.rotation)
                .all(|x| x.is_finite());
            if !finite {
                anyhow::bail!("sample {i}: non-finite value");
            }
        }
        Ok(Self {
            samples,
            feature_dim,
        })
    }

    /// Load a JSONL file, assigning bins from `dictionary` where missing.
    pub fn load_jsonl(
        path: &Path,
        feature_dim: usize,
        num_classes: usize,
        dictionary: &RotationDictionary,
    ) -> AnyhowResult<Self> {
        let reader = BufReader::new(
            File::open(path).with_context(|| format!("open {}", path.display()))?,
        );
        let mut samples = Vec::new();
        let mut assigned = 0usize;
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record: SampleRecord = serde_json::from_str(line)
                .with_context(|| format!("{}:{}: bad sample", path.display(), lineno + 1))?;
            let sample = match (record.bin, record.residual) {
                (Some(bin), Some(residual)) => RotationSample {
                    features: record.features,
                    label: record.label,
                    bin,
                    residual,
                    rotation: record.rotation,
                },
                _ => {
                    assigned += 1;
                    RotationSample::assign(
                        record.features,
                        record.label,
                        record.rotation,
                        dictionary,
                    )
                }
            };
            samples.push(sample);
        }
        if samples.is_empty() {
            anyhow::bail!("no samples in {}", path.display());
        }
        tracing::info!(
            path = %path.display(),
            samples = samples.len(),
            assigned_bins = assigned,
            "Loaded pose dataset"
        );
        Self::from_samples(samples, feature_dim, num_classes, dictionary.len())
            .with_context(|| format!("validate {}", path.display()))
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[RotationSample] {
        &self.samples
    }
}

// ── Batches ─────────────────────────────────────────────────────────────────

/// A batch of samples in flat row-major buffers.
#[derive(Debug, Clone)]
pub struct RotationBatch {
    pub features: Vec<f32>,
    pub labels: Vec<u32>,
    pub bins: Vec<u32>,
    pub residuals: Vec<f32>,
    pub rotations: Vec<f32>,
    pub feature_dim: usize,
}

/// A batch on a device: features `(B, F)`, labels/bins `(B,)` u32,
/// residuals/rotations `(B, 3)`.
pub struct BatchTensors {
    pub features: Tensor,
    pub labels: Tensor,
    pub bins: Tensor,
    pub residuals: Tensor,
    pub rotations: Tensor,
}

impl RotationBatch {
    pub fn from_samples<'a>(
        samples: impl IntoIterator<Item = &'a RotationSample>,
        feature_dim: usize,
    ) -> Self {
        let mut batch = Self {
            features: Vec::new(),
            labels: Vec::new(),
            bins: Vec::new(),
            residuals: Vec::new(),
            rotations: Vec::new(),
            feature_dim,
        };
        for s in samples {
            batch.features.extend_from_slice(&s.features);
            batch.labels.push(s.label);
            batch.bins.push(s.bin);
            batch.residuals.extend_from_slice(&s.residual);
            batch.rotations.extend_from_slice(&s.rotation);
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Ground-truth rotations, one per sample.
    pub fn rotation_rows(&self) -> impl Iterator<Item = RotationVector> + '_ {
        self.rotations.chunks_exact(3).map(|r| [r[0], r[1], r[2]])
    }

    /// Convert to Candle tensors on `device`.
    pub fn to_tensors(&self, device: &Device) -> Result<BatchTensors> {
        let b = self.len();
        Ok(BatchTensors {
            features: Tensor::from_vec(self.features.clone(), (b, self.feature_dim), device)?,
            labels: Tensor::from_vec(self.labels.clone(), b, device)?,
            bins: Tensor::from_vec(self.bins.clone(), b, device)?,
            residuals: Tensor::from_vec(self.residuals.clone(), (b, 3), device)?,
            rotations: Tensor::from_vec(self.rotations.clone(), (b, 3), device)?,
        })
    }
}

// ── BatchSource trait ───────────────────────────────────────────────────────

/// A finite, restartable sequence of batches: one call to
/// [`epoch`](BatchSource::epoch) yields one pass over the data.
pub trait BatchSource {
    fn num_batches(&self) -> usize;
    fn epoch(&mut self) -> Box<dyn Iterator<Item = RotationBatch> + '_>;
}

/// Batches a [`PoseDataset`]. The last batch may be short.
pub struct Loader<'a> {
    dataset: &'a PoseDataset,
    batch_size: usize,
    shuffle: Option<StdRng>,
}

impl<'a> Loader<'a> {
    /// Sequential loader (evaluation).
    pub fn sequential(dataset: &'a PoseDataset, batch_size: usize) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle: None,
        }
    }

    /// Loader that reshuffles sample order at the start of every epoch (training).
    pub fn shuffled(dataset: &'a PoseDataset, batch_size: usize, seed: u64) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle: Some(StdRng::seed_from_u64(seed)),
        }
    }
}

impl BatchSource for Loader<'_> {
    fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    fn epoch(&mut self) -> Box<dyn Iterator<Item = RotationBatch> + '_> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if let Some(rng) = self.shuffle.as_mut() {
            order.shuffle(rng);
        }
        let dataset = self.dataset;
        let batch_size = self.batch_size;
        let mut start = 0usize;
        Box::new(std::iter::from_fn(move || {
            if start >= order.len() {
                return None;
            }
            let end = (start + batch_size).min(order.len());
            let batch = RotationBatch::from_samples(
                order[start..end].iter().map(|&i| &dataset.samples[i]),
                dataset.feature_dim,
            );
            start = end;
            Some(batch)
        }))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn dictionary() -> RotationDictionary {
        RotationDictionary::new(vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 0.1]]).unwrap()
    }

    fn dataset(n: usize) -> PoseDataset {
        let d = dictionary();
        let samples = (0..n)
            .map(|i| RotationSample::assign(vec![i as f32, 1.0], (i % 2) as u32, [0.0, 0.0, 0.09], &d))
            .collect();
        PoseDataset::from_samples(samples, 2, 2, d.len()).unwrap()
    }

    #[test]
    fn assign_picks_nearest_bin_and_residual() {
        let s = RotationSample::assign(vec![0.0], 0, [0.9, 0.0, 0.0], &dictionary());
        assert_eq!(s.bin, 1);
        assert!((s.residual[0] + 0.1).abs() < 1e-6);
        assert_eq!(s.residual[1], 0.0);
    }

    #[test]
    fn load_jsonl_assigns_missing_bins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.jsonl");
        let mut f = File::create(&path).unwrap();
        writeln!(f, r#"{{"features": [1, 2], "label": 1, "rotation": [0.9, 0, 0]}}"#).unwrap();
        writeln!(f).unwrap();
        writeln!(
            f,
            r#"{{"features": [3, 4], "label": 0, "rotation": [0, 0, 0.1], "bin": 2, "residual": [0, 0, 0]}}"#
        )
        .unwrap();
        drop(f);

        let ds = PoseDataset::load_jsonl(&path, 2, 2, &dictionary()).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.samples()[0].bin, 1);
        assert_eq!(ds.samples()[1].bin, 2);
        assert_eq!(ds.samples()[1].features, vec![3.0, 4.0]);
    }

    #[test]
    fn load_jsonl_rejects_bad_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, r#"{"features": [1], "label": 0, "rotation": [0, 0, 0]}"#).unwrap();
        assert!(PoseDataset::load_jsonl(&path, 2, 2, &dictionary()).is_err());

        std::fs::write(&path, r#"{"features": [1, 2], "label": 5, "rotation": [0, 0, 0]}"#).unwrap();
        assert!(PoseDataset::load_jsonl(&path, 2, 2, &dictionary()).is_err());

        std::fs::write(&path, "").unwrap();
        assert!(PoseDataset::load_jsonl(&path, 2, 2, &dictionary()).is_err());
    }

    #[test]
    fn sequential_loader_keeps_order_and_partial_batch() {
        let ds = dataset(5);
        let mut loader = Loader::sequential(&ds, 2);
        assert_eq!(loader.num_batches(), 3);
        let batches: Vec<_> = loader.epoch().collect();
        assert_eq!(batches.iter().map(|b| b.len()).collect::<Vec<_>>(), vec![2, 2, 1]);
        assert_eq!(batches[0].features, vec![0.0, 1.0, 1.0, 1.0]);
        assert_eq!(batches[2].labels, vec![0]);
    }

    #[test]
    fn shuffled_loader_covers_every_sample_each_epoch() {
        let ds = dataset(10);
        let mut loader = Loader::shuffled(&ds, 3, 7);
        let mut epochs = Vec::new();
        for _ in 0..2 {
            let mut firsts: Vec<f32> = loader
                .epoch()
                .flat_map(|b| b.features.chunks(2).map(|c| c[0]).collect::<Vec<_>>())
                .collect();
            epochs.push(firsts.clone());
            firsts.sort_by(f32::total_cmp);
            assert_eq!(firsts, (0..10).map(|i| i as f32).collect::<Vec<_>>());
        }
        assert_ne!(epochs[0], epochs[1]);
    }

    #[test]
    fn batch_tensor_shapes() {
        let ds = dataset(3);
        let batch = RotationBatch::from_samples(ds.samples(), 2);
        let t = batch.to_tensors(&Device::Cpu).unwrap();
        assert_eq!(t.features.dims(), &[3, 2]);
        assert_eq!(t.labels.dims(), &[3]);
        assert_eq!(t.bins.to_vec1::<u32>().unwrap(), vec![2, 2, 2]);
        assert_eq!(t.rotations.dims(), &[3, 3]);
        assert_eq!(batch.rotation_rows().count(), 3);
    }
}
