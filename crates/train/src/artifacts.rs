//! On-disk outputs of a training run.
//!
//! ```text
//! <dir>/
//!   config.json          model config (reload with ModelConfig::load)
//!   model.safetensors    parameters, overwritten after every epoch
//!   results.json         {"ytest", "yhat_test", "test_labels"} of the last evaluation
//!   history.json         {"val_loss": [...]} median error per epoch, degrees
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use rotbin_common::ModelConfig;

use crate::trainer::Predictions;

pub const CHECKPOINT_FILE: &str = "model.safetensors";
pub const CONFIG_FILE: &str = "config.json";
pub const RESULTS_FILE: &str = "results.json";
pub const HISTORY_FILE: &str = "history.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct History {
    pub val_loss: Vec<f64>,
}

/// Output directory of one run.
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    dir: PathBuf,
}

impl RunArtifacts {
    /// Use `dir`, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create output dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    pub fn results_path(&self) -> PathBuf {
        self.dir.join(RESULTS_FILE)
    }

    pub fn history_path(&self) -> PathBuf {
        self.dir.join(HISTORY_FILE)
    }

    /// Write parameters and the config that rebuilds them.
    pub fn save_checkpoint(&self, varmap: &VarMap, config: &ModelConfig) -> anyhow::Result<()> {
        let path = self.checkpoint_path();
        varmap
            .save(&path)
            .with_context(|| format!("save checkpoint {}", path.display()))?;
        config.save(&self.config_path())?;
        tracing::debug!(path = %path.display(), "checkpoint saved");
        Ok(())
    }

    pub fn save_results(&self, predictions: &Predictions) -> anyhow::Result<()> {
        write_json(&self.results_path(), predictions)
    }

    pub fn load_results(&self) -> anyhow::Result<Predictions> {
        read_json(&self.results_path())
    }

    pub fn save_history(&self, val_loss: &[f64]) -> anyhow::Result<()> {
        let history = History {
            val_loss: val_loss.to_vec(),
        };
        write_json(&self.history_path(), &history)
    }

    pub fn load_history(&self) -> anyhow::Result<History> {
        read_json(&self.history_path())
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string(value)?;
    std::fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> anyhow::Result<T> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Ok(serde_json::from_str(&s)?)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    #[test]
    fn results_use_legacy_keys() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = RunArtifacts::new(dir.path().join("run")).unwrap();
        let p = Predictions {
            predictions: vec![[0.1, 0.2, 0.3]],
            targets: vec![[0.0, 0.0, 0.5]],
            labels: vec![7],
        };
        artifacts.save_results(&p).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(artifacts.results_path()).unwrap())
                .unwrap();
        assert_eq!(raw["test_labels"][0], 7);
        assert_eq!(raw["ytest"].as_array().unwrap().len(), 1);
        assert!(raw.get("yhat_test").is_some());

        let back = artifacts.load_results().unwrap();
        assert_eq!(back.labels, p.labels);
        assert_eq!(back.predictions, p.predictions);
    }

    #[test]
    fn history_is_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = RunArtifacts::new(dir.path()).unwrap();
        artifacts.save_history(&[30.0]).unwrap();
        artifacts.save_history(&[30.0, 21.5]).unwrap();
        assert_eq!(artifacts.load_history().unwrap().val_loss, vec![30.0, 21.5]);
    }

    #[test]
    fn checkpoint_reloads_into_fresh_varmap() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = RunArtifacts::new(dir.path()).unwrap();
        let config = ModelConfig::default();

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let w = vb.get_with_hints((2, 3), "w", Init::Const(1.5)).unwrap();
        artifacts.save_checkpoint(&varmap, &config).unwrap();

        let mut fresh = VarMap::new();
        let vb = VarBuilder::from_varmap(&fresh, DType::F32, &Device::Cpu);
        let w2 = vb.get_with_hints((2, 3), "w", Init::Const(0.0)).unwrap();
        fresh.load(artifacts.checkpoint_path()).unwrap();
        let reloaded = fresh.data().lock().unwrap()["w"]
            .as_tensor()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(reloaded, w.to_vec2::<f32>().unwrap());
        assert_eq!(w2.dims(), &[2, 3]);

        let back = ModelConfig::load(&artifacts.config_path()).unwrap();
        assert_eq!(back.dict_size, config.dict_size);
    }
}
