//! Trainer: owns the model parameters, optimiser, loss weighting and step
//! counter, and runs training epochs and evaluation passes over them.
//!
//! All mutable run state (parameters, `s`, global step, LR epoch, mode) lives
//! in one [`Trainer`] value, so several runs can coexist in one process.

use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};
use candle_nn::{loss, AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use rotbin_common::{
    aggregate, per_class_medians, BatchSource, Loader, ModelConfig, PoseDataset, RotationBatch,
    RotationDictionary, RotationVector,
};
use rotbin_core::{geodesic_loss, reconstruct, ModelMode, PoseModel, PoseNet};

use crate::loss::{LossMode, LossScheduler};
use crate::scheduler::{LrDecay, LrScheduler};
use crate::sink::MetricsSink;

// ── Config ──────────────────────────────────────────────────────────────────

/// Training hyper-parameters (CLI-level knobs).
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub batch_size: usize,
    pub eval_batch_size: usize,
    pub num_epochs: usize,
    pub lr: f64,
    pub lr_min: f64,
    pub lr_decay: LrDecay,
    pub weight_decay: f64,
    pub log_every: usize,
    pub seed: u64,
    pub output_dir: PathBuf,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            batch_size: 96,
            eval_batch_size: 32,
            num_epochs: 10,
            lr: 1e-4,
            lr_min: 0.0,
            lr_decay: LrDecay::Inverse,
            weight_decay: 0.0,
            log_every: 50,
            seed: 0,
            output_dir: PathBuf::from("runs"),
        }
    }
}

impl TrainerConfig {
    /// Training batches of `batch_size`, reshuffled every epoch from `seed`.
    pub fn train_loader<'a>(&self, dataset: &'a PoseDataset) -> Loader<'a> {
        Loader::shuffled(dataset, self.batch_size, self.seed)
    }

    /// Evaluation batches of `eval_batch_size`, in file order.
    pub fn eval_loader<'a>(&self, dataset: &'a PoseDataset) -> Loader<'a> {
        Loader::sequential(dataset, self.eval_batch_size)
    }
}

/// Metrics returned after each training step.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    /// Global step index (1-based, monotonically increasing across phases).
    pub step: usize,
    pub loss: f64,
    pub classification_loss: f64,
    pub regression_loss: f64,
    /// `s` after this step's update.
    pub s: f64,
    /// Regression weight after this step's update.
    pub alpha: f64,
    pub grad_norm: f64,
}

/// Per-step metrics of one epoch, in order.
#[derive(Debug, Clone, Default)]
pub struct EpochSummary {
    pub steps: Vec<StepMetrics>,
}

impl EpochSummary {
    pub fn mean_loss(&self) -> f64 {
        if self.steps.is_empty() {
            return f64::NAN;
        }
        self.steps.iter().map(|m| m.loss).sum::<f64>() / self.steps.len() as f64
    }

    pub fn last(&self) -> Option<&StepMetrics> {
        self.steps.last()
    }
}

// ── Predictions ─────────────────────────────────────────────────────────────

/// Output of an evaluation pass: parallel sequences aligned by sample.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Predictions {
    #[serde(rename = "yhat_test")]
    pub predictions: Vec<RotationVector>,
    #[serde(rename = "ytest")]
    pub targets: Vec<RotationVector>,
    #[serde(rename = "test_labels")]
    pub labels: Vec<u32>,
}

impl Predictions {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Mean of per-class median geodesic errors, in degrees.
    pub fn median_error_deg(&self, num_classes: usize) -> f64 {
        aggregate(&self.predictions, &self.targets, &self.labels, num_classes).to_degrees()
    }

    /// Per-class median errors in degrees (`None` for unseen classes).
    pub fn per_class_deg(&self, num_classes: usize) -> Vec<Option<f64>> {
        per_class_medians(&self.predictions, &self.targets, &self.labels, num_classes)
            .into_iter()
            .map(|m| m.map(f64::to_degrees))
            .collect()
    }
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// The training engine. Owns the model, optimiser, and all run state.
pub struct Trainer<M: PoseModel> {
    model: M,
    varmap: VarMap,
    vars: Vec<Var>,
    optimizer: AdamW,
    lr_scheduler: LrScheduler,
    loss: LossScheduler,
    centers: Tensor,
    mode: ModelMode,
    pub config: TrainerConfig,
    pub global_step: usize,
    device: Device,
}

impl Trainer<PoseNet> {
    /// Build the configured model variant in a fresh `VarMap`.
    pub fn new(
        model_config: &ModelConfig,
        trainer_config: TrainerConfig,
        dictionary: RotationDictionary,
        device: Device,
    ) -> anyhow::Result<Self> {
        model_config.validate()?;
        if dictionary.len() != model_config.dict_size {
            anyhow::bail!(
                "dictionary has {} centers but the model expects dict_size = {}",
                dictionary.len(),
                model_config.dict_size
            );
        }
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = PoseNet::new(model_config, vb)?;
        tracing::info!(
            variant = ?model_config.variant,
            feature_dim = model_config.feature_dim,
            num_classes = model_config.num_classes,
            dict_size = model_config.dict_size,
            params = varmap.all_vars().iter().map(|v| v.elem_count()).sum::<usize>(),
            "Built pose model"
        );
        Self::with_model(model, varmap, dictionary, trainer_config, device)
    }
}

impl<M: PoseModel> Trainer<M> {
    /// Wrap an already-built model whose parameters live in `varmap`.
    pub fn with_model(
        model: M,
        varmap: VarMap,
        dictionary: RotationDictionary,
        trainer_config: TrainerConfig,
        device: Device,
    ) -> anyhow::Result<Self> {
        if model.num_bins() != dictionary.len() {
            anyhow::bail!(
                "model predicts {} bins but the dictionary has {}",
                model.num_bins(),
                dictionary.len()
            );
        }
        let vars = varmap.all_vars();
        let lr_scheduler = LrScheduler::new(
            trainer_config.lr,
            trainer_config.lr_min,
            trainer_config.num_epochs,
            trainer_config.lr_decay,
        );
        let optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: lr_scheduler.current_lr(),
                weight_decay: trainer_config.weight_decay,
                ..Default::default()
            },
        )?;
        let centers = dictionary.to_tensor(&device)?;

        Ok(Self {
            model,
            varmap,
            vars,
            optimizer,
            lr_scheduler,
            loss: LossScheduler::new(),
            centers,
            mode: ModelMode::Train,
            config: trainer_config,
            global_step: 0,
            device,
        })
    }

    // ── Training ────────────────────────────────────────────────────────────

    /// One optimiser step on one batch.
    pub fn step(&mut self, batch: &RotationBatch, mode: LossMode) -> anyhow::Result<StepMetrics> {
        let t = batch.to_tensors(&self.device)?;
        let out = self.model.forward(&t.features, &t.labels, ModelMode::Train)?;

        let lc = loss::cross_entropy(&out.bin_logits, &t.bins)?;
        let lr = match mode {
            LossMode::Init => loss::mse(&out.residual, &t.residuals)?,
            LossMode::Main => {
                let y = reconstruct(&self.centers, &out.bin_logits, &out.residual)?;
                geodesic_loss(&y, &t.rotations)?
            }
        };
        let total = self.loss.combine(mode, &lc, &lr)?;

        let loss_val = total.to_scalar::<f32>()? as f64;
        if !loss_val.is_finite() {
            anyhow::bail!(
                "non-finite {} loss ({loss_val}) at step {}",
                mode.as_str(),
                self.global_step + 1
            );
        }

        // Backward: a fresh gradient store per step, nothing accumulates.
        let grads = total.backward()?;
        let norm = grad_norm(&grads, &self.vars)?;
        if !norm.is_finite() {
            anyhow::bail!(
                "non-finite gradient norm ({norm}) at step {}",
                self.global_step + 1
            );
        }
        self.optimizer.step(&grads)?;

        let classification_loss = lc.to_scalar::<f32>()? as f64;
        let regression_loss = lr.to_scalar::<f32>()? as f64;
        let alpha = self.loss.update(mode, regression_loss)?;
        self.global_step += 1;

        Ok(StepMetrics {
            step: self.global_step,
            loss: loss_val,
            classification_loss,
            regression_loss,
            s: self.loss.s(),
            alpha,
            grad_norm: norm,
        })
    }

    /// One pass over `batches`, emitting `train_loss` and `alpha` per step.
    pub fn run_epoch(
        &mut self,
        mode: LossMode,
        batches: &mut dyn BatchSource,
        sink: &mut dyn MetricsSink,
    ) -> anyhow::Result<EpochSummary> {
        self.mode = ModelMode::Train;
        let total = batches.num_batches();
        let mut summary = EpochSummary::default();
        for (i, batch) in batches.epoch().enumerate() {
            let m = self.step(&batch, mode)?;
            sink.add_scalar("train_loss", m.loss, m.step)?;
            sink.add_scalar("alpha", m.alpha, m.step)?;
            if self.config.log_every > 0 && (i + 1) % self.config.log_every == 0 {
                tracing::info!(
                    phase = mode.as_str(),
                    batch = i + 1,
                    total,
                    step = m.step,
                    loss = %format!("{:.4}", m.loss),
                    lc = %format!("{:.4}", m.classification_loss),
                    lr_loss = %format!("{:.4}", m.regression_loss),
                    alpha = %format!("{:.4e}", m.alpha),
                    "train"
                );
            }
            summary.steps.push(m);
        }
        Ok(summary)
    }

    /// Start a phase: `s` back to 0.
    pub fn begin_phase(&mut self) {
        self.loss.reset();
    }

    /// Step the learning-rate schedule and push the new rate into the optimiser.
    pub fn advance_lr(&mut self) -> f64 {
        self.lr_scheduler.advance();
        let lr = self.lr_scheduler.current_lr();
        self.optimizer.set_learning_rate(lr);
        lr
    }

    // ── Evaluation ──────────────────────────────────────────────────────────

    /// Predict every sample in `batches` without touching parameters.
    ///
    /// Runs in eval mode and restores the previous mode afterwards, whether
    /// or not the pass succeeds.
    pub fn evaluate(&mut self, batches: &mut dyn BatchSource) -> anyhow::Result<Predictions> {
        let previous = std::mem::replace(&mut self.mode, ModelMode::Eval);
        let result = self.predict_all(batches);
        self.mode = previous;
        result
    }

    fn predict_all(&self, batches: &mut dyn BatchSource) -> anyhow::Result<Predictions> {
        let mut out = Predictions::default();
        for batch in batches.epoch() {
            let y = self.predict_batch(&batch)?;
            for row in y.to_vec2::<f32>()? {
                out.predictions.push([row[0], row[1], row[2]]);
            }
            out.targets.extend(batch.rotation_rows());
            out.labels.extend_from_slice(&batch.labels);
        }
        Ok(out)
    }

    /// Reconstructed rotations `(B, 3)` for one batch, cut off from the autograd graph.
    fn predict_batch(&self, batch: &RotationBatch) -> anyhow::Result<Tensor> {
        let t = batch.to_tensors(&self.device)?;
        let o = self.model.forward(&t.features, &t.labels, self.mode)?;
        Ok(reconstruct(&self.centers, &o.bin_logits.detach(), &o.residual.detach())?)
    }

    // ── Checkpoints ─────────────────────────────────────────────────────────

    /// Overwrite parameters from a safetensors checkpoint.
    pub fn load_checkpoint(&mut self, path: &Path) -> anyhow::Result<()> {
        self.varmap
            .load(path)
            .with_context(|| format!("load checkpoint {}", path.display()))?;
        tracing::info!(path = %path.display(), "Loaded checkpoint");
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn mode(&self) -> ModelMode {
        self.mode
    }

    pub fn loss_scheduler(&self) -> &LossScheduler {
        &self.loss
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}

// ── Gradient utilities ──────────────────────────────────────────────────────

/// Total L2 norm of gradients.
fn grad_norm(grads: &GradStore, vars: &[Var]) -> anyhow::Result<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(total.sqrt())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use rotbin_common::{Loader, ModelVariant, PoseDataset, RotationSample};

    fn dictionary() -> RotationDictionary {
        RotationDictionary::new(vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 0.0, 0.1],
            [0.0, 1.0, 0.0],
        ])
        .unwrap()
    }

    fn model_config(variant: ModelVariant) -> ModelConfig {
        ModelConfig {
            feature_dim: 4,
            hidden_dims: vec![16],
            residual_hidden: 8,
            num_classes: 2,
            dict_size: 4,
            variant,
            dropout: 0.0,
            class_names: vec![],
        }
    }

    fn trainer(variant: ModelVariant) -> Trainer<PoseNet> {
        let config = TrainerConfig {
            lr: 1e-2,
            log_every: 0,
            ..Default::default()
        };
        Trainer::new(&model_config(variant), config, dictionary(), Device::Cpu).unwrap()
    }

    fn dataset(n: usize) -> PoseDataset {
        let d = dictionary();
        let samples = (0..n)
            .map(|i| {
                let t = i as f32 / n as f32;
                let rotation = [0.9 * t, 0.2, 0.1 - 0.05 * t];
                RotationSample::assign(vec![t, 1.0 - t, t * t, 0.5], (i % 2) as u32, rotation, &d)
            })
            .collect();
        PoseDataset::from_samples(samples, 4, 2, d.len()).unwrap()
    }

    /// Constant logits and `residual = sqrt(w)` for a single `(1, 3)` parameter.
    struct StubModel {
        w: Tensor,
        logit: f32,
    }

    impl PoseModel for StubModel {
        fn forward(
            &self,
            features: &Tensor,
            _labels: &Tensor,
            _mode: ModelMode,
        ) -> candle_core::Result<rotbin_core::ModelOutput> {
            let b = features.dim(0)?;
            Ok(rotbin_core::ModelOutput {
                bin_logits: Tensor::full(self.logit, (b, 4), features.device())?,
                residual: self.w.sqrt()?.broadcast_as((b, 3))?,
            })
        }

        fn num_bins(&self) -> usize {
            4
        }
    }

    fn stub_trainer(logit: f32, w0: f64) -> Trainer<StubModel> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let w = vb
            .get_with_hints((1, 3), "w", candle_nn::Init::Const(w0))
            .unwrap();
        let config = TrainerConfig {
            log_every: 0,
            ..Default::default()
        };
        Trainer::with_model(StubModel { w, logit }, varmap, dictionary(), config, Device::Cpu)
            .unwrap()
    }

    fn stub_weight(trainer: &Trainer<StubModel>) -> Vec<f32> {
        trainer.varmap().all_vars()[0]
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
    }

    #[test]
    fn nan_loss_aborts_before_any_update() {
        let mut trainer = stub_trainer(f32::NAN, 0.25);
        let ds = dataset(8);
        let mut loader = Loader::shuffled(&ds, 4, 1);
        let mut sink = MemorySink::default();

        let err = trainer
            .run_epoch(LossMode::Init, &mut loader, &mut sink)
            .unwrap_err();

        assert!(err.to_string().contains("non-finite init loss"), "{err}");
        assert_eq!(trainer.loss_scheduler().s(), 0.0);
        assert_eq!(trainer.global_step, 0);
        assert!(sink.records.is_empty());
        assert_eq!(stub_weight(&trainer), vec![0.25; 3]);
    }

    #[test]
    fn non_finite_gradient_aborts_before_optimizer_step() {
        // Finite loss, but d/dw sqrt(w) is unbounded at w = 0.
        let mut trainer = stub_trainer(0.0, 0.0);
        let ds = dataset(4);
        let batch = RotationBatch::from_samples(ds.samples(), 4);

        let err = trainer.step(&batch, LossMode::Init).unwrap_err();

        assert!(err.to_string().contains("non-finite gradient norm"), "{err}");
        assert_eq!(trainer.loss_scheduler().s(), 0.0);
        assert_eq!(trainer.global_step, 0);
        assert_eq!(stub_weight(&trainer), vec![0.0; 3]);
    }

    #[test]
    fn predictions_carry_no_gradient_graph() {
        let trainer = trainer(ModelVariant::OneDeltaPerBin);
        let ds = dataset(3);
        let batch = RotationBatch::from_samples(ds.samples(), 4);
        let y = trainer.predict_batch(&batch).unwrap();
        assert_eq!(y.dims(), &[3, 3]);
        let grads = y.sum_all().unwrap().backward().unwrap();
        for var in trainer.varmap().all_vars() {
            assert!(grads.get(var.as_tensor()).is_none());
        }
    }

    #[test]
    fn config_builds_loaders() {
        let ds = dataset(10);
        let config = TrainerConfig {
            batch_size: 4,
            eval_batch_size: 3,
            seed: 5,
            ..Default::default()
        };
        assert_eq!(config.train_loader(&ds).num_batches(), 3);

        let mut eval = config.eval_loader(&ds);
        assert_eq!(eval.num_batches(), 4);
        let labels: Vec<u32> = eval.epoch().flat_map(|b| b.labels).collect();
        assert_eq!(labels, (0..10).map(|i| i % 2).collect::<Vec<u32>>());

        // Same seed, same first-epoch order.
        let order = |loader: &mut Loader| -> Vec<f32> {
            loader
                .epoch()
                .flat_map(|b| b.features.chunks(4).map(|c| c[0]).collect::<Vec<_>>())
                .collect()
        };
        assert_eq!(
            order(&mut config.train_loader(&ds)),
            order(&mut config.train_loader(&ds))
        );
    }

    #[test]
    fn init_epoch_leaves_s_from_last_batch() {
        let mut trainer = trainer(ModelVariant::OneBinDelta);
        let ds = dataset(8);
        let mut loader = Loader::shuffled(&ds, 4, 1);
        let mut sink = MemorySink::default();

        let summary = trainer.run_epoch(LossMode::Init, &mut loader, &mut sink).unwrap();

        assert_eq!(summary.steps.len(), 2);
        let last = summary.last().unwrap();
        let s = trainer.loss_scheduler().s();
        assert!((s - 0.5 * last.regression_loss.ln()).abs() < 1e-12);
        assert_eq!(s, last.s);
        // The first step's update was overwritten, not accumulated.
        let first = &summary.steps[0];
        assert!((first.s - 0.5 * first.regression_loss.ln()).abs() < 1e-12);
        // Steps are tagged 1, 2 and both scalars are emitted per step.
        assert_eq!(
            sink.series("train_loss").iter().map(|p| p.0).collect::<Vec<_>>(),
            vec![1, 2]
        );
        let alpha = sink.series("alpha");
        assert!((alpha[1].1 - 0.5 * (-2.0 * s).exp()).abs() < 1e-12);
    }

    #[test]
    fn first_step_uses_zero_s() {
        let mut trainer = trainer(ModelVariant::OneBinDelta);
        let ds = dataset(4);
        let batch = RotationBatch::from_samples(ds.samples(), 4);
        let m = trainer.step(&batch, LossMode::Main).unwrap();
        let expected = m.classification_loss + m.regression_loss;
        assert!((m.loss - expected).abs() < 1e-4, "{} vs {expected}", m.loss);
        assert!((trainer.loss_scheduler().s() - m.regression_loss.ln()).abs() < 1e-12);
        assert!(m.grad_norm.is_finite() && m.grad_norm > 0.0);
    }

    #[test]
    fn main_epoch_runs_for_both_variants() {
        for variant in [ModelVariant::OneBinDelta, ModelVariant::OneDeltaPerBin] {
            let mut trainer = trainer(variant);
            let ds = dataset(10);
            let mut loader = Loader::shuffled(&ds, 4, 3);
            let mut sink = MemorySink::default();
            trainer.run_epoch(LossMode::Init, &mut loader, &mut sink).unwrap();
            trainer.begin_phase();
            assert_eq!(trainer.loss_scheduler().s(), 0.0);
            let summary = trainer.run_epoch(LossMode::Main, &mut loader, &mut sink).unwrap();
            assert_eq!(summary.steps.len(), 3);
            assert!(summary.mean_loss().is_finite());
            // Global step keeps counting across phases.
            assert_eq!(trainer.global_step, 6);
            assert_eq!(summary.steps[0].step, 4);
        }
    }

    #[test]
    fn evaluate_restores_training_mode() {
        let mut trainer = trainer(ModelVariant::OneBinDelta);
        let ds = dataset(6);
        let batch = RotationBatch::from_samples(ds.samples(), 4);

        trainer.step(&batch, LossMode::Init).unwrap();
        assert_eq!(trainer.mode(), ModelMode::Train);
        let mut eval = Loader::sequential(&ds, 4);
        trainer.evaluate(&mut eval).unwrap();
        assert_eq!(trainer.mode(), ModelMode::Train);
        trainer.step(&batch, LossMode::Init).unwrap();
        assert_eq!(trainer.mode(), ModelMode::Train);
    }

    #[test]
    fn evaluate_aligns_predictions_and_leaves_parameters() {
        let mut trainer = trainer(ModelVariant::OneDeltaPerBin);
        let ds = dataset(5);
        let before: Vec<Vec<f32>> = trainer
            .varmap()
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect();

        let mut eval = Loader::sequential(&ds, 2);
        let p = trainer.evaluate(&mut eval).unwrap();

        assert_eq!(p.len(), 5);
        assert_eq!(p.predictions.len(), 5);
        assert_eq!(p.labels, vec![0, 1, 0, 1, 0]);
        assert_eq!(p.targets[3], ds.samples()[3].rotation);
        assert!(p.median_error_deg(2).is_finite());
        assert_eq!(trainer.global_step, 0);

        let after: Vec<Vec<f32>> = trainer
            .varmap()
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn advance_lr_updates_optimizer() {
        let mut trainer = trainer(ModelVariant::OneBinDelta);
        assert!((trainer.learning_rate() - 1e-2).abs() < 1e-12);
        let lr = trainer.advance_lr();
        assert!((lr - 5e-3).abs() < 1e-12);
        assert!((trainer.learning_rate() - 5e-3).abs() < 1e-12);
    }

    #[test]
    fn mismatched_dictionary_is_rejected() {
        let small = RotationDictionary::new(vec![[0.0, 0.0, 0.0]]).unwrap();
        let result = Trainer::new(
            &model_config(ModelVariant::OneBinDelta),
            TrainerConfig::default(),
            small,
            Device::Cpu,
        );
        assert!(result.is_err());
    }
}
