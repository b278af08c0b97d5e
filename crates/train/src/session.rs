//! The full two-phase run: one init epoch, then `num_epochs` main epochs with
//! a checkpoint and an evaluation after each.

use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use rotbin_common::{BatchSource, ModelConfig};
use rotbin_core::PoseModel;

use crate::artifacts::RunArtifacts;
use crate::loss::LossMode;
use crate::sink::MetricsSink;
use crate::trainer::{Predictions, Trainer};

/// What a finished run leaves behind besides its files.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Median error (degrees) after each main epoch, in order.
    pub history: Vec<f64>,
    /// Median error (degrees) after the init epoch.
    pub init_error_deg: f64,
    pub final_error_deg: f64,
    pub final_predictions: Predictions,
}

/// Train and evaluate end to end, persisting into `artifacts`.
pub fn run<M: PoseModel>(
    trainer: &mut Trainer<M>,
    train: &mut dyn BatchSource,
    test: &mut dyn BatchSource,
    artifacts: &RunArtifacts,
    sink: &mut dyn MetricsSink,
    model_config: &ModelConfig,
) -> anyhow::Result<RunOutcome> {
    let num_classes = model_config.num_classes;
    let num_epochs = trainer.config.num_epochs;
    let run_start = Instant::now();

    tracing::info!(
        train_batches = train.num_batches(),
        test_batches = test.num_batches(),
        num_epochs,
        output = %artifacts.dir().display(),
        "Starting run"
    );

    // ── Init phase ──────────────────────────────────────────────────────────
    trainer.begin_phase();
    let t0 = Instant::now();
    let summary = trainer.run_epoch(LossMode::Init, train, sink)?;
    let init = trainer.evaluate(test)?;
    let init_error_deg = init.median_error_deg(num_classes);
    tracing::info!(
        phase = "init",
        mean_loss = %format!("{:.4}", summary.mean_loss()),
        med_err_deg = %format!("{:.2}", init_error_deg),
        secs = %format!("{:.1}", t0.elapsed().as_secs_f64()),
        "Init epoch done"
    );

    // ── Main phase ──────────────────────────────────────────────────────────
    trainer.begin_phase();
    let mut history = Vec::with_capacity(num_epochs);
    let pb = ProgressBar::new(num_epochs as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} epochs {msg}")?
            .progress_chars("=>-"),
    );
    for epoch in 0..num_epochs {
        let t0 = Instant::now();
        let lr = trainer.advance_lr();
        let summary = trainer.run_epoch(LossMode::Main, train, sink)?;
        artifacts.save_checkpoint(trainer.varmap(), model_config)?;

        let predictions = trainer.evaluate(test)?;
        let err = predictions.median_error_deg(num_classes);
        history.push(err);
        artifacts.save_results(&predictions)?;

        tracing::info!(
            epoch = epoch + 1,
            num_epochs,
            lr = %format!("{lr:.3e}"),
            mean_loss = %format!("{:.4}", summary.mean_loss()),
            s = %format!("{:.4}", trainer.loss_scheduler().s()),
            med_err_deg = %format!("{:.2}", err),
            secs = %format!("{:.1}", t0.elapsed().as_secs_f64()),
            "Epoch done"
        );
        sink.flush()?;
        pb.set_message(format!("MedErr {err:.2}°"));
        pb.inc(1);
    }
    pb.finish_with_message("done");
    artifacts.save_history(&history)?;

    // ── Final evaluation ────────────────────────────────────────────────────
    let final_predictions = trainer.evaluate(test)?;
    let final_error_deg = final_predictions.median_error_deg(num_classes);
    artifacts.save_results(&final_predictions)?;
    sink.flush()?;

    for (label, med) in final_predictions
        .per_class_deg(num_classes)
        .into_iter()
        .enumerate()
    {
        if let Some(med) = med {
            tracing::debug!(class = %model_config.class_name(label), med_err_deg = med, "per-class");
        }
    }
    tracing::info!(
        med_err_deg = %format!("{:.2}", final_error_deg),
        steps = trainer.global_step,
        secs = %format!("{:.1}", run_start.elapsed().as_secs_f64()),
        "Run finished"
    );

    Ok(RunOutcome {
        history,
        init_error_deg,
        final_error_deg,
        final_predictions,
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::trainer::TrainerConfig;
    use candle_core::Device;
    use rotbin_common::{ModelVariant, PoseDataset, RotationDictionary, RotationSample};

    fn setup() -> (ModelConfig, RotationDictionary, PoseDataset, PoseDataset) {
        let dict = RotationDictionary::new(vec![
            [0.0, 0.0, 0.0],
            [0.5, 0.0, 0.0],
            [0.0, 0.5, 0.0],
        ])
        .unwrap();
        let config = ModelConfig {
            feature_dim: 3,
            hidden_dims: vec![8],
            residual_hidden: 4,
            num_classes: 2,
            dict_size: 3,
            variant: ModelVariant::OneBinDelta,
            dropout: 0.0,
            class_names: vec!["chair".into(), "sofa".into()],
        };
        let make = |n: usize, offset: f32| {
            let samples = (0..n)
                .map(|i| {
                    let t = offset + i as f32 / n as f32;
                    RotationSample::assign(
                        vec![t, 1.0 - t, 0.3],
                        (i % 2) as u32,
                        [0.4 * t, 0.1, 0.05],
                        &dict,
                    )
                })
                .collect();
            PoseDataset::from_samples(samples, 3, 2, 3).unwrap()
        };
        let train = make(12, 0.0);
        let test = make(5, 0.05);
        (config, dict, train, test)
    }

    #[test]
    fn run_produces_history_and_artifacts() {
        let (config, dict, train_ds, test_ds) = setup();
        let dir = tempfile::tempdir().unwrap();
        let trainer_config = TrainerConfig {
            batch_size: 4,
            eval_batch_size: 2,
            num_epochs: 2,
            lr: 1e-2,
            log_every: 0,
            seed: 7,
            output_dir: dir.path().join("run"),
            ..Default::default()
        };
        let mut trainer = Trainer::new(&config, trainer_config, dict, Device::Cpu).unwrap();
        let artifacts = RunArtifacts::new(&trainer.config.output_dir).unwrap();
        let mut train = trainer.config.train_loader(&train_ds);
        let mut test = trainer.config.eval_loader(&test_ds);
        let mut sink = MemorySink::default();

        let outcome = run(
            &mut trainer,
            &mut train,
            &mut test,
            &artifacts,
            &mut sink,
            &config,
        )
        .unwrap();

        assert_eq!(outcome.history.len(), 2);
        assert!(outcome.history.iter().all(|e| e.is_finite()));
        assert!(outcome.init_error_deg.is_finite());
        assert_eq!(outcome.final_predictions.len(), 5);
        // Final evaluation sees the same parameters as the last epoch's.
        assert!((outcome.final_error_deg - outcome.history[1]).abs() < 1e-9);

        // 3 batches per epoch, 3 epochs (init + 2 main).
        let steps: Vec<usize> = sink.series("train_loss").iter().map(|p| p.0).collect();
        assert_eq!(steps, (1..=9).collect::<Vec<_>>());
        assert_eq!(sink.series("alpha").len(), 9);
        assert_eq!(trainer.global_step, 9);

        assert!(artifacts.checkpoint_path().exists());
        assert_eq!(artifacts.load_history().unwrap().val_loss, outcome.history);
        assert_eq!(artifacts.load_results().unwrap().labels.len(), 5);
        let reloaded = ModelConfig::load(&artifacts.config_path()).unwrap();
        assert_eq!(reloaded.class_names, config.class_names);
    }
}
