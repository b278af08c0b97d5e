use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};

use rotbin_common::{ModelConfig, ModelVariant, PoseDataset, RotationDictionary};
use rotbin_train::{
    CsvSink, LrDecay, MetricsSink, RunArtifacts, TracingSink, Trainer, TrainerConfig,
};

#[derive(Parser, Debug)]
#[command(name = "rotbin", about = "Bin-and-delta rotation regression")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a model: one init epoch, then `--num-epochs` main epochs.
    Train(TrainArgs),
    /// Evaluate a trained run directory on a data file.
    Evaluate(EvaluateArgs),
}

// ── Train ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct TrainArgs {
    /// Model config JSON; a default one is written here if missing.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Dictionary of rotation centers (JSON).
    #[arg(long)]
    dictionary: PathBuf,
    #[arg(long)]
    train_data: PathBuf,
    #[arg(long)]
    test_data: PathBuf,
    #[arg(long, default_value = "runs")]
    output_dir: PathBuf,
    /// Overrides `variant` in the config (`single`/`one_bin_delta`, `multires`/`one_delta_per_bin`).
    #[arg(long)]
    variant: Option<String>,
    /// Overrides `dict_size` in the config.
    #[arg(long)]
    dict_size: Option<usize>,
    #[arg(long, default_value_t = 96)]
    batch_size: usize,
    #[arg(long, default_value_t = 32)]
    eval_batch_size: usize,
    #[arg(long, default_value_t = 10)]
    num_epochs: usize,
    #[arg(long, default_value = "1e-4")]
    lr: f64,
    #[arg(long, default_value = "0.0")]
    lr_min: f64,
    #[arg(long, default_value = "inverse", value_parser = ["inverse", "cosine", "none"])]
    lr_decay: String,
    #[arg(long, default_value = "0.0")]
    weight_decay: f64,
    #[arg(long, default_value_t = 50)]
    log_every: usize,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Where per-step scalars go.
    #[arg(long, default_value = "csv", value_parser = ["csv", "log"])]
    metrics: String,
    #[arg(long)]
    cpu: bool,
}

// ── Evaluate ───────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct EvaluateArgs {
    /// Run directory holding config.json and model.safetensors.
    #[arg(long)]
    run_dir: PathBuf,
    #[arg(long)]
    dictionary: PathBuf,
    #[arg(long)]
    data: PathBuf,
    #[arg(long, default_value_t = 32)]
    batch_size: usize,
    /// Write results.json here instead of into the run directory.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Train(args) => cmd_train(args),
        Command::Evaluate(args) => cmd_evaluate(args),
    }
}

fn select_device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else {
        Ok(Device::cuda_if_available(0)?)
    }
}

// ── Command implementations ────────────────────────────────────────────────────

fn cmd_train(args: TrainArgs) -> Result<()> {
    let mut model_config = if args.config.exists() {
        ModelConfig::load(&args.config)?
    } else {
        let default = ModelConfig::default();
        default.save(&args.config)?;
        eprintln!("Created default config at {}", args.config.display());
        default
    };
    if let Some(ref v) = args.variant {
        model_config.variant = ModelVariant::from_str(v)
            .with_context(|| format!("unknown model variant {v:?}"))?;
    }
    if let Some(k) = args.dict_size {
        model_config.dict_size = k;
    }
    model_config.validate()?;

    let dictionary = RotationDictionary::load(&args.dictionary, Some(model_config.dict_size))?;
    let train_ds = PoseDataset::load_jsonl(
        &args.train_data,
        model_config.feature_dim,
        model_config.num_classes,
        &dictionary,
    )?;
    let test_ds = PoseDataset::load_jsonl(
        &args.test_data,
        model_config.feature_dim,
        model_config.num_classes,
        &dictionary,
    )?;

    let trainer_config = TrainerConfig {
        batch_size: args.batch_size,
        eval_batch_size: args.eval_batch_size,
        num_epochs: args.num_epochs,
        lr: args.lr,
        lr_min: args.lr_min,
        lr_decay: LrDecay::from_str(&args.lr_decay),
        weight_decay: args.weight_decay,
        log_every: args.log_every,
        seed: args.seed,
        output_dir: args.output_dir.clone(),
    };

    let device = select_device(args.cpu)?;
    let mut trainer = Trainer::new(&model_config, trainer_config, dictionary, device)?;
    let artifacts = RunArtifacts::new(&trainer.config.output_dir)?;
    let mut sink: Box<dyn MetricsSink> = match args.metrics.as_str() {
        "log" => Box::new(TracingSink),
        _ => Box::new(CsvSink::create(&artifacts.dir().join("metrics.csv"))?),
    };
    let mut train = trainer.config.train_loader(&train_ds);
    let mut test = trainer.config.eval_loader(&test_ds);

    let outcome = rotbin_train::run(
        &mut trainer,
        &mut train,
        &mut test,
        &artifacts,
        sink.as_mut(),
        &model_config,
    )?;

    eprintln!("Init MedErr: {:.2}°", outcome.init_error_deg);
    for (epoch, err) in outcome.history.iter().enumerate() {
        eprintln!("epoch {:>3}  MedErr {:.2}°", epoch + 1, err);
    }
    eprintln!(
        "Final MedErr: {:.2}°  ({} steps, output in {})",
        outcome.final_error_deg,
        trainer.global_step,
        artifacts.dir().display()
    );
    Ok(())
}

fn cmd_evaluate(args: EvaluateArgs) -> Result<()> {
    let run = RunArtifacts::new(&args.run_dir)?;
    let model_config = ModelConfig::load(&run.config_path())?;
    let dictionary = RotationDictionary::load(&args.dictionary, Some(model_config.dict_size))?;
    let dataset = PoseDataset::load_jsonl(
        &args.data,
        model_config.feature_dim,
        model_config.num_classes,
        &dictionary,
    )?;

    let device = select_device(args.cpu)?;
    let trainer_config = TrainerConfig {
        eval_batch_size: args.batch_size,
        ..Default::default()
    };
    let mut trainer = Trainer::new(&model_config, trainer_config, dictionary, device)?;
    trainer.load_checkpoint(&run.checkpoint_path())?;

    let mut loader = trainer.config.eval_loader(&dataset);
    let predictions = trainer.evaluate(&mut loader)?;

    let num_classes = model_config.num_classes;
    println!("samples: {}", predictions.len());
    for (label, med) in predictions.per_class_deg(num_classes).into_iter().enumerate() {
        if let Some(med) = med {
            println!("  {:<20} {:>8.2}°", model_config.class_name(label), med);
        }
    }
    println!("MedErr: {:.2}°", predictions.median_error_deg(num_classes));

    let out = match args.output_dir {
        Some(dir) => RunArtifacts::new(dir)?,
        None => run,
    };
    out.save_results(&predictions)?;
    eprintln!("Results written to {}", out.results_path().display());
    Ok(())
}
