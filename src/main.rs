//! Warp-supervised co-training CLI
//!
//! Entry point for training the registration and segmentation models on
//! co-registered MRI/CT volumes.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::optim::AdamConfig;
use burn::tensor::backend::Backend;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use liverseg_ssl::backend::{backend_name, resolve_device, DefaultBackend, TrainingBackend};
use liverseg_ssl::dataset::{DatasetSplit, SampleSource, VolumeDataset};
use liverseg_ssl::model::{load_reference, CoTrainModels, DeviceMap};
use liverseg_ssl::training::{CoTrainer, FileSink, GradScaler, RunSummary};
use liverseg_ssl::utils::format_duration;
use liverseg_ssl::utils::logging::{init_logging, LogConfig};
use liverseg_ssl::RunConfig;

/// Semi-supervised MRI/CT segmentation through registration pseudo-labels
#[derive(Parser, Debug)]
#[command(name = "liverseg_ssl")]
#[command(version)]
#[command(about = "Warp-supervised co-training with Burn", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false", global = true)]
    verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run co-training
    Train {
        /// Path to the TOML run configuration
        #[arg(short, long)]
        config: PathBuf,

        /// Override the number of epochs
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Override the batch size
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Override the random seed
        #[arg(long)]
        seed: Option<u64>,

        /// Override the log root directory
        #[arg(long)]
        log_root: Option<PathBuf>,
    },

    /// Validate a configuration and its dataset index without training
    Check {
        /// Path to the TOML run configuration
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Write the default configuration
    InitConfig {
        /// Output path
        #[arg(short, long, default_value = "run.toml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };
    let _ = init_logging(&log_config);

    print_banner();

    match cli.command {
        Commands::Train {
            config,
            epochs,
            batch_size,
            seed,
            log_root,
        } => {
            let mut run_config = load_config(&config)?;
            if let Some(epochs) = epochs {
                run_config.epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                run_config.batch_size = batch_size;
            }
            if let Some(seed) = seed {
                run_config.seed = seed;
            }
            if let Some(log_root) = log_root {
                run_config.log_root = log_root;
            }
            cmd_train(run_config)?;
        }

        Commands::Check { config } => {
            cmd_check(&config)?;
        }

        Commands::InitConfig { output } => {
            RunConfig::default()
                .save(&output)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("{} Default configuration written to {}", "Done:".green(), output.display());
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<RunConfig> {
    let config = RunConfig::load(path)?;
    config
        .validate()
        .with_context(|| format!("invalid configuration {}", path.display()))?;
    Ok(config)
}

fn cmd_train(config: RunConfig) -> Result<()> {
    config.validate()?;

    let devices = DeviceMap {
        reference: resolve_device(config.device_map.reference)?,
        registration: resolve_device(config.device_map.registration)?,
        segmentation: resolve_device(config.device_map.segmentation)?,
    };

    println!("{}", "Training Configuration:".cyan().bold());
    println!("  Dataset:      {}", config.dataset_root.display());
    println!("  Epochs:       {}", config.epochs);
    println!("  Batch size:   {}", config.batch_size);
    println!("  Shape:        {:?}", config.output_shape);
    println!("  Backend:      {}", backend_name());
    println!(
        "  Devices:      reference={} registration={} segmentation={}",
        config.device_map.reference, config.device_map.registration, config.device_map.segmentation
    );
    println!();

    TrainingBackend::seed(&devices.registration, config.seed);

    let source = VolumeDataset::from_config(&config)?;
    let models = CoTrainModels::<TrainingBackend>::init(&config, &devices);
    let reference = load_reference::<DefaultBackend>(
        &config,
        config.checkpoints.reference_weights.as_deref(),
        &devices.reference,
    )?;
    let optimizer = AdamConfig::new().init::<TrainingBackend, CoTrainModels<TrainingBackend>>();
    let scaler = GradScaler::new(config.scaler.clone());

    let mut sink = FileSink::create(&config.log_root)?;
    config.save(&sink.run_dir().join("config.toml"))?;
    info!("Effective configuration saved to {}", sink.run_dir().display());

    let mut trainer = CoTrainer::new(
        config,
        models,
        reference,
        optimizer,
        scaler,
        devices,
        Box::new(source),
    )?;
    let summary = trainer.run(&mut sink)?;
    let summary_path = sink.write_json("summary.json", &summary)?;

    print_summary(&summary);
    println!("  Summary:      {}", summary_path.display());
    Ok(())
}

fn cmd_check(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let dataset = VolumeDataset::from_config(&config)?;
    let split = DatasetSplit::new(dataset.len(), config.split_ratio, config.seed)?;

    println!("{}", "Configuration OK".green().bold());
    println!("  Index:        {}", config.index_path().display());
    println!("  Samples:      {}", dataset.len());
    println!("  Train:        {}", split.train.len());
    println!("  Validation:   {}", split.validation.len());
    for slot in [
        config.device_map.reference,
        config.device_map.registration,
        config.device_map.segmentation,
    ] {
        resolve_device(slot)?;
    }
    println!("  Backend:      {}", backend_name());
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("{}", "Training Complete".green().bold());
    println!("  Duration:     {}", format_duration(summary.elapsed_secs));
    println!(
        "  Steps:        {} applied, {} skipped",
        summary.optimizer_steps, summary.skipped_steps
    );
    println!("  Loss scale:   {}", summary.final_loss_scale);
    for best in [&summary.registration, &summary.segmentation] {
        match (best.best_epoch, best.best_val_loss) {
            (Some(epoch), Some(loss)) => {
                println!("  Best {:<8} epoch {} (val loss {:.4})", best.model, epoch, loss)
            }
            _ => println!("  Best {:<8} {}", best.model, "none".yellow()),
        }
    }
}

fn print_banner() {
    println!(
        "{}",
        r#"
 ╔══════════════════════════════════════════════════════════════════╗
 ║   Warp-Supervised Co-Training                                    ║
 ║   MRI → CT Liver Segmentation with Burn + Rust                   ║
 ╚══════════════════════════════════════════════════════════════════╝
  "#
        .green()
    );
}
