//! leafscan CLI
//!
//! Entry point for cleaning raw images, training, evaluating, predicting and
//! inspecting datasets.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use leafscan::backend::{backend_name, default_device, InferenceBackend, TrainingBackend};
use leafscan::dataset::cleaner::{clean_splits, Cleaner, SPLITS};
use leafscan::dataset::{has_image_extension, DecodeFailurePolicy, ImageFolder};
use leafscan::evaluation::Evaluator;
use leafscan::inference::{BatchOutcome, Predictor};
use leafscan::training::{run_training, CheckpointBundle, TrainOptions};
use leafscan::utils::config::AppConfig;
use leafscan::utils::error::ResultExt;
use leafscan::utils::logging::{init_logging, LogConfig};
use leafscan::utils::{format_duration, format_progress_bar};

/// Leaf disease classification with Burn
#[derive(Parser, Debug)]
#[command(name = "leafscan")]
#[command(version)]
#[command(about = "Clean, train, evaluate and serve a leaf disease classifier", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,

    /// TOML configuration file
    #[arg(short, long, global = true, env = "LEAFSCAN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate raw images and write cleaned RGB JPEG copies
    Clean {
        /// Raw data root containing train/, val/ and test/
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Output root for the cleaned splits
        #[arg(long)]
        processed_dir: Option<PathBuf>,
    },

    /// Train a classifier on the cleaned train/val splits
    Train {
        #[arg(short, long)]
        epochs: Option<usize>,

        #[arg(short, long)]
        batch_size: Option<usize>,

        #[arg(short, long)]
        learning_rate: Option<f64>,

        /// Random seed for shuffling and augmentation
        #[arg(long)]
        seed: Option<u64>,

        /// Checkpoint directory to resume from
        #[arg(long)]
        resume: Option<PathBuf>,

        /// Backbone weights written by `export-backbone`
        #[arg(long)]
        pretrained_backbone: Option<PathBuf>,

        /// Replace decoding failures with blank images instead of dropping them
        #[arg(long)]
        on_decode_error: Option<DecodeFailurePolicy>,
    },

    /// Evaluate a checkpoint on a held-out split
    Evaluate {
        /// Checkpoint directory
        #[arg(short, long)]
        model: PathBuf,

        /// Split directory (defaults to the cleaned test split)
        #[arg(short, long)]
        split: Option<PathBuf>,
    },

    /// Predict the classes of images
    Predict {
        /// Checkpoint directory
        #[arg(short, long)]
        model: PathBuf,

        /// Image files or directories of images
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Number of classes to report per image
        #[arg(short = 'k', long, default_value_t = leafscan::DEFAULT_TOP_K)]
        top_k: usize,

        /// Print machine-readable JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Show per-class sample counts
    Stats {
        /// Dataset directory (defaults to every cleaned split)
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },

    /// Write a checkpoint's backbone weights for reuse as a pretrained start
    ExportBackbone {
        /// Checkpoint directory
        #[arg(short, long)]
        model: PathBuf,

        /// Output file stem (the recorder adds its extension)
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&LogConfig::from_verbosity(cli.verbose))?;
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    info!("leafscan v{} | backend: {} | run {}", leafscan::VERSION, backend_name(), config.run_id);

    match cli.command {
        Commands::Clean {
            data_dir,
            processed_dir,
        } => {
            if let Some(dir) = data_dir {
                config.paths.data_dir = dir;
            }
            if let Some(dir) = processed_dir {
                config.paths.processed_dir = dir;
            }
            cmd_clean(&config)?;
        }

        Commands::Train {
            epochs,
            batch_size,
            learning_rate,
            seed,
            resume,
            pretrained_backbone,
            on_decode_error,
        } => {
            if let Some(epochs) = epochs {
                config.training.num_epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                config.data.batch_size = batch_size;
            }
            if let Some(lr) = learning_rate {
                config.training.learning_rate = lr;
            }
            if let Some(seed) = seed {
                config.training.seed = seed;
            }
            if let Some(policy) = on_decode_error {
                config.data.on_decode_error = policy;
            }
            let options = TrainOptions {
                resume,
                pretrained_backbone,
                show_progress: true,
            };
            cmd_train(&config, &options)?;
        }

        Commands::Evaluate { model, split } => {
            let split = split.unwrap_or_else(|| config.test_dir());
            cmd_evaluate(&config, &model, &split)?;
        }

        Commands::Predict {
            model,
            inputs,
            top_k,
            json,
        } => {
            cmd_predict(&config, &model, &inputs, top_k, json)?;
        }

        Commands::Stats { data_dir } => {
            cmd_stats(&config, data_dir.as_deref())?;
        }

        Commands::ExportBackbone { model, output } => {
            cmd_export_backbone(&model, &output)?;
        }
    }

    Ok(())
}

fn cmd_clean(config: &AppConfig) -> Result<()> {
    config.prepare_directories()?;
    println!("{}", "Cleaning raw images...".cyan().bold());

    let cleaner = Cleaner::default().with_progress(true);
    let reports = clean_splits(&cleaner, &config.paths.data_dir, &config.paths.processed_dir)?;
    if reports.is_empty() {
        bail!(
            "no train/val/test directories found under {}",
            config.paths.data_dir.display()
        );
    }

    for (split, report) in &reports {
        println!(
            "  {:<6} {} written, {} skipped",
            split.bold(),
            report.written.to_string().green(),
            report.skipped.len().to_string().yellow()
        );
        for (dir, tally) in &report.per_dir {
            println!("    {:<30} {:>6} {:>6}", dir, tally.written, tally.skipped);
        }
        for skipped in &report.skipped {
            println!("    {} {}: {}", "skip".yellow(), skipped.path.display(), skipped.reason);
        }
    }

    println!(
        "{} Cleaned data written to {}",
        "Done.".green().bold(),
        config.paths.processed_dir.display()
    );
    Ok(())
}

fn cmd_train(config: &AppConfig, options: &TrainOptions) -> Result<()> {
    println!("{}", "Training Configuration:".cyan().bold());
    println!("  Run id:        {}", config.run_id);
    println!("  Backend:       {}", backend_name());
    println!("  Epochs:        {}", config.training.num_epochs);
    println!("  Batch size:    {}", config.data.batch_size);
    println!("  Learning rate: {}", config.training.learning_rate);
    println!("  Image size:    {}", config.data.image_size);
    if let Some(resume) = &options.resume {
        println!("  Resume from:   {}", resume.display());
    }
    println!();

    let start = std::time::Instant::now();
    let summary = run_training::<TrainingBackend>(config, options, &default_device())?;

    println!();
    println!("{}", "Training Complete!".green().bold());
    println!("  Epochs run:     {}", summary.epochs_run);
    println!(
        "  Best accuracy:  {:.2}% (epoch {})",
        summary.best_accuracy * 100.0,
        summary
            .best_epoch
            .map(|e| e.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    if summary.early_stopped {
        println!("  {}", "Stopped early".yellow());
    }
    println!("  Duration:       {}", format_duration(start.elapsed().as_secs_f64()));
    println!("  Checkpoint:     {}", summary.checkpoint_dir.display());
    println!("  Training log:   {}", summary.log_path.display());
    Ok(())
}

fn cmd_evaluate(config: &AppConfig, model: &Path, split: &Path) -> Result<()> {
    println!("{}", "Evaluating...".cyan().bold());
    let (evaluation, artifacts) =
        Evaluator::new(config, model).run::<InferenceBackend>(split, &default_device())?;

    println!();
    println!("  Samples:        {}", evaluation.num_samples);
    println!("  Loss:           {:.4}", evaluation.loss);
    println!("  Accuracy:       {:.2}%", evaluation.accuracy * 100.0);
    println!("  Top-5 accuracy: {:.2}%", evaluation.top5_accuracy * 100.0);
    println!();
    println!("{}", evaluation.report);
    println!(
        "{}",
        evaluation
            .confusion_matrix
            .display(Some(&evaluation.class_names))
    );
    println!("  Heatmap: {}", artifacts.heatmap.display());
    println!("  Counts:  {}", artifacts.csv.display());
    println!("  Report:  {}", artifacts.json.display());
    Ok(())
}

/// Files named directly plus the images inside named directories
fn expand_inputs(inputs: &[PathBuf]) -> leafscan::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut found: Vec<PathBuf> = fs::read_dir(input)
                .with_context(|| format!("Cannot list {}", input.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| path.is_file() && has_image_extension(path))
                .collect();
            found.sort();
            paths.extend(found);
        } else {
            paths.push(input.clone());
        }
    }
    Ok(paths)
}

fn cmd_predict(config: &AppConfig, model: &Path, inputs: &[PathBuf], top_k: usize, json: bool) -> Result<()> {
    let predictor =
        Predictor::<InferenceBackend>::load(model, config.data.resize_margin, &default_device())?;
    let paths = expand_inputs(inputs)?;
    let results = predictor.batch_predict(&paths, top_k);

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    for result in &results {
        println!("{}", result.image_path.display().to_string().bold());
        match &result.outcome {
            BatchOutcome::Predictions(predictions) => {
                for (rank, p) in predictions.iter().enumerate() {
                    let line = format!(
                        "  {}. {:<30} {}",
                        rank + 1,
                        p.class_name,
                        format_progress_bar(p.probability as f64, 20)
                    );
                    if rank == 0 {
                        println!("{}", line.green());
                    } else {
                        println!("{}", line);
                    }
                }
            }
            BatchOutcome::Error(message) => println!("  {} {}", "Error:".red(), message),
        }
    }

    let failed = results.iter().filter(|r| !r.is_ok()).count();
    if failed > 0 && failed == results.len() {
        bail!("all {} predictions failed", failed);
    }
    Ok(())
}

fn cmd_stats(config: &AppConfig, data_dir: Option<&Path>) -> Result<()> {
    let roots: Vec<PathBuf> = match data_dir {
        Some(dir) => vec![dir.to_path_buf()],
        None => SPLITS
            .iter()
            .map(|split| config.paths.processed_dir.join(split))
            .filter(|dir| dir.is_dir())
            .collect(),
    };

    if roots.is_empty() {
        bail!(
            "no dataset found under {} (run `leafscan clean` first)",
            config.paths.processed_dir.display()
        );
    }

    for root in roots {
        let stats = ImageFolder::new(&root)?.stats();
        println!("{}", stats);
        if let (Some(min), Some(max)) = (stats.min_class(), stats.max_class()) {
            println!(
                "  Smallest class: {} ({}) | Largest class: {} ({})",
                min.0.yellow(),
                min.1,
                max.0.green(),
                max.1
            );
        }
        println!();
    }
    Ok(())
}

fn cmd_export_backbone(model: &Path, output: &Path) -> Result<()> {
    let (classifier, _, metadata) =
        CheckpointBundle::new(model).load_model::<InferenceBackend>(&default_device())?;
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    classifier.backbone.export(output)?;

    println!(
        "{} Backbone of run {} ({} features) written to {}",
        "Done.".green().bold(),
        metadata.run_id,
        classifier.feature_size(),
        output.display()
    );
    Ok(())
}
