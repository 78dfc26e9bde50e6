use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use gmm_trainer_rs::pipeline::checkpoint::CheckpointStore;
use gmm_trainer_rs::{Corpus, TrainingConfiguration, TrainingPlan};

#[path = "training_plan/plan_formatter.rs"]
mod plan_formatter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "training_plan")]
#[command(about = "Validate GMM-HMM training configurations and inspect training plans")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Parse and validate a training configuration.
    Validate {
        #[arg(long, env = "GMM_TRAINER_CONFIG")]
        config: PathBuf,
    },
    /// Show per-stage subsets and Gaussian growth without training.
    Plan {
        #[arg(long, env = "GMM_TRAINER_CONFIG")]
        config: PathBuf,
        /// JSON array of utterances.
        #[arg(long, env = "GMM_TRAINER_CORPUS")]
        corpus: PathBuf,
        /// Overrides the configured subset seed.
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// List completed stages recorded in a checkpoint directory.
    Checkpoints {
        #[arg(long, env = "GMM_TRAINER_CHECKPOINT_DIR")]
        dir: PathBuf,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run(Args::parse()) {
        tracing::error!("{err}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), String> {
    match args.command {
        Command::Validate { config } => {
            let config = load_config(&config)?;
            println!(
                "configuration is valid: {} stage(s), beam {} / retry beam {}",
                config.training.len(),
                config.beam,
                config.retry_beam
            );
            Ok(())
        }
        Command::Plan {
            config,
            corpus,
            seed,
            format,
        } => {
            let mut config = load_config(&config)?;
            if let Some(seed) = seed {
                config.seed = seed;
            }
            let corpus = Corpus::load_json(&corpus)
                .map_err(|err| format!("Failed to load corpus '{}': {err}", corpus.display()))?;
            let plan = TrainingPlan::new(&config, &corpus);
            let rendered = match format {
                OutputFormat::Text => plan_formatter::render_text(&plan),
                OutputFormat::Json => plan_formatter::render_json(&plan)?,
            };
            println!("{rendered}");
            Ok(())
        }
        Command::Checkpoints { dir } => {
            if !dir.is_dir() {
                return Err(format!("Checkpoint directory '{}' does not exist", dir.display()));
            }
            let store = CheckpointStore::open(&dir).map_err(|err| err.to_string())?;
            let manifest = store.load_manifest().map_err(|err| err.to_string())?;
            println!("{}", plan_formatter::render_manifest(&manifest));
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> Result<TrainingConfiguration, String> {
    let config = TrainingConfiguration::load(path)
        .map_err(|err| format!("Failed to load config '{}': {err}", path.display()))?;
    config
        .validate()
        .map_err(|err| format!("Config '{}' is invalid: {err}", path.display()))?;
    Ok(config)
}
