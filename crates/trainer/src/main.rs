use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use rand::distributions::Alphanumeric;
use rand::Rng;

use im2latex_core::Im2LatexModel;
use tokenizer::LatexTokenizer;
use trainer::{resume_from, FormulaDataset, JsonlSink, MetricSink, RunConfig, Trainer};

/// Train an image-to-LaTeX model.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Run configuration (YAML)
    #[arg(short, long, default_value = "configs/default.yaml")]
    config: PathBuf,

    /// Dataset directory, overrides `data` from the config
    #[arg(short, long)]
    data: Option<PathBuf>,

    /// Train on the CPU even when CUDA is available
    #[arg(long)]
    no_cuda: bool,

    /// Verbose logging
    #[arg(long)]
    debug: bool,

    /// Continue the run saved in this checkpoint directory
    #[arg(long, value_name = "DIR")]
    resume: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        "debug"
    } else {
        "warn,im2latex_core=info,trainer=info,im2latex_train=info"
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(filter)).init();

    let resumed = cli.resume.is_some();
    let mut config = match &cli.resume {
        Some(dir) => {
            resume_from(dir).with_context(|| format!("Failed to resume from {:?}", dir))?
        }
        None => RunConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config {:?}", cli.config))?,
    };
    if let Some(data) = cli.data {
        config.data = data;
    }
    if cli.no_cuda {
        config.device = "cpu".to_string();
    }
    if config.log_metrics && (config.id.is_none() || !resumed) {
        config.id = Some(run_id());
    }
    config.validate()?;
    if config.starts_without_weights() {
        log::warn!(
            "Starting at epoch {} without load_checkpoint; weights are freshly initialised (use --resume to continue a run)",
            config.epoch
        );
    }

    tch::manual_seed(config.seed as i64);
    let device = config.device()?;
    log::info!("Using device: {:?}", device);

    let tokenizer = Arc::new(
        LatexTokenizer::load(&config.tokenizer)
            .with_context(|| format!("Failed to load vocabulary {:?}", config.tokenizer))?,
    );
    let mut dataset = FormulaDataset::load(&config, tokenizer).context("Failed to load dataset")?;

    let sink: Option<Box<dyn MetricSink>> = match &config.id {
        Some(id) if config.log_metrics => {
            let path = JsonlSink::path_for(&config.out_path, id);
            log::info!("Logging metrics to {:?}", path);
            Some(Box::new(JsonlSink::create(path)?))
        }
        _ => None,
    };

    let model = Im2LatexModel::new(&config.model_config(), device);
    let mut trainer = Trainer::new(config, model, sink)?;
    let summary = trainer.train(&mut dataset)?;

    log::info!(
        "Finished {} epochs ({} steps), {} checkpoints written",
        summary.epochs,
        summary.steps,
        summary.checkpoints.len()
    );
    Ok(())
}

fn run_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}
