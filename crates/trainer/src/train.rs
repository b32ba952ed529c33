use std::path::PathBuf;

use indicatif::{ProgressBar, ProgressStyle};

use im2latex_core::{load_weights, Seq2Seq};

use crate::checkpoint::CheckpointManager;
use crate::config::RunConfig;
use crate::dataset::BatchSource;
use crate::error::Result;
use crate::metrics::MetricSink;
use crate::optim::OptimizationDriver;
use crate::sampling::SamplingMonitor;

pub const LOSS_KEY: &str = "train/loss";

/// Where the epoch loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochPhase {
    Pending(usize),
    Running(usize),
    Done(usize),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// Epochs run by this call.
    pub epochs: usize,
    /// Optimizer steps taken by this call.
    pub steps: usize,
    /// `(epoch, step)` pairs where samples were decoded.
    pub sampled_steps: Vec<(usize, usize)>,
    /// Weight files written, in order.
    pub checkpoints: Vec<PathBuf>,
    pub last_loss: Option<f64>,
}

pub struct Trainer<M: Seq2Seq> {
    config: RunConfig,
    model: M,
    checkpoints: CheckpointManager,
    sink: Option<Box<dyn MetricSink>>,
    phase: EpochPhase,
}

impl<M: Seq2Seq> Trainer<M> {
    /// Validates `config` and, when `load_checkpoint` is set, restores the
    /// model weights. Any name or shape disagreement is a `ResumeMismatch`.
    pub fn new(config: RunConfig, mut model: M, sink: Option<Box<dyn MetricSink>>) -> Result<Self> {
        config.validate()?;

        if let Some(path) = &config.load_checkpoint {
            let restored = load_weights(model.var_store_mut(), path)?;
            log::info!("restored {} tensors from {:?}", restored, path);
        }

        Ok(Self {
            checkpoints: CheckpointManager::new(&config),
            phase: EpochPhase::Pending(config.epoch),
            config,
            model,
            sink,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn phase(&self) -> EpochPhase {
        self.phase
    }

    /// Runs epochs `config.epoch..config.epochs` over `source`.
    ///
    /// The optimizer and schedule start fresh on every call, so a resumed
    /// run does not carry momentum or schedule position across the restart.
    pub fn train(&mut self, source: &mut dyn BatchSource) -> Result<RunSummary> {
        let steps_per_epoch = source.num_batches();
        let mut driver =
            OptimizationDriver::new(self.model.var_store(), &self.config, steps_per_epoch)?;
        let monitor = SamplingMonitor::new(&self.config, source.tokenizer());
        let mut summary = RunSummary::default();

        log::info!(
            "training {} from epoch {} to {} ({} steps per epoch)",
            self.config.name,
            self.config.epoch,
            self.config.epochs,
            steps_per_epoch
        );

        for epoch in self.config.epoch..self.config.epochs {
            self.phase = EpochPhase::Pending(epoch);
            self.config.epoch = epoch;
            self.phase = EpochPhase::Running(epoch);

            let pb = ProgressBar::new(steps_per_epoch as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("  epoch {prefix} {bar:30} {pos}/{len} [{elapsed}<{eta}] {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            pb.set_prefix(format!("{}/{}", epoch + 1, self.config.epochs));

            let mut epoch_loss = 0.0;
            let mut epoch_steps = 0usize;
            for (step, batch) in source.iter_epoch(epoch).enumerate() {
                let batch = batch?;
                let global_step = epoch * steps_per_epoch + step;

                let output = driver.step(&self.model, &batch)?;
                if let Some(sink) = self.sink.as_deref_mut() {
                    sink.log_scalar(LOSS_KEY, output.loss, global_step)?;
                }
                pb.set_message(format!("Loss: {:.4}", output.loss));
                log::debug!(
                    "step {} loss {:.4} grad_norm {:.3} lr {:.3e}",
                    global_step,
                    output.loss,
                    output.grad_norm,
                    output.lr
                );

                let sampled = monitor.maybe_sample(
                    step,
                    global_step,
                    &batch,
                    &output.context,
                    &mut self.model,
                    self.sink
                        .as_mut()
                        .map(|sink| sink.as_mut() as &mut dyn MetricSink),
                )?;
                if sampled.is_some() {
                    summary.sampled_steps.push((epoch, step));
                }

                epoch_loss += output.loss;
                epoch_steps += 1;
                summary.steps += 1;
                summary.last_loss = Some(output.loss);
                pb.inc(1);
            }
            pb.finish_and_clear();

            self.phase = EpochPhase::Done(epoch);
            if epoch_steps > 0 {
                log::info!(
                    "epoch {} average loss {:.4}",
                    epoch + 1,
                    epoch_loss / epoch_steps as f64
                );
            }
            if let Some(sink) = self.sink.as_deref_mut() {
                sink.flush()?;
            }
            if let Some(saved) = self.checkpoints.maybe_save(epoch, &self.model, &self.config)? {
                summary.checkpoints.push(saved.weights);
            }
            summary.epochs += 1;
        }

        Ok(summary)
    }
}
