use std::fs;
use std::path::{Path, PathBuf};

use im2latex_core::Seq2Seq;

use crate::config::RunConfig;
use crate::error::{Result, TrainError};

pub const CONFIG_FILE: &str = "config.yaml";

/// `{name}_e{boundary:02}.safetensors`, where `boundary` counts completed epochs.
pub fn weights_file_name(name: &str, boundary: usize) -> String {
    format!("{name}_e{boundary:02}.safetensors")
}

#[derive(Debug, Clone, PartialEq)]
pub struct SavedCheckpoint {
    pub weights: PathBuf,
    pub config: PathBuf,
}

/// Writes weights plus the run config every `save_freq` epochs.
pub struct CheckpointManager {
    out_path: PathBuf,
    save_freq: usize,
}

impl CheckpointManager {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            out_path: config.out_path.clone(),
            save_freq: config.save_freq,
        }
    }

    pub fn should_save(&self, epoch: usize) -> bool {
        (epoch + 1) % self.save_freq == 0
    }

    pub fn weights_path(&self, name: &str, boundary: usize) -> PathBuf {
        self.out_path.join(weights_file_name(name, boundary))
    }

    pub fn config_path(&self) -> PathBuf {
        self.out_path.join(CONFIG_FILE)
    }

    /// Saves after epoch index `epoch` when it is a save boundary. The written
    /// config replaces any earlier one and records `epoch + 1` as completed.
    pub fn maybe_save<M: Seq2Seq + ?Sized>(
        &self,
        epoch: usize,
        model: &M,
        config: &RunConfig,
    ) -> Result<Option<SavedCheckpoint>> {
        if !self.should_save(epoch) {
            return Ok(None);
        }

        fs::create_dir_all(&self.out_path).map_err(|e| TrainError::io(&self.out_path, e))?;

        let snapshot = config.at_boundary(epoch);
        let weights = self.weights_path(&snapshot.name, snapshot.epoch);
        model
            .var_store()
            .save(&weights)
            .map_err(|source| TrainError::CheckpointWrite {
                path: weights.clone(),
                source,
            })?;

        let config_path = self.config_path();
        snapshot.save(&config_path)?;

        log::info!("saved checkpoint {:?}", weights);
        Ok(Some(SavedCheckpoint {
            weights,
            config: config_path,
        }))
    }
}

/// Config for continuing the run saved in `dir`, with `load_checkpoint`
/// pointing at the weights of its last completed epoch.
pub fn resume_from<P: AsRef<Path>>(dir: P) -> Result<RunConfig> {
    let dir = dir.as_ref();
    let mut config = RunConfig::load(dir.join(CONFIG_FILE))?;
    let weights = dir.join(weights_file_name(&config.name, config.epoch));
    if !weights.exists() {
        return Err(TrainError::Data(format!(
            "no weights for epoch {} at {:?}",
            config.epoch, weights
        )));
    }
    config.load_checkpoint = Some(weights);
    Ok(config)
}
