use std::fs;
use std::path::{Path, PathBuf};

use im2latex_core::ModelConfig;
use serde::{Deserialize, Serialize};
use tch::Device;

use crate::error::{Result, TrainError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adam,
    AdamW,
    Sgd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    /// One-cycle cosine policy peaking at `max_lr`.
    OneCycle,
    /// `lr` for the whole run.
    Constant,
}

/// Every hyperparameter of a run, persisted as one flat YAML mapping next to
/// the checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Run identifier, used to name checkpoint files.
    pub name: String,
    /// Metric sink run id; generated for fresh runs when metrics are on.
    pub id: Option<String>,
    pub seed: u64,
    /// `cpu`, `cuda`, `cuda:N` or `auto`.
    pub device: String,
    /// Append metrics to `{out_path}/metrics-{id}.jsonl`.
    pub log_metrics: bool,

    /// Dataset directory holding `formulas.txt` and `images/`.
    pub data: PathBuf,
    /// Vocabulary JSON.
    pub tokenizer: PathBuf,
    pub out_path: PathBuf,
    /// Weights to load before the first step.
    pub load_checkpoint: Option<PathBuf>,
    pub batch_size: usize,
    pub shuffle: bool,
    pub keep_smaller_batches: bool,

    /// Completed epoch boundary; training starts at this epoch index.
    pub epoch: usize,
    pub epochs: usize,
    pub optimizer: OptimizerKind,
    pub scheduler: SchedulerKind,
    pub lr: f64,
    pub max_lr: f64,
    pub betas: [f64; 2],
    pub weight_decay: f64,

    pub bos_token: i64,
    pub eos_token: i64,
    pub pad_token: i64,

    pub sample_freq: usize,
    pub save_freq: usize,
    pub test_samples: usize,

    pub channels: i64,
    pub patch_size: i64,
    pub max_height: i64,
    pub max_width: i64,
    pub dim: i64,
    pub heads: i64,
    pub encoder_depth: i64,
    pub decoder_depth: i64,
    pub num_tokens: i64,
    pub max_seq_len: i64,
    pub dropout: f64,
}

impl Default for RunConfig {
    fn default() -> Self {
        let model = ModelConfig::default();
        Self {
            name: "im2latex".to_string(),
            id: None,
            seed: 42,
            device: "auto".to_string(),
            log_metrics: false,
            data: PathBuf::from("data"),
            tokenizer: PathBuf::from("data/vocab.json"),
            out_path: PathBuf::from("checkpoints"),
            load_checkpoint: None,
            batch_size: 16,
            shuffle: true,
            keep_smaller_batches: false,
            epoch: 0,
            epochs: 10,
            optimizer: OptimizerKind::Adam,
            scheduler: SchedulerKind::OneCycle,
            lr: 1e-3,
            max_lr: 5e-3,
            betas: [0.9, 0.999],
            weight_decay: 0.0,
            bos_token: 1,
            eos_token: 2,
            pad_token: 0,
            sample_freq: 1000,
            save_freq: 1,
            test_samples: 5,
            channels: model.channels,
            patch_size: model.patch_size,
            max_height: model.max_height,
            max_width: model.max_width,
            dim: model.dim,
            heads: model.heads,
            encoder_depth: model.encoder_depth,
            decoder_depth: model.decoder_depth,
            num_tokens: model.num_tokens,
            max_seq_len: model.max_seq_len,
            dropout: model.dropout,
        }
    }
}

impl RunConfig {
    /// Reads and validates a YAML config. Unknown keys are an error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| TrainError::io(path, e))?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content).map_err(|e| TrainError::io(path, e))
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains(['/', '\\']) {
            return Err(TrainError::config(format!("invalid run name {:?}", self.name)));
        }
        if self.batch_size == 0 {
            return Err(TrainError::config("batch_size must be positive"));
        }
        if self.sample_freq == 0 || self.save_freq == 0 {
            return Err(TrainError::config("sample_freq and save_freq must be positive"));
        }
        if self.test_samples == 0 {
            return Err(TrainError::config("test_samples must be positive"));
        }
        if self.epoch > self.epochs {
            return Err(TrainError::config(format!(
                "epoch {} is past the last epoch {}",
                self.epoch, self.epochs
            )));
        }
        if !(self.lr > 0.0 && self.max_lr > 0.0) {
            return Err(TrainError::config("learning rates must be positive"));
        }
        if self.betas.iter().any(|b| !(0.0..1.0).contains(b)) {
            return Err(TrainError::config(format!("betas {:?} must lie in [0, 1)", self.betas)));
        }
        for (label, id) in [
            ("bos_token", self.bos_token),
            ("eos_token", self.eos_token),
            ("pad_token", self.pad_token),
        ] {
            if !(0..self.num_tokens).contains(&id) {
                return Err(TrainError::config(format!(
                    "{label} {id} outside vocabulary of {}",
                    self.num_tokens
                )));
            }
        }
        if self.max_seq_len < 2 {
            return Err(TrainError::config("max_seq_len must allow [BOS] and [EOS]"));
        }
        if self.patch_size <= 0
            || self.max_height % self.patch_size != 0
            || self.max_width % self.patch_size != 0
        {
            return Err(TrainError::config(format!(
                "max_height {} and max_width {} must be multiples of patch_size {}",
                self.max_height, self.max_width, self.patch_size
            )));
        }
        if self.heads <= 0 || self.dim % self.heads != 0 || (self.dim / self.heads) % 2 != 0 {
            return Err(TrainError::config(format!(
                "dim {} must split into an even head size over {} heads",
                self.dim, self.heads
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(TrainError::config("dropout must lie in [0, 1)"));
        }
        self.device()?;
        Ok(())
    }

    pub fn device(&self) -> Result<Device> {
        match self.device.as_str() {
            "auto" => Ok(Device::cuda_if_available()),
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|index| index.parse().ok())
                .map(Device::Cuda)
                .ok_or_else(|| TrainError::config(format!("unknown device {other:?}"))),
        }
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            channels: self.channels,
            patch_size: self.patch_size,
            max_height: self.max_height,
            max_width: self.max_width,
            dim: self.dim,
            heads: self.heads,
            encoder_depth: self.encoder_depth,
            decoder_depth: self.decoder_depth,
            num_tokens: self.num_tokens,
            max_seq_len: self.max_seq_len,
            pad_token: self.pad_token,
            dropout: self.dropout,
            ..Default::default()
        }
    }

    /// True when the run would continue past epoch 0 from freshly
    /// initialised weights, as when a saved `config.yaml` is passed directly
    /// instead of going through `resume_from`.
    pub fn starts_without_weights(&self) -> bool {
        self.epoch > 0 && self.load_checkpoint.is_none()
    }

    /// Copy describing the run once `epoch_index` has fully completed.
    pub fn at_boundary(&self, epoch_index: usize) -> Self {
        Self {
            epoch: epoch_index + 1,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        RunConfig::default().validate().unwrap();
    }

    #[test]
    fn yaml_round_trip_preserves_every_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let config = RunConfig {
            name: "formulas".to_string(),
            id: Some("abc123".to_string()),
            load_checkpoint: Some(PathBuf::from("ckpt/formulas_e02.safetensors")),
            optimizer: OptimizerKind::AdamW,
            scheduler: SchedulerKind::Constant,
            device: "cpu".to_string(),
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(RunConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn shipped_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../configs/default.yaml");
        let config = RunConfig::load(path).unwrap();
        assert!(config.log_metrics);
        assert_eq!(config.model_config(), ModelConfig::default());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = serde_yaml::from_str::<RunConfig>("epochs: 3\nlearning_rate: 0.1\n").unwrap_err();
        assert!(err.to_string().contains("learning_rate"));
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let config: RunConfig = serde_yaml::from_str("epochs: 3\noptimizer: sgd\n").unwrap();
        assert_eq!(config.epochs, 3);
        assert_eq!(config.optimizer, OptimizerKind::Sgd);
        assert_eq!(config.batch_size, RunConfig::default().batch_size);
    }

    #[test]
    fn validation_catches_bad_values() {
        let cases = [
            RunConfig { sample_freq: 0, ..Default::default() },
            RunConfig { save_freq: 0, ..Default::default() },
            RunConfig { dim: 100, heads: 8, ..Default::default() },
            RunConfig { max_width: 100, ..Default::default() },
            RunConfig { eos_token: 9000, ..Default::default() },
            RunConfig { betas: [0.9, 1.0], ..Default::default() },
            RunConfig { epoch: 11, epochs: 10, ..Default::default() },
            RunConfig { device: "tpu".to_string(), ..Default::default() },
            RunConfig { name: "a/b".to_string(), ..Default::default() },
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(TrainError::Config(_))),
                "accepted {config:?}"
            );
        }
    }

    #[test]
    fn boundary_only_advances_epoch() {
        let config = RunConfig { epoch: 3, ..Default::default() };
        let snapshot = config.at_boundary(3);
        assert_eq!(snapshot.epoch, 4);
        assert_eq!(RunConfig { epoch: 3, ..snapshot }, config);
    }

    #[test]
    fn flags_late_start_without_weights() {
        assert!(!RunConfig::default().starts_without_weights());

        let saved = RunConfig::default().at_boundary(1);
        assert!(saved.starts_without_weights());

        let resumed = RunConfig {
            load_checkpoint: Some(PathBuf::from("out/im2latex_e02.safetensors")),
            ..saved
        };
        assert!(!resumed.starts_without_weights());
    }

    #[test]
    fn parses_devices() {
        let device = |name: &str| RunConfig { device: name.to_string(), ..Default::default() }.device();
        assert_eq!(device("cpu").unwrap(), Device::Cpu);
        assert_eq!(device("cuda").unwrap(), Device::Cuda(0));
        assert_eq!(device("cuda:2").unwrap(), Device::Cuda(2));
        assert!(device("cuda:x").is_err());
    }

    #[test]
    fn model_config_carries_pad_token() {
        let config = RunConfig { pad_token: 5, dim: 64, heads: 4, ..Default::default() };
        let model = config.model_config();
        assert_eq!(model.pad_token, 5);
        assert_eq!(model.head_size(), 16);
    }
}
