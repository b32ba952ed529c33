use std::path::PathBuf;

use im2latex_core::ModelError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("loss diverged to {loss} at step {step}")]
    Divergence { step: usize, loss: f64 },

    #[error("checkpoint does not match the model: {0}")]
    ResumeMismatch(#[source] ModelError),

    #[error("failed to load weights: {0}")]
    Weights(#[source] ModelError),

    #[error("failed to write weights to {path:?}: {source}")]
    CheckpointWrite {
        path: PathBuf,
        source: tch::TchError,
    },

    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("torch error: {0}")]
    Torch(#[from] tch::TchError),

    #[error("tokenizer error: {0}")]
    Tokenizer(#[from] tokenizer::TokenizerError),

    #[error("learning-rate schedule exhausted after {0} steps")]
    ScheduleExhausted(usize),

    #[error("data error: {0}")]
    Data(String),
}

impl TrainError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

impl From<ModelError> for TrainError {
    fn from(err: ModelError) -> Self {
        if err.is_mismatch() {
            Self::ResumeMismatch(err)
        } else {
            Self::Weights(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, TrainError>;
