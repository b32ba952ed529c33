use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    #[error("torch error: {0}")]
    Torch(#[from] tch::TchError),

    #[error("unsupported dtype {dtype:?} for tensor {name}")]
    UnsupportedDtype {
        name: String,
        dtype: safetensors::Dtype,
    },

    #[error("tensor {name} has shape {found:?} in checkpoint but {expected:?} in model")]
    ShapeMismatch {
        name: String,
        expected: Vec<i64>,
        found: Vec<i64>,
    },

    #[error("tensor {0} is missing from checkpoint")]
    MissingTensor(String),

    #[error("checkpoint tensor {0} has no counterpart in model")]
    UnexpectedTensor(String),
}

impl ModelError {
    /// True when the checkpoint describes a different architecture than the model.
    pub fn is_mismatch(&self) -> bool {
        matches!(
            self,
            Self::ShapeMismatch { .. } | Self::MissingTensor(_) | Self::UnexpectedTensor(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;
