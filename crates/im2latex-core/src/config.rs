use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of image planes fed to the patch embedding.
    pub channels: i64,
    /// Side length of the square patches the encoder cuts images into.
    pub patch_size: i64,
    /// Largest image height (pixels) the position table covers.
    pub max_height: i64,
    /// Largest image width (pixels) the position table covers.
    pub max_width: i64,
    /// Width of encoder and decoder hidden states.
    pub dim: i64,
    /// Number of attention heads in every attention layer.
    pub heads: i64,
    pub encoder_depth: i64,
    pub decoder_depth: i64,
    /// Size of the output vocabulary.
    pub num_tokens: i64,
    /// Longest token sequence the decoder attends over.
    pub max_seq_len: i64,
    /// Token id ignored by the teacher-forced loss.
    pub pad_token: i64,
    pub dropout: f64,
    /// RMSNorm epsilon value (for numerical stability).
    pub layer_norm_epsilon: f64,
    pub use_bias: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            channels: 1,
            patch_size: 16,
            max_height: 192,
            max_width: 672,
            dim: 256,
            heads: 8,
            encoder_depth: 4,
            decoder_depth: 4,
            num_tokens: 8000,
            max_seq_len: 512,
            pad_token: 0,
            dropout: 0.1,
            layer_norm_epsilon: 1e-5,
            use_bias: false,
        }
    }
}

impl ModelConfig {
    pub fn head_size(&self) -> i64 {
        self.dim / self.heads
    }

    /// Patch rows covered by the encoder position table.
    pub fn grid_height(&self) -> i64 {
        self.max_height / self.patch_size
    }

    /// Patch columns covered by the encoder position table.
    pub fn grid_width(&self) -> i64 {
        self.max_width / self.patch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_follows_patch_size() {
        let config = ModelConfig {
            patch_size: 32,
            max_height: 96,
            max_width: 320,
            ..Default::default()
        };
        assert_eq!(config.grid_height(), 3);
        assert_eq!(config.grid_width(), 10);
        assert_eq!(config.head_size(), 32);
    }
}
