use tch::{nn, Tensor};

use crate::attention::MultiHeadAttention;
use crate::config::ModelConfig;
use crate::layer_norm::RMSNorm;
use crate::rotary::RotaryEmbedding;

/// Position-wise MLP
pub struct FeedForward {
    fc: nn::Linear,
    proj: nn::Linear,
    dropout: f64,
}

impl FeedForward {
    pub fn new(vs: &nn::Path, config: &ModelConfig) -> Self {
        let hidden = 4 * config.dim;
        Self {
            fc: nn::linear(vs / "fc", config.dim, hidden, Default::default()),
            proj: nn::linear(vs / "proj", hidden, config.dim, Default::default()),
            dropout: config.dropout,
        }
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Tensor {
        x.apply(&self.fc)
            .gelu("none")
            .apply(&self.proj)
            .dropout(self.dropout, train)
    }
}

/// Pre-norm block with bidirectional self-attention over image patches.
pub struct EncoderBlock {
    norm_attn: RMSNorm,
    attn: MultiHeadAttention,
    norm_ff: RMSNorm,
    ff: FeedForward,
}

impl EncoderBlock {
    pub fn new(vs: &nn::Path, config: &ModelConfig) -> Self {
        let eps = config.layer_norm_epsilon;
        Self {
            norm_attn: RMSNorm::new(&(vs / "norm_attn"), config.dim, eps),
            attn: MultiHeadAttention::new(&(vs / "attn"), config),
            norm_ff: RMSNorm::new(&(vs / "norm_ff"), config.dim, eps),
            ff: FeedForward::new(&(vs / "ff"), config),
        }
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Tensor {
        let x = x + self
            .attn
            .forward_t(&self.norm_attn.forward(x), None, None, None, train);
        let ff_out = self.ff.forward_t(&self.norm_ff.forward(&x), train);
        x + ff_out
    }
}

/// Pre-norm block: causal self-attention, cross-attention over the encoded
/// image, then the MLP.
pub struct DecoderBlock {
    norm_self: RMSNorm,
    self_attn: MultiHeadAttention,
    norm_cross: RMSNorm,
    cross_attn: MultiHeadAttention,
    norm_ff: RMSNorm,
    ff: FeedForward,
}

impl DecoderBlock {
    pub fn new(vs: &nn::Path, config: &ModelConfig) -> Self {
        let eps = config.layer_norm_epsilon;
        Self {
            norm_self: RMSNorm::new(&(vs / "norm_self"), config.dim, eps),
            self_attn: MultiHeadAttention::new(&(vs / "self_attn"), config),
            norm_cross: RMSNorm::new(&(vs / "norm_cross"), config.dim, eps),
            cross_attn: MultiHeadAttention::new(&(vs / "cross_attn"), config),
            norm_ff: RMSNorm::new(&(vs / "norm_ff"), config.dim, eps),
            ff: FeedForward::new(&(vs / "ff"), config),
        }
    }

    pub fn forward_t(
        &self,
        x: &Tensor,
        context: &Tensor,
        mask: &Tensor,
        rotary: &RotaryEmbedding,
        train: bool,
    ) -> Tensor {
        let x = x + self.self_attn.forward_t(
            &self.norm_self.forward(x),
            None,
            Some(mask),
            Some(rotary),
            train,
        );
        let cross = self.cross_attn.forward_t(
            &self.norm_cross.forward(&x),
            Some(context),
            None,
            None,
            train,
        );
        let x = x + cross;
        let ff_out = self.ff.forward_t(&self.norm_ff.forward(&x), train);
        x + ff_out
    }
}
