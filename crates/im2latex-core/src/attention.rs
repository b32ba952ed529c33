use tch::{nn, Kind, Tensor};

use crate::config::ModelConfig;
use crate::rotary::RotaryEmbedding;

/// Multi-head attention used for encoder self-attention, decoder causal
/// self-attention and decoder cross-attention over the image context.
pub struct MultiHeadAttention {
    to_q: nn::Linear,
    to_kv: nn::Linear,
    proj: nn::Linear,
    n_head: i64,
    dropout: f64,
}

impl MultiHeadAttention {
    pub fn new(vs: &nn::Path, config: &ModelConfig) -> Self {
        let dim = config.dim;
        let linear_config = nn::LinearConfig {
            bias: config.use_bias,
            ..Default::default()
        };

        Self {
            to_q: nn::linear(vs / "to_q", dim, dim, linear_config),
            to_kv: nn::linear(vs / "to_kv", dim, 2 * dim, linear_config),
            proj: nn::linear(vs / "proj", dim, dim, linear_config),
            n_head: config.heads,
            dropout: config.dropout,
        }
    }

    /// x: [batch, t, dim]; context: [batch, s, dim] or None for self-attention.
    /// mask: bool, broadcastable to [batch, n_head, t, s], true where attention is allowed.
    pub fn forward_t(
        &self,
        x: &Tensor,
        context: Option<&Tensor>,
        mask: Option<&Tensor>,
        rotary: Option<&RotaryEmbedding>,
        train: bool,
    ) -> Tensor {
        let size = x.size();
        let (b, t, c) = (size[0], size[1], size[2]);
        let source = context.unwrap_or(x);
        let s = source.size()[1];
        let head_size = c / self.n_head;

        let mut q = x
            .apply(&self.to_q)
            .view([b, t, self.n_head, head_size])
            .transpose(1, 2);
        let kv = source.apply(&self.to_kv).chunk(2, -1);
        let mut k = kv[0].view([b, s, self.n_head, head_size]).transpose(1, 2);
        let v = kv[1].view([b, s, self.n_head, head_size]).transpose(1, 2);

        if let Some(rope) = rotary {
            q = rope.forward(&q);
            k = rope.forward(&k);
        }

        let att = q.matmul(&k.transpose(-2, -1)) * (1.0 / (head_size as f64).sqrt());
        let att = match mask {
            Some(mask) => att.masked_fill(&mask.logical_not(), f64::NEG_INFINITY),
            None => att,
        };
        let att = att.softmax(-1, Kind::Float).dropout(self.dropout, train);

        att.matmul(&v)
            .transpose(1, 2)
            .contiguous()
            .view([b, t, c])
            .apply(&self.proj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn small_config() -> ModelConfig {
        ModelConfig {
            dim: 16,
            heads: 4,
            dropout: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn cross_attention_keeps_query_length() {
        let vs = nn::VarStore::new(Device::Cpu);
        let attn = MultiHeadAttention::new(&vs.root(), &small_config());
        let x = Tensor::randn([2, 3, 16], (Kind::Float, Device::Cpu));
        let context = Tensor::randn([2, 7, 16], (Kind::Float, Device::Cpu));
        let y = attn.forward_t(&x, Some(&context), None, None, false);
        assert_eq!(y.size(), vec![2, 3, 16]);
    }

    #[test]
    fn causal_mask_hides_future_tokens() {
        let vs = nn::VarStore::new(Device::Cpu);
        let attn = MultiHeadAttention::new(&vs.root(), &small_config());
        let mask = Tensor::ones([4, 4], (Kind::Bool, Device::Cpu))
            .tril(0)
            .view([1, 1, 4, 4]);
        let x = Tensor::randn([1, 4, 16], (Kind::Float, Device::Cpu));
        let full = attn.forward_t(&x, None, Some(&mask), None, false);

        // Changing the last token must not affect earlier outputs.
        let changed = x.copy();
        let _ = changed.narrow(1, 3, 1).fill_(5.0);
        let other = attn.forward_t(&changed, None, Some(&mask), None, false);
        let diff = (full.narrow(1, 0, 3) - other.narrow(1, 0, 3))
            .abs()
            .max()
            .double_value(&[]);
        assert!(diff < 1e-6);
    }
}
