use tch::{nn, Kind, Reduction, Tensor};

use crate::config::ModelConfig;
use crate::layer_norm::RMSNorm;
use crate::rotary::RotaryEmbedding;
use crate::transformer::DecoderBlock;

/// Autoregressive transformer decoder conditioned on the encoder context.
pub struct Decoder {
    tok_emb: nn::Embedding,
    blocks: Vec<DecoderBlock>,
    norm: RMSNorm,
    lm_head: nn::Linear,
    rotary: RotaryEmbedding,
    causal: Tensor,
    dropout: f64,
    max_seq_len: i64,
    pad_token: i64,
}

impl Decoder {
    pub fn new(vs: &nn::Path, config: &ModelConfig) -> Self {
        let tok_emb = nn::embedding(
            vs / "tok_emb",
            config.num_tokens,
            config.dim,
            Default::default(),
        );
        let blocks = (0..config.decoder_depth)
            .map(|i| DecoderBlock::new(&(vs / "blocks" / i), config))
            .collect();
        let lm_head = nn::linear(
            vs / "lm_head",
            config.dim,
            config.num_tokens,
            nn::LinearConfig {
                bias: false,
                ..Default::default()
            },
        );
        let causal = Tensor::ones(
            &[config.max_seq_len, config.max_seq_len],
            (Kind::Bool, vs.device()),
        )
        .tril(0);

        Self {
            tok_emb,
            blocks,
            norm: RMSNorm::new(&(vs / "norm"), config.dim, config.layer_norm_epsilon),
            lm_head,
            rotary: RotaryEmbedding::new(config.head_size(), config.max_seq_len, vs.device()),
            causal,
            dropout: config.dropout,
            max_seq_len: config.max_seq_len,
            pad_token: config.pad_token,
        }
    }

    /// tokens: [batch, t] (t <= max_seq_len); mask: [batch, t] bool, true on real tokens.
    /// Returns logits: [batch, t, num_tokens]
    pub fn forward_t(
        &self,
        tokens: &Tensor,
        mask: Option<&Tensor>,
        context: &Tensor,
        train: bool,
    ) -> Tensor {
        let size = tokens.size();
        let (b, t) = (size[0], size[1]);

        let causal = self.causal.narrow(0, 0, t).narrow(1, 0, t).view([1, 1, t, t]);
        let attn_mask = match mask {
            Some(mask) => causal.logical_and(&mask.to_kind(Kind::Bool).reshape([b, 1, 1, t])),
            None => causal,
        };

        let mut x = tokens.apply(&self.tok_emb).dropout(self.dropout, train);
        for block in &self.blocks {
            x = block.forward_t(&x, context, &attn_mask, &self.rotary, train);
        }
        self.norm.forward(&x).apply(&self.lm_head)
    }

    /// Teacher-forced cross entropy: predict tokens[:, 1:] from tokens[:, :-1].
    /// Padding targets do not contribute.
    pub fn loss(&self, tokens: &Tensor, mask: &Tensor, context: &Tensor, train: bool) -> Tensor {
        let t = tokens.size()[1];
        let input = tokens.narrow(1, 0, t - 1);
        let target = tokens.narrow(1, 1, t - 1);
        let input_mask = mask.narrow(1, 0, t - 1);

        let logits = self.forward_t(&input, Some(&input_mask), context, train);
        let vocab = logits.size()[2];
        logits.reshape([-1, vocab]).cross_entropy_loss::<Tensor>(
            &target.reshape([-1]),
            None,
            Reduction::Mean,
            self.pad_token,
            0.0,
        )
    }

    /// Greedy decoding from `start` ([batch, s]) for at most `max_len` new
    /// tokens. Rows that emitted `eos` keep emitting it; decoding stops once
    /// every row has. Returns only the generated tokens: [batch, <= max_len].
    pub fn generate(&self, start: &Tensor, max_len: i64, eos: i64, context: &Tensor) -> Tensor {
        let batch = start.size()[0];
        let start_len = start.size()[1];
        let mut out = start.shallow_clone();
        let mut finished = Tensor::zeros(&[batch], (Kind::Bool, start.device()));

        for _ in 0..max_len {
            let len = out.size()[1];
            let window = if len > self.max_seq_len {
                out.narrow(1, len - self.max_seq_len, self.max_seq_len)
            } else {
                out.shallow_clone()
            };

            let logits = self.forward_t(&window, None, context, false);
            let next = logits.select(1, -1).argmax(-1, false).masked_fill(&finished, eos);
            finished = finished.logical_or(&next.eq(eos));
            out = Tensor::cat(&[&out, &next.unsqueeze(1)], 1);

            if finished.all().int64_value(&[]) != 0 {
                break;
            }
        }

        out.narrow(1, start_len, out.size()[1] - start_len)
    }
}
