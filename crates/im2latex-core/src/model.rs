use tch::{nn, Device, Tensor};

use crate::config::ModelConfig;
use crate::decoder::Decoder;
use crate::encoder::Encoder;

/// Call contract the training loop needs from an image-to-sequence model.
///
/// Parameters live in the model's `VarStore`; the trainer builds its optimizer
/// over it and checkpoints it as an opaque blob.
pub trait Seq2Seq {
    fn var_store(&self) -> &nn::VarStore;

    fn var_store_mut(&mut self) -> &mut nn::VarStore;

    /// Switches dropout (and any other train-only behaviour) on or off.
    fn set_train(&mut self, train: bool);

    /// images: [batch, channels, height, width] -> context
    fn encode(&self, images: &Tensor) -> Tensor;

    /// Scalar teacher-forced loss of `tokens` given `context`.
    fn decoder_loss(&self, tokens: &Tensor, mask: &Tensor, context: &Tensor) -> Tensor;

    /// Token ids generated after `start`, at most `max_len` per row.
    fn decoder_generate(&self, start: &Tensor, max_len: i64, eos: i64, context: &Tensor) -> Tensor;
}

pub struct Im2LatexModel {
    vs: nn::VarStore,
    encoder: Encoder,
    decoder: Decoder,
    train: bool,
}

impl Im2LatexModel {
    pub fn new(config: &ModelConfig, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let (encoder, decoder) = {
            let root = vs.root();
            (
                Encoder::new(&(&root / "encoder"), config),
                Decoder::new(&(&root / "decoder"), config),
            )
        };

        Self {
            vs,
            encoder,
            decoder,
            train: true,
        }
    }
}

impl Seq2Seq for Im2LatexModel {
    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }

    fn set_train(&mut self, train: bool) {
        self.train = train;
    }

    fn encode(&self, images: &Tensor) -> Tensor {
        self.encoder.forward_t(images, self.train)
    }

    fn decoder_loss(&self, tokens: &Tensor, mask: &Tensor, context: &Tensor) -> Tensor {
        self.decoder.loss(tokens, mask, context, self.train)
    }

    fn decoder_generate(&self, start: &Tensor, max_len: i64, eos: i64, context: &Tensor) -> Tensor {
        self.decoder.generate(start, max_len, eos, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            patch_size: 8,
            max_height: 16,
            max_width: 32,
            dim: 16,
            heads: 2,
            encoder_depth: 1,
            decoder_depth: 1,
            num_tokens: 10,
            max_seq_len: 6,
            dropout: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn encode_then_loss_backpropagates() {
        let model = Im2LatexModel::new(&tiny_config(), Device::Cpu);
        let images = Tensor::rand([2, 1, 16, 32], (Kind::Float, Device::Cpu));
        let tokens = Tensor::from_slice(&[1i64, 4, 5, 2, 1, 6, 2, 0]).view([2, 4]);
        let mask = tokens.ne(0i64);

        let context = model.encode(&images);
        let loss = model.decoder_loss(&tokens, &mask, &context);
        loss.backward();

        let with_grad = model
            .var_store()
            .trainable_variables()
            .iter()
            .filter(|v| v.grad().defined())
            .count();
        assert!(with_grad > 0);
    }

    #[test]
    fn parameters_are_namespaced() {
        let model = Im2LatexModel::new(&tiny_config(), Device::Cpu);
        let names: Vec<String> = model.var_store().variables().into_keys().collect();
        assert!(names.iter().any(|n| n.starts_with("encoder.")));
        assert!(names.iter().any(|n| n.starts_with("decoder.")));
    }
}
