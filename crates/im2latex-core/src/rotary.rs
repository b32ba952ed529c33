use tch::{Device, Kind, Tensor};

/// Rotary position tables, precomputed up to the decoder's context length.
pub struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
    max_len: i64,
}

impl RotaryEmbedding {
    pub fn new(dim: i64, max_len: i64, device: Device) -> Self {
        let inv_freq: Vec<f32> = (0..dim)
            .step_by(2)
            .map(|i| 1.0 / 10000.0f32.powf(i as f32 / dim as f32))
            .collect();
        let inv_freq = Tensor::from_slice(&inv_freq).to(device);

        // freqs: [max_len, dim/2] -> emb: [max_len, dim]
        let positions = Tensor::arange(max_len, (Kind::Float, device));
        let freqs = positions.outer(&inv_freq);
        let emb = Tensor::cat(&[&freqs, &freqs], -1);

        Self {
            cos: emb.cos(),
            sin: emb.sin(),
            max_len,
        }
    }

    pub fn max_len(&self) -> i64 {
        self.max_len
    }

    /// x: [batch, n_head, seq_len, head_dim], seq_len <= max_len
    pub fn forward(&self, x: &Tensor) -> Tensor {
        let seq_len = x.size()[2];
        let cos = self.cos.narrow(0, 0, seq_len);
        let sin = self.sin.narrow(0, 0, seq_len);
        x * cos + Self::rotate_half(x) * sin
    }

    fn rotate_half(x: &Tensor) -> Tensor {
        let half = x.size()[3] / 2;
        let x1 = x.narrow(-1, 0, half);
        let x2 = x.narrow(-1, half, half);
        Tensor::cat(&[&-x2, &x1], -1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_position_is_identity() {
        let rope = RotaryEmbedding::new(8, 16, Device::Cpu);
        let x = Tensor::randn([1, 2, 3, 8], (Kind::Float, Device::Cpu));
        let y = rope.forward(&x);
        assert_eq!(y.size(), x.size());
        let diff = (y.narrow(2, 0, 1) - x.narrow(2, 0, 1))
            .abs()
            .max()
            .double_value(&[]);
        assert!(diff < 1e-6);
    }

    #[test]
    fn rotation_preserves_norm() {
        let rope = RotaryEmbedding::new(8, 16, Device::Cpu);
        let x = Tensor::randn([1, 1, 5, 8], (Kind::Float, Device::Cpu));
        let before = x.norm().double_value(&[]);
        let after = rope.forward(&x).norm().double_value(&[]);
        assert!((before - after).abs() < 1e-4);
    }
}
