use tch::{nn, Kind, Tensor};

#[derive(Debug)]
pub struct RMSNorm {
    weight: Tensor,
    eps: f64,
}

impl RMSNorm {
    pub fn new(vs: &nn::Path, dim: i64, eps: f64) -> Self {
        let weight = vs.var("weight", &[dim], nn::Init::Const(1.0));
        Self { weight, eps }
    }

    /// x: [batch, seq_len, dim]
    pub fn forward(&self, x: &Tensor) -> Tensor {
        let norm = x
            .pow_tensor_scalar(2.0)
            .mean_dim(Some(&[-1][..]), true, Kind::Float)
            + self.eps;
        x * norm.rsqrt() * &self.weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn normalises_to_unit_rms() {
        let vs = nn::VarStore::new(Device::Cpu);
        let norm = RMSNorm::new(&vs.root(), 4, 1e-6);
        let x = Tensor::from_slice(&[2.0f32, -2.0, 2.0, -2.0, 0.5, 0.5, 0.5, 0.5]).view([1, 2, 4]);
        let y = norm.forward(&x);
        let rms = y
            .pow_tensor_scalar(2.0)
            .mean_dim(Some(&[-1][..]), false, Kind::Float)
            .sqrt();
        for row in 0..2 {
            assert!((rms.double_value(&[0, row]) - 1.0).abs() < 1e-4);
        }
    }
}
