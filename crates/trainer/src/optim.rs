use tch::{nn, nn::OptimizerConfig, Device, Kind, Tensor};

use im2latex_core::Seq2Seq;

use crate::config::{OptimizerKind, RunConfig};
use crate::dataset::Batch;
use crate::error::{Result, TrainError};
use crate::scheduler::LrSchedule;

/// Ceiling for the global gradient L2 norm.
pub const MAX_GRAD_NORM: f64 = 1.0;

pub struct StepOutput {
    pub loss: f64,
    /// Gradient norm before clipping.
    pub grad_norm: f64,
    /// Learning rate for the next step.
    pub lr: f64,
    /// Encoder output for this batch, detached from the graph.
    pub context: Tensor,
}

/// Owns the optimizer and learning-rate schedule and applies one update per batch.
/// A one-cycle schedule also drives the optimizer's momentum (Adam `beta1`).
pub struct OptimizationDriver {
    optimizer: nn::Optimizer,
    schedule: LrSchedule,
    variables: Vec<Tensor>,
    device: Device,
    steps: usize,
}

impl OptimizationDriver {
    pub fn new(vs: &nn::VarStore, config: &RunConfig, steps_per_epoch: usize) -> Result<Self> {
        let schedule = LrSchedule::from_config(config, steps_per_epoch)?;
        let lr = schedule.lr();
        let [beta1, beta2] = config.betas;

        let mut optimizer = match config.optimizer {
            OptimizerKind::Adam => nn::Adam {
                beta1,
                beta2,
                wd: config.weight_decay,
                ..Default::default()
            }
            .build(vs, lr)?,
            OptimizerKind::AdamW => nn::AdamW {
                beta1,
                beta2,
                wd: config.weight_decay,
                ..Default::default()
            }
            .build(vs, lr)?,
            OptimizerKind::Sgd => nn::Sgd {
                wd: config.weight_decay,
                ..Default::default()
            }
            .build(vs, lr)?,
        };
        if let Some(momentum) = schedule.momentum() {
            optimizer.set_momentum(momentum);
        }

        Ok(Self {
            optimizer,
            schedule,
            variables: vs.trainable_variables(),
            device: vs.device(),
            steps: 0,
        })
    }

    pub fn schedule(&self) -> &LrSchedule {
        &self.schedule
    }

    /// Updates applied so far.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// One optimization step. A non-finite loss is reported before any
    /// gradient is computed or parameter touched.
    pub fn step<M: Seq2Seq + ?Sized>(&mut self, model: &M, batch: &Batch) -> Result<StepOutput> {
        self.optimizer.zero_grad();

        let tokens = batch.tokens.to_device(self.device);
        let mask = batch.mask.to_kind(Kind::Bool).to_device(self.device);
        let images = batch.images.to_device(self.device);

        let context = model.encode(&images);
        let loss = model.decoder_loss(&tokens, &mask, &context);
        let loss_value = loss.double_value(&[]);
        if !loss_value.is_finite() {
            return Err(TrainError::Divergence {
                step: self.steps,
                loss: loss_value,
            });
        }

        loss.backward();
        let grad_norm = clip_grad_norm(&self.variables, MAX_GRAD_NORM);
        self.optimizer.step();
        let lr = self.schedule.step()?;
        self.optimizer.set_lr(lr);
        if let Some(momentum) = self.schedule.momentum() {
            self.optimizer.set_momentum(momentum);
        }
        self.steps += 1;

        Ok(StepOutput {
            loss: loss_value,
            grad_norm,
            lr,
            context: context.detach(),
        })
    }
}

/// Rescales the gradients of `variables` in place so their global L2 norm is
/// at most `max_norm`. Returns the norm before rescaling.
pub fn clip_grad_norm(variables: &[Tensor], max_norm: f64) -> f64 {
    let grads: Vec<Tensor> = variables
        .iter()
        .map(Tensor::grad)
        .filter(|grad| grad.defined())
        .collect();

    let total_norm = tch::no_grad(|| {
        grads
            .iter()
            .map(|grad| grad.square().sum(Kind::Double).double_value(&[]))
            .sum::<f64>()
            .sqrt()
    });

    let clip_coef = max_norm / (total_norm + 1e-6);
    if clip_coef < 1.0 {
        tch::no_grad(|| {
            for grad in &grads {
                let mut grad = grad.shallow_clone();
                let _ = grad.g_mul_scalar_(clip_coef);
            }
        });
    }
    total_norm
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global_norm(variables: &[Tensor]) -> f64 {
        variables
            .iter()
            .map(|v| v.grad().square().sum(Kind::Double).double_value(&[]))
            .sum::<f64>()
            .sqrt()
    }

    fn variables_with_grads(scale: f64) -> Vec<Tensor> {
        let a = Tensor::from_slice(&[1.0f32, 2.0, 3.0]).set_requires_grad(true);
        let b = Tensor::from_slice(&[4.0f32, -1.0]).set_requires_grad(true);
        let loss = (&a * &a).sum(Kind::Float) * scale + (&b * &b).sum(Kind::Float) * scale;
        loss.backward();
        vec![a, b]
    }

    #[test]
    fn clips_large_gradients_to_ceiling() {
        let variables = variables_with_grads(10.0);
        let before = global_norm(&variables);
        assert!(before > MAX_GRAD_NORM);

        let reported = clip_grad_norm(&variables, MAX_GRAD_NORM);
        assert!((reported - before).abs() < 1e-6 * before);
        assert!(global_norm(&variables) <= MAX_GRAD_NORM + 1e-5);
    }

    #[test]
    fn leaves_small_gradients_untouched() {
        let variables = variables_with_grads(0.01);
        let before: Vec<Tensor> = variables.iter().map(|v| v.grad().copy()).collect();
        assert!(global_norm(&variables) < MAX_GRAD_NORM);

        clip_grad_norm(&variables, MAX_GRAD_NORM);
        for (var, grad) in variables.iter().zip(&before) {
            assert!(var.grad().equal(grad));
        }
    }

    #[test]
    fn ignores_variables_without_gradients() {
        let unused = Tensor::zeros([4], (Kind::Float, Device::Cpu)).set_requires_grad(true);
        assert_eq!(clip_grad_norm(&[unused], MAX_GRAD_NORM), 0.0);
    }
}
