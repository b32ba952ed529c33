//! Learning-rate schedules stepped once per optimizer update.

use std::f64::consts::PI;

use crate::config::{RunConfig, SchedulerKind};
use crate::error::{Result, TrainError};

/// The schedule is sized for twice the real number of steps per epoch, so a
/// full run only traverses the first half of the one-cycle curve.
pub const SCHEDULE_STEP_FACTOR: usize = 2;

const PCT_START: f64 = 0.3;
const DIV_FACTOR: f64 = 25.0;
const FINAL_DIV_FACTOR: f64 = 1e4;
const BASE_MOMENTUM: f64 = 0.85;
const MAX_MOMENTUM: f64 = 0.95;

#[derive(Debug, Clone)]
pub enum LrSchedule {
    Constant { lr: f64 },
    OneCycle(OneCycle),
}

impl LrSchedule {
    pub fn from_config(config: &RunConfig, steps_per_epoch: usize) -> Result<Self> {
        match config.scheduler {
            SchedulerKind::Constant => Ok(Self::Constant { lr: config.lr }),
            SchedulerKind::OneCycle => {
                let schedule_steps = steps_per_epoch * SCHEDULE_STEP_FACTOR;
                if schedule_steps == 0 || config.epochs == 0 {
                    return Err(TrainError::config("one-cycle schedule needs at least one step"));
                }
                Ok(Self::OneCycle(OneCycle::new(
                    config.max_lr,
                    config.epochs,
                    schedule_steps,
                )))
            }
        }
    }

    /// Learning rate for the next optimizer update.
    pub fn lr(&self) -> f64 {
        match self {
            Self::Constant { lr } => *lr,
            Self::OneCycle(schedule) => schedule.lr(),
        }
    }

    /// First-moment coefficient for the next update, when the schedule
    /// drives it. Cycles against the learning rate.
    pub fn momentum(&self) -> Option<f64> {
        match self {
            Self::Constant { .. } => None,
            Self::OneCycle(schedule) => Some(schedule.momentum()),
        }
    }

    /// Advances one step and returns the new learning rate.
    pub fn step(&mut self) -> Result<f64> {
        match self {
            Self::Constant { lr } => Ok(*lr),
            Self::OneCycle(schedule) => schedule.step(),
        }
    }

    pub fn total_steps(&self) -> Option<usize> {
        match self {
            Self::Constant { .. } => None,
            Self::OneCycle(schedule) => Some(schedule.total_steps),
        }
    }
}

/// One-cycle policy: cosine warm-up from `max_lr / 25` to `max_lr` over the
/// first 30% of the budget, then cosine decay to `max_lr / 25 / 1e4`.
/// Momentum moves the opposite way, from 0.95 down to 0.85 at the peak and
/// back to 0.95.
#[derive(Debug, Clone)]
pub struct OneCycle {
    initial_lr: f64,
    max_lr: f64,
    min_lr: f64,
    total_steps: usize,
    steps_per_epoch: usize,
    step_num: usize,
}

impl OneCycle {
    pub fn new(max_lr: f64, epochs: usize, steps_per_epoch: usize) -> Self {
        let initial_lr = max_lr / DIV_FACTOR;
        Self {
            initial_lr,
            max_lr,
            min_lr: initial_lr / FINAL_DIV_FACTOR,
            total_steps: epochs * steps_per_epoch,
            steps_per_epoch,
            step_num: 0,
        }
    }

    pub fn steps_per_epoch(&self) -> usize {
        self.steps_per_epoch
    }

    pub fn step_num(&self) -> usize {
        self.step_num
    }

    pub fn lr(&self) -> f64 {
        match self.phase() {
            (true, pct) => cosine(self.initial_lr, self.max_lr, pct),
            (false, pct) => cosine(self.max_lr, self.min_lr, pct),
        }
    }

    pub fn momentum(&self) -> f64 {
        match self.phase() {
            (true, pct) => cosine(MAX_MOMENTUM, BASE_MOMENTUM, pct),
            (false, pct) => cosine(BASE_MOMENTUM, MAX_MOMENTUM, pct),
        }
    }

    /// Whether the current step is in warm-up, and the progress through its phase.
    fn phase(&self) -> (bool, f64) {
        let step = self.step_num as f64;
        let warmup_end = PCT_START * self.total_steps as f64 - 1.0;
        let last = self.total_steps as f64 - 1.0;

        if step <= warmup_end {
            (true, step / warmup_end)
        } else {
            (false, (step - warmup_end) / (last - warmup_end))
        }
    }

    pub fn step(&mut self) -> Result<f64> {
        if self.step_num >= self.total_steps {
            return Err(TrainError::ScheduleExhausted(self.total_steps));
        }
        self.step_num += 1;
        Ok(self.lr())
    }
}

fn cosine(start: f64, end: f64, pct: f64) -> f64 {
    end + (start - end) / 2.0 * ((PI * pct).cos() + 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-9 * b.abs().max(1.0)
    }

    #[test]
    fn one_cycle_budget_doubles_steps_per_epoch() {
        let config = RunConfig { epochs: 3, ..Default::default() };
        let schedule = LrSchedule::from_config(&config, 50).unwrap();
        assert_eq!(schedule.total_steps(), Some(3 * 2 * 50));
        match schedule {
            LrSchedule::OneCycle(cycle) => assert_eq!(cycle.steps_per_epoch(), 100),
            other => panic!("unexpected schedule {other:?}"),
        }
    }

    #[test]
    fn one_cycle_warms_up_then_anneals() {
        let mut cycle = OneCycle::new(1e-2, 1, 100);
        assert!(close(cycle.lr(), 1e-2 / 25.0));
        assert!(close(cycle.momentum(), 0.95));

        let mut peak = cycle.lr();
        let mut peak_step = 0;
        let mut lowest_momentum = cycle.momentum();
        let mut lowest_momentum_step = 0;
        let mut last = cycle.lr();
        for step in 1..100 {
            last = cycle.step().unwrap();
            if last > peak {
                peak = last;
                peak_step = step;
            }
            if cycle.momentum() < lowest_momentum {
                lowest_momentum = cycle.momentum();
                lowest_momentum_step = step;
            }
        }
        assert_eq!(peak_step, 29);
        assert!(close(peak, 1e-2));
        assert!(close(last, 1e-2 / 25.0 / 1e4));

        assert_eq!(lowest_momentum_step, peak_step);
        assert!(close(lowest_momentum, 0.85));
        assert!(close(cycle.momentum(), 0.95));
    }

    #[test]
    fn one_cycle_refuses_to_run_past_budget() {
        let mut cycle = OneCycle::new(1e-3, 1, 4);
        for _ in 0..4 {
            cycle.step().unwrap();
        }
        assert!(matches!(cycle.step(), Err(TrainError::ScheduleExhausted(4))));
    }

    #[test]
    fn constant_never_moves() {
        let config = RunConfig { scheduler: SchedulerKind::Constant, lr: 3e-4, ..Default::default() };
        let mut schedule = LrSchedule::from_config(&config, 10).unwrap();
        for _ in 0..1000 {
            assert_eq!(schedule.step().unwrap(), 3e-4);
        }
        assert_eq!(schedule.total_steps(), None);
        assert_eq!(schedule.momentum(), None);
    }
}
