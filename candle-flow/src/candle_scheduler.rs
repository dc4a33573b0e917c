use crate::config::{LrSchedulerKind, TrainConfig};
use crate::error::invalid_config;

use std::f64::consts::PI;

const ONE_CYCLE_PCT_START: f64 = 0.3;
const ONE_CYCLE_DIV_FACTOR: f64 = 25.0;
const ONE_CYCLE_FINAL_DIV_FACTOR: f64 = 1e4;

/// cosine interpolation from `start` (pct = 0) to `end` (pct = 1)
fn cos_anneal(start: f64, end: f64, pct: f64) -> f64 {
    end + (start - end) / 2.0 * ((PI * pct).cos() + 1.0)
}

/// Learning-rate schedules; `step` returns the rate to use next
#[derive(Clone, Debug)]
pub enum LrScheduler {
    /// lr * factor^(epoch / decay_epochs), stepped per epoch
    Step {
        base_lr: f64,
        decay_epochs: usize,
        factor: f64,
        step: usize,
    },
    /// warm up to `max_lr`, then anneal, stepped per batch
    OneCycle {
        max_lr: f64,
        total_steps: usize,
        step: usize,
    },
    /// cosine decay to zero over `t_max` batches
    CosineAnnealing {
        base_lr: f64,
        t_max: usize,
        step: usize,
    },
}

impl LrScheduler {
    /// * `num_minibatch` - batches per epoch
    pub fn from_config(config: &TrainConfig, num_minibatch: usize) -> anyhow::Result<Option<Self>> {
        let total_steps = config.epochs * num_minibatch;
        Ok(match config.lr_scheduler {
            None => None,
            Some(LrSchedulerKind::Step) => {
                let (Some(decay_epochs), Some(factor)) =
                    (config.lr_decay_epochs, config.lr_decay_factor)
                else {
                    return Err(invalid_config(
                        "step scheduler needs lr_decay_epochs and lr_decay_factor",
                    ));
                };
                Some(LrScheduler::Step {
                    base_lr: config.lr,
                    decay_epochs: decay_epochs.max(1),
                    factor,
                    step: 0,
                })
            }
            Some(LrSchedulerKind::OneCycle) => Some(LrScheduler::OneCycle {
                max_lr: config.max_lr.unwrap_or(10.0 * config.lr),
                total_steps: total_steps.max(2),
                step: 0,
            }),
            Some(LrSchedulerKind::CosineAnnealing) => Some(LrScheduler::CosineAnnealing {
                base_lr: config.lr,
                t_max: total_steps.max(1),
                step: 0,
            }),
        })
    }

    /// stepped after every batch rather than every epoch
    pub fn is_per_batch(&self) -> bool {
        !matches!(self, LrScheduler::Step { .. })
    }

    pub fn position(&self) -> usize {
        match self {
            LrScheduler::Step { step, .. }
            | LrScheduler::OneCycle { step, .. }
            | LrScheduler::CosineAnnealing { step, .. } => *step,
        }
    }

    pub fn set_position(&mut self, position: usize) {
        match self {
            LrScheduler::Step { step, .. }
            | LrScheduler::OneCycle { step, .. }
            | LrScheduler::CosineAnnealing { step, .. } => *step = position,
        }
    }

    /// learning rate at the current position
    pub fn current_lr(&self) -> f64 {
        match *self {
            LrScheduler::Step {
                base_lr,
                decay_epochs,
                factor,
                step,
            } => base_lr * factor.powi((step / decay_epochs) as i32),
            LrScheduler::OneCycle {
                max_lr,
                total_steps,
                step,
            } => {
                let initial_lr = max_lr / ONE_CYCLE_DIV_FACTOR;
                let min_lr = initial_lr / ONE_CYCLE_FINAL_DIV_FACTOR;
                let warmup_end = (ONE_CYCLE_PCT_START * total_steps as f64 - 1.0).max(1.0);
                let last = (total_steps - 1) as f64;
                let s = (step as f64).min(last);
                if s <= warmup_end {
                    cos_anneal(initial_lr, max_lr, s / warmup_end)
                } else {
                    cos_anneal(max_lr, min_lr, (s - warmup_end) / (last - warmup_end).max(1.0))
                }
            }
            LrScheduler::CosineAnnealing {
                base_lr,
                t_max,
                step,
            } => cos_anneal(base_lr, 0.0, step.min(t_max) as f64 / t_max as f64),
        }
    }

    /// advance by one step and return the new learning rate
    pub fn step(&mut self) -> f64 {
        let next = self.position() + 1;
        self.set_position(next);
        self.current_lr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn config(kind: LrSchedulerKind) -> TrainConfig {
        TrainConfig {
            epochs: 10,
            lr: 1e-3,
            lr_scheduler: Some(kind),
            lr_decay_epochs: Some(3),
            lr_decay_factor: Some(0.5),
            ..Default::default()
        }
    }

    #[test]
    fn step_decay_per_epoch() -> anyhow::Result<()> {
        let mut sched = LrScheduler::from_config(&config(LrSchedulerKind::Step), 7)?
            .ok_or_else(|| anyhow::anyhow!("scheduler"))?;
        assert!(!sched.is_per_batch());
        let lrs: Vec<f64> = (0..6).map(|_| sched.step()).collect();
        assert_abs_diff_eq!(lrs[1], 1e-3);
        assert_abs_diff_eq!(lrs[2], 5e-4);
        assert_abs_diff_eq!(lrs[5], 2.5e-4);
        Ok(())
    }

    #[test]
    fn one_cycle_peaks_then_decays() -> anyhow::Result<()> {
        let mut sched = LrScheduler::from_config(&config(LrSchedulerKind::OneCycle), 10)?
            .ok_or_else(|| anyhow::anyhow!("scheduler"))?;
        assert_abs_diff_eq!(sched.current_lr(), 1e-2 / 25.0, epsilon = 1e-12);
        let lrs: Vec<f64> = (0..99).map(|_| sched.step()).collect();
        let peak = lrs.iter().cloned().fold(0.0, f64::max);
        assert_abs_diff_eq!(peak, 1e-2, epsilon = 1e-6);
        let last = *lrs.last().unwrap_or(&1.0);
        assert!(last < 1e-6, "final lr {}", last);
        Ok(())
    }

    #[test]
    fn cosine_reaches_zero() -> anyhow::Result<()> {
        let mut sched = LrScheduler::from_config(&config(LrSchedulerKind::CosineAnnealing), 5)?
            .ok_or_else(|| anyhow::anyhow!("scheduler"))?;
        assert!(sched.is_per_batch());
        let mut lr = sched.current_lr();
        assert_abs_diff_eq!(lr, 1e-3);
        for _ in 0..50 {
            let next = sched.step();
            assert!(next <= lr);
            lr = next;
        }
        assert_abs_diff_eq!(lr, 0.0, epsilon = 1e-12);
        Ok(())
    }
}
