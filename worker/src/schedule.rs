use crate::config::RunConfig;

/// Decides when a step triggers evaluation, sampling or a checkpoint, and how
/// many steps the run takes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub eval_every: u64,
    pub sample_every: u64,
    pub save_every: u64,
    pub budget: u64,
}

impl Schedule {
    /// # Arguments
    /// * `cfg` - The run configuration.
    /// * `num_params` - Trainable parameters of the model.
    pub fn new(cfg: &RunConfig, num_params: usize) -> Self {
        Self {
            eval_every: cfg.eval_every,
            sample_every: cfg.sample_every,
            save_every: cfg.save_every,
            budget: Self::step_budget(cfg, num_params),
        }
    }

    /// Total optimizer steps for the run.
    ///
    /// An explicit iteration count wins; otherwise the budget is the number of
    /// steps needed to see `target_param_data_ratio` tokens per parameter.
    pub fn step_budget(cfg: &RunConfig, num_params: usize) -> u64 {
        if let Some(n) = cfg.num_iterations {
            return n;
        }

        let tokens_per_step = cfg.global_batch_rows() as f64 * cfg.shape.seq_len as f64;
        let target_tokens = cfg.target_param_data_ratio * num_params as f64;
        ((target_tokens / tokens_per_step).ceil() as u64).max(1)
    }

    #[inline]
    pub fn should_eval(&self, step: u64) -> bool {
        every(self.eval_every, step)
    }

    #[inline]
    pub fn should_sample(&self, step: u64) -> bool {
        every(self.sample_every, step)
    }

    #[inline]
    pub fn should_save(&self, step: u64) -> bool {
        every(self.save_every, step)
    }

    #[inline]
    pub fn is_done(&self, step: u64) -> bool {
        step >= self.budget
    }
}

#[inline]
fn every(interval: u64, step: u64) -> bool {
    interval > 0 && step % interval == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervals_fire_on_multiples_and_zero_disables() {
        let cfg = RunConfig {
            eval_every: 3,
            sample_every: 0,
            save_every: 5,
            num_iterations: Some(10),
            ..RunConfig::default()
        };
        let s = Schedule::new(&cfg, 1);

        assert!(!s.should_eval(2));
        assert!(s.should_eval(3));
        assert!(s.should_eval(6));
        assert!(!s.should_sample(6));
        assert!(s.should_save(10));
        assert!(!s.is_done(9));
        assert!(s.is_done(10));
    }

    #[test]
    fn budget_follows_the_param_data_ratio() {
        let mut cfg = RunConfig {
            world_size: 2,
            device_batch_size: 4,
            target_param_data_ratio: 20.0,
            ..RunConfig::default()
        };
        cfg.shape.seq_len = 128;

        // 20 * 10_000 tokens over 1024 tokens per step.
        assert_eq!(Schedule::step_budget(&cfg, 10_000), 196);

        cfg.num_iterations = Some(7);
        assert_eq!(Schedule::step_budget(&cfg, 10_000), 7);
    }
}
