use std::{collections::VecDeque, time::Duration};

/// Steps of loss history a run keeps.
pub const LOSS_WINDOW: usize = 256;

/// What one completed step looked like, as handed to the metrics sink.
#[derive(Debug, Clone, PartialEq)]
pub struct StepMetrics {
    pub step: u64,
    pub loss: f32,
    pub epoch: u64,
    pub rows_per_sec: f64,
    pub step_time: Duration,
    pub elapsed: Duration,
}

/// Time spent per phase over a whole run.
#[derive(Debug, Default, Clone)]
pub struct RunMetrics {
    pub fetch_time: Duration,
    pub compute_time: Duration,
    pub sync_time: Duration,
    pub checkpoint_time: Duration,

    pub steps: u64,
    pub rows: u64,
    /// `(step, loss)` of the last `LOSS_WINDOW` steps this process ran.
    losses: VecDeque<(u64, f32)>,
}

impl RunMetrics {
    #[inline]
    pub fn record_step(&mut self, step: u64, loss: f32, rows: usize) {
        self.steps += 1;
        self.rows += rows as u64;
        if self.losses.len() == LOSS_WINDOW {
            self.losses.pop_front();
        }
        self.losses.push_back((step, loss));
    }

    /// `(step, loss)` pairs still in the window, oldest first.
    pub fn losses(&self) -> &VecDeque<(u64, f32)> {
        &self.losses
    }

    /// Mean loss over the last `n` recorded steps, at most `LOSS_WINDOW`.
    pub fn recent_loss(&self, n: usize) -> Option<f32> {
        let n = n.min(self.losses.len());
        if n == 0 {
            return None;
        }

        let sum: f32 = self.losses.iter().rev().take(n).map(|(_, l)| l).sum();
        Some(sum / n as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_loss_averages_the_tail() {
        let mut m = RunMetrics::default();
        assert_eq!(m.recent_loss(3), None);

        for (step, loss) in [(1, 4.0), (2, 2.0), (3, 1.0)] {
            m.record_step(step, loss, 8);
        }

        assert_eq!(m.steps, 3);
        assert_eq!(m.rows, 24);
        assert_eq!(m.recent_loss(2), Some(1.5));
        assert_eq!(m.recent_loss(10), Some(7.0 / 3.0));
    }

    #[test]
    fn loss_history_stays_bounded() {
        let mut m = RunMetrics::default();
        for step in 1..=(LOSS_WINDOW as u64 * 3) {
            m.record_step(step, step as f32, 1);
        }

        assert_eq!(m.steps, LOSS_WINDOW as u64 * 3);
        assert_eq!(m.losses().len(), LOSS_WINDOW);
        assert_eq!(
            m.losses().front().map(|(s, _)| *s),
            Some(LOSS_WINDOW as u64 * 2 + 1)
        );
        assert_eq!(m.recent_loss(1), Some(LOSS_WINDOW as f32 * 3.0));
    }
}
