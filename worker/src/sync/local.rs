use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{
    error::{GroupErr, Result},
    group::RunGroup,
};

/// What one rank brings to a collective round.
#[derive(Debug, Clone, Copy)]
enum Contribution<'a> {
    Barrier { step: u64, stop: bool },
    Reduce(&'a [f32]),
    Agree(&'a str),
}

/// A collective round, folded as ranks arrive.
#[derive(Debug, Clone)]
enum Round {
    Barrier {
        step: u64,
        stop: bool,
        skew: Option<(usize, u64)>,
    },
    Reduce {
        sum: Vec<f32>,
        bad_len: Option<(usize, usize)>,
    },
    Agree {
        digest: String,
        mismatch: Option<(usize, String)>,
    },
    /// Ranks disagreed on which collective this is.
    Confused { rank: usize },
}

impl Round {
    fn first(contribution: Contribution<'_>) -> Self {
        match contribution {
            Contribution::Barrier { step, stop } => Self::Barrier {
                step,
                stop,
                skew: None,
            },
            Contribution::Reduce(buf) => Self::Reduce {
                sum: buf.to_vec(),
                bad_len: None,
            },
            Contribution::Agree(digest) => Self::Agree {
                digest: digest.to_string(),
                mismatch: None,
            },
        }
    }

    fn absorb(&mut self, rank: usize, contribution: Contribution<'_>) {
        match (self, contribution) {
            (
                Self::Barrier { step, stop, skew },
                Contribution::Barrier {
                    step: theirs,
                    stop: vote,
                },
            ) => {
                *stop |= vote;
                if theirs != *step && skew.is_none() {
                    *skew = Some((rank, theirs));
                }
            }
            (Self::Reduce { sum, bad_len }, Contribution::Reduce(buf)) => {
                if buf.len() == sum.len() {
                    sum.iter_mut().zip(buf).for_each(|(acc, g)| *acc += g);
                } else if bad_len.is_none() {
                    *bad_len = Some((rank, buf.len()));
                }
            }
            (Self::Agree { digest, mismatch }, Contribution::Agree(theirs)) => {
                if theirs != digest.as_str() && mismatch.is_none() {
                    *mismatch = Some((rank, theirs.to_string()));
                }
            }
            (Self::Confused { .. }, _) => {}
            (this, _) => *this = Self::Confused { rank },
        }
    }
}

#[derive(Debug, Default)]
struct State {
    generation: u64,
    arrived: usize,
    pending: Option<Round>,
    completed: Option<Round>,
    aborted: Option<(usize, String)>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

/// A run group of tasks inside one process.
///
/// Each collective is one round: ranks fold their contribution into the
/// pending round and the last one to arrive publishes it. A published round
/// stays readable until the next one completes, which needs every rank to
/// have arrived again.
#[derive(Debug, Clone)]
pub struct LocalGroup {
    rank: usize,
    world_size: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Creates one handle per rank.
    ///
    /// # Panics
    /// If `world_size` is zero.
    pub fn new(world_size: usize) -> Vec<LocalGroup> {
        assert!(world_size > 0, "world_size must be > 0");

        let shared = Arc::new(Shared::default());
        (0..world_size)
            .map(|rank| LocalGroup {
                rank,
                world_size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    /// The group of a process training alone.
    pub fn single() -> LocalGroup {
        LocalGroup {
            rank: 0,
            world_size: 1,
            shared: Arc::default(),
        }
    }

    fn aborted_err(aborted: &(usize, String)) -> GroupErr {
        GroupErr::Aborted {
            rank: aborted.0,
            reason: aborted.1.clone(),
        }
    }

    async fn round(&self, contribution: Contribution<'_>) -> Result<Round> {
        let generation = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            if let Some(aborted) = &state.aborted {
                return Err(Self::aborted_err(aborted));
            }

            if let Some(round) = state.pending.as_mut() {
                round.absorb(self.rank, contribution);
            } else {
                state.pending = Some(Round::first(contribution));
            }
            state.arrived += 1;

            if state.arrived == self.world_size {
                state.arrived = 0;
                state.generation += 1;
                state.completed = state.pending.take();
                self.shared.notify.notify_waiters();

                return state
                    .completed
                    .clone()
                    .ok_or_else(|| GroupErr::Protocol("round completed empty".into()));
            }

            state.generation
        };

        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.shared.state.lock();
                if let Some(aborted) = &state.aborted {
                    return Err(Self::aborted_err(aborted));
                }
                if state.generation != generation {
                    return state
                        .completed
                        .clone()
                        .ok_or_else(|| GroupErr::Protocol("round completed empty".into()));
                }
            }

            notified.await;
        }
    }
}

fn confused(rank: usize) -> GroupErr {
    GroupErr::Protocol(format!(
        "rank {rank} entered a different collective than its peers"
    ))
}

impl RunGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn barrier(&self, step: u64, stop: bool) -> Result<bool> {
        match self.round(Contribution::Barrier { step, stop }).await? {
            Round::Barrier {
                skew: Some((rank, got)),
                step: expected,
                ..
            } => Err(GroupErr::StepSkew {
                rank,
                expected,
                got,
            }),
            Round::Barrier { stop, .. } => {
                debug!(rank = self.rank; "barrier released at step {step}");
                Ok(stop)
            }
            Round::Confused { rank } => Err(confused(rank)),
            _ => Err(confused(self.rank)),
        }
    }

    async fn all_reduce_mean(&self, buf: &mut [f32]) -> Result<()> {
        match self.round(Contribution::Reduce(buf)).await? {
            Round::Reduce {
                bad_len: Some((rank, got)),
                sum,
            } => Err(GroupErr::Protocol(format!(
                "rank {rank} reduced {got} values, expected {}",
                sum.len()
            ))),
            Round::Reduce { sum, .. } => {
                let scale = 1. / self.world_size as f32;
                buf.iter_mut()
                    .zip(sum)
                    .for_each(|(out, total)| *out = total * scale);
                Ok(())
            }
            Round::Confused { rank } => Err(confused(rank)),
            _ => Err(confused(self.rank)),
        }
    }

    async fn agree(&self, digest: &str) -> Result<()> {
        match self.round(Contribution::Agree(digest)).await? {
            Round::Agree {
                mismatch: Some((rank, got)),
                digest: expected,
            } => Err(GroupErr::Mismatch {
                rank,
                expected,
                got,
            }),
            Round::Agree { .. } => Ok(()),
            Round::Confused { rank } => Err(confused(rank)),
            _ => Err(confused(self.rank)),
        }
    }

    async fn abort(&self, reason: &str) {
        {
            let mut state = self.shared.state.lock();
            if state.aborted.is_none() {
                state.aborted = Some((self.rank, reason.to_string()));
            }
        }

        self.shared.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::task::JoinSet;

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn all_reduce_averages_across_ranks() {
        let mut tasks = JoinSet::new();
        for group in LocalGroup::new(4) {
            tasks.spawn(async move {
                let r = group.rank() as f32;
                let mut last = Vec::new();
                for round in 0..20 {
                    let mut buf = vec![r, r * 2., round as f32];
                    group.all_reduce_mean(&mut buf).await.unwrap();
                    last = buf;
                }
                last
            });
        }

        while let Some(res) = tasks.join_next().await {
            assert_eq!(res.unwrap(), [1.5, 3.0, 19.0]);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn barrier_reports_any_stop_vote() {
        let mut tasks = JoinSet::new();
        for group in LocalGroup::new(3) {
            tasks.spawn(async move {
                let quiet = group.barrier(1, false).await.unwrap();
                let vote = group.barrier(2, group.rank() == 2).await.unwrap();
                (quiet, vote)
            });
        }

        while let Some(res) = tasks.join_next().await {
            assert_eq!(res.unwrap(), (false, true));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disagreement_fails_every_rank() {
        let mut tasks = JoinSet::new();
        for group in LocalGroup::new(3) {
            tasks.spawn(async move {
                let digest = if group.rank() == 1 { "b" } else { "a" };
                group.agree(digest).await
            });
        }

        while let Some(res) = tasks.join_next().await {
            assert!(matches!(
                res.unwrap(),
                Err(GroupErr::Mismatch { rank: 1, .. })
            ));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn abort_wakes_waiting_ranks() {
        let mut groups = LocalGroup::new(2);
        let failing = groups.pop().unwrap();
        let waiting = groups.pop().unwrap();

        let waiter = tokio::spawn(async move { waiting.barrier(1, false).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        failing.abort("disk on fire").await;

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, GroupErr::Aborted { rank: 1, .. }));
        assert!(failing.barrier(1, false).await.is_err());
    }

    #[tokio::test]
    async fn single_rank_group_is_trivial() {
        let group = LocalGroup::single();
        let mut buf = [1.0, 2.0];

        assert!(!group.barrier(1, false).await.unwrap());
        assert!(group.barrier(2, true).await.unwrap());
        group.all_reduce_mean(&mut buf).await.unwrap();
        group.agree("x").await.unwrap();
        assert_eq!(buf, [1.0, 2.0]);
    }
}
