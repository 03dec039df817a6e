use std::{
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use tokio::task;
use tokio_util::sync::CancellationToken;

use crate::{
    checkpoint::{CheckpointHandle, CheckpointStore},
    config::RunConfig,
    data::{Cursor, Prefetcher, RankSlice, ShardSet, StreamReader},
    error::Result,
    hooks::Hooks,
    metrics::{RunMetrics, StepMetrics},
    model::Model,
    schedule::Schedule,
    state::TrainingState,
    sync::{GroupErr, RunGroup, is_writer},
};

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The step budget was reached.
    Budget,
    /// A rank voted to stop, on a signal or when its wall-clock budget ran out.
    Interrupted,
}

/// The outcome of a run on one rank.
#[derive(Debug)]
pub struct RunSummary {
    pub final_step: u64,
    pub cursor: Cursor,
    pub stop: StopReason,
    pub metrics: RunMetrics,
    /// The state after the last step, with the final weights.
    pub state: TrainingState,
    /// The newest checkpoint this rank committed, writers only.
    pub last_checkpoint: Option<CheckpointHandle>,
}

/// Drives one rank through the training steps of a run.
///
/// Every rank runs the same sequence of collectives: a gradient all-reduce
/// and a barrier per step, plus a post-save barrier whenever a checkpoint is
/// taken. A fatal error aborts the group so the other ranks unwind too.
pub struct TrainLoop<S, G, M> {
    config: RunConfig,
    store: Arc<S>,
    group: G,
    cancel: CancellationToken,
    hooks: Hooks<M>,
}

impl<S, G, M> TrainLoop<S, G, M>
where
    S: CheckpointStore + 'static,
    G: RunGroup,
    M: Model,
{
    /// # Arguments
    /// * `config` - The run configuration.
    /// * `store` - Where the writer rank commits checkpoints.
    /// * `group` - This rank's handle on the run group.
    /// * `cancel` - Cancelled to request a graceful stop at the next step boundary.
    pub fn new(config: RunConfig, store: Arc<S>, group: G, cancel: CancellationToken) -> Self {
        Self {
            config,
            store,
            group,
            cancel,
            hooks: Hooks::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: Hooks<M>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn group(&self) -> &G {
        &self.group
    }

    /// Trains `model` from `state` until the step budget or a stop vote.
    ///
    /// # Arguments
    /// * `model` - The model, already holding the weights of `state`.
    /// * `state` - Where the run starts.
    /// * `shards` - The training split.
    ///
    /// # Errors
    /// Any fatal failure, after telling the group about it.
    pub async fn run(
        mut self,
        model: M,
        state: TrainingState,
        shards: ShardSet,
    ) -> Result<RunSummary> {
        match self.drive(model, state, shards).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                error!(rank = self.group.rank(); "run failed: {e}");
                self.group.abort(&e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn drive(
        &mut self,
        mut model: M,
        mut state: TrainingState,
        shards: ShardSet,
    ) -> Result<RunSummary> {
        let rank = self.group.rank();
        let world_size = NonZeroUsize::new(self.group.world_size())
            .ok_or_else(|| GroupErr::Protocol("run group has no ranks".into()))?;
        let schedule = Schedule::new(&self.config, model.num_params());
        let global_rows = self.config.global_batch_rows();

        let mut metrics = RunMetrics::default();
        let mut last_checkpoint = None;

        if schedule.is_done(state.step) {
            info!(step = state.step; "step budget of {} already reached", schedule.budget);
            return Ok(summarize(model, state, StopReason::Budget, metrics, None));
        }

        // Startup is a step boundary too, a stop requested before it trains nothing.
        if self.group.barrier(state.step, self.cancel.is_cancelled()).await? {
            info!(rank = rank, step = state.step; "stop requested before the first step");
            return Ok(summarize(model, state, StopReason::Interrupted, metrics, None));
        }

        let reader = StreamReader::new(
            shards,
            state.cursor,
            self.config.device_batch_size,
            RankSlice::new(rank, world_size),
        )?;
        let mut batches = Prefetcher::spawn(reader, self.config.prefetch_depth);

        let wall_budget = self.config.max_wall_secs.map(Duration::from_secs);
        let started = Instant::now();
        info!(
            rank = rank,
            step = state.step;
            "training to step {} from {}", schedule.budget, state.cursor
        );

        let stop = loop {
            let step_started = Instant::now();
            let batch = batches.next().await?;
            metrics.fetch_time += step_started.elapsed();

            let t = Instant::now();
            let mut rng = state.rng.for_step(state.step, rank);
            let (returned, batch, loss) = task::spawn_blocking(move || {
                let loss = model.forward_backward(&batch, &mut rng);
                (model, batch, loss)
            })
            .await?;
            model = returned;
            let loss = loss?;
            metrics.compute_time += t.elapsed();

            let t = Instant::now();
            self.group.all_reduce_mean(model.grads_mut()).await?;
            metrics.sync_time += t.elapsed();

            let t = Instant::now();
            model.apply_update()?;
            metrics.compute_time += t.elapsed();

            state.cursor = batch.end;
            state.step += 1;
            let step = state.step;
            metrics.record_step(step, loss, batch.rows.len());

            let step_time = step_started.elapsed();
            self.hooks.metrics.emit(&StepMetrics {
                step,
                loss,
                epoch: state.cursor.epoch,
                rows_per_sec: global_rows as f64 / step_time.as_secs_f64().max(1e-9),
                step_time,
                elapsed: started.elapsed(),
            });

            let vote = self.cancel.is_cancelled()
                || wall_budget.is_some_and(|budget| started.elapsed() >= budget);
            if vote {
                info!(rank = rank, step = step; "voting to stop");
            }

            let t = Instant::now();
            let stop_any = self.group.barrier(step, vote).await?;
            metrics.sync_time += t.elapsed();
            debug!(rank = rank, step = step; "step complete, loss {loss:.4}");

            model = self.run_hooks(model, &state, &schedule).await?;

            let done = schedule.is_done(step);
            if schedule.should_save(step) || stop_any || done {
                let t = Instant::now();
                let frozen = is_writer(&self.group).then(|| snapshot(&model, &state));
                if let Some(handle) = self.commit(frozen, step).await? {
                    last_checkpoint = Some(handle);
                }
                metrics.checkpoint_time += t.elapsed();
            }

            if stop_any {
                break StopReason::Interrupted;
            }
            if done {
                break StopReason::Budget;
            }
        };

        info!(
            rank = rank,
            step = state.step;
            "run stopped ({stop:?}) after {} step(s) in {:.1?}, fetch {:.1?}, compute {:.1?}, sync {:.1?}, checkpoint {:.1?}",
            metrics.steps,
            started.elapsed(),
            metrics.fetch_time,
            metrics.compute_time,
            metrics.sync_time,
            metrics.checkpoint_time
        );

        Ok(summarize(model, state, stop, metrics, last_checkpoint))
    }

    /// Runs the hooks due at this step. Their failures are only logged.
    ///
    /// Evaluation reads validation shards, so it runs on the blocking pool
    /// and hands the model back when done.
    async fn run_hooks(
        &mut self,
        mut model: M,
        state: &TrainingState,
        schedule: &Schedule,
    ) -> Result<M> {
        let step = state.step;

        if schedule.should_eval(step)
            && let Some(mut hook) = self.hooks.eval.take()
        {
            let (returned, hook, res) = task::spawn_blocking(move || {
                let res = hook.evaluate(&model, step);
                (model, hook, res)
            })
            .await?;
            model = returned;
            self.hooks.eval = Some(hook);

            if let Err(e) = res {
                warn!(step = step; "evaluation failed: {e}");
            }
        }

        if schedule.should_sample(step)
            && let Some(hook) = self.hooks.sample.as_mut()
        {
            let mut rng = state.rng.for_step(step, self.group.rank());
            if let Err(e) = hook.sample(&model, step, &mut rng) {
                warn!(step = step; "sampling failed: {e}");
            }
        }

        Ok(model)
    }

    /// Saves `snapshot` when given one, then waits for every rank.
    ///
    /// Nobody leaves the post-save barrier before the writer's commit is
    /// durable, so no rank runs ahead of an unconfirmed checkpoint.
    async fn commit(
        &mut self,
        snapshot: Option<TrainingState>,
        step: u64,
    ) -> Result<Option<CheckpointHandle>> {
        let handle = match snapshot {
            Some(snapshot) => {
                let store = Arc::clone(&self.store);
                let keep_last = self.config.keep_last;

                let handle = task::spawn_blocking(move || -> Result<CheckpointHandle> {
                    let handle = store.save(&snapshot)?;
                    if let Some(keep) = keep_last {
                        store.prune(keep)?;
                    }
                    Ok(handle)
                })
                .await??;
                Some(handle)
            }
            None => None,
        };

        self.group.barrier(step, false).await?;
        debug!(rank = self.group.rank(), step = step; "post-save barrier released");
        Ok(handle)
    }
}

fn snapshot<M: Model>(model: &M, state: &TrainingState) -> TrainingState {
    let (weights, optimizer) = model.state();
    TrainingState {
        step: state.step,
        cursor: state.cursor,
        model: weights,
        optimizer,
        rng: state.rng,
        config: state.config.clone(),
    }
}

fn summarize<M: Model>(
    model: M,
    state: TrainingState,
    stop: StopReason,
    metrics: RunMetrics,
    last_checkpoint: Option<CheckpointHandle>,
) -> RunSummary {
    let state = snapshot(&model, &state);
    RunSummary {
        final_step: state.step,
        cursor: state.cursor,
        stop,
        metrics,
        state,
        last_checkpoint,
    }
}
