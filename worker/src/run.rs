use std::sync::Arc;

use log::{info, warn};
use tokio::task;
use tokio_util::sync::CancellationToken;

use crate::{
    checkpoint::FsCheckpointStore,
    config::RunConfig,
    data::{ShardCatalog, ShardSet, Split},
    error::Result,
    hooks::{GreedySampler, Hooks, ValLoss},
    loop_::{RunSummary, TrainLoop},
    model::{BigramModel, Model},
    resume::{Resolution, ResumeCoordinator},
    state::TrainingState,
    sync::{RunGroup, is_writer},
};

/// Everything a rank resolves before its first step.
struct Prepared {
    model: BigramModel,
    state: TrainingState,
    resumed: bool,
    train: ShardSet,
    val: ShardSet,
    store: Arc<FsCheckpointStore>,
}

/// Runs this process' rank of the group from start to finish.
///
/// Opens the data, builds the model, resolves whether to resume, checks that
/// every rank starts from the same state and trains.
///
/// # Arguments
/// * `cfg` - The validated run configuration.
/// * `group` - This rank's handle on the run group.
/// * `cancel` - Cancelled on an external stop request.
///
/// # Errors
/// Any fatal failure; the group is aborted first so the other ranks stop too.
pub async fn run_rank<G: RunGroup>(
    cfg: RunConfig,
    group: G,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    let setup = cfg.clone();
    let prepared = match task::spawn_blocking(move || prepare(setup)).await {
        Ok(prepared) => prepared,
        Err(e) => Err(e.into()),
    };

    let prepared = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            group.abort(&e.to_string()).await;
            return Err(e);
        }
    };

    let digest = prepared.state.digest();
    if let Err(e) = group.agree(&digest).await {
        group.abort(&e.to_string()).await;
        return Err(e.into());
    }
    info!(
        rank = group.rank(),
        step = prepared.state.step;
        "{} run agreed on state {}",
        if prepared.resumed { "resumed" } else { "fresh" },
        &digest[..12]
    );

    let mut hooks: Hooks<BigramModel> = Hooks::default();
    if is_writer(&group) {
        hooks.eval = Some(Box::new(ValLoss::new(prepared.val, cfg.eval_rows)));
        hooks.sample = Some(Box::new(GreedySampler::default()));
    }

    TrainLoop::new(cfg, prepared.store, group, cancel)
        .with_hooks(hooks)
        .run(prepared.model, prepared.state, prepared.train)
        .await
}

fn prepare(cfg: RunConfig) -> Result<Prepared> {
    let catalog = ShardCatalog::open(&cfg.data_dir)?;
    let info = catalog.info()?;
    info!(
        shards = info.shard_count,
        rows = info.total_rows;
        "corpus of {} bytes",
        info.total_bytes
    );
    let train = catalog.split(Split::Train)?;
    let val = catalog.split(Split::Val)?;

    let mut model = BigramModel::new(&cfg.shape, cfg.learning_rate, cfg.seed)?
        .with_memory_budget(cfg.device_memory_bytes)?;
    let store = Arc::new(FsCheckpointStore::new(&cfg.checkpoint_dir));

    let resolution = ResumeCoordinator::resolve(store.as_ref(), &cfg, || {
        let (weights, optimizer) = model.state();
        TrainingState::fresh(cfg.clone(), weights, optimizer)
    })?;

    let resumed = resolution.is_resumed();
    let mut state = match resolution {
        Resolution::Fresh(state) => state,
        Resolution::Resumed(state) => {
            model.load_state(&state.model, &state.optimizer)?;
            state
        }
    };

    if state.rng.seed != cfg.seed {
        warn!(
            "seed {} differs from the checkpoint's {}, continuing with the checkpoint's",
            cfg.seed, state.rng.seed
        );
    }
    // Same architecture guaranteed by the hash; the rest follows this run.
    state.config = cfg;

    Ok(Prepared {
        model,
        state,
        resumed,
        train,
        val,
        store,
    })
}
