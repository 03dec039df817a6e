mod common;

use std::{
    net::TcpListener,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use worker::{
    RunConfig, TrainLoop, WorkerErr,
    checkpoint::{CheckpointHandle, CheckpointStore, MemoryStore, StepSelector},
    data::{ShardCatalog, Split},
    hooks::{Hooks, MetricsSink},
    metrics::StepMetrics,
    model::{BigramModel, Model},
    run_rank,
    state::TrainingState,
    sync::{GroupErr, LocalGroup, NetGroup, RunGroup},
};

/// A store whose commits take a while to become visible.
struct SlowStore {
    inner: MemoryStore,
    delay: Duration,
    committed: AtomicU64,
}

impl CheckpointStore for SlowStore {
    fn save(&self, state: &TrainingState) -> worker::checkpoint::Result<CheckpointHandle> {
        thread::sleep(self.delay);
        let handle = self.inner.save(state)?;
        self.committed.store(state.step, Ordering::SeqCst);
        Ok(handle)
    }

    fn load(
        &self,
        selector: StepSelector,
        config: &RunConfig,
    ) -> worker::checkpoint::Result<TrainingState> {
        self.inner.load(selector, config)
    }

    fn steps(&self) -> worker::checkpoint::Result<Vec<u64>> {
        self.inner.steps()
    }

    fn prune(&self, keep_last: usize) -> worker::checkpoint::Result<Vec<u64>> {
        self.inner.prune(keep_last)
    }
}

/// Records, for every step a reader rank starts, the newest committed checkpoint.
struct CommitWatch {
    store: Arc<SlowStore>,
    seen: Arc<Mutex<Vec<(u64, u64)>>>,
}

impl MetricsSink for CommitWatch {
    fn emit(&mut self, m: &StepMetrics) {
        let committed = self.store.committed.load(Ordering::SeqCst);
        self.seen.lock().push((m.step, committed));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn no_rank_runs_ahead_of_an_inflight_checkpoint() {
    let data = tempfile::tempdir().unwrap();
    common::corpus(data.path(), 1, 30);
    let train = ShardCatalog::open(data.path())
        .unwrap()
        .split(Split::Train)
        .unwrap();

    let cfg = RunConfig {
        world_size: 2,
        save_every: 3,
        eval_every: 0,
        sample_every: 0,
        ..common::config(data.path(), data.path(), 9)
    };
    let store = Arc::new(SlowStore {
        inner: MemoryStore::new(),
        delay: Duration::from_millis(150),
        committed: AtomicU64::new(0),
    });
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut tasks = JoinSet::new();
    for group in LocalGroup::new(2) {
        let cfg = RunConfig {
            rank: group.rank(),
            ..cfg.clone()
        };
        let store = Arc::clone(&store);
        let train = train.clone();
        let mut hooks: Hooks<BigramModel> = Hooks::default();
        if group.rank() == 1 {
            hooks.metrics = Box::new(CommitWatch {
                store: Arc::clone(&store),
                seen: Arc::clone(&seen),
            });
        }

        tasks.spawn(async move {
            let model = BigramModel::new(&cfg.shape, cfg.learning_rate, cfg.seed).unwrap();
            let (weights, optimizer) = model.state();
            let state = TrainingState::fresh(cfg.clone(), weights, optimizer);

            TrainLoop::new(cfg, store, group, CancellationToken::new())
                .with_hooks(hooks)
                .run(model, state, train)
                .await
                .unwrap()
        });
    }
    while let Some(res) = tasks.join_next().await {
        assert_eq!(res.unwrap().final_step, 9);
    }

    let seen = seen.lock().clone();
    assert_eq!(seen.len(), 9);
    for (step, committed) in seen {
        // The step after a save may only start once that save is visible.
        let last_save = (step - 1) / 3 * 3;
        assert!(
            committed >= last_save,
            "rank 1 finished step {step} while checkpoint {last_save} was in flight"
        );
    }
    assert_eq!(store.steps().unwrap(), [3, 6, 9]);
}

#[tokio::test(flavor = "multi_thread")]
async fn two_processes_train_in_lockstep_over_tcp() {
    let data = tempfile::tempdir().unwrap();
    common::corpus(data.path(), 2, 11);
    let ckpt = tempfile::tempdir().unwrap();

    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    };

    let mut tasks = JoinSet::new();
    for rank in 0..2 {
        let cfg = RunConfig {
            rank,
            world_size: 2,
            master_addr: addr.clone(),
            ..common::config(data.path(), ckpt.path(), 30)
        };
        tasks.spawn(async move {
            let group = NetGroup::connect(rank, 2, &cfg.master_addr, Duration::from_secs(10))
                .await
                .unwrap();
            run_rank(cfg, group, CancellationToken::new()).await.unwrap()
        });
    }

    let mut finals = Vec::new();
    while let Some(res) = tasks.join_next().await {
        let summary = res.unwrap();
        assert_eq!(summary.final_step, 30);
        finals.push((summary.cursor, summary.state.model));
    }

    assert_eq!(finals[0], finals[1]);

    let store = worker::checkpoint::FsCheckpointStore::new(ckpt.path());
    assert_eq!(store.steps().unwrap(), [30]);
}

#[tokio::test(flavor = "multi_thread")]
async fn a_failing_rank_takes_the_group_down() {
    let data = tempfile::tempdir().unwrap();
    common::corpus(data.path(), 1, 10);
    let ckpt = tempfile::tempdir().unwrap();

    let mut tasks = JoinSet::new();
    for group in LocalGroup::new(2) {
        let mut cfg = RunConfig {
            rank: group.rank(),
            world_size: 2,
            ..common::config(data.path(), ckpt.path(), 10)
        };
        if group.rank() == 1 {
            cfg.data_dir = data.path().join("missing");
        }
        tasks.spawn(async move { run_rank(cfg, group, CancellationToken::new()).await });
    }

    while let Some(res) = tasks.join_next().await {
        assert!(res.unwrap().is_err());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn ranks_with_different_batch_sizes_refuse_to_start() {
    let data = tempfile::tempdir().unwrap();
    common::corpus(data.path(), 1, 10);
    let ckpt = tempfile::tempdir().unwrap();

    let mut tasks = JoinSet::new();
    for group in LocalGroup::new(2) {
        let mut cfg = RunConfig {
            rank: group.rank(),
            world_size: 2,
            ..common::config(data.path(), ckpt.path(), 10)
        };
        if group.rank() == 1 {
            cfg.device_batch_size = 3;
        }
        tasks.spawn(async move { run_rank(cfg, group, CancellationToken::new()).await });
    }

    while let Some(res) = tasks.join_next().await {
        let err = res.unwrap().unwrap_err();
        assert!(
            matches!(err, WorkerErr::Group(GroupErr::Mismatch { rank: 1, .. })),
            "{err}"
        );
    }
    assert!(
        worker::checkpoint::FsCheckpointStore::new(ckpt.path())
            .steps()
            .unwrap()
            .is_empty()
    );
}
