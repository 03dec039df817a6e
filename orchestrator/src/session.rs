use std::process::ExitStatus;

use log::{debug, info, warn};
use tokio::{
    process::{Child, Command},
    runtime::Runtime,
    signal,
    task::JoinSet,
};

use crate::{config::LaunchConfig, error::OrchestratorError};

/// Represents a running group of worker processes.
///
/// Dropping the session kills every worker that is still alive.
pub struct Session {
    runtime: Runtime,
    workers: Vec<(usize, Child)>,
}

impl Session {
    /// Spawns one worker per rank.
    ///
    /// # Arguments
    /// * `cfg` - A validated launch configuration.
    ///
    /// # Returns
    /// A new `Session` instance.
    pub fn spawn(cfg: &LaunchConfig) -> Result<Self, OrchestratorError> {
        cfg.validate()?;
        let runtime = Runtime::new()?;

        let mut workers = Vec::with_capacity(cfg.world_size);
        for rank in 0..cfg.world_size {
            // Process creation registers with the runtime's reaper.
            let _guard = runtime.enter();
            let child = Command::new(&cfg.worker_bin)
                .args(&cfg.args)
                .envs(cfg.env.iter().map(|(k, v)| (k, v)))
                .env("RANK", rank.to_string())
                .env("WORLD_SIZE", cfg.world_size.to_string())
                .env("MASTER_ADDR", &cfg.master_addr)
                .kill_on_drop(true)
                .spawn()
                .map_err(|source| OrchestratorError::SpawnFailed { rank, source })?;

            debug!(rank = rank; "spawned {} as pid {:?}", cfg.worker_bin.display(), child.id());
            workers.push((rank, child));
        }

        info!("launched {} rank(s)", cfg.world_size);
        Ok(Self { runtime, workers })
    }

    /// The number of ranks in the group.
    pub fn world_size(&self) -> usize {
        self.workers.len()
    }

    /// Waits until every worker exited.
    ///
    /// An interrupt reaches the workers directly from the terminal, so the
    /// session keeps waiting for them to checkpoint and exit.
    ///
    /// # Errors
    /// `WorkerFailed` for the first rank that exits unsuccessfully; the other
    /// ranks are killed before returning.
    pub fn wait(self) -> Result<(), OrchestratorError> {
        let Self { runtime, workers } = self;

        runtime.block_on(async move {
            let mut running = JoinSet::new();
            for (rank, mut child) in workers {
                running.spawn(async move { (rank, child.wait().await) });
            }

            loop {
                tokio::select! {
                    joined = running.join_next() => {
                        let Some(joined) = joined else {
                            info!("all ranks finished");
                            return Ok(());
                        };

                        let (rank, status) = joined.map_err(|e| OrchestratorError::Io(e.into()))?;
                        check(rank, status?)?;
                    }
                    res = signal::ctrl_c() => {
                        res?;
                        warn!("interrupt received, waiting for the ranks to stop");
                    }
                }
            }
        })
    }
}

fn check(rank: usize, status: ExitStatus) -> Result<(), OrchestratorError> {
    if status.success() {
        info!(rank = rank; "rank exited cleanly");
        return Ok(());
    }

    warn!(rank = rank; "rank failed with {status}, stopping the group");
    Err(OrchestratorError::WorkerFailed {
        rank,
        code: status.code(),
    })
}
