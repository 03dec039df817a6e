use std::{env, path::PathBuf};

use crate::error::OrchestratorError;

const DEFAULT_WORKER_BIN: &str = "worker";
const DEFAULT_MASTER_ADDR: &str = "127.0.0.1:29500";

/// How to start the run group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    /// The worker executable, started once per rank.
    pub worker_bin: PathBuf,
    /// Arguments passed to every worker.
    pub args: Vec<String>,
    pub world_size: usize,
    /// Where rank 0 listens for its peers.
    pub master_addr: String,
    /// Extra variables for every worker, on top of the inherited environment.
    pub env: Vec<(String, String)>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            worker_bin: PathBuf::from(DEFAULT_WORKER_BIN),
            args: Vec::new(),
            world_size: 1,
            master_addr: DEFAULT_MASTER_ADDR.into(),
            env: Vec::new(),
        }
    }
}

impl LaunchConfig {
    /// Reads `ORCHESTRA_WORKER_BIN`, `WORLD_SIZE` and `MASTER_ADDR`.
    ///
    /// Without `ORCHESTRA_WORKER_BIN` the `worker` binary next to the current
    /// executable is used. The workers inherit the rest of the environment,
    /// so every `ORCHESTRA_*` setting reaches them unchanged.
    pub fn from_env() -> Result<Self, OrchestratorError> {
        let mut cfg = Self::default();

        match env::var("ORCHESTRA_WORKER_BIN") {
            Ok(bin) => cfg.worker_bin = PathBuf::from(bin),
            Err(_) => {
                if let Some(dir) = env::current_exe()?.parent() {
                    cfg.worker_bin = dir.join(DEFAULT_WORKER_BIN);
                }
            }
        }

        if let Ok(world_size) = env::var("WORLD_SIZE") {
            cfg.world_size = world_size.trim().parse().map_err(|e| {
                OrchestratorError::InvalidConfig(format!("WORLD_SIZE={world_size:?}: {e}"))
            })?;
        }
        if let Ok(addr) = env::var("MASTER_ADDR") {
            cfg.master_addr = addr;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.world_size == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "world size must be at least 1".into(),
            ));
        }
        if self.master_addr.is_empty() {
            return Err(OrchestratorError::InvalidConfig(
                "master address must not be empty".into(),
            ));
        }

        Ok(())
    }
}
