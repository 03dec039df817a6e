//! Launches the fixed-size group of worker processes of a training run and
//! tears the whole group down when one rank fails.

pub mod config;
pub mod error;
mod session;

pub use config::LaunchConfig;
pub use error::OrchestratorError;
pub use session::Session;

/// Starts one worker process per rank and returns the running session.
///
/// # Errors
/// Returns an `OrchestratorError` if the config is invalid or a worker can't
/// be spawned.
pub fn launch(cfg: &LaunchConfig) -> Result<Session, OrchestratorError> {
    log::info!(
        "launching {} rank(s) of {} with rank 0 at {}",
        cfg.world_size,
        cfg.worker_bin.display(),
        cfg.master_addr
    );
    Session::spawn(cfg)
}
