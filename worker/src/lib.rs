//! One rank of a resumable data-parallel training run.
//!
//! Each process streams its slice of a sharded corpus, trains, averages
//! gradients with its peers and stops at the same step boundary as every
//! other rank. The lowest rank commits checkpoints that any rank can resume
//! from.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod hooks;
pub mod loop_;
pub mod metrics;
pub mod model;
pub mod resume;
pub mod run;
pub mod schedule;
pub mod state;
pub mod sync;

pub use config::RunConfig;
pub use error::{Result, WorkerErr};
pub use loop_::{RunSummary, StopReason, TrainLoop};
pub use run::run_rank;
