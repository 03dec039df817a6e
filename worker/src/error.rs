use std::{error::Error, fmt, io};

use tokio::task::JoinError;

use crate::{
    checkpoint::CheckpointErr,
    config::ConfigErr,
    data::{CatalogErr, ShardReadErr},
    model::ModelErr,
    sync::GroupErr,
};

/// The worker crate's result type.
pub type Result<T> = std::result::Result<T, WorkerErr>;

/// Failures that end a rank's run, and with it the whole group's.
#[derive(Debug)]
pub enum WorkerErr {
    Config(ConfigErr),
    Catalog(CatalogErr),
    ShardRead(ShardReadErr),
    Checkpoint(CheckpointErr),
    Model(ModelErr),
    Group(GroupErr),
    Io(io::Error),
    /// A blocking task panicked or was cancelled.
    Join(String),
}

impl fmt::Display for WorkerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerErr::Config(e) => write!(f, "config error: {e}"),
            WorkerErr::Catalog(e) => write!(f, "catalog error: {e}"),
            WorkerErr::ShardRead(e) => write!(f, "data error: {e}"),
            WorkerErr::Checkpoint(e) => write!(f, "checkpoint error: {e}"),
            WorkerErr::Model(e) => write!(f, "model error: {e}"),
            WorkerErr::Group(e) => write!(f, "run group error: {e}"),
            WorkerErr::Io(e) => write!(f, "io error: {e}"),
            WorkerErr::Join(e) => write!(f, "task failed: {e}"),
        }
    }
}

impl Error for WorkerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WorkerErr::Config(e) => Some(e),
            WorkerErr::Catalog(e) => Some(e),
            WorkerErr::ShardRead(e) => Some(e),
            WorkerErr::Checkpoint(e) => Some(e),
            WorkerErr::Model(e) => Some(e),
            WorkerErr::Group(e) => Some(e),
            WorkerErr::Io(e) => Some(e),
            WorkerErr::Join(_) => None,
        }
    }
}

impl From<ConfigErr> for WorkerErr {
    fn from(value: ConfigErr) -> Self {
        Self::Config(value)
    }
}

impl From<CatalogErr> for WorkerErr {
    fn from(value: CatalogErr) -> Self {
        Self::Catalog(value)
    }
}

impl From<ShardReadErr> for WorkerErr {
    fn from(value: ShardReadErr) -> Self {
        Self::ShardRead(value)
    }
}

impl From<CheckpointErr> for WorkerErr {
    fn from(value: CheckpointErr) -> Self {
        Self::Checkpoint(value)
    }
}

impl From<ModelErr> for WorkerErr {
    fn from(value: ModelErr) -> Self {
        Self::Model(value)
    }
}

impl From<GroupErr> for WorkerErr {
    fn from(value: GroupErr) -> Self {
        Self::Group(value)
    }
}

impl From<io::Error> for WorkerErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<JoinError> for WorkerErr {
    fn from(value: JoinError) -> Self {
        Self::Join(value.to_string())
    }
}

impl From<WorkerErr> for io::Error {
    fn from(value: WorkerErr) -> Self {
        match value {
            WorkerErr::Io(e) => e,
            other => io::Error::other(other.to_string()),
        }
    }
}
