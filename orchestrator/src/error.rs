use std::{fmt, io};

/// All errors that can occur in the orchestrator.
#[derive(Debug)]
pub enum OrchestratorError {
    /// Invalid configuration, caught before anything is spawned.
    InvalidConfig(String),
    /// A worker process couldn't be started.
    SpawnFailed { rank: usize, source: io::Error },
    /// A worker exited unsuccessfully; the rest of the group was killed.
    WorkerFailed { rank: usize, code: Option<i32> },
    /// An underlying I/O error not covered by the above variants.
    Io(io::Error),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Self::SpawnFailed { rank, source } => {
                write!(f, "failed to spawn rank {rank}: {source}")
            }
            Self::WorkerFailed {
                rank,
                code: Some(code),
            } => write!(f, "rank {rank} exited with code {code}"),
            Self::WorkerFailed { rank, code: None } => {
                write!(f, "rank {rank} was killed by a signal")
            }
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for OrchestratorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SpawnFailed { source, .. } => Some(source),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for OrchestratorError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
