use std::{error::Error, fmt, io};

/// The sync module's result type.
pub type Result<T> = std::result::Result<T, GroupErr>;

/// Run group failures. Any of them ends the run on every rank.
#[derive(Debug)]
pub enum GroupErr {
    /// A rank gave up and told the group why.
    Aborted { rank: usize, reason: String },
    /// Ranks resolved different starting states.
    Mismatch {
        rank: usize,
        expected: String,
        got: String,
    },
    /// A rank reached a barrier at a different step.
    StepSkew { rank: usize, expected: u64, got: u64 },
    /// A peer sent something out of turn.
    Protocol(String),
    Timeout(String),
    Io(io::Error),
}

impl fmt::Display for GroupErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aborted { rank, reason } => write!(f, "rank {rank} aborted the run: {reason}"),
            Self::Mismatch {
                rank,
                expected,
                got,
            } => write!(
                f,
                "rank {rank} resolved state {got}, rank 0 resolved {expected}"
            ),
            Self::StepSkew {
                rank,
                expected,
                got,
            } => write!(
                f,
                "rank {rank} reached the barrier at step {got}, expected {expected}"
            ),
            Self::Protocol(msg) => write!(f, "run group protocol violation: {msg}"),
            Self::Timeout(msg) => write!(f, "timed out {msg}"),
            Self::Io(e) => write!(f, "run group connection lost: {e}"),
        }
    }
}

impl Error for GroupErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for GroupErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}
