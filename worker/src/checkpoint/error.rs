use std::{error::Error, fmt, io, path::PathBuf};

/// The checkpoint module's result type.
pub type Result<T> = std::result::Result<T, CheckpointErr>;

/// A checkpoint candidate passed over while resolving the latest step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub step: u64,
    pub reason: String,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {}: {}", self.step, self.reason)
    }
}

#[derive(Debug)]
pub enum CheckpointErr {
    /// No step qualified; `rejected` explains every candidate that was seen.
    NoCheckpoint {
        dir: PathBuf,
        rejected: Vec<Rejection>,
    },
    /// The checkpoint belongs to a different model architecture.
    ConfigMismatch {
        step: u64,
        expected: String,
        found: String,
    },
    /// The step is incomplete or its artifacts disagree with the metadata.
    Corrupt { step: u64, reason: String },
    Io { path: PathBuf, source: io::Error },
    Json(serde_json::Error),
    Tensor(String),
}

impl CheckpointErr {
    pub(crate) fn corrupt(step: u64, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            step,
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}

impl fmt::Display for CheckpointErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCheckpoint { dir, rejected } => {
                write!(f, "no usable checkpoint in {}", dir.display())?;
                if !rejected.is_empty() {
                    let reasons: Vec<String> = rejected.iter().map(|r| r.to_string()).collect();
                    write!(f, " (rejected {})", reasons.join("; "))?;
                }
                Ok(())
            }
            Self::ConfigMismatch {
                step,
                expected,
                found,
            } => write!(
                f,
                "checkpoint at step {step} was written for model config {found}, this run is {expected}"
            ),
            Self::Corrupt { step, reason } => write!(f, "checkpoint at step {step} is unusable: {reason}"),
            Self::Io { path, source } => write!(f, "checkpoint io on {}: {source}", path.display()),
            Self::Json(e) => write!(f, "checkpoint metadata: {e}"),
            Self::Tensor(e) => write!(f, "tensor encoding: {e}"),
        }
    }
}

impl Error for CheckpointErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CheckpointErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}
