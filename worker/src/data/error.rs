use std::{error::Error, fmt, io, path::PathBuf};

use super::cursor::Cursor;

/// Shard catalog failures. All of them stop the run.
#[derive(Debug)]
pub enum CatalogErr {
    /// The data directory holds no shards.
    Empty { dir: PathBuf },
    /// A shard's actual row count disagrees with the catalog.
    RowCountMismatch {
        shard: usize,
        declared: u64,
        actual: u64,
    },
    /// A shard file or the sidecar is structurally invalid.
    Malformed { path: PathBuf, reason: String },
    Io { path: PathBuf, source: io::Error },
}

impl fmt::Display for CatalogErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty { dir } => write!(f, "no shards found in {}", dir.display()),
            Self::RowCountMismatch {
                shard,
                declared,
                actual,
            } => write!(
                f,
                "shard {shard} declares {declared} rows but holds {actual}"
            ),
            Self::Malformed { path, reason } => {
                write!(f, "malformed shard data {}: {reason}", path.display())
            }
            Self::Io { path, source } => write!(f, "failed to read {}: {source}", path.display()),
        }
    }
}

impl Error for CatalogErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Stream reader failures. All of them stop the run; shards are never skipped.
#[derive(Debug)]
pub enum ShardReadErr {
    /// A shard listed in the catalog can't be found.
    Missing { shard: usize, path: PathBuf },
    /// The resume cursor doesn't point inside the catalog.
    CursorOutOfRange { cursor: Cursor, shards: usize },
    /// The prefetch producer is gone.
    Closed,
    Catalog(CatalogErr),
}

impl fmt::Display for ShardReadErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { shard, path } => {
                write!(f, "shard {shard} is missing at {}", path.display())
            }
            Self::CursorOutOfRange { cursor, shards } => write!(
                f,
                "cursor {cursor} lies outside the catalog of {shards} shard(s)"
            ),
            Self::Closed => write!(f, "batch stream closed"),
            Self::Catalog(e) => write!(f, "{e}"),
        }
    }
}

impl Error for ShardReadErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Catalog(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CatalogErr> for ShardReadErr {
    fn from(value: CatalogErr) -> Self {
        Self::Catalog(value)
    }
}
