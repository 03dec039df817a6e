use std::{
    fs,
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::{
    error::{CatalogErr, ShardReadErr},
    shard::{self, ShardData},
};

/// Sidecar file describing the shards of a data directory.
pub const CATALOG_FILE: &str = "catalog.json";

const SHARD_EXT: &str = "bin";

/// One immutable shard as declared by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEntry {
    pub id: usize,
    pub file: String,
    pub rows: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    shards: Vec<ShardEntry>,
}

/// Which part of the corpus to stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    /// Every shard but the last.
    Train,
    /// The last shard.
    Val,
}

/// Corpus totals, for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogInfo {
    pub shard_count: usize,
    pub total_rows: u64,
    pub total_bytes: u64,
}

/// Ordered, immutable list of the shards in a data directory.
#[derive(Debug, Clone)]
pub struct ShardCatalog {
    dir: PathBuf,
    shards: Vec<ShardEntry>,
}

impl ShardCatalog {
    /// Opens the catalog of `dir`.
    ///
    /// Reads `catalog.json` when present, otherwise lists the `*.bin` files in
    /// name order and takes each declared row count from its header. Partially
    /// written `*.tmp` files are never picked up.
    ///
    /// # Errors
    /// Returns `CatalogErr` when the directory or sidecar can't be read.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, CatalogErr> {
        let dir = dir.as_ref().to_path_buf();
        let sidecar = dir.join(CATALOG_FILE);

        let mut shards = if sidecar.is_file() {
            let raw = fs::read(&sidecar).map_err(|source| CatalogErr::Io {
                path: sidecar.clone(),
                source,
            })?;
            let parsed: Sidecar =
                serde_json::from_slice(&raw).map_err(|e| CatalogErr::Malformed {
                    path: sidecar.clone(),
                    reason: e.to_string(),
                })?;
            parsed.shards
        } else {
            debug!("no {CATALOG_FILE} in {}, listing shard files", dir.display());
            Self::scan(&dir)?
        };

        shards.sort_by_key(|s| s.id);
        if shards.windows(2).any(|w| w[0].id == w[1].id) {
            return Err(CatalogErr::Malformed {
                path: sidecar,
                reason: "duplicate shard ids".into(),
            });
        }
        if let Some(empty) = shards.iter().find(|s| s.rows == 0) {
            return Err(CatalogErr::Malformed {
                path: dir.join(&empty.file),
                reason: "shard declares zero rows".into(),
            });
        }

        info!(shards = shards.len(); "opened catalog at {}", dir.display());
        Ok(Self { dir, shards })
    }

    fn scan(dir: &Path) -> Result<Vec<ShardEntry>, CatalogErr> {
        let io_err = |source| CatalogErr::Io {
            path: dir.to_path_buf(),
            source,
        };

        let mut files = Vec::new();
        for entry in fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == SHARD_EXT) {
                files.push(path);
            }
        }
        files.sort();

        files
            .into_iter()
            .enumerate()
            .map(|(id, path)| {
                let rows = shard::read_declared_rows(&path)?;
                let file = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Ok(ShardEntry { id, file, rows })
            })
            .collect()
    }

    /// Writes the sidecar for `entries` into `dir`.
    pub fn write_sidecar(dir: &Path, entries: &[ShardEntry]) -> Result<(), CatalogErr> {
        let path = dir.join(CATALOG_FILE);
        let body = serde_json::to_vec_pretty(&Sidecar {
            shards: entries.to_vec(),
        })
        .map_err(|e| CatalogErr::Malformed {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        fs::write(&path, body).map_err(|source| CatalogErr::Io { path, source })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The shards in stream order.
    ///
    /// # Errors
    /// `CatalogErr::Empty` when the directory holds no shards.
    pub fn list_shards(&self) -> Result<&[ShardEntry], CatalogErr> {
        if self.shards.is_empty() {
            return Err(CatalogErr::Empty {
                dir: self.dir.clone(),
            });
        }

        Ok(&self.shards)
    }

    /// The shards belonging to `split`.
    ///
    /// With a single shard both splits stream it.
    pub fn split(&self, split: Split) -> Result<ShardSet, CatalogErr> {
        let shards = self.list_shards()?;
        let entries = match (split, shards.len()) {
            (_, 1) => {
                warn!("catalog has a single shard, train and val share it");
                shards.to_vec()
            }
            (Split::Train, n) => shards[..n - 1].to_vec(),
            (Split::Val, n) => shards[n - 1..].to_vec(),
        };

        Ok(ShardSet {
            dir: self.dir.clone(),
            entries,
        })
    }

    /// Shard count, row total and on-disk size.
    pub fn info(&self) -> Result<CatalogInfo, CatalogErr> {
        let shards = self.list_shards()?;

        let mut total_bytes = 0;
        for entry in shards {
            let path = self.dir.join(&entry.file);
            let meta = fs::metadata(&path).map_err(|source| CatalogErr::Io { path, source })?;
            total_bytes += meta.len();
        }

        Ok(CatalogInfo {
            shard_count: shards.len(),
            total_rows: shards.iter().map(|s| s.rows).sum(),
            total_bytes,
        })
    }

    /// Opens every shard and reports the first inconsistency.
    pub fn validate(&self) -> Result<(), ShardReadErr> {
        for (i, entry) in self.list_shards()?.iter().enumerate() {
            ShardData::open(&self.dir.join(&entry.file), i, entry.rows)?;
        }

        Ok(())
    }
}

/// The ordered shards one stream reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSet {
    dir: PathBuf,
    entries: Vec<ShardEntry>,
}

impl ShardSet {
    pub fn entries(&self) -> &[ShardEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Row counts in stream order.
    pub fn rows(&self) -> Vec<u64> {
        self.entries.iter().map(|e| e.rows).collect()
    }

    pub fn total_rows(&self) -> u64 {
        self.entries.iter().map(|e| e.rows).sum()
    }

    /// Location of the shard at stream position `i`.
    pub fn path(&self, i: usize) -> PathBuf {
        self.dir.join(&self.entries[i].file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::shard::pack_shard;

    fn corpus(dir: &Path, shards: &[&[&str]]) {
        for (i, rows) in shards.iter().enumerate() {
            pack_shard(dir.join(format!("shard_{i:05}.bin")), rows).unwrap();
        }
    }

    #[test]
    fn listing_ignores_tmp_files_and_sorts_by_name() {
        let dir = tempfile::tempdir().unwrap();
        corpus(dir.path(), &[&["a", "b"], &["c"], &["d", "e", "f"]]);
        fs::write(dir.path().join("shard_00003.bin.tmp"), b"partial").unwrap();

        let catalog = ShardCatalog::open(dir.path()).unwrap();
        let shards = catalog.list_shards().unwrap();

        let rows: Vec<_> = shards.iter().map(|s| (s.id, s.rows)).collect();
        assert_eq!(rows, [(0, 2), (1, 1), (2, 3)]);
        assert_eq!(shards[2].file, "shard_00002.bin");
    }

    #[test]
    fn sidecar_wins_over_listing() {
        let dir = tempfile::tempdir().unwrap();
        corpus(dir.path(), &[&["a", "b"], &["c"]]);
        let entries = [ShardEntry {
            id: 0,
            file: "shard_00001.bin".into(),
            rows: 1,
        }];
        ShardCatalog::write_sidecar(dir.path(), &entries).unwrap();

        let catalog = ShardCatalog::open(dir.path()).unwrap();
        assert_eq!(catalog.list_shards().unwrap(), entries);
    }

    #[test]
    fn empty_directory_fails_listing() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = ShardCatalog::open(dir.path()).unwrap();

        assert!(matches!(
            catalog.list_shards(),
            Err(CatalogErr::Empty { .. })
        ));
    }

    #[test]
    fn last_shard_is_validation() {
        let dir = tempfile::tempdir().unwrap();
        corpus(dir.path(), &[&["a"], &["b"], &["c", "d"]]);
        let catalog = ShardCatalog::open(dir.path()).unwrap();

        let train = catalog.split(Split::Train).unwrap();
        let val = catalog.split(Split::Val).unwrap();
        assert_eq!(train.rows(), [1, 1]);
        assert_eq!(val.rows(), [2]);

        let info = catalog.info().unwrap();
        assert_eq!(info.shard_count, 3);
        assert_eq!(info.total_rows, 4);
        assert!(info.total_bytes > 0);
    }

    #[test]
    fn validate_reports_a_lying_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        corpus(dir.path(), &[&["a", "b"]]);
        let entries = [ShardEntry {
            id: 0,
            file: "shard_00000.bin".into(),
            rows: 5,
        }];
        ShardCatalog::write_sidecar(dir.path(), &entries).unwrap();

        let catalog = ShardCatalog::open(dir.path()).unwrap();
        assert!(matches!(
            catalog.validate(),
            Err(ShardReadErr::Catalog(CatalogErr::RowCountMismatch {
                declared: 5,
                actual: 2,
                ..
            }))
        ));
    }
}
