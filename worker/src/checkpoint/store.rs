use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use chrono::Utc;
use log::{debug, info, warn};

use super::{
    error::{CheckpointErr, Rejection, Result},
    layout::{Artifact, TMP_SUFFIX},
    meta::{BlobRecord, CheckpointMeta},
    tensors,
};
use crate::{config::RunConfig, state::TrainingState};

/// Which checkpoint to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepSelector {
    /// The newest step that passes every integrity check.
    Latest,
    /// Exactly this step, never a fallback.
    Step(u64),
}

/// Reference to a committed checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointHandle {
    pub step: u64,
    pub location: PathBuf,
}

/// Durable snapshots of `TrainingState`.
///
/// Only the group's writer rank saves; every rank may load.
pub trait CheckpointStore: Send + Sync {
    /// Persists `state` so it is either fully visible or not at all.
    fn save(&self, state: &TrainingState) -> Result<CheckpointHandle>;

    /// Loads the checkpoint picked by `selector`.
    ///
    /// # Errors
    /// `ConfigMismatch` before any tensor is read when the architecture
    /// differs, `NoCheckpoint` when `Latest` finds nothing usable, `Corrupt`
    /// when an explicit step is unusable.
    fn load(&self, selector: StepSelector, config: &RunConfig) -> Result<TrainingState>;

    /// Committed steps in ascending order.
    fn steps(&self) -> Result<Vec<u64>>;

    /// Deletes all but the newest `keep_last` committed steps.
    ///
    /// # Returns
    /// The steps removed.
    fn prune(&self, keep_last: usize) -> Result<Vec<u64>>;
}

/// What the checkpoint directory currently holds.
#[derive(Debug, Default)]
struct Listing {
    steps: BTreeMap<u64, BTreeSet<Artifact>>,
    tmp: Vec<PathBuf>,
}

/// Checkpoints as files in one directory.
///
/// Every artifact is written to a `.tmp` sibling, synced and renamed. The
/// metadata record goes last, so a step without one was never committed.
#[derive(Debug, Clone)]
pub struct FsCheckpointStore {
    dir: PathBuf,
}

impl FsCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, artifact: Artifact, step: u64) -> PathBuf {
        self.dir.join(artifact.file_name(step))
    }

    fn list(&self) -> Result<Listing> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Listing::default()),
            Err(e) => return Err(CheckpointErr::io(&self.dir)(e)),
        };

        let mut listing = Listing::default();
        for entry in entries {
            let path = entry.map_err(CheckpointErr::io(&self.dir))?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if name.ends_with(TMP_SUFFIX) {
                listing.tmp.push(path);
            } else if let Some((artifact, step)) = Artifact::parse(name) {
                listing.steps.entry(step).or_default().insert(artifact);
            }
        }

        Ok(listing)
    }

    fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{name}{TMP_SUFFIX}"));

        let mut file = File::create(&tmp).map_err(CheckpointErr::io(&tmp))?;
        file.write_all(bytes).map_err(CheckpointErr::io(&tmp))?;
        file.sync_all().map_err(CheckpointErr::io(&tmp))?;
        fs::rename(&tmp, &path).map_err(CheckpointErr::io(&path))?;

        debug!("wrote {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }

    fn read_meta(&self, step: u64) -> Result<CheckpointMeta> {
        let path = self.path(Artifact::Meta, step);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CheckpointErr::corrupt(step, "metadata missing"));
            }
            Err(e) => return Err(CheckpointErr::io(&path)(e)),
        };

        let meta: CheckpointMeta = serde_json::from_slice(&raw)
            .map_err(|e| CheckpointErr::corrupt(step, format!("metadata unreadable: {e}")))?;

        if meta.step != step {
            return Err(CheckpointErr::corrupt(
                step,
                format!("metadata names step {}", meta.step),
            ));
        }
        if meta.config.shape_hash() != meta.run_config_hash {
            return Err(CheckpointErr::corrupt(
                step,
                "metadata config doesn't match its own hash",
            ));
        }

        Ok(meta)
    }

    fn read_blob(&self, step: u64, artifact: Artifact, record: &BlobRecord) -> Result<Vec<u8>> {
        let expected = artifact.file_name(step);
        if record.file != expected {
            return Err(CheckpointErr::corrupt(
                step,
                format!("metadata points at {}, expected {expected}", record.file),
            ));
        }

        let path = self.dir.join(&record.file);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CheckpointErr::corrupt(step, format!("{expected} missing")));
            }
            Err(e) => return Err(CheckpointErr::io(&path)(e)),
        };

        if !record.matches(&bytes) {
            return Err(CheckpointErr::corrupt(
                step,
                format!(
                    "{expected} holds {} bytes that don't match the recorded {} byte digest",
                    bytes.len(),
                    record.bytes
                ),
            ));
        }

        Ok(bytes)
    }

    fn load_step(&self, step: u64, config: &RunConfig) -> Result<TrainingState> {
        let meta = self.read_meta(step)?;

        let expected = config.shape_hash();
        if meta.run_config_hash != expected {
            return Err(CheckpointErr::ConfigMismatch {
                step,
                expected,
                found: meta.run_config_hash,
            });
        }
        warn_on_drift(step, &meta.config, config);

        let model = self.read_blob(step, Artifact::Model, &meta.model)?;
        let optimizer = self.read_blob(step, Artifact::Optimizer, &meta.optimizer)?;

        let model = tensors::decode(&model)
            .map_err(|e| CheckpointErr::corrupt(step, format!("model tensors: {e}")))?;
        let optimizer = tensors::decode(&optimizer)
            .map_err(|e| CheckpointErr::corrupt(step, format!("optimizer tensors: {e}")))?;

        info!(step = step; "loaded checkpoint, resuming at {}", meta.cursor);
        Ok(TrainingState {
            step,
            cursor: meta.cursor,
            model,
            optimizer,
            rng: meta.rng,
            config: meta.config,
        })
    }

    /// Loads the newest usable step, along with every newer step it skipped.
    ///
    /// # Returns
    /// The state and the rejected candidates, newest first.
    ///
    /// # Errors
    /// `NoCheckpoint` when no step qualifies, and any non-corruption failure
    /// of a candidate as is.
    pub fn load_latest(&self, config: &RunConfig) -> Result<(TrainingState, Vec<Rejection>)> {
        let listing = self.list()?;
        let mut rejected = Vec::new();

        for &step in listing.steps.keys().rev() {
            match self.load_step(step, config) {
                Ok(state) => return Ok((state, rejected)),
                Err(CheckpointErr::Corrupt { step, reason }) => {
                    warn!(step = step; "skipping checkpoint: {reason}");
                    rejected.push(Rejection { step, reason });
                }
                Err(e) => return Err(e),
            }
        }

        Err(CheckpointErr::NoCheckpoint {
            dir: self.dir.clone(),
            rejected,
        })
    }
}

impl CheckpointStore for FsCheckpointStore {
    fn save(&self, state: &TrainingState) -> Result<CheckpointHandle> {
        let step = state.step;
        fs::create_dir_all(&self.dir).map_err(CheckpointErr::io(&self.dir))?;

        let model = tensors::encode(&state.model).map_err(CheckpointErr::Tensor)?;
        let optimizer = tensors::encode(&state.optimizer).map_err(CheckpointErr::Tensor)?;

        let model_name = Artifact::Model.file_name(step);
        let optim_name = Artifact::Optimizer.file_name(step);
        self.write_atomic(&model_name, &model)?;
        self.write_atomic(&optim_name, &optimizer)?;

        let meta = CheckpointMeta {
            step,
            cursor: state.cursor,
            run_config_hash: state.config.shape_hash(),
            timestamp: Utc::now(),
            rng: state.rng,
            config: state.config.clone(),
            model: BlobRecord::of(model_name, &model),
            optimizer: BlobRecord::of(optim_name, &optimizer),
        };
        let meta_name = Artifact::Meta.file_name(step);
        self.write_atomic(&meta_name, &serde_json::to_vec_pretty(&meta)?)?;
        sync_dir(&self.dir).map_err(CheckpointErr::io(&self.dir))?;

        info!(step = step; "checkpoint committed at {}", self.dir.display());
        Ok(CheckpointHandle {
            step,
            location: self.dir.join(meta_name),
        })
    }

    fn load(&self, selector: StepSelector, config: &RunConfig) -> Result<TrainingState> {
        match selector {
            StepSelector::Latest => self.load_latest(config).map(|(state, _)| state),
            StepSelector::Step(step) => self.load_step(step, config),
        }
    }

    fn steps(&self) -> Result<Vec<u64>> {
        Ok(self
            .list()?
            .steps
            .into_iter()
            .filter(|(_, artifacts)| artifacts.contains(&Artifact::Meta))
            .map(|(step, _)| step)
            .collect())
    }

    fn prune(&self, keep_last: usize) -> Result<Vec<u64>> {
        let listing = self.list()?;
        for tmp in &listing.tmp {
            remove_if_present(tmp)?;
        }

        let committed: Vec<u64> = listing
            .steps
            .iter()
            .filter(|(_, artifacts)| artifacts.contains(&Artifact::Meta))
            .map(|(&step, _)| step)
            .collect();
        let Some(&oldest_kept) = committed.len().checked_sub(keep_last.max(1)).map(|i| &committed[i])
        else {
            return Ok(Vec::new());
        };

        let mut removed = Vec::new();
        for (&step, artifacts) in listing.steps.range(..oldest_kept) {
            // Meta first so a half-pruned step is never mistaken for a committed one.
            for &artifact in artifacts.iter().rev() {
                remove_if_present(&self.path(artifact, step))?;
            }
            if artifacts.contains(&Artifact::Meta) {
                removed.push(step);
            }
        }

        if !removed.is_empty() {
            info!("pruned checkpoints {removed:?}");
        }
        Ok(removed)
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(CheckpointErr::io(path)(e)),
        _ => Ok(()),
    }
}

fn warn_on_drift(step: u64, saved: &RunConfig, current: &RunConfig) {
    if saved.device_batch_size != current.device_batch_size {
        warn!(
            step = step;
            "device batch size changed from {} to {}, rows per step differ from the checkpointed run",
            saved.device_batch_size, current.device_batch_size
        );
    }
    if saved.world_size != current.world_size {
        warn!(
            step = step;
            "world size changed from {} to {}, rows per step differ from the checkpointed run",
            saved.world_size, current.world_size
        );
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
