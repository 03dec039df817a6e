use std::{collections::BTreeMap, path::PathBuf};

use parking_lot::Mutex;

use super::{
    error::{CheckpointErr, Rejection, Result},
    store::{CheckpointHandle, CheckpointStore, StepSelector},
};
use crate::{config::RunConfig, state::TrainingState};

#[derive(Debug, Clone)]
enum Entry {
    Committed(Box<TrainingState>),
    Torn(String),
}

/// Checkpoints held in memory, for single-process runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<u64, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an unusable step, as a crash in the middle of a save would.
    pub fn insert_torn(&self, step: u64, reason: impl Into<String>) {
        self.entries.lock().insert(step, Entry::Torn(reason.into()));
    }

    fn location(step: u64) -> PathBuf {
        PathBuf::from(format!("memory/{step:06}"))
    }

    fn check(step: u64, entry: &Entry, config: &RunConfig) -> Result<TrainingState> {
        match entry {
            Entry::Torn(reason) => Err(CheckpointErr::corrupt(step, reason.clone())),
            Entry::Committed(state) => {
                let expected = config.shape_hash();
                let found = state.config.shape_hash();
                if found != expected {
                    return Err(CheckpointErr::ConfigMismatch {
                        step,
                        expected,
                        found,
                    });
                }
                Ok(state.as_ref().clone())
            }
        }
    }
}

impl CheckpointStore for MemoryStore {
    fn save(&self, state: &TrainingState) -> Result<CheckpointHandle> {
        self.entries
            .lock()
            .insert(state.step, Entry::Committed(Box::new(state.clone())));

        Ok(CheckpointHandle {
            step: state.step,
            location: Self::location(state.step),
        })
    }

    fn load(&self, selector: StepSelector, config: &RunConfig) -> Result<TrainingState> {
        let entries = self.entries.lock();

        match selector {
            StepSelector::Step(step) => match entries.get(&step) {
                Some(entry) => Self::check(step, entry, config),
                None => Err(CheckpointErr::corrupt(step, "metadata missing")),
            },
            StepSelector::Latest => {
                let mut rejected = Vec::new();
                for (&step, entry) in entries.iter().rev() {
                    match Self::check(step, entry, config) {
                        Err(CheckpointErr::Corrupt { step, reason }) => {
                            rejected.push(Rejection { step, reason })
                        }
                        other => return other,
                    }
                }

                Err(CheckpointErr::NoCheckpoint {
                    dir: PathBuf::from("memory"),
                    rejected,
                })
            }
        }
    }

    fn steps(&self) -> Result<Vec<u64>> {
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| matches!(e, Entry::Committed(_)))
            .map(|(&step, _)| step)
            .collect())
    }

    fn prune(&self, keep_last: usize) -> Result<Vec<u64>> {
        let committed = self.steps()?;
        let Some(&oldest_kept) = committed
            .len()
            .checked_sub(keep_last.max(1))
            .map(|i| &committed[i])
        else {
            return Ok(Vec::new());
        };

        let mut entries = self.entries.lock();
        let removed: Vec<u64> = entries.range(..oldest_kept).map(|(&s, _)| s).collect();
        entries.retain(|&step, _| step >= oldest_kept);

        Ok(removed
            .into_iter()
            .filter(|s| committed.contains(s))
            .collect())
    }
}
