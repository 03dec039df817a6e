use rand::{SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{config::RunConfig, data::Cursor};

const GOLDEN: u64 = 0x9E37_79B9_7F4A_7C15;

/// A named, row-major `f32` tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl NamedTensor {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, values: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            shape,
            values,
        }
    }
}

/// A set of tensors kept sorted by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TensorSet {
    tensors: Vec<NamedTensor>,
}

impl TensorSet {
    pub fn new(mut tensors: Vec<NamedTensor>) -> Self {
        tensors.sort_by(|a, b| a.name.cmp(&b.name));
        Self { tensors }
    }

    pub fn tensors(&self) -> &[NamedTensor] {
        &self.tensors
    }

    pub fn get(&self, name: &str) -> Option<&NamedTensor> {
        self.tensors
            .binary_search_by(|t| t.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.tensors[i])
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

/// Parameters, as checkpointed.
pub type ModelState = TensorSet;

/// Optimizer moments and counters, as checkpointed.
pub type OptimizerState = TensorSet;

/// Randomness of the run, reduced to its seed.
///
/// Each step draws from a generator derived from the seed, the step and the
/// rank, so a resumed run sees the same randomness as an uninterrupted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RngState {
    pub seed: u64,
}

impl RngState {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// The generator for `step` on `rank`.
    pub fn for_step(&self, step: u64, rank: usize) -> StdRng {
        let mixed = self.seed
            ^ step.wrapping_add(1).wrapping_mul(GOLDEN)
            ^ (rank as u64).rotate_left(32);
        StdRng::seed_from_u64(mixed)
    }
}

/// Everything needed to continue a run exactly where it stopped.
///
/// `step` counts completed optimizer updates and `cursor` points at the first
/// row of the next global batch; the two only ever move together.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingState {
    pub step: u64,
    pub cursor: Cursor,
    pub model: ModelState,
    pub optimizer: OptimizerState,
    pub rng: RngState,
    pub config: RunConfig,
}

impl TrainingState {
    /// State of a run that hasn't taken a step yet.
    pub fn fresh(config: RunConfig, model: ModelState, optimizer: OptimizerState) -> Self {
        Self {
            step: 0,
            cursor: Cursor::START,
            model,
            optimizer,
            rng: RngState::new(config.seed),
            config,
        }
    }

    /// Fingerprint every rank must agree on before the first step.
    ///
    /// Covers the position in the run and the run-wide part of the config, so
    /// ranks configured with different schedules or batch sizes never start.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.step.to_le_bytes());
        hasher.update((self.cursor.shard as u64).to_le_bytes());
        hasher.update(self.cursor.row.to_le_bytes());
        hasher.update(self.cursor.epoch.to_le_bytes());
        hasher.update(self.rng.seed.to_le_bytes());
        hasher.update(self.config.group_hash().as_bytes());
        hex::encode(hasher.finalize())
    }
}
