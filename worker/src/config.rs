use std::{
    env, error::Error, fmt, fs, io,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Env var naming an optional JSON file layered over the defaults.
pub const CONFIG_ENV: &str = "ORCHESTRA_CONFIG";

const DEFAULT_MASTER_ADDR: &str = "127.0.0.1:29500";
const ASPECT_RATIO: usize = 64;
const HEAD_DIM: usize = 128;

/// The config module's result type.
pub type Result<T> = std::result::Result<T, ConfigErr>;

/// Architecture of the model being trained.
///
/// This is the part of the run configuration a checkpoint is bound to: two runs
/// may only exchange weights when their shapes hash to the same value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelShape {
    pub depth: usize,
    pub model_dim: usize,
    pub num_heads: usize,
    pub vocab_size: usize,
    pub seq_len: usize,
    pub window_pattern: String,
}

impl ModelShape {
    /// Derives the width and head count from the depth.
    ///
    /// # Arguments
    /// * `depth` - Number of transformer layers.
    ///
    /// # Returns
    /// A shape with byte-level vocabulary and the default sequence length.
    pub fn for_depth(depth: usize) -> Self {
        let mut shape = Self {
            depth: 0,
            model_dim: 0,
            num_heads: 0,
            vocab_size: 257,
            seq_len: 256,
            window_pattern: "L".into(),
        };
        shape.set_depth(depth);
        shape
    }

    /// Changes the depth, keeping width and heads proportional.
    pub fn set_depth(&mut self, depth: usize) {
        self.depth = depth;
        self.model_dim = depth * ASPECT_RATIO;
        self.num_heads = self.model_dim.div_ceil(HEAD_DIM).max(1);
    }

    /// Hex SHA-256 over every architectural field.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        for field in [
            self.depth,
            self.model_dim,
            self.num_heads,
            self.vocab_size,
            self.seq_len,
        ] {
            hasher.update((field as u64).to_le_bytes());
        }
        hasher.update(self.window_pattern.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Whether a run starts from the latest checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeMode {
    /// Always start fresh.
    Off,
    /// Resume when a valid checkpoint exists, start fresh otherwise.
    Auto,
    /// Resume or fail.
    Require,
}

impl FromStr for ResumeMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "0" | "false" => Ok(Self::Off),
            "auto" | "1" | "true" => Ok(Self::Auto),
            "require" => Ok(Self::Require),
            other => Err(format!("expected off, auto or require, got {other:?}")),
        }
    }
}

/// Process-wide run configuration, read once at startup and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub rank: usize,
    pub world_size: usize,
    pub master_addr: String,
    pub shape: ModelShape,
    pub device_batch_size: usize,
    pub target_param_data_ratio: f64,
    pub num_iterations: Option<u64>,
    pub learning_rate: f32,
    /// Steps between evaluations, `0` disables.
    pub eval_every: u64,
    pub eval_rows: usize,
    /// Steps between sample generations, `0` disables.
    pub sample_every: u64,
    /// Steps between checkpoints, `0` keeps only the final one.
    pub save_every: u64,
    pub resume: ResumeMode,
    pub resume_step: Option<u64>,
    pub seed: u64,
    pub data_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub max_wall_secs: Option<u64>,
    pub prefetch_depth: usize,
    pub keep_last: Option<usize>,
    /// Accelerator memory a step may use, unbounded when unset.
    pub device_memory_bytes: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            master_addr: DEFAULT_MASTER_ADDR.into(),
            shape: ModelShape::for_depth(20),
            device_batch_size: 32,
            target_param_data_ratio: 20.0,
            num_iterations: None,
            learning_rate: 1e-2,
            eval_every: 250,
            eval_rows: 64,
            sample_every: 2000,
            save_every: 1000,
            resume: ResumeMode::Auto,
            resume_step: None,
            seed: 42,
            data_dir: PathBuf::from("data"),
            checkpoint_dir: PathBuf::from("checkpoints"),
            max_wall_secs: None,
            prefetch_depth: 4,
            keep_last: None,
            device_memory_bytes: None,
        }
    }
}

impl RunConfig {
    /// Builds the config from defaults, the optional JSON file and the environment.
    ///
    /// # Returns
    /// A validated configuration.
    ///
    /// # Errors
    /// Returns `ConfigErr` if the file can't be read or parsed, a variable
    /// doesn't parse, or the result fails validation.
    pub fn load() -> Result<Self> {
        let mut cfg = match env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };

        cfg.apply_env(|key| env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads a JSON config file, missing fields take their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read(path).map_err(|source| ConfigErr::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(serde_json::from_slice(&raw)?)
    }

    /// Overrides fields from environment variables.
    ///
    /// # Arguments
    /// * `var` - Variable lookup, `env::var` in production.
    pub fn apply_env<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &'static str| var(key).map(|value| (key, value));

        if let Some((k, v)) = get("RANK") {
            self.rank = parse(k, &v)?;
        }
        if let Some((k, v)) = get("WORLD_SIZE") {
            self.world_size = parse(k, &v)?;
        }
        if let Some((_, v)) = get("MASTER_ADDR") {
            self.master_addr = v;
        }
        if let Some((k, v)) = get("ORCHESTRA_DEPTH") {
            self.shape.set_depth(parse(k, &v)?);
        }
        if let Some((k, v)) = get("ORCHESTRA_SEQ_LEN") {
            self.shape.seq_len = parse(k, &v)?;
        }
        if let Some((_, v)) = get("ORCHESTRA_WINDOW_PATTERN") {
            self.shape.window_pattern = v;
        }
        if let Some((k, v)) = get("ORCHESTRA_DEVICE_BATCH_SIZE") {
            self.device_batch_size = parse(k, &v)?;
        }
        if let Some((k, v)) = get("ORCHESTRA_PARAM_DATA_RATIO") {
            self.target_param_data_ratio = parse(k, &v)?;
        }
        if let Some((k, v)) = get("ORCHESTRA_NUM_ITERATIONS") {
            self.num_iterations = Some(parse(k, &v)?);
        }
        if let Some((k, v)) = get("ORCHESTRA_LR") {
            self.learning_rate = parse(k, &v)?;
        }
        if let Some((k, v)) = get("ORCHESTRA_EVAL_EVERY") {
            self.eval_every = parse(k, &v)?;
        }
        if let Some((k, v)) = get("ORCHESTRA_SAMPLE_EVERY") {
            self.sample_every = parse(k, &v)?;
        }
        if let Some((k, v)) = get("ORCHESTRA_SAVE_EVERY") {
            self.save_every = parse(k, &v)?;
        }
        if let Some((k, v)) = get("ORCHESTRA_RESUME") {
            self.resume = parse(k, &v)?;
        }
        if let Some((k, v)) = get("ORCHESTRA_RESUME_STEP") {
            self.resume_step = Some(parse(k, &v)?);
        }
        if let Some((k, v)) = get("ORCHESTRA_SEED") {
            self.seed = parse(k, &v)?;
        }
        if let Some((_, v)) = get("ORCHESTRA_DATA_DIR") {
            self.data_dir = v.into();
        }
        if let Some((_, v)) = get("ORCHESTRA_CHECKPOINT_DIR") {
            self.checkpoint_dir = v.into();
        }
        if let Some((k, v)) = get("ORCHESTRA_MAX_WALL_SECS") {
            self.max_wall_secs = Some(parse(k, &v)?);
        }
        if let Some((k, v)) = get("ORCHESTRA_PREFETCH") {
            self.prefetch_depth = parse(k, &v)?;
        }
        if let Some((k, v)) = get("ORCHESTRA_KEEP_LAST") {
            self.keep_last = Some(parse(k, &v)?);
        }
        if let Some((k, v)) = get("ORCHESTRA_DEVICE_MEMORY") {
            self.device_memory_bytes = Some(parse(k, &v)?);
        }

        Ok(())
    }

    /// Rejects configurations that can't run.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ConfigErr::Invalid(msg));

        if self.world_size == 0 {
            return invalid("world_size must be at least 1".into());
        }
        if self.rank >= self.world_size {
            return invalid(format!(
                "rank {} out of range for world_size {}",
                self.rank, self.world_size
            ));
        }
        if self.device_batch_size == 0 {
            return invalid("device_batch_size must be at least 1".into());
        }
        if self.shape.depth == 0 || self.shape.seq_len == 0 || self.shape.vocab_size == 0 {
            return invalid("depth, seq_len and vocab_size must be non-zero".into());
        }
        if self.shape.window_pattern.is_empty()
            || !self.shape.window_pattern.chars().all(|c| c == 'S' || c == 'L')
        {
            return invalid(format!(
                "window_pattern must be a non-empty string of S and L, got {:?}",
                self.shape.window_pattern
            ));
        }
        if self.num_iterations.is_none()
            && !(self.target_param_data_ratio.is_finite() && self.target_param_data_ratio > 0.0)
        {
            return invalid("target_param_data_ratio must be positive".into());
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return invalid("learning_rate must be positive".into());
        }
        if self.eval_every > 0 && self.eval_rows == 0 {
            return invalid("eval_rows must be at least 1 when evaluation is on".into());
        }
        if self.prefetch_depth == 0 {
            return invalid("prefetch_depth must be at least 1".into());
        }
        if self.keep_last == Some(0) {
            return invalid("keep_last must be at least 1".into());
        }
        if self.device_memory_bytes == Some(0) {
            return invalid("device_memory_bytes must be at least 1".into());
        }
        if self.resume == ResumeMode::Off && self.resume_step.is_some() {
            return invalid("resume_step is set but resume is off".into());
        }

        Ok(())
    }

    /// Rows consumed by the whole group in one step.
    pub fn global_batch_rows(&self) -> u64 {
        (self.device_batch_size * self.world_size) as u64
    }

    /// Whether a missing checkpoint must fail the run instead of starting fresh.
    pub fn require_checkpoint(&self) -> bool {
        self.resume == ResumeMode::Require || self.resume_step.is_some()
    }

    /// Hash binding checkpoints to this model architecture.
    pub fn shape_hash(&self) -> String {
        self.shape.hash()
    }

    /// Hex SHA-256 over everything the ranks of one run must share.
    ///
    /// Covers the architecture, the data layout and the step schedule. Fields
    /// that may legitimately differ per rank (rank, addresses, local paths,
    /// prefetch depth, wall-clock and memory limits, retention, resume selection)
    /// are left out.
    pub fn group_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.shape_hash().as_bytes());
        for field in [
            self.world_size as u64,
            self.device_batch_size as u64,
            self.target_param_data_ratio.to_bits(),
            u64::from(self.learning_rate.to_bits()),
            self.eval_every,
            self.eval_rows as u64,
            self.sample_every,
            self.save_every,
            self.seed,
        ] {
            hasher.update(field.to_le_bytes());
        }
        match self.num_iterations {
            Some(n) => {
                hasher.update([1]);
                hasher.update(n.to_le_bytes());
            }
            None => hasher.update([0]),
        }
        hex::encode(hasher.finalize())
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigErr::InvalidVar {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Configuration loading failures.
#[derive(Debug)]
pub enum ConfigErr {
    Io { path: PathBuf, source: io::Error },
    Json(serde_json::Error),
    InvalidVar {
        key: &'static str,
        value: String,
        reason: String,
    },
    Invalid(String),
}

impl fmt::Display for ConfigErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            Self::Json(e) => write!(f, "malformed config file: {e}"),
            Self::InvalidVar { key, value, reason } => {
                write!(f, "invalid value {value:?} for {key}: {reason}")
            }
            Self::Invalid(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl Error for ConfigErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ConfigErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}
