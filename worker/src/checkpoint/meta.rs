use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{config::RunConfig, data::Cursor, state::RngState};

/// Size and digest of one tensor blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRecord {
    pub file: String,
    pub bytes: u64,
    pub sha256: String,
}

impl BlobRecord {
    pub fn of(file: String, bytes: &[u8]) -> Self {
        Self {
            file,
            bytes: bytes.len() as u64,
            sha256: sha256_hex(bytes),
        }
    }

    /// Whether `bytes` is exactly the blob this record describes.
    pub fn matches(&self, bytes: &[u8]) -> bool {
        self.bytes == bytes.len() as u64 && self.sha256 == sha256_hex(bytes)
    }
}

/// The metadata record that commits a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub step: u64,
    pub cursor: Cursor,
    pub run_config_hash: String,
    pub timestamp: DateTime<Utc>,
    pub rng: RngState,
    pub config: RunConfig,
    pub model: BlobRecord,
    pub optimizer: BlobRecord,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
