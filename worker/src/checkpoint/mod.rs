pub mod error;
pub mod layout;
pub mod memory;
pub mod meta;
pub mod store;
pub mod tensors;

pub use error::{CheckpointErr, Rejection, Result};
pub use layout::Artifact;
pub use memory::MemoryStore;
pub use meta::{BlobRecord, CheckpointMeta};
pub use store::{CheckpointHandle, CheckpointStore, FsCheckpointStore, StepSelector};
