mod error;
mod group;
mod local;
mod net;

pub use error::{GroupErr, Result};
pub use group::{RunGroup, RunGroupTemplate, WRITER_RANK, is_writer};
pub use local::LocalGroup;
pub use net::{Link, NetGroup};
