pub mod catalog;
pub mod cursor;
pub mod error;
pub mod prefetch;
pub mod reader;
pub mod shard;

pub use catalog::{CatalogInfo, ShardCatalog, ShardEntry, ShardSet, Split};
pub use cursor::Cursor;
pub use error::{CatalogErr, ShardReadErr};
pub use prefetch::Prefetcher;
pub use reader::{Batch, RankSlice, StreamReader};
pub use shard::{ShardData, pack_shard};
