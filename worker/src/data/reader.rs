use std::{num::NonZeroUsize, ops::Range};

use log::debug;

use super::{
    catalog::ShardSet,
    cursor::Cursor,
    error::ShardReadErr,
    shard::ShardData,
};

/// A rank's position in the data-parallel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankSlice {
    pub rank: usize,
    pub world_size: NonZeroUsize,
}

impl RankSlice {
    /// # Panics
    /// If `rank` is not below `world_size`.
    pub fn new(rank: usize, world_size: NonZeroUsize) -> Self {
        assert!(rank < world_size.get(), "rank out of range");
        Self { rank, world_size }
    }

    pub fn single() -> Self {
        Self::new(0, NonZeroUsize::MIN)
    }

    /// Offsets this rank owns within a global batch of `world_size * batch` rows.
    #[inline]
    pub fn range(self, batch: usize) -> Range<usize> {
        let start = self.rank * batch;
        start..start + batch
    }
}

/// Rows handed to one rank for one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub rows: Vec<String>,
    /// Cursor of the first row of the global batch.
    pub start: Cursor,
    /// Cursor right after the global batch, identical on every rank.
    pub end: Cursor,
}

/// Restartable, infinite stream of batches over a shard set.
///
/// Every call consumes a whole global batch so the cursor stays the same on
/// every rank; this rank only materialises its own slice of it.
#[derive(Debug)]
pub struct StreamReader {
    shards: ShardSet,
    rows: Vec<u64>,
    cursor: Cursor,
    batch_size: usize,
    slice: RankSlice,
    cached: Option<(usize, ShardData)>,
}

impl StreamReader {
    /// Creates a reader positioned at `cursor`.
    ///
    /// # Arguments
    /// * `shards` - The shards to stream, in order.
    /// * `cursor` - First row of the next global batch.
    /// * `batch_size` - Rows per rank per step.
    /// * `slice` - This rank's position in the group.
    ///
    /// # Errors
    /// `ShardReadErr::CursorOutOfRange` when the cursor doesn't fit the shard set.
    ///
    /// # Panics
    /// If `batch_size` is zero.
    pub fn new(
        shards: ShardSet,
        cursor: Cursor,
        batch_size: usize,
        slice: RankSlice,
    ) -> Result<Self, ShardReadErr> {
        assert!(batch_size > 0, "batch_size must be > 0");

        let rows = shards.rows();
        if !cursor.is_within(&rows) {
            return Err(ShardReadErr::CursorOutOfRange {
                cursor,
                shards: rows.len(),
            });
        }

        Ok(Self {
            shards,
            rows,
            cursor,
            batch_size,
            slice,
            cached: None,
        })
    }

    #[inline]
    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    #[inline]
    pub fn slice(&self) -> RankSlice {
        self.slice
    }

    /// Rows the whole group consumes per call.
    #[inline]
    pub fn global_batch(&self) -> u64 {
        (self.batch_size * self.slice.world_size.get()) as u64
    }

    /// Returns this rank's rows of the next global batch and advances the cursor.
    ///
    /// # Errors
    /// A missing or inconsistent shard; the cursor doesn't move in that case.
    pub fn next_batch(&mut self) -> Result<Batch, ShardReadErr> {
        let start = self.cursor;
        let batch_size = self.batch_size;
        let own = self.slice.range(batch_size);

        let mut at = start.advance(own.start as u64, &self.rows);
        let mut rows = Vec::with_capacity(batch_size);

        while rows.len() < batch_size {
            let shard = self.load(at.shard)?;
            let first = at.row as usize;
            let take = (batch_size - rows.len()).min(shard.len() - first);

            rows.extend((first..first + take).map(|i| shard.row(i).to_owned()));
            at = at.advance(take as u64, &self.rows);
        }

        let end = start.advance(self.global_batch(), &self.rows);
        self.cursor = end;
        debug!(rank = self.slice.rank; "batch {start} -> {end}");

        Ok(Batch { rows, start, end })
    }

    fn load(&mut self, shard: usize) -> Result<&ShardData, ShardReadErr> {
        let cached = match self.cached.take() {
            Some((id, data)) if id == shard => (id, data),
            _ => {
                let entry = &self.shards.entries()[shard];
                debug!(shard = shard; "loading {}", entry.file);
                (
                    shard,
                    ShardData::open(&self.shards.path(shard), shard, entry.rows)?,
                )
            }
        };

        Ok(&self.cached.insert(cached).1)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::data::{
        catalog::{ShardCatalog, Split},
        error::CatalogErr,
        shard::pack_shard,
    };

    fn corpus(shards: &[u64]) -> (tempfile::TempDir, ShardSet) {
        let dir = tempfile::tempdir().unwrap();
        let mut next = 0;
        for (i, &n) in shards.iter().enumerate() {
            let rows: Vec<String> = (next..next + n).map(|r| format!("row-{r}")).collect();
            next += n;
            pack_shard(dir.path().join(format!("shard_{i:05}.bin")), &rows).unwrap();
        }
        // Trailing validation shard.
        pack_shard(
            dir.path().join(format!("shard_{:05}.bin", shards.len())),
            &["val"],
        )
        .unwrap();

        let set = ShardCatalog::open(dir.path())
            .unwrap()
            .split(Split::Train)
            .unwrap();
        (dir, set)
    }

    fn world(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn restart_from_a_cursor_replays_the_stream() {
        let (_dir, set) = corpus(&[5, 3, 4]);

        let mut first = StreamReader::new(set.clone(), Cursor::START, 3, RankSlice::single()).unwrap();
        let run: Vec<Batch> = (0..10).map(|_| first.next_batch().unwrap()).collect();

        let mut resumed = StreamReader::new(set, run[3].end, 3, RankSlice::single()).unwrap();
        for expected in &run[4..] {
            assert_eq!(&resumed.next_batch().unwrap(), expected);
        }
    }

    #[test]
    fn one_epoch_yields_every_row_once() {
        let (_dir, set) = corpus(&[4, 1, 3]);
        let total = set.total_rows();
        let mut reader = StreamReader::new(set, Cursor::START, 1, RankSlice::single()).unwrap();

        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut last = None;
        for _ in 0..total {
            let batch = reader.next_batch().unwrap();
            assert_eq!(batch.start.epoch, 0);
            *seen.entry(batch.rows[0].clone()).or_default() += 1;
            last = Some(batch.end);
        }

        assert_eq!(seen.len() as u64, total);
        assert!(seen.values().all(|&n| n == 1));
        assert_eq!(last, Some(Cursor::new(0, 0, 1)));
    }

    #[test]
    fn batches_span_shard_boundaries() {
        let (_dir, set) = corpus(&[2, 2]);
        let mut reader = StreamReader::new(set, Cursor::START, 3, RankSlice::single()).unwrap();

        let first = reader.next_batch().unwrap();
        assert_eq!(first.rows, ["row-0", "row-1", "row-2"]);
        assert_eq!(first.end, Cursor::new(1, 1, 0));

        let second = reader.next_batch().unwrap();
        assert_eq!(second.rows, ["row-3", "row-0", "row-1"]);
        assert_eq!(second.end, Cursor::new(1, 0, 1));
    }

    #[test]
    fn rank_slices_tile_the_global_batch() {
        let (_dir, set) = corpus(&[7, 6]);
        let ranks = 3;
        let batch = 2;

        let mut whole = StreamReader::new(
            set.clone(),
            Cursor::START,
            batch * ranks,
            RankSlice::single(),
        )
        .unwrap();
        let mut readers: Vec<_> = (0..ranks)
            .map(|r| {
                StreamReader::new(
                    set.clone(),
                    Cursor::START,
                    batch,
                    RankSlice::new(r, world(ranks)),
                )
                .unwrap()
            })
            .collect();

        for _ in 0..5 {
            let expected = whole.next_batch().unwrap();
            let parts: Vec<Batch> = readers.iter_mut().map(|r| r.next_batch().unwrap()).collect();

            let joined: Vec<String> = parts.iter().flat_map(|b| b.rows.clone()).collect();
            assert_eq!(joined, expected.rows);
            assert!(parts.iter().all(|b| b.end == expected.end));
        }
    }

    #[test]
    fn missing_shard_is_fatal() {
        let (dir, set) = corpus(&[2, 2]);
        fs_remove(dir.path().join("shard_00001.bin"));

        let mut reader = StreamReader::new(set, Cursor::START, 2, RankSlice::single()).unwrap();
        reader.next_batch().unwrap();

        let err = reader.next_batch().unwrap_err();
        assert!(matches!(err, ShardReadErr::Missing { shard: 1, .. }));
        assert_eq!(reader.cursor(), Cursor::new(1, 0, 0));
    }

    #[test]
    fn row_count_lies_surface_on_first_read() {
        let dir = tempfile::tempdir().unwrap();
        pack_shard(dir.path().join("shard_00000.bin"), &["a", "b"]).unwrap();
        ShardCatalog::write_sidecar(
            dir.path(),
            &[crate::data::catalog::ShardEntry {
                id: 0,
                file: "shard_00000.bin".into(),
                rows: 3,
            }],
        )
        .unwrap();
        let set = ShardCatalog::open(dir.path())
            .unwrap()
            .split(Split::Train)
            .unwrap();

        let mut reader = StreamReader::new(set, Cursor::START, 1, RankSlice::single()).unwrap();
        assert!(matches!(
            reader.next_batch(),
            Err(ShardReadErr::Catalog(CatalogErr::RowCountMismatch { .. }))
        ));
    }

    #[test]
    fn cursor_outside_catalog_is_rejected() {
        let (_dir, set) = corpus(&[2]);
        let err = StreamReader::new(set, Cursor::new(0, 2, 0), 1, RankSlice::single()).unwrap_err();

        assert!(matches!(err, ShardReadErr::CursorOutOfRange { .. }));
    }

    fn fs_remove(path: std::path::PathBuf) {
        std::fs::remove_file(path).unwrap();
    }
}
