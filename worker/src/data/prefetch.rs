use log::debug;
use tokio::{sync::mpsc, task};

use super::{
    error::ShardReadErr,
    reader::{Batch, StreamReader},
};

/// Reads batches ahead of the training loop on the blocking pool.
///
/// The queue is bounded: a full queue parks the producer, nothing is dropped,
/// and batches arrive in stream order. The first read error is delivered in
/// its place and ends the producer.
pub struct Prefetcher {
    rx: mpsc::Receiver<Result<Batch, ShardReadErr>>,
}

impl Prefetcher {
    /// Moves `reader` onto a blocking task.
    ///
    /// # Arguments
    /// * `reader` - Reader positioned at the first batch to deliver.
    /// * `depth` - Batches that may wait in the queue.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(mut reader: StreamReader, depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(depth.max(1));

        task::spawn_blocking(move || {
            loop {
                let next = reader.next_batch();
                let failed = next.is_err();

                if tx.blocking_send(next).is_err() {
                    debug!("prefetch consumer gone at {}", reader.cursor());
                    break;
                }
                if failed {
                    break;
                }
            }
        });

        Self { rx }
    }

    /// Waits for the next batch.
    pub async fn next(&mut self) -> Result<Batch, ShardReadErr> {
        match self.rx.recv().await {
            Some(batch) => batch,
            None => Err(ShardReadErr::Closed),
        }
    }

    /// Batches currently waiting in the queue.
    pub fn ready(&self) -> usize {
        self.rx.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::data::{
        catalog::{ShardCatalog, Split},
        cursor::Cursor,
        reader::RankSlice,
        shard::pack_shard,
    };

    fn corpus(shards: &[&[&str]]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (i, rows) in shards.iter().enumerate() {
            pack_shard(dir.path().join(format!("shard_{i:05}.bin")), rows).unwrap();
        }
        dir
    }

    fn reader(dir: &tempfile::TempDir) -> StreamReader {
        let set = ShardCatalog::open(dir.path())
            .unwrap()
            .split(Split::Train)
            .unwrap();

        StreamReader::new(set, Cursor::START, 1, RankSlice::single()).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queue_is_bounded_and_ordered() {
        let dir = corpus(&[&["a", "b", "c"]]);
        let mut prefetch = Prefetcher::spawn(reader(&dir), 2);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(prefetch.ready(), 2);

        let mut got = Vec::new();
        for _ in 0..7 {
            got.extend(prefetch.next().await.unwrap().rows);
        }

        assert_eq!(got, ["a", "b", "c", "a", "b", "c", "a"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn read_error_is_delivered_in_order() {
        let dir = corpus(&[&["a"], &["b"], &["val"]]);
        let reader = reader(&dir);
        std::fs::remove_file(dir.path().join("shard_00001.bin")).unwrap();
        let mut prefetch = Prefetcher::spawn(reader, 4);

        assert_eq!(prefetch.next().await.unwrap().rows, ["a"]);
        assert!(matches!(
            prefetch.next().await,
            Err(ShardReadErr::Missing { shard: 1, .. })
        ));
        assert!(matches!(prefetch.next().await, Err(ShardReadErr::Closed)));
    }
}
