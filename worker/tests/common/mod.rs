#![allow(dead_code)]

use std::path::Path;

use worker::{RunConfig, config::ModelShape, data::pack_shard};

/// Packs `shards` train shards of `rows` rows each, plus one validation shard.
pub fn corpus(dir: &Path, shards: usize, rows: usize) {
    for s in 0..shards {
        let rows: Vec<String> = (0..rows)
            .map(|r| format!("shard {s} row {r}: the quick brown fox"))
            .collect();
        pack_shard(dir.join(format!("shard_{s:05}.bin")), &rows).unwrap();
    }

    pack_shard(
        dir.join(format!("shard_{shards:05}.bin")),
        &["held out text", "more held out text"],
    )
    .unwrap();
}

/// A small, fast configuration rooted in `data` and `checkpoints`.
pub fn config(data: &Path, checkpoints: &Path, iterations: u64) -> RunConfig {
    RunConfig {
        shape: ModelShape::for_depth(1),
        device_batch_size: 2,
        num_iterations: Some(iterations),
        learning_rate: 0.02,
        eval_every: 50,
        eval_rows: 2,
        sample_every: 100,
        save_every: 50,
        seed: 7,
        data_dir: data.to_path_buf(),
        checkpoint_dir: checkpoints.to_path_buf(),
        ..RunConfig::default()
    }
}
