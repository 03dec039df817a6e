use std::fmt;

use serde::{Deserialize, Serialize};

/// Position in the logical row stream.
///
/// `row` is always below the row count of `shard`. Stepping past the last row
/// of the last shard wraps to the first shard and bumps `epoch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Cursor {
    pub shard: usize,
    pub row: u64,
    pub epoch: u64,
}

impl Cursor {
    pub const START: Cursor = Cursor {
        shard: 0,
        row: 0,
        epoch: 0,
    };

    pub fn new(shard: usize, row: u64, epoch: u64) -> Self {
        Self { shard, row, epoch }
    }

    /// Whether this cursor points at an existing row.
    ///
    /// # Arguments
    /// * `rows` - Row count of every shard, in catalog order.
    pub fn is_within(&self, rows: &[u64]) -> bool {
        rows.get(self.shard).is_some_and(|&n| self.row < n)
    }

    /// Moves `n` rows forward.
    ///
    /// # Arguments
    /// * `n` - Number of rows to skip.
    /// * `rows` - Row count of every shard, in catalog order, all non-zero.
    ///
    /// # Returns
    /// The cursor `n` rows later in the stream.
    pub fn advance(self, n: u64, rows: &[u64]) -> Cursor {
        let total: u64 = rows.iter().sum();
        if total == 0 {
            return self;
        }

        let mut next = self;
        next.epoch += n / total;
        let mut n = n % total;

        while n > 0 {
            let left = rows[next.shard] - next.row;
            if n < left {
                next.row += n;
                break;
            }

            n -= left;
            next.row = 0;
            next.shard += 1;
            if next.shard == rows.len() {
                next.shard = 0;
                next.epoch += 1;
            }
        }

        next
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(shard {}, row {}, epoch {})",
            self.shard, self.row, self.epoch
        )
    }
}
