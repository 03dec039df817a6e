use super::error::Result;

/// The rank that writes checkpoints.
pub const WRITER_RANK: usize = 0;

/// The fixed set of processes training one model together.
///
/// Every rank calls the same sequence of collective operations; each call
/// returns only once all ranks made it, or with an error on every rank.
#[allow(unused)]
#[trait_variant::make(RunGroup: Send)]
pub trait RunGroupTemplate: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// The per-step barrier.
    ///
    /// # Arguments
    /// * `step` - The step every rank just completed.
    /// * `stop` - This rank's vote to stop after this step.
    ///
    /// # Returns
    /// Whether any rank voted to stop.
    async fn barrier(&self, step: u64, stop: bool) -> Result<bool>;

    /// Replaces `buf` with its element-wise mean over all ranks.
    async fn all_reduce_mean(&self, buf: &mut [f32]) -> Result<()>;

    /// Fails on every rank unless all ranks present the same `digest`.
    async fn agree(&self, digest: &str) -> Result<()>;

    /// Best-effort notice that this rank is failing; pending and later
    /// collective calls on the other ranks return `GroupErr::Aborted`.
    async fn abort(&self, reason: &str);
}

/// Whether `group`'s local rank writes checkpoints.
pub fn is_writer<G: RunGroup>(group: &G) -> bool {
    group.rank() == WRITER_RANK
}
