/// Snapshot returned by [`crate::SparseImageStore::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub total_size: u64,
    /// Bytes cached in the read list plus bytes queued in the pending list.
    /// A byte present in both is counted once, from the pending list, since
    /// that is what an observer would see.
    pub cached_bytes: u64,
    pub read_segment_count: usize,
    pub pending_segment_count: usize,
}
