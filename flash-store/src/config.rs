/// Tunables for a [`crate::SparseImageStore`].
///
/// This is the entire "configuration" surface of the core: there is no
/// config file or environment parsing here, since the store is a library
/// embedded in a larger tool, not a front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// Power-of-two byte count the backing device writes atomically.
    /// `spec.md` §3 defaults this to 256 in general, 4096 in practice for
    /// NOR/NAND flash.
    pub sector_size: u64,
    /// Upper bound on non-progressing read-callback replies before a gap
    /// is given up on and filled with the erased-flash sentinel.
    pub max_read_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sector_size: 256,
            max_read_retries: 16,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sector_size(mut self, sector_size: u64) -> Self {
        assert!(sector_size.is_power_of_two(), "sector_size must be a power of two");
        self.sector_size = sector_size;
        self
    }

    pub fn max_read_retries(mut self, max_read_retries: u32) -> Self {
        self.max_read_retries = max_read_retries;
        self
    }
}
