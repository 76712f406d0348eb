use crate::error::CallbackError;
use crate::store::SparseImageStore;

/// What a read callback handed back.
///
/// The underlying transport may satisfy a read with exactly the bytes
/// requested, or it may reply with a differently based or differently
/// sized block (a flash read command returning a whole page when only a
/// few bytes were wanted, say). Rather than accept "bytes, a slice, or an
/// `{address, data}` record" interchangeably at runtime, the two shapes
/// are distinct constructors so the compiler enforces which one a given
/// callback produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadReply {
    /// The reply covers `[addr, addr + bytes.len())` for the `addr` that
    /// was requested.
    AtRequestedBase(Vec<u8>),
    /// The reply covers `[addr, addr + bytes.len())` for some other base
    /// than the one requested. Accepted leniently (see `spec.md` §9's open
    /// question on this), but every such reply is logged.
    AtExplicitBase { addr: u64, bytes: Vec<u8> },
}

impl ReadReply {
    pub(crate) fn into_addr_bytes(self, requested_addr: u64) -> (u64, Vec<u8>) {
        match self {
            ReadReply::AtRequestedBase(bytes) => (requested_addr, bytes),
            ReadReply::AtExplicitBase { addr, bytes } => (addr, bytes),
        }
    }
}

/// Reads a byte range from the backing device.
///
/// The store never assumes the callback returns exactly the requested
/// length; it loops, re-querying the remaining gap, until the range is
/// covered or a bounded retry count is exhausted.
pub trait ReadCallback {
    fn read(&mut self, addr: u64, len: u64) -> Result<ReadReply, CallbackError>;
}

impl<F> ReadCallback for F
where
    F: FnMut(u64, u64) -> Result<ReadReply, CallbackError>,
{
    fn read(&mut self, addr: u64, len: u64) -> Result<ReadReply, CallbackError> {
        self(addr, len)
    }
}

/// Persists bytes to the backing device, starting at `addr`.
///
/// Invoked once per pending segment during `flush()`, in ascending address
/// order, with sector-aligned addresses whenever the pending sector was
/// materialized in full.
pub trait WriteCallback {
    fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<(), CallbackError>;
}

impl<F> WriteCallback for F
where
    F: FnMut(u64, &[u8]) -> Result<(), CallbackError>,
{
    fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<(), CallbackError> {
        self(addr, bytes)
    }
}

/// Optional hook invoked once at the start of `flush()`, before any write
/// callback, with mutable access to the store being flushed.
pub trait FlushPrepareCallback {
    fn prepare(&mut self, store: &mut SparseImageStore) -> Result<(), CallbackError>;
}

impl<F> FlushPrepareCallback for F
where
    F: FnMut(&mut SparseImageStore) -> Result<(), CallbackError>,
{
    fn prepare(&mut self, store: &mut SparseImageStore) -> Result<(), CallbackError> {
        self(store)
    }
}
