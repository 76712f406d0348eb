use std::fmt;

/// Opaque error returned by a caller-supplied device callback.
///
/// The store does not know or care what went wrong on the wire; it only
/// needs an [`std::error::Error`] it can attach and hand back.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by [`crate::SparseImageStore`].
///
/// `StructurallyInvalid` and `ChecksumMismatch` from the taxonomy this crate
/// shares with `flash-kvs` are deliberately absent here: the store itself
/// never parses structured data, so it can never produce them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("address range [0x{addr:x}, 0x{addr:x}+0x{len:x}) is outside the store's declared size (0x{size:x})")]
    OutOfRange { addr: u64, len: u64, size: u64 },

    #[error("device callback failed")]
    CallbackFailure(#[source] CallbackError),
}

impl Error {
    pub fn out_of_range(addr: u64, len: u64, size: u64) -> Self {
        Error::OutOfRange { addr, len, size }
    }

    pub fn callback<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::CallbackFailure(Box::new(err))
    }
}

/// Helper so callbacks written as plain closures can return any
/// `Display`-able error without pulling in `anyhow` at the call site.
#[derive(Debug)]
pub struct Opaque(pub String);

impl fmt::Display for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Opaque {}

pub type Result<T> = std::result::Result<T, Error>;
