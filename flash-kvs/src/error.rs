/// Errors produced by the KVS engine's mutating operations. Parse-time
/// anomalies (`StructurallyInvalid`, `ChecksumMismatch`) are not part of
/// this enum: they're attached to [`crate::ParsedItem`]/[`crate::ParsedPage`]
/// rather than raised, per `SPEC_FULL.md` §7.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store I/O failed")]
    Store(#[from] flash_store::Error),

    #[error("no item found for namespace {namespace:?}, key {key:?}")]
    NotFound { namespace: String, key: String },

    #[error("namespace {0:?} already exists")]
    Conflict(String),

    #[error("{0}")]
    Exhausted(&'static str),

    #[error("invalid value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, Error>;
