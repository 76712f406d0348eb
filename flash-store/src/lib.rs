//! Lazy, sector-aware, copy-on-write cache of a flash device's address
//! space.
//!
//! See `SPEC_FULL.md` §4.2 for the full read/write/flush algorithm this
//! crate implements. The short version: two [`flash_segment::SegmentList`]s
//! (a read cache and a pending-write list) back a single [`SparseImageStore`],
//! which mediates every byte access through them and only calls out to the
//! caller's device callbacks for the gaps the caches can't already answer.

mod callbacks;
mod config;
mod error;
mod stats;
mod store;

pub use callbacks::{FlushPrepareCallback, ReadCallback, ReadReply, WriteCallback};
pub use config::StoreConfig;
pub use error::{CallbackError, Error, Opaque, Result};
pub use flash_segment::{Segment, SegmentList, ERASED_BYTE};
pub use stats::Stats;
pub use store::SparseImageStore;
