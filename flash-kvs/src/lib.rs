//! Parser and mutator for a log-structured, page-oriented key/value format
//! stored in flash.
//!
//! See `SPEC_FULL.md` §4.3-4.4 for the page layout and the engine's
//! add/delete/update/find algorithms. Every operation here borrows a
//! [`flash_store::SparseImageStore`] reference for its own duration; the
//! engine holds no state between calls, and never flushes the store itself.

mod crc;
mod engine;
mod error;
mod page;
mod types;

pub use crc::crc32;
pub use engine::{add_item, add_namespace, delete_item, find_item, parse, parse_hex_blob, update_item};
pub use error::{Error, Result};
pub use page::{PageState, SlotState};
pub use types::{DataType, EntryLocation, KvsValue, ParsedItem, ParsedPage, StructuralIssue};
