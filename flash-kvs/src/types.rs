//! Typed values and parse-result records for the KVS engine.

use crate::page::PageState;

/// On-flash type codes for entry values. Values match the codes real
/// NVS-style flash formats use, so a partition produced by one of those
/// tools is byte-compatible with this decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    String,
    Blob,
    BlobIndex,
}

impl DataType {
    pub const fn code(self) -> u8 {
        match self {
            DataType::U8 => 0x01,
            DataType::I8 => 0x11,
            DataType::U16 => 0x02,
            DataType::I16 => 0x12,
            DataType::U32 => 0x04,
            DataType::I32 => 0x14,
            DataType::U64 => 0x08,
            DataType::I64 => 0x18,
            DataType::String => 0x21,
            DataType::Blob => 0x42,
            DataType::BlobIndex => 0x48,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => DataType::U8,
            0x11 => DataType::I8,
            0x02 => DataType::U16,
            0x12 => DataType::I16,
            0x04 => DataType::U32,
            0x14 => DataType::I32,
            0x08 => DataType::U64,
            0x18 => DataType::I64,
            0x21 => DataType::String,
            0x42 => DataType::Blob,
            0x48 => DataType::BlobIndex,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            DataType::U8 => "U8",
            DataType::I8 => "I8",
            DataType::U16 => "U16",
            DataType::I16 => "I16",
            DataType::U32 => "U32",
            DataType::I32 => "I32",
            DataType::U64 => "U64",
            DataType::I64 => "I64",
            DataType::String => "String",
            DataType::Blob => "Blob",
            DataType::BlobIndex => "BlobIndex",
        }
    }

    /// Whether values of this type are stored as a single inline entry
    /// with no follow-on data slots.
    pub fn is_fixed_width(self) -> bool {
        matches!(
            self,
            DataType::U8
                | DataType::I8
                | DataType::U16
                | DataType::I16
                | DataType::U32
                | DataType::I32
                | DataType::U64
                | DataType::I64
        )
    }
}

/// A decoded entry value. `U64`/`I64` stay integers rather than strings —
/// `SPEC_FULL.md` calls this out explicitly to avoid precision loss that
/// the source's host runtime papered over by stringifying.
#[derive(Debug, Clone, PartialEq)]
pub enum KvsValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    String(String),
    Blob(Vec<u8>),
}

impl KvsValue {
    pub fn data_type(&self) -> DataType {
        match self {
            KvsValue::U8(_) => DataType::U8,
            KvsValue::I8(_) => DataType::I8,
            KvsValue::U16(_) => DataType::U16,
            KvsValue::I16(_) => DataType::I16,
            KvsValue::U32(_) => DataType::U32,
            KvsValue::I32(_) => DataType::I32,
            KvsValue::U64(_) => DataType::U64,
            KvsValue::I64(_) => DataType::I64,
            KvsValue::String(_) => DataType::String,
            KvsValue::Blob(_) => DataType::Blob,
        }
    }
}

/// Where a decoded or newly placed entry's first slot lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLocation {
    pub page_offset: u64,
    pub slot_index: usize,
    pub byte_offset: u64,
    pub span: u8,
}

/// A structural problem found while decoding a slot. Reported alongside
/// the partition walk's results rather than aborting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuralIssue {
    pub page_offset: u64,
    pub slot_index: usize,
    pub description: String,
}

/// A fully decoded entry, with its namespace resolved and its checksums
/// checked (but not filtered on).
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedItem {
    pub location: EntryLocation,
    pub namespace_index: u8,
    pub namespace: String,
    pub key: String,
    pub chunk_index: u8,
    pub value: KvsValue,
    pub header_crc_valid: bool,
    /// `None` for fixed-width types, which carry no separate data CRC.
    pub data_crc_valid: Option<bool>,
}

/// Decode results for one page.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPage {
    pub offset: u64,
    pub state: PageState,
    pub sequence: u32,
    pub header_crc_valid: bool,
    pub items: Vec<ParsedItem>,
    pub issues: Vec<StructuralIssue>,
}
