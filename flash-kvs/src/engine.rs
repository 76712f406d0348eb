//! Two-pass partition parser plus the add/delete/update/find mutators.
//!
//! Every operation here borrows a [`flash_store::SparseImageStore`] for its
//! own duration; the engine itself holds no state between calls. Mutators
//! queue their changes as pending writes on the store exactly like any
//! other caller would — `flush()` is the caller's call, not this crate's.

use std::collections::HashMap;

use flash_store::SparseImageStore;
use log::{debug, trace, warn};

use crate::crc::crc32;
use crate::error::{Error, Result};
use crate::page::{
    self, entry_header_crc, header_crc, page_offset, slot_offset, PageState, SlotState,
    BITMAP_OFFSET, BITMAP_SIZE, ENTRIES_PER_PAGE, ENTRY_SIZE, KEY_LEN, PAGE_HEADER_SIZE,
    PAGE_SIZE, PAGE_STATE_ACTIVE,
};
use crate::types::{DataType, EntryLocation, KvsValue, ParsedItem, ParsedPage, StructuralIssue};

const CHUNK_INDEX_NONE: u8 = 0xFF;

struct RawItem {
    page_idx: usize,
    slot: usize,
    ns_index: u8,
    data_type: DataType,
    chunk_index: u8,
    span: u8,
    key: String,
    value: KvsValue,
    header_crc_valid: bool,
    data_crc_valid: Option<bool>,
}

#[derive(Clone)]
struct RawChunk {
    page_idx: usize,
    slot: usize,
    chunk_index: u8,
    data: Vec<u8>,
}

struct BlobIndexEntry {
    page_idx: usize,
    slot: usize,
    ns_index: u8,
    key: String,
    total_size: u32,
    chunk_count: u8,
    chunk_start_index: u8,
    header_crc_valid: bool,
}

fn num_pages(partition_len: u64) -> usize {
    (partition_len / PAGE_SIZE as u64) as usize
}

fn decode_key(key_bytes: &[u8]) -> std::result::Result<String, String> {
    let end = key_bytes.iter().position(|&b| b == 0).unwrap_or(key_bytes.len());
    if end == 0 {
        return Err("empty key".to_string());
    }
    for &b in &key_bytes[..end] {
        if !(0x20..=0x7E).contains(&b) {
            return Err(format!("non-printable byte 0x{b:02x} in key"));
        }
    }
    Ok(String::from_utf8_lossy(&key_bytes[..end]).into_owned())
}

fn le_u16(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}
fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}
fn le_u64(b: &[u8]) -> u64 {
    u64::from_le_bytes(b.try_into().unwrap())
}

fn decode_fixed(data_type: DataType, value_area: &[u8]) -> KvsValue {
    match data_type {
        DataType::U8 => KvsValue::U8(value_area[0]),
        DataType::I8 => KvsValue::I8(value_area[0] as i8),
        DataType::U16 => KvsValue::U16(le_u16(value_area)),
        DataType::I16 => KvsValue::I16(le_u16(value_area) as i16),
        DataType::U32 => KvsValue::U32(le_u32(value_area)),
        DataType::I32 => KvsValue::I32(le_u32(value_area) as i32),
        DataType::U64 => KvsValue::U64(le_u64(value_area)),
        DataType::I64 => KvsValue::I64(le_u64(value_area) as i64),
        DataType::String | DataType::Blob | DataType::BlobIndex => {
            unreachable!("decode_fixed called with a variable-length type")
        }
    }
}

/// Parses every non-skippable page of `[base, base+len)` into structured
/// pages and items, resolving namespace names and checking checksums.
pub fn parse(store: &mut SparseImageStore, base: u64, len: u64) -> Result<Vec<ParsedPage>> {
    let pages = num_pages(len);
    let mut namespace_map: HashMap<u8, String> = HashMap::new();
    let mut raw_items: Vec<RawItem> = Vec::new();
    let mut blob_chunks: HashMap<(u8, String), Vec<RawChunk>> = HashMap::new();
    let mut blob_indices: Vec<BlobIndexEntry> = Vec::new();
    let mut page_meta: Vec<(u64, PageState, u32, bool)> = Vec::with_capacity(pages);
    let mut issues: Vec<StructuralIssue> = Vec::new();

    for page_idx in 0..pages {
        let page_base = page_offset(base, page_idx);
        let page_bytes = store.read_sync(page_base, PAGE_SIZE as u64)?;

        let state_word = le_u32(&page_bytes[0..4]);
        let state = PageState::decode(state_word);
        let sequence = le_u32(&page_bytes[4..8]);
        let mut header: [u8; PAGE_HEADER_SIZE] = [0; PAGE_HEADER_SIZE];
        header.copy_from_slice(&page_bytes[0..PAGE_HEADER_SIZE]);
        let stored_header_crc = le_u32(&page_bytes[28..32]);
        let header_crc_valid = stored_header_crc == header_crc(&header);
        page_meta.push((page_base, state, sequence, header_crc_valid));

        if state.is_skippable() {
            trace!("page 0x{page_base:x} state {state:?} skipped");
            continue;
        }

        let bitmap_start = BITMAP_OFFSET;
        let mut bitmap: [u8; BITMAP_SIZE] = [0; BITMAP_SIZE];
        bitmap.copy_from_slice(&page_bytes[bitmap_start..bitmap_start + BITMAP_SIZE]);

        let mut slot = 0usize;
        while slot < ENTRIES_PER_PAGE {
            if page::slot_state(&bitmap, slot) != SlotState::Written {
                slot += 1;
                continue;
            }

            let off = page::slot_offset(page_base, slot) as usize - page_base as usize;
            let entry = &page_bytes[off..off + ENTRY_SIZE];
            let mut entry_arr: [u8; ENTRY_SIZE] = [0; ENTRY_SIZE];
            entry_arr.copy_from_slice(entry);

            let ns_index = entry[0];
            let type_code = entry[1];
            let span = entry[2];
            let chunk_index = entry[3];
            let stored_crc = le_u32(&entry[4..8]);
            let header_crc_valid = stored_crc == entry_header_crc(&entry_arr);
            let value_area = &entry[24..32];

            if !(1..=ENTRIES_PER_PAGE as u8).contains(&span) {
                issues.push(StructuralIssue {
                    page_offset: page_base,
                    slot_index: slot,
                    description: format!("invalid span {span}"),
                });
                slot += 1;
                continue;
            }

            let key = match decode_key(&entry[8..8 + KEY_LEN]) {
                Ok(k) => k,
                Err(msg) => {
                    issues.push(StructuralIssue {
                        page_offset: page_base,
                        slot_index: slot,
                        description: msg,
                    });
                    slot += span as usize;
                    continue;
                }
            };

            let Some(data_type) = DataType::from_code(type_code) else {
                issues.push(StructuralIssue {
                    page_offset: page_base,
                    slot_index: slot,
                    description: format!("unknown data type code 0x{type_code:02x}"),
                });
                slot += span as usize;
                continue;
            };

            if ns_index == 0 && data_type == DataType::U8 {
                let assigned = value_area[0];
                if let Some(existing) = namespace_map.get(&assigned) {
                    if existing != &key {
                        issues.push(StructuralIssue {
                            page_offset: page_base,
                            slot_index: slot,
                            description: format!(
                                "duplicate namespace index {assigned}: '{key}' conflicts with '{existing}'"
                            ),
                        });
                    }
                } else {
                    namespace_map.insert(assigned, key);
                }
                slot += span as usize;
                continue;
            }

            match data_type {
                dt if dt.is_fixed_width() => {
                    let value = decode_fixed(dt, value_area);
                    raw_items.push(RawItem {
                        page_idx,
                        slot,
                        ns_index,
                        data_type: dt,
                        chunk_index,
                        span,
                        key,
                        value,
                        header_crc_valid,
                        data_crc_valid: None,
                    });
                }
                DataType::BlobIndex => {
                    if span != 1 {
                        issues.push(StructuralIssue {
                            page_offset: page_base,
                            slot_index: slot,
                            description: format!("BlobIndex span {span} must be 1"),
                        });
                    }
                    blob_indices.push(BlobIndexEntry {
                        page_idx,
                        slot,
                        ns_index,
                        key,
                        total_size: le_u32(&value_area[0..4]),
                        chunk_count: value_area[4],
                        chunk_start_index: value_area[5],
                        header_crc_valid,
                    });
                }
                DataType::String | DataType::Blob => {
                    let declared_len = le_u16(&value_area[0..2]) as usize;
                    let reserved = le_u16(&value_area[2..4]);
                    let stored_data_crc = le_u32(&value_area[4..8]);
                    if reserved != 0 {
                        issues.push(StructuralIssue {
                            page_offset: page_base,
                            slot_index: slot,
                            description: format!("unexpected reserved field 0x{reserved:04x}"),
                        });
                    }

                    let expected_span = 1 + declared_len.div_ceil(32);
                    if expected_span != span as usize {
                        issues.push(StructuralIssue {
                            page_offset: page_base,
                            slot_index: slot,
                            description: format!(
                                "span {span} does not match declared length {declared_len} (expected {expected_span})"
                            ),
                        });
                    }

                    let mut data = Vec::with_capacity(declared_len.min((span as usize - 1) * 32));
                    for i in 0..(span as usize - 1) {
                        let data_slot = slot + 1 + i;
                        if data_slot >= ENTRIES_PER_PAGE {
                            break;
                        }
                        if page::slot_state(&bitmap, data_slot) != SlotState::Written {
                            issues.push(StructuralIssue {
                                page_offset: page_base,
                                slot_index: slot,
                                description: format!(
                                    "data sub-slot {data_slot} is not marked Written"
                                ),
                            });
                        }
                        let doff = page::slot_offset(page_base, data_slot) as usize
                            - page_base as usize;
                        data.extend_from_slice(&page_bytes[doff..doff + ENTRY_SIZE]);
                    }
                    data.truncate(declared_len);
                    let data_crc_valid = Some(stored_data_crc == crc32(&data));

                    // `chunk_index == CHUNK_INDEX_NONE` is the normal
                    // standalone-blob case (what `add_item`'s Blob path
                    // always writes): it's a complete item on its own and
                    // never resolved against a `BlobIndex`, so only blobs
                    // carrying a real chunk index go into `blob_chunks`.
                    if data_type == DataType::Blob && chunk_index != CHUNK_INDEX_NONE {
                        blob_chunks.entry((ns_index, key.clone())).or_default().push(RawChunk {
                            page_idx,
                            slot,
                            chunk_index,
                            data: data.clone(),
                        });
                    }

                    let value = if data_type == DataType::String {
                        match String::from_utf8(data) {
                            Ok(s) => KvsValue::String(s),
                            Err(_) => {
                                issues.push(StructuralIssue {
                                    page_offset: page_base,
                                    slot_index: slot,
                                    description: "string value is not valid UTF-8".to_string(),
                                });
                                KvsValue::String(String::new())
                            }
                        }
                    } else {
                        KvsValue::Blob(data)
                    };

                    raw_items.push(RawItem {
                        page_idx,
                        slot,
                        ns_index,
                        data_type,
                        chunk_index,
                        span,
                        key,
                        value,
                        header_crc_valid,
                        data_crc_valid,
                    });
                }
            }

            slot += span as usize;
        }
    }

    // Resolve blob-index entries against the collected chunks; chunked
    // entries don't appear standalone in the output, only as the
    // assembled item at the index entry's location.
    let mut consumed: std::collections::HashSet<(usize, usize)> = std::collections::HashSet::new();
    let mut assembled: Vec<RawItem> = Vec::new();
    for idx in &blob_indices {
        let key_tuple = (idx.ns_index, idx.key.clone());
        let mut chunks = blob_chunks.remove(&key_tuple).unwrap_or_default();
        chunks.sort_by_key(|c| c.chunk_index);
        if chunks.len() != idx.chunk_count as usize {
            issues.push(StructuralIssue {
                page_offset: page_offset(base, idx.page_idx),
                slot_index: idx.slot,
                description: format!(
                    "BlobIndex for '{}' expects {} chunks but {} were found",
                    idx.key,
                    idx.chunk_count,
                    chunks.len()
                ),
            });
        } else {
            for (i, c) in chunks.iter().enumerate() {
                let expected = idx.chunk_start_index.wrapping_add(i as u8);
                if c.chunk_index != expected {
                    issues.push(StructuralIssue {
                        page_offset: page_offset(base, idx.page_idx),
                        slot_index: idx.slot,
                        description: format!(
                            "BlobIndex for '{}' chunk {} has index {} but expected {} (chunk_start_index {})",
                            idx.key, i, c.chunk_index, expected, idx.chunk_start_index
                        ),
                    });
                }
            }
        }
        for c in &chunks {
            consumed.insert((c.page_idx, c.slot));
        }
        let mut data: Vec<u8> = Vec::new();
        for c in &chunks {
            data.extend_from_slice(&c.data);
        }
        data.truncate(idx.total_size as usize);
        assembled.push(RawItem {
            page_idx: idx.page_idx,
            slot: idx.slot,
            ns_index: idx.ns_index,
            data_type: DataType::Blob,
            chunk_index: CHUNK_INDEX_NONE,
            span: 1,
            key: idx.key.clone(),
            value: KvsValue::Blob(data),
            header_crc_valid: idx.header_crc_valid,
            data_crc_valid: Some(chunks.len() == idx.chunk_count as usize),
        });
    }
    // Anything still in `blob_chunks` here carries a real (non-`NONE`)
    // chunk index with no `BlobIndex` entry to resolve it against — a
    // genuinely broken chunk link, not a standalone blob (those never
    // entered the map in the first place).
    if !blob_chunks.is_empty() {
        for (ns_index, key) in blob_chunks.keys() {
            warn!("orphaned blob chunk(s) for namespace index {ns_index}, key '{key}' with no BlobIndex");
        }
    }

    raw_items.retain(|item| !consumed.contains(&(item.page_idx, item.slot)));
    raw_items.extend(assembled);

    let mut pages_out: Vec<ParsedPage> = page_meta
        .into_iter()
        .map(|(offset, state, sequence, header_crc_valid)| ParsedPage {
            offset,
            state,
            sequence,
            header_crc_valid,
            items: Vec::new(),
            issues: Vec::new(),
        })
        .collect();
    for issue in issues {
        if let Some(p) = pages_out.iter_mut().find(|p| p.offset == issue.page_offset) {
            p.issues.push(issue);
        }
    }

    for raw in raw_items {
        let namespace = namespace_map
            .get(&raw.ns_index)
            .cloned()
            .unwrap_or_else(|| format!("ns_{}", raw.ns_index));
        let page_base = page_offset(base, raw.page_idx);
        let item = ParsedItem {
            location: EntryLocation {
                page_offset: page_base,
                slot_index: raw.slot,
                byte_offset: slot_offset(page_base, raw.slot),
                span: raw.span,
            },
            namespace_index: raw.ns_index,
            namespace,
            key: raw.key,
            chunk_index: raw.chunk_index,
            value: raw.value,
            header_crc_valid: raw.header_crc_valid,
            data_crc_valid: raw.data_crc_valid,
        };
        if let Some(p) = pages_out.iter_mut().find(|p| p.offset == page_base) {
            p.items.push(item);
        }
    }
    for p in &mut pages_out {
        p.items.sort_by_key(|i| i.location.slot_index);
    }

    Ok(pages_out)
}

/// Builds the map of assigned namespace indices to names by scanning every
/// page's namespace-definition entries (`ns_index == 0`, type `U8`).
fn collect_namespace_map(store: &mut SparseImageStore, base: u64, len: u64) -> Result<HashMap<u8, String>> {
    let mut map = HashMap::new();
    for page_idx in 0..num_pages(len) {
        let page_base = page_offset(base, page_idx);
        let page_bytes = store.read_sync(page_base, PAGE_SIZE as u64)?;
        let state = PageState::decode(le_u32(&page_bytes[0..4]));
        if state.is_skippable() {
            continue;
        }
        let mut bitmap: [u8; BITMAP_SIZE] = [0; BITMAP_SIZE];
        bitmap.copy_from_slice(&page_bytes[BITMAP_OFFSET..BITMAP_OFFSET + BITMAP_SIZE]);

        let mut slot = 0usize;
        while slot < ENTRIES_PER_PAGE {
            if page::slot_state(&bitmap, slot) != SlotState::Written {
                slot += 1;
                continue;
            }
            let off = page::slot_offset(page_base, slot) as usize - page_base as usize;
            let entry = &page_bytes[off..off + ENTRY_SIZE];
            let span = entry[2];
            if !(1..=ENTRIES_PER_PAGE as u8).contains(&span) {
                slot += 1;
                continue;
            }
            if entry[0] == 0 && entry[1] == DataType::U8.code() {
                if let Ok(key) = decode_key(&entry[8..8 + KEY_LEN]) {
                    map.entry(entry[24]).or_insert(key);
                }
            }
            slot += span as usize;
        }
    }
    Ok(map)
}

fn encode_key(key: &str) -> Result<[u8; KEY_LEN]> {
    if key.is_empty() || key.len() > KEY_LEN - 1 {
        return Err(Error::InvalidValue(format!(
            "key '{key}' must be 1..={} printable ASCII bytes",
            KEY_LEN - 1
        )));
    }
    if !key.bytes().all(|b| (0x20..=0x7E).contains(&b)) {
        return Err(Error::InvalidValue(format!("key '{key}' is not printable ASCII")));
    }
    let mut buf = [0u8; KEY_LEN];
    buf[..key.len()].copy_from_slice(key.as_bytes());
    Ok(buf)
}

fn encode_entry(
    ns_index: u8,
    data_type: DataType,
    span: u8,
    chunk_index: u8,
    key: &str,
    value_area: [u8; 8],
) -> Result<[u8; ENTRY_SIZE]> {
    let key_bytes = encode_key(key)?;
    let mut entry = [0u8; ENTRY_SIZE];
    entry[0] = ns_index;
    entry[1] = data_type.code();
    entry[2] = span;
    entry[3] = chunk_index;
    entry[8..24].copy_from_slice(&key_bytes);
    entry[24..32].copy_from_slice(&value_area);
    let crc = entry_header_crc(&entry);
    entry[4..8].copy_from_slice(&crc.to_le_bytes());
    Ok(entry)
}

fn encode_fixed_value_area(value: &KvsValue) -> Result<[u8; 8]> {
    let mut area = [0u8; 8];
    match value {
        KvsValue::U8(v) => area[0] = *v,
        KvsValue::I8(v) => area[0] = *v as u8,
        KvsValue::U16(v) => area[0..2].copy_from_slice(&v.to_le_bytes()),
        KvsValue::I16(v) => area[0..2].copy_from_slice(&v.to_le_bytes()),
        KvsValue::U32(v) => area[0..4].copy_from_slice(&v.to_le_bytes()),
        KvsValue::I32(v) => area[0..4].copy_from_slice(&v.to_le_bytes()),
        KvsValue::U64(v) => area[0..8].copy_from_slice(&v.to_le_bytes()),
        KvsValue::I64(v) => area[0..8].copy_from_slice(&v.to_le_bytes()),
        KvsValue::String(_) | KvsValue::Blob(_) => {
            return Err(Error::InvalidValue("not a fixed-width value".to_string()))
        }
    }
    Ok(area)
}

/// Parses whitespace-separated hexadecimal byte pairs into a blob payload,
/// applying the add-path's length validation. A convenience for front
/// ends; the engine itself never calls this on an already-typed `KvsValue`.
pub fn parse_hex_blob(text: &str) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for token in text.split_whitespace() {
        let byte = u8::from_str_radix(token, 16)
            .map_err(|_| Error::InvalidValue(format!("'{token}' is not a hex byte pair")))?;
        bytes.push(byte);
    }
    if bytes.len() > 64 {
        return Err(Error::InvalidValue(format!(
            "blob payload is {} bytes, exceeds the 64-byte limit",
            bytes.len()
        )));
    }
    Ok(bytes)
}

fn validate_value(value: &KvsValue) -> Result<()> {
    match value {
        KvsValue::String(s) if s.len() > 64 => Err(Error::InvalidValue(format!(
            "string payload is {} bytes, exceeds the 64-byte limit",
            s.len()
        ))),
        KvsValue::Blob(b) if b.len() > 64 => Err(Error::InvalidValue(format!(
            "blob payload is {} bytes, exceeds the 64-byte limit",
            b.len()
        ))),
        _ => Ok(()),
    }
}

/// Scans all pages to collect used namespace indices and checks for a name
/// collision, then assigns and writes a new namespace-definition entry.
pub fn add_namespace(store: &mut SparseImageStore, base: u64, len: u64, name: &str) -> Result<u8> {
    let map = collect_namespace_map(store, base, len)?;
    if map.values().any(|existing| existing == name) {
        return Err(Error::Conflict(name.to_string()));
    }
    let assigned = (1u8..=254)
        .find(|i| !map.contains_key(i))
        .ok_or(Error::Exhausted("no unused namespace index in 1..=254"))?;

    let (page_base, slot) = find_free_span(store, base, len, 1)?;
    let value_area = {
        let mut a = [0u8; 8];
        a[0] = assigned;
        a
    };
    let entry = encode_entry(0, DataType::U8, 1, CHUNK_INDEX_NONE, name, value_area)?;
    write_entry_and_mark(store, page_base, slot, 1, &[entry.to_vec()])?;
    debug!("add_namespace '{name}' assigned index {assigned} at page 0x{page_base:x} slot {slot}");
    Ok(assigned)
}

fn resolve_namespace(store: &mut SparseImageStore, base: u64, len: u64, name: &str) -> Result<u8> {
    let map = collect_namespace_map(store, base, len)?;
    map.iter()
        .find(|(_, n)| n.as_str() == name)
        .map(|(&idx, _)| idx)
        .ok_or_else(|| Error::NotFound { namespace: name.to_string(), key: String::new() })
}

/// Finds `span` consecutive non-`Written` slots within a single `Active`
/// or `Full` page, returning that page's base address and the first slot.
/// If no page has been activated yet (a freshly erased partition, every
/// page still `Uninit`), the first page is activated before the search —
/// real devices make exactly this transition on the first write to a
/// blank partition.
fn find_free_span(store: &mut SparseImageStore, base: u64, len: u64, span: u8) -> Result<(u64, usize)> {
    let mut first_uninit: Option<u64> = None;
    for page_idx in 0..num_pages(len) {
        let page_base = page_offset(base, page_idx);
        let page_bytes = store.read_sync(page_base, PAGE_SIZE as u64)?;
        let state = PageState::decode(le_u32(&page_bytes[0..4]));
        if state == PageState::Uninit && first_uninit.is_none() {
            first_uninit = Some(page_base);
        }
        if !state.accepts_new_entries() {
            continue;
        }
        let mut bitmap: [u8; BITMAP_SIZE] = [0; BITMAP_SIZE];
        bitmap.copy_from_slice(&page_bytes[BITMAP_OFFSET..BITMAP_OFFSET + BITMAP_SIZE]);

        let mut run_start = None;
        let mut run_len = 0u8;
        for slot in 0..ENTRIES_PER_PAGE {
            if page::slot_state(&bitmap, slot).is_free() {
                if run_start.is_none() {
                    run_start = Some(slot);
                }
                run_len += 1;
                if run_len >= span {
                    return Ok((page_base, run_start.unwrap()));
                }
            } else {
                run_start = None;
                run_len = 0;
            }
        }
    }

    if let Some(page_base) = first_uninit {
        activate_page(store, page_base)?;
        return Ok((page_base, 0));
    }
    Err(Error::Exhausted("no page has a free run of slots for this item"))
}

/// Writes a page header that transitions a blank (`Uninit`) page to
/// `Active`, sequence 0. The entry-state bitmap and entry slots are left
/// untouched: erased flash already decodes every slot as `Empty`.
fn activate_page(store: &mut SparseImageStore, page_base: u64) -> Result<()> {
    let mut header = [0u8; PAGE_HEADER_SIZE];
    header[0..4].copy_from_slice(&PAGE_STATE_ACTIVE.to_le_bytes());
    let crc = header_crc(&header);
    header[28..32].copy_from_slice(&crc.to_le_bytes());
    store.write(page_base, &header)?;
    debug!("activated page 0x{page_base:x}");
    Ok(())
}

/// Writes `slots` (already-encoded 32-byte buffers) starting at `slot` in
/// the page at `page_base`, then flips their bitmap bits to `Written`.
fn write_entry_and_mark(
    store: &mut SparseImageStore,
    page_base: u64,
    slot: usize,
    span: u8,
    slots: &[Vec<u8>],
) -> Result<()> {
    for (i, bytes) in slots.iter().enumerate() {
        store.write(page::slot_offset(page_base, slot + i), bytes)?;
    }
    set_bitmap_run(store, page_base, slot, span, SlotState::Written)?;
    Ok(())
}

/// Reads the page's bitmap, flips `span` consecutive slots starting at
/// `slot` to `state`, and writes the whole bitmap back.
fn set_bitmap_run(
    store: &mut SparseImageStore,
    page_base: u64,
    slot: usize,
    span: u8,
    state: SlotState,
) -> Result<()> {
    let current = store.read_sync(page_base + BITMAP_OFFSET as u64, BITMAP_SIZE as u64)?;
    let mut bitmap: [u8; BITMAP_SIZE] = [0; BITMAP_SIZE];
    bitmap.copy_from_slice(&current);
    for i in 0..span as usize {
        page::set_slot_state(&mut bitmap, slot + i, state);
    }
    store.write(page_base + BITMAP_OFFSET as u64, &bitmap)?;
    Ok(())
}

/// Constructs and writes the entry sequence for `value`, resolving `ns`'s
/// index first.
pub fn add_item(
    store: &mut SparseImageStore,
    base: u64,
    len: u64,
    ns: &str,
    key: &str,
    value: KvsValue,
) -> Result<EntryLocation> {
    validate_value(&value)?;
    let ns_index = resolve_namespace(store, base, len, ns)?;

    let (span, slots) = match &value {
        KvsValue::String(s) => {
            let data = s.as_bytes();
            let span = 1 + data.len().div_ceil(32);
            let mut value_area = [0u8; 8];
            value_area[0..2].copy_from_slice(&(data.len() as u16).to_le_bytes());
            value_area[4..8].copy_from_slice(&crc32(data).to_le_bytes());
            let header = encode_entry(ns_index, DataType::String, span as u8, CHUNK_INDEX_NONE, key, value_area)?;
            let mut slots = vec![header.to_vec()];
            slots.extend(pad_to_slots(data));
            (span as u8, slots)
        }
        KvsValue::Blob(b) => {
            let span = 1 + b.len().div_ceil(32);
            let mut value_area = [0u8; 8];
            value_area[0..2].copy_from_slice(&(b.len() as u16).to_le_bytes());
            value_area[4..8].copy_from_slice(&crc32(b).to_le_bytes());
            let header = encode_entry(ns_index, DataType::Blob, span as u8, CHUNK_INDEX_NONE, key, value_area)?;
            let mut slots = vec![header.to_vec()];
            slots.extend(pad_to_slots(b));
            (span as u8, slots)
        }
        fixed => {
            let value_area = encode_fixed_value_area(fixed)?;
            let entry = encode_entry(ns_index, fixed.data_type(), 1, CHUNK_INDEX_NONE, key, value_area)?;
            (1u8, vec![entry.to_vec()])
        }
    };

    let (page_base, slot) = find_free_span(store, base, len, span)?;
    write_entry_and_mark(store, page_base, slot, span, &slots)?;
    trace!("add_item ns='{ns}' key='{key}' at page 0x{page_base:x} slot {slot} span {span}");
    Ok(EntryLocation {
        page_offset: page_base,
        slot_index: slot,
        byte_offset: slot_offset(page_base, slot),
        span,
    })
}

fn pad_to_slots(data: &[u8]) -> Vec<Vec<u8>> {
    let slot_count = data.len().div_ceil(32).max(if data.is_empty() { 0 } else { 1 });
    let mut out = Vec::with_capacity(slot_count);
    for i in 0..slot_count {
        let start = i * 32;
        let end = (start + 32).min(data.len());
        let mut slot = vec![0xFFu8; 32];
        slot[..end - start].copy_from_slice(&data[start..end]);
        out.push(slot);
    }
    out
}

/// Finds the first slot within `[base, base+len)` matching `(ns, key)`,
/// resolving each candidate entry's namespace index against `target_index`.
fn scan_for_item(
    store: &mut SparseImageStore,
    base: u64,
    len: u64,
    target_index: u8,
    key: &str,
) -> Result<Option<EntryLocation>> {
    for page_idx in 0..num_pages(len) {
        let page_base = page_offset(base, page_idx);
        let page_bytes = store.read_sync(page_base, PAGE_SIZE as u64)?;
        let state = PageState::decode(le_u32(&page_bytes[0..4]));
        if state.is_skippable() {
            continue;
        }
        let mut bitmap: [u8; BITMAP_SIZE] = [0; BITMAP_SIZE];
        bitmap.copy_from_slice(&page_bytes[BITMAP_OFFSET..BITMAP_OFFSET + BITMAP_SIZE]);

        let mut slot = 0usize;
        while slot < ENTRIES_PER_PAGE {
            if page::slot_state(&bitmap, slot) != SlotState::Written {
                slot += 1;
                continue;
            }
            let off = page::slot_offset(page_base, slot) as usize - page_base as usize;
            let entry = &page_bytes[off..off + ENTRY_SIZE];
            let span = entry[2];
            if !(1..=ENTRIES_PER_PAGE as u8).contains(&span) {
                slot += 1;
                continue;
            }
            if entry[0] == target_index {
                if let Ok(entry_key) = decode_key(&entry[8..8 + KEY_LEN]) {
                    if entry_key == key {
                        return Ok(Some(EntryLocation {
                            page_offset: page_base,
                            slot_index: slot,
                            byte_offset: slot_offset(page_base, slot),
                            span,
                        }));
                    }
                }
            }
            slot += span as usize;
        }
    }
    Ok(None)
}

pub fn find_item(
    store: &mut SparseImageStore,
    base: u64,
    len: u64,
    ns: &str,
    key: &str,
) -> Result<Option<EntryLocation>> {
    let Some(ns_index) = resolve_ns_optional(store, base, len, ns)? else {
        return Ok(None);
    };
    scan_for_item(store, base, len, ns_index, key)
}

fn resolve_ns_optional(store: &mut SparseImageStore, base: u64, len: u64, ns: &str) -> Result<Option<u8>> {
    let map = collect_namespace_map(store, base, len)?;
    Ok(map.iter().find(|(_, n)| n.as_str() == ns).map(|(&idx, _)| idx))
}

/// Overwrites every slot the found entry spans with `0xFF` and flips its
/// bitmap bits to `Empty`.
pub fn delete_item(store: &mut SparseImageStore, base: u64, len: u64, ns: &str, key: &str) -> Result<()> {
    let location = find_item(store, base, len, ns, key)?.ok_or_else(|| Error::NotFound {
        namespace: ns.to_string(),
        key: key.to_string(),
    })?;
    for i in 0..location.span as usize {
        store.write(page::slot_offset(location.page_offset, location.slot_index + i), &[0xFFu8; ENTRY_SIZE])?;
    }
    set_bitmap_run(store, location.page_offset, location.slot_index, location.span, SlotState::Empty)?;
    debug!("delete_item ns='{ns}' key='{key}' at page 0x{:x} slot {}", location.page_offset, location.slot_index);
    Ok(())
}

/// Specified as delete-then-add; a not-found delete is not fatal.
pub fn update_item(
    store: &mut SparseImageStore,
    base: u64,
    len: u64,
    ns: &str,
    key: &str,
    value: KvsValue,
) -> Result<EntryLocation> {
    match delete_item(store, base, len, ns, key) {
        Ok(()) | Err(Error::NotFound { .. }) => {}
        Err(e) => return Err(e),
    }
    add_item(store, base, len, ns, key, value)
}
