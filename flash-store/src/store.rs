use std::sync::Mutex;

use flash_segment::{Segment, SegmentList, ERASED_BYTE};
use log::{debug, trace, warn};

use crate::callbacks::{FlushPrepareCallback, ReadCallback, WriteCallback};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::stats::Stats;

/// A lazy, sector-aware, copy-on-write cache of a flash device's address
/// space.
///
/// It owns two [`SegmentList`]s — a read cache and a pending-write list —
/// and mediates every read and write against them, invoking the caller's
/// callbacks only when the caches can't already answer the request. See
/// `spec.md` §4.2 for the read/write/flush algorithms this implements.
pub struct SparseImageStore {
    size: u64,
    config: StoreConfig,
    read_list: SegmentList,
    pending_list: SegmentList,
    read_cb: Option<Box<dyn ReadCallback + Send>>,
    write_cb: Option<Box<dyn WriteCallback + Send>>,
    flush_prepare_cb: Option<Box<dyn FlushPrepareCallback + Send>>,
    /// Serializes the read-fetch critical section so that at most one
    /// callback invocation is in flight and queued callers observe its
    /// result in FIFO order (`spec.md` §5).
    fetch_lock: Mutex<()>,
}

impl SparseImageStore {
    pub fn new(size: u64, sector_size: u64) -> Self {
        Self::with_config(size, StoreConfig::new().sector_size(sector_size))
    }

    pub fn with_config(size: u64, config: StoreConfig) -> Self {
        Self {
            size,
            config,
            read_list: SegmentList::new(),
            pending_list: SegmentList::new(),
            read_cb: None,
            write_cb: None,
            flush_prepare_cb: None,
            fetch_lock: Mutex::new(()),
        }
    }

    /// A store seeded from an in-memory buffer: the whole buffer becomes a
    /// single read segment at address 0, and the store's size is the
    /// buffer's length.
    pub fn from_backing(bytes: Vec<u8>, sector_size: u64) -> Self {
        let mut store = Self::new(bytes.len() as u64, sector_size);
        store.read_list.insert(0, &bytes);
        store
    }

    pub fn with_read_callback(mut self, cb: impl ReadCallback + Send + 'static) -> Self {
        self.read_cb = Some(Box::new(cb));
        self
    }

    pub fn with_write_callback(mut self, cb: impl WriteCallback + Send + 'static) -> Self {
        self.write_cb = Some(Box::new(cb));
        self
    }

    pub fn with_flush_prepare_callback(
        mut self,
        cb: impl FlushPrepareCallback + Send + 'static,
    ) -> Self {
        self.flush_prepare_cb = Some(Box::new(cb));
        self
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn sector_size(&self) -> u64 {
        self.config.sector_size
    }

    // ---- read path -----------------------------------------------------

    /// Fills the read cache across `[addr, addr+len)`, invoking the read
    /// callback (if any) for every uncovered sub-range until the range is
    /// covered or the retry budget is exhausted.
    pub fn ensure(&mut self, addr: u64, len: u64) -> Result<()> {
        self.check_range(addr, len)?;
        if len == 0 {
            return Ok(());
        }
        let _guard = self.fetch_lock.lock().unwrap();

        let mut non_progress_retries = 0u32;
        loop {
            let gap = match self.first_effective_gap(addr, len) {
                None => return Ok(()),
                Some(gap) => gap,
            };

            let Some(cb) = self.read_cb.as_mut() else {
                // No callback configured: gaps are zero-filled directly,
                // distinct from the 0xFF sentinel used when nothing has
                // been fetched at all (`spec.md` §4.2). Filling one gap can
                // still leave others in `[addr, addr+len)` uncovered (e.g. a
                // prior write left a cached island in the middle), so loop
                // back around rather than returning after the first.
                self.read_list.insert(gap.0, &vec![0u8; gap.1 as usize]);
                continue;
            };

            trace!("fetching gap addr=0x{:x} len=0x{:x}", gap.0, gap.1);
            let reply = cb.read(gap.0, gap.1).map_err(Error::CallbackFailure)?;
            let (reply_addr, reply_bytes) = reply.into_addr_bytes(gap.0);

            if !reply_bytes.is_empty() {
                let reply_hi = reply_addr + reply_bytes.len() as u64;
                if reply_hi <= gap.0 || reply_addr >= gap.0 + gap.1 {
                    warn!(
                        "read callback reply [0x{:x}, 0x{:x}) landed entirely outside requested gap [0x{:x}, 0x{:x}); accepting it anyway",
                        reply_addr, reply_hi, gap.0, gap.0 + gap.1
                    );
                }
                self.read_list.insert(reply_addr, &reply_bytes);
            }

            match self.first_effective_gap(gap.0, gap.1) {
                Some(still) if still == gap => {
                    non_progress_retries += 1;
                    if non_progress_retries >= self.config.max_read_retries {
                        warn!(
                            "read retry budget exhausted at addr=0x{:x} len=0x{:x}; filling with erased sentinel",
                            gap.0, gap.1
                        );
                        self.read_list.insert(gap.0, &vec![ERASED_BYTE; gap.1 as usize]);
                        return Ok(());
                    }
                }
                _ => non_progress_retries = 0,
            }
        }
    }

    pub fn read_sync(&mut self, addr: u64, len: u64) -> Result<Vec<u8>> {
        self.ensure(addr, len)?;
        Ok(self.effective_materialize(addr, addr + len))
    }

    /// Identical to [`Self::read_sync`]: this crate's device callbacks are
    /// ordinary blocking trait calls rather than `Future`s (see
    /// DESIGN.md), so there is no separate asynchronous code path to run.
    pub fn read_async(&mut self, addr: u64, len: u64) -> Result<Vec<u8>> {
        self.read_sync(addr, len)
    }

    /// Single-byte read against the effective view. Assumes the byte has
    /// already been materialized by a prior `ensure`/`read_*` call; an
    /// uncovered address yields the erased-flash sentinel rather than
    /// triggering a fetch.
    pub fn byte_at(&self, addr: u64) -> u8 {
        self.effective_byte(addr)
    }

    /// Range-copy against the effective view, assuming the range has
    /// already been materialized (see [`Self::byte_at`]).
    pub fn copy_range_sync(&self, addr: u64, len: u64) -> Vec<u8> {
        self.effective_materialize(addr, addr + len)
    }

    /// Ensures `[addr, addr+len)` is covered (fetching through the read
    /// callback if needed), then copies it out. The ensure-then-copy
    /// counterpart to [`Self::copy_range_sync`], mirroring how
    /// [`Self::read_async`] relates to [`Self::read_sync`].
    pub fn copy_range_async(&mut self, addr: u64, len: u64) -> Result<Vec<u8>> {
        self.ensure(addr, len)?;
        Ok(self.copy_range_sync(addr, len))
    }

    // ---- write path ------------------------------------------------------

    /// Records `bytes` at `addr` into the pending-write list. Purely
    /// in-memory and cannot suspend; see `spec.md` §4.2 for the placement
    /// and pruning rules this implements.
    pub fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        self.check_range(addr, bytes.len() as u64)?;
        if bytes.is_empty() {
            return Ok(());
        }

        let sector_size = self.config.sector_size;
        for (run_addr, run_bytes) in self.differing_runs(addr, bytes) {
            // A run may span several sectors; each sector-aligned slice of
            // it is placed independently, since "materialize the full
            // sector" only makes sense one sector at a time.
            let mut pos = 0usize;
            while pos < run_bytes.len() {
                let cur_addr = run_addr + pos as u64;
                let sector_lo = cur_addr - (cur_addr % sector_size);
                let sector_hi = (sector_lo + sector_size).min(self.size);
                let chunk_end = ((sector_hi - run_addr) as usize).min(run_bytes.len());
                let chunk = &run_bytes[pos..chunk_end];

                if self
                    .first_effective_gap(sector_lo, sector_hi - sector_lo)
                    .is_none()
                {
                    let mut buf = self.effective_materialize(sector_lo, sector_hi);
                    let off = (cur_addr - sector_lo) as usize;
                    buf[off..off + chunk.len()].copy_from_slice(chunk);

                    let read_confirmed = self.read_list.covered(sector_lo, sector_hi - sector_lo);
                    let baseline = self.read_list.materialize(sector_lo, sector_hi);
                    if read_confirmed && buf == baseline {
                        // Matches the read baseline exactly: any pending
                        // bytes previously queued for this sector are now
                        // stale (the effective view must become the plain
                        // baseline), so they're removed rather than kept.
                        trace!("sector 0x{:x} write pruned (matches read baseline)", sector_lo);
                        self.pending_list.remove(sector_lo, sector_hi - sector_lo);
                    } else {
                        trace!("sector 0x{:x} materialized for write", sector_lo);
                        self.pending_list.insert(sector_lo, &buf);
                    }
                } else {
                    trace!(
                        "queuing minimal differing run addr=0x{:x} len=0x{:x} (sector not fully cached)",
                        cur_addr,
                        chunk.len()
                    );
                    self.pending_list.insert(cur_addr, chunk);
                }

                pos = chunk_end;
            }
        }

        self.prune_pending_against_read();
        Ok(())
    }

    pub fn fill(&mut self, value: u8, lo: u64, hi: u64) -> Result<()> {
        assert!(hi >= lo, "fill range must be non-decreasing");
        self.write(lo, &vec![value; (hi - lo) as usize])
    }

    // ---- flush -------------------------------------------------------

    /// Commits pending writes to the device in ascending address order,
    /// then folds both lists into the read cache with pending-overrides-read
    /// semantics and empties the pending list.
    ///
    /// If the write callback fails partway through, everything at a lower
    /// address is treated as committed; the failed segment and everything
    /// at or above it remains pending so the caller can retry.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(mut cb) = self.flush_prepare_cb.take() {
            let result = cb.prepare(self);
            self.flush_prepare_cb = Some(cb);
            result.map_err(Error::CallbackFailure)?;
        }

        let segments: Vec<Segment> = self.pending_list.iter().cloned().collect();

        if let Some(cb) = self.write_cb.as_mut() {
            let mut committed_hi: Option<u64> = None;
            for seg in &segments {
                match cb.write(seg.base, &seg.bytes) {
                    Ok(()) => committed_hi = Some(seg.end()),
                    Err(e) => {
                        warn!(
                            "write callback failed at 0x{:x}; committing up to there and retaining the rest",
                            seg.base
                        );
                        if let Some(hi) = committed_hi {
                            self.commit_pending_below(hi);
                        }
                        return Err(Error::CallbackFailure(e));
                    }
                }
            }
        }

        self.commit_pending_below(u64::MAX);
        debug!("flush committed {} pending segment(s)", segments.len());
        Ok(())
    }

    /// Read-only snapshot of the pending-write list, in ascending address
    /// order. Exposed for introspection by tools built on top of the
    /// store (and by this crate's own tests); `flush` is the only thing
    /// that should ever be used to act on it.
    pub fn pending_segments(&self) -> Vec<Segment> {
        self.pending_list.iter().cloned().collect()
    }

    pub fn stats(&self) -> Stats {
        let pending_bytes = self.pending_list.total_bytes();
        let read_only_bytes: u64 = self
            .read_list
            .iter()
            .map(|seg| {
                // Count only the bytes of this read segment not shadowed by
                // a pending segment, so overlaps aren't double-counted.
                let mut cursor = seg.base;
                let mut counted = 0u64;
                while cursor < seg.end() {
                    match self.pending_list.first_gap(cursor, seg.end() - cursor) {
                        None => break,
                        Some((gap_lo, gap_len)) => {
                            counted += gap_len;
                            cursor = gap_lo + gap_len;
                        }
                    }
                }
                counted
            })
            .sum();
        Stats {
            total_size: self.size,
            cached_bytes: pending_bytes + read_only_bytes,
            read_segment_count: self.read_list.len(),
            pending_segment_count: self.pending_list.len(),
        }
    }

    // ---- internal helpers ----------------------------------------------

    fn check_range(&self, addr: u64, len: u64) -> Result<()> {
        let oob = || Error::out_of_range(addr, len, self.size);
        if len == 0 {
            return if addr > self.size { Err(oob()) } else { Ok(()) };
        }
        if addr >= self.size {
            return Err(oob());
        }
        match addr.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(oob()),
        }
    }

    fn effective_byte(&self, addr: u64) -> u8 {
        self.pending_list
            .byte_at(addr)
            .or_else(|| self.read_list.byte_at(addr))
            .unwrap_or(ERASED_BYTE)
    }

    fn effective_materialize(&self, lo: u64, hi: u64) -> Vec<u8> {
        let mut buf = self.read_list.materialize(lo, hi);
        for seg in self.pending_list.iter() {
            if seg.end() <= lo || seg.base >= hi {
                continue;
            }
            let overlap_lo = seg.base.max(lo);
            let overlap_hi = seg.end().min(hi);
            let src_start = (overlap_lo - seg.base) as usize;
            let src_end = (overlap_hi - seg.base) as usize;
            let dst_start = (overlap_lo - lo) as usize;
            let dst_end = (overlap_hi - lo) as usize;
            buf[dst_start..dst_end].copy_from_slice(&seg.bytes[src_start..src_end]);
        }
        buf
    }

    /// The first sub-range of `[addr, addr+len)` covered by neither list.
    fn first_effective_gap(&self, addr: u64, len: u64) -> Option<(u64, u64)> {
        let hi = addr + len;
        let mut cursor = addr;
        while cursor < hi {
            match self.read_list.first_gap(cursor, hi - cursor) {
                None => return None,
                Some((gap_lo, gap_len)) => match self.pending_list.first_gap(gap_lo, gap_len) {
                    Some(still) => return Some(still),
                    None => cursor = gap_lo + gap_len,
                },
            }
        }
        None
    }

    fn is_cached(&self, addr: u64) -> bool {
        self.pending_list.byte_at(addr).is_some() || self.read_list.byte_at(addr).is_some()
    }

    /// Splits `bytes` into maximal runs that need placement: a byte needs
    /// placement if it differs from the effective view, *or* if it lies in
    /// a region neither list has ever covered. The second clause matters
    /// even when the incoming byte happens to equal the erased-flash
    /// sentinel the effective view defaults to for uncovered bytes — the
    /// store hasn't actually confirmed that byte is erased, so the write
    /// still needs to be placed (and is only pruned later, against the
    /// read baseline, once that baseline is known).
    fn differing_runs<'a>(&self, addr: u64, bytes: &'a [u8]) -> Vec<(u64, &'a [u8])> {
        let mut runs = Vec::new();
        let mut run_start: Option<usize> = None;
        for (i, &b) in bytes.iter().enumerate() {
            let a = addr + i as u64;
            let needs_placement = !self.is_cached(a) || self.effective_byte(a) != b;
            match (needs_placement, run_start) {
                (true, None) => run_start = Some(i),
                (false, Some(start)) => {
                    runs.push((addr + start as u64, &bytes[start..i]));
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            runs.push((addr + start as u64, &bytes[start..]));
        }
        runs
    }

    /// Drops any pending segment that is byte-for-byte identical to the
    /// read baseline across its entire range. A segment not entirely
    /// covered by the read list is always kept: for the uncovered part,
    /// there is no confirmed baseline to compare against, only the
    /// erased-flash default `materialize` would fall back to, and treating
    /// that default as a real baseline would silently drop writes the
    /// device has never actually confirmed are already erased (see
    /// `differing_runs`'s `is_cached` guard for the same concern on the
    /// placement side).
    fn prune_pending_against_read(&mut self) {
        let read_list = &self.read_list;
        self.pending_list.retain(|seg| {
            if !read_list.covered(seg.base, seg.len()) {
                return true;
            }
            let baseline = read_list.materialize(seg.base, seg.end());
            baseline != seg.bytes
        });
    }

    /// Moves every pending segment ending at or before `hi` into the read
    /// list (pending overrides read in the merge); segments that cross or
    /// sit above `hi` remain pending, split at `hi` if necessary.
    fn commit_pending_below(&mut self, hi: u64) {
        let mut remaining = SegmentList::new();
        for seg in self.pending_list.iter() {
            if seg.end() <= hi {
                self.read_list.insert(seg.base, &seg.bytes);
            } else if seg.base < hi {
                let split = (hi - seg.base) as usize;
                self.read_list.insert(seg.base, &seg.bytes[..split]);
                remaining.insert(hi, &seg.bytes[split..]);
            } else {
                remaining.insert(seg.base, &seg.bytes);
            }
        }
        self.pending_list = remaining;
    }
}
