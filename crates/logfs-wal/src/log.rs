//! Segmented, self-describing write-ahead log.
//!
//! The log region is an array of fixed-size blocks. Live blocks belong to one
//! of two segments: the active segment, which receives new entries, and the
//! swept segment, which exists only while compaction copies the live part of
//! the active segment forward. The two segments carry tags from adjacent
//! sweep sets, so a scan after a crash can tell them apart and resume.
//!
//! Each segment appends through a single in-memory page. A page is written
//! back to its block on flush, on overflow, and at the end of every sweep
//! step; unchanged pages are never rewritten.

use std::collections::VecDeque;
use std::mem;
use std::ops::Range;

use logfs_storage::Region;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::block::{
    log_tag, payload_checksum, successor, tag_set, BlockHeader, HEADER_LEN, TAG_BOOT, TAG_EMPTY,
    TAG_NONE,
};
use crate::entry::{LogEntry, PREFIX_LEN};
use crate::error::{WalError, WalResult};

/// Configuration for the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Block size in bytes (default 4096).
    pub block_size: u32,
    /// Free blocks below which appends trigger a sweep (default 3).
    pub reserve_blocks: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            reserve_blocks: 3,
        }
    }
}

/// Which of the two live segments to read.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SegmentKind {
    /// The segment receiving new entries.
    Active,
    /// The partial copy built by an unfinished sweep.
    Swept,
}

/// The fate of one entry during a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyDecision {
    /// Drop the entry.
    Discard,
    /// Copy the entry's bytes unchanged.
    Keep,
    /// Append this rewritten entry in its place.
    Repack(LogEntry),
}

/// Decides, entry by entry, what a sweep carries forward.
pub trait SweepPolicy {
    /// Called once per entry newer than anything already carried forward.
    fn decide(&mut self, entry: &LogEntry) -> WalResult<CopyDecision>;
}

/// A policy that keeps every entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepAll;

impl SweepPolicy for KeepAll {
    fn decide(&mut self, _entry: &LogEntry) -> WalResult<CopyDecision> {
        Ok(CopyDecision::Keep)
    }
}

/// Statistics for the log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogStats {
    /// Block size in bytes.
    pub block_size: u32,
    /// Blocks in the log region.
    pub total_blocks: u32,
    /// Blocks in the free pool.
    pub free_blocks: u32,
    /// Blocks held by the active segment.
    pub active_blocks: u32,
    /// Blocks held by the swept segment.
    pub swept_blocks: u32,
    /// Entries appended since open.
    pub entries_appended: u64,
    /// Bytes appended since open.
    pub bytes_appended: u64,
    /// Pages written back to disk.
    pub pages_written: u64,
    /// Completed sweeps.
    pub sweeps: u64,
    /// Entries copied unchanged by sweeps.
    pub entries_kept: u64,
    /// Entries rewritten by sweeps.
    pub entries_repacked: u64,
    /// Entries dropped by sweeps.
    pub entries_discarded: u64,
}

struct Page {
    block: Option<u32>,
    tag: u8,
    seq: u64,
    used: usize,
    buf: Vec<u8>,
}

struct Segment {
    tag: u8,
    blocks: VecDeque<u32>,
    gen: u64,
    page: Page,
}

impl Segment {
    fn new(tag: u8, bsize: usize, blocks: VecDeque<u32>, gen: u64) -> Self {
        Self {
            tag,
            gen,
            blocks,
            page: Page {
                block: None,
                tag,
                seq: 0,
                used: HEADER_LEN,
                buf: vec![0u8; bsize],
            },
        }
    }
}

/// The write-ahead log over one region.
pub struct LogFile {
    region: Region,
    bsize: usize,
    nblocks: u32,
    reserve: usize,
    headers: Vec<BlockHeader>,
    active: Segment,
    swept: Segment,
    empty: VecDeque<u32>,
    scavenging: bool,
    stats: LogStats,
}

fn check_config(region: &Region, config: &LogConfig) -> WalResult<u32> {
    let bsize = config.block_size as usize;
    if bsize < 2 * HEADER_LEN + PREFIX_LEN || bsize >= 1 << 24 {
        return Err(WalError::InvalidConfig(format!(
            "block size {} out of range",
            bsize
        )));
    }
    let nblocks = region.length() / bsize as u64;
    if nblocks == 0 || nblocks > u32::MAX as u64 {
        return Err(WalError::InvalidConfig(format!(
            "region of {} bytes holds {} blocks",
            region.length(),
            nblocks
        )));
    }
    Ok(nblocks as u32)
}

/// Put a sweep set's blocks in sequence order, rejecting gaps and duplicates.
/// The set may start above zero when a sweep already drained its head.
/// Returns the blocks and the sequence number of the next block.
fn order_set(set: &mut [(u64, u32)], tag: u8) -> WalResult<(VecDeque<u32>, u64)> {
    set.sort_unstable();
    let first = set.first().map_or(0, |&(seq, _)| seq);
    for (i, &(seq, block)) in set.iter().enumerate() {
        if seq != first + i as u64 {
            return Err(WalError::Corrupt(format!(
                "tag {:#04x}: block {} has sequence {} where {} was expected",
                tag,
                block,
                seq,
                first + i as u64
            )));
        }
    }
    let next = first + set.len() as u64;
    Ok((set.iter().map(|&(_, b)| b).collect(), next))
}

/// Decode every entry in a sealed block. A decoding failure ends the scan
/// of the final block of a segment; anywhere else it is corruption.
fn parse_entries(
    buf: &[u8],
    hdr: &BlockHeader,
    block: u32,
    last: bool,
) -> WalResult<Vec<(LogEntry, Range<usize>)>> {
    let used = hdr.used as usize;
    let mut out = Vec::new();
    let mut off = HEADER_LEN;
    while off < used {
        match LogEntry::decode(&buf[off..used]) {
            Ok((entry, n)) => {
                out.push((entry, off..off + n));
                off += n;
            }
            Err(err) if last => {
                warn!(block, offset = off, error = %err, "stopping at corrupt log tail");
                break;
            }
            Err(err) => {
                return Err(WalError::Corrupt(format!(
                    "block {} offset {}: {}",
                    block, off, err
                )))
            }
        }
    }
    Ok(out)
}

impl LogFile {
    /// Write an unused header to every block, then open the empty log.
    pub fn format(region: Region, config: LogConfig) -> WalResult<Self> {
        let nblocks = check_config(&region, &config)?;
        let bsize = config.block_size as usize;
        let mut buf = vec![0u8; bsize];
        BlockHeader::unused().seal(&mut buf);
        for b in 0..nblocks as u64 {
            region.write(b * bsize as u64, &buf)?;
        }
        region.sync()?;
        info!(blocks = nblocks, block_size = bsize, "formatted log");
        Self::open(region, config)
    }

    /// Scan every block and rebuild the segment structure.
    pub fn open(region: Region, config: LogConfig) -> WalResult<Self> {
        let nblocks = check_config(&region, &config)?;
        let bsize = config.block_size as usize;
        let limit = bsize - HEADER_LEN;

        let mut headers = Vec::with_capacity(nblocks as usize);
        let mut sets: [Vec<(u64, u32)>; 4] = Default::default();
        let mut empty = VecDeque::new();
        let mut buf = vec![0u8; bsize];

        for b in 0..nblocks {
            region.read(b as u64 * bsize as u64, &mut buf)?;
            let hdr = match BlockHeader::read_block(&buf) {
                Some(h) if h.tag != TAG_EMPTY && h.tag != TAG_NONE => h,
                Some(_) => {
                    headers.push(BlockHeader::unused());
                    empty.push_back(b);
                    continue;
                }
                None => {
                    warn!(block = b, "block headers disagree, treating block as empty");
                    headers.push(BlockHeader::unused());
                    empty.push_back(b);
                    continue;
                }
            };
            headers.push(hdr);
            if hdr.tag == TAG_BOOT {
                continue;
            }
            let Some(set) = tag_set(hdr.tag) else {
                return Err(WalError::Corrupt(format!(
                    "block {}: unknown tag {:#04x}",
                    b, hdr.tag
                )));
            };
            if (hdr.used as usize) < HEADER_LEN || hdr.used as usize > limit {
                return Err(WalError::Corrupt(format!(
                    "block {}: used {} out of range",
                    b, hdr.used
                )));
            }
            sets[set as usize].push((hdr.seq, b));
        }

        let live: Vec<u8> = (0..4u8).filter(|&s| !sets[s as usize].is_empty()).collect();
        let (atag, stag) = match live.as_slice() {
            [] => (log_tag(0), log_tag(1)),
            [a] => (log_tag(*a), successor(log_tag(*a))),
            [a, b] => {
                let (ta, tb) = (log_tag(*a), log_tag(*b));
                if successor(ta) == tb {
                    (ta, tb)
                } else if successor(tb) == ta {
                    (tb, ta)
                } else {
                    return Err(WalError::Corrupt(format!(
                        "sweep sets {} and {} are not successors",
                        a, b
                    )));
                }
            }
            _ => {
                return Err(WalError::Corrupt(format!(
                    "{} live sweep sets",
                    live.len()
                )))
            }
        };
        let (active_blocks, active_gen) = order_set(&mut sets[(atag & 3) as usize], atag)?;
        let (swept_blocks, swept_gen) = order_set(&mut sets[(stag & 3) as usize], stag)?;

        let log = Self {
            region,
            bsize,
            nblocks,
            reserve: config.reserve_blocks,
            headers,
            active: Segment::new(atag, bsize, active_blocks, active_gen),
            swept: Segment::new(stag, bsize, swept_blocks, swept_gen),
            empty,
            scavenging: false,
            stats: LogStats::default(),
        };
        info!(
            blocks = nblocks,
            active = log.active.blocks.len(),
            swept = log.swept.blocks.len(),
            free = log.empty.len(),
            tag = log.active.tag,
            "opened log"
        );
        Ok(log)
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> usize {
        self.bsize
    }

    /// Number of blocks in the free pool.
    pub fn free_blocks(&self) -> usize {
        self.empty.len()
    }

    /// Number of blocks a segment holds.
    pub fn segment_blocks(&self, kind: SegmentKind) -> usize {
        self.seg(kind).blocks.len()
    }

    fn seg(&self, kind: SegmentKind) -> &Segment {
        match kind {
            SegmentKind::Active => &self.active,
            SegmentKind::Swept => &self.swept,
        }
    }

    fn seg_mut(&mut self, kind: SegmentKind) -> &mut Segment {
        match kind {
            SegmentKind::Active => &mut self.active,
            SegmentKind::Swept => &mut self.swept,
        }
    }

    /// Read a block that belongs to a segment, checking both headers and the
    /// payload checksum.
    fn load_block(&self, block: u32, buf: &mut [u8]) -> WalResult<BlockHeader> {
        self.region.read(block as u64 * self.bsize as u64, buf)?;
        let hdr = BlockHeader::read_block(buf).ok_or_else(|| {
            WalError::Corrupt(format!("block {}: headers changed since scan", block))
        })?;
        let used = hdr.used as usize;
        if tag_set(hdr.tag).is_none() || used < HEADER_LEN || used > self.bsize - HEADER_LEN {
            return Err(WalError::Corrupt(format!(
                "block {}: not a log block (tag {:#04x} used {})",
                block, hdr.tag, used
            )));
        }
        let csum = payload_checksum(buf, used);
        if csum != hdr.csum {
            return Err(WalError::Corrupt(format!(
                "block {}: checksum {:#010x} does not match header {:#010x}",
                block, csum, hdr.csum
            )));
        }
        Ok(hdr)
    }

    /// Append one entry to the active segment. The entry reaches disk at the
    /// next flush.
    pub fn append(&mut self, entry: &LogEntry, policy: &mut dyn SweepPolicy) -> WalResult<()> {
        let bytes = entry.to_bytes()?;
        self.seg_append(SegmentKind::Active, &bytes, policy)?;
        self.stats.entries_appended += 1;
        self.stats.bytes_appended += bytes.len() as u64;
        debug!(
            seq = entry.seq,
            op = entry.op.name(),
            path = entry.path,
            len = bytes.len(),
            "appended log entry"
        );
        Ok(())
    }

    fn seg_append(
        &mut self,
        kind: SegmentKind,
        bytes: &[u8],
        policy: &mut dyn SweepPolicy,
    ) -> WalResult<()> {
        let limit = self.bsize - HEADER_LEN;
        if HEADER_LEN + bytes.len() > limit {
            return Err(WalError::EntryTooLarge(bytes.len()));
        }
        if self.seg(kind).page.block.is_none() {
            self.alloc_page(kind, policy)?;
        }
        if self.seg(kind).page.used + bytes.len() > limit {
            self.flush_page(kind)?;
            self.alloc_page(kind, policy)?;
        }
        let page = &mut self.seg_mut(kind).page;
        page.buf[page.used..page.used + bytes.len()].copy_from_slice(bytes);
        page.used += bytes.len();
        Ok(())
    }

    /// Give a segment a fresh page from the free pool, sweeping first if the
    /// pool is low and no sweep is already running.
    fn alloc_page(&mut self, kind: SegmentKind, policy: &mut dyn SweepPolicy) -> WalResult<()> {
        if !self.scavenging && self.empty.len() < self.reserve {
            self.sweep(policy)?;
        }
        let block = match self.empty.pop_front() {
            Some(b) => b,
            None if self.scavenging => return Err(WalError::IrrevocablyFull),
            None => return Err(WalError::LogFull),
        };
        let seg = self.seg_mut(kind);
        let seq = seg.gen;
        seg.gen += 1;
        seg.blocks.push_back(block);
        let tag = seg.tag;
        let page = &mut seg.page;
        page.block = Some(block);
        page.tag = tag;
        page.seq = seq;
        page.used = HEADER_LEN;
        debug!(block, seq, segment = ?kind, "allocated log page");
        Ok(())
    }

    /// Write a segment's page to its block if it changed since the last write.
    /// Returns true if anything was written.
    fn flush_page(&mut self, kind: SegmentKind) -> WalResult<bool> {
        let seg = match kind {
            SegmentKind::Active => &mut self.active,
            SegmentKind::Swept => &mut self.swept,
        };
        let page = &mut seg.page;
        let Some(block) = page.block else {
            return Ok(false);
        };
        let disk = self.headers[block as usize];
        if disk.tag == page.tag && disk.seq == page.seq && disk.used as usize == page.used {
            return Ok(false);
        }
        let limit = self.bsize - HEADER_LEN;
        page.buf[page.used..limit].fill(0);
        let hdr = BlockHeader {
            tag: page.tag,
            seq: page.seq,
            used: page.used as u32,
            csum: payload_checksum(&page.buf, page.used),
        };
        hdr.seal(&mut page.buf);
        self.region
            .write(block as u64 * self.bsize as u64, &page.buf)?;
        self.headers[block as usize] = hdr;
        self.stats.pages_written += 1;
        debug!(block, seq = hdr.seq, used = hdr.used, "flushed log page");
        Ok(true)
    }

    /// Return a drained block to the free pool on disk.
    fn clean_block(&mut self, block: u32) -> WalResult<()> {
        let hdr = BlockHeader::unused();
        let mut buf = vec![0u8; self.bsize];
        hdr.seal(&mut buf);
        self.region.write(block as u64 * self.bsize as u64, &buf)?;
        self.headers[block as usize] = hdr;
        self.empty.push_back(block);
        Ok(())
    }

    /// Make every appended entry durable.
    pub fn flush(&mut self) -> WalResult<()> {
        if self.flush_page(SegmentKind::Active)? {
            self.region.sync()?;
        }
        Ok(())
    }

    /// Make sure the free pool holds the reserve, sweeping if needed.
    /// Fails with [`WalError::LogFull`] before anything is appended when even
    /// a sweep cannot free enough blocks.
    pub fn ensure_space(&mut self, policy: &mut dyn SweepPolicy) -> WalResult<()> {
        if self.empty.len() >= self.reserve {
            return Ok(());
        }
        self.sweep(policy)?;
        if self.empty.len() < self.reserve {
            warn!(free = self.empty.len(), reserve = self.reserve, "log full after sweep");
            return Err(WalError::LogFull);
        }
        Ok(())
    }

    /// Compact the active segment into the swept segment, then make the swept
    /// segment active. Does nothing if a sweep is already in progress.
    pub fn sweep(&mut self, policy: &mut dyn SweepPolicy) -> WalResult<()> {
        if self.scavenging {
            return Ok(());
        }
        self.scavenging = true;
        let result = self.sweep_segments(policy);
        self.scavenging = false;
        result
    }

    fn sweep_segments(&mut self, policy: &mut dyn SweepPolicy) -> WalResult<()> {
        self.flush_page(SegmentKind::Active)?;
        let mut high = if self.swept.blocks.is_empty() {
            let tag = successor(self.active.tag);
            self.swept = Segment::new(tag, self.bsize, VecDeque::new(), 0);
            0
        } else {
            self.resume_swept()?
        };

        let (mut kept, mut repacked, mut discarded) = (0u64, 0u64, 0u64);
        let mut buf = vec![0u8; self.bsize];
        while let Some(&block) = self.active.blocks.front() {
            let hdr = self.load_block(block, &mut buf)?;
            let last = self.active.blocks.len() == 1;
            for (entry, range) in parse_entries(&buf, &hdr, block, last)? {
                if entry.seq <= high {
                    continue;
                }
                high = entry.seq;
                match policy.decide(&entry)? {
                    CopyDecision::Discard => discarded += 1,
                    CopyDecision::Keep => {
                        self.seg_append(SegmentKind::Swept, &buf[range], policy)?;
                        kept += 1;
                    }
                    CopyDecision::Repack(rewritten) => {
                        let bytes = rewritten.to_bytes()?;
                        self.seg_append(SegmentKind::Swept, &bytes, policy)?;
                        repacked += 1;
                    }
                }
            }
            if self.flush_page(SegmentKind::Swept)? {
                self.region.sync()?;
            }
            self.active.blocks.pop_front();
            self.clean_block(block)?;
        }
        self.region.sync()?;

        let next = successor(self.swept.tag);
        self.active = mem::replace(
            &mut self.swept,
            Segment::new(next, self.bsize, VecDeque::new(), 0),
        );
        self.stats.sweeps += 1;
        self.stats.entries_kept += kept;
        self.stats.entries_repacked += repacked;
        self.stats.entries_discarded += discarded;
        info!(
            kept,
            repacked,
            discarded,
            active = self.active.blocks.len(),
            free = self.empty.len(),
            tag = self.active.tag,
            "swept log"
        );
        Ok(())
    }

    /// Load the tail of an unfinished swept segment as its page and return the
    /// highest sequence number it already holds.
    fn resume_swept(&mut self) -> WalResult<u64> {
        let blocks: Vec<u32> = self.swept.blocks.iter().copied().collect();
        let mut buf = vec![0u8; self.bsize];
        let mut high = 0;
        let mut tail = None;
        for (i, &block) in blocks.iter().enumerate() {
            let hdr = self.load_block(block, &mut buf)?;
            let entries = parse_entries(&buf, &hdr, block, i + 1 == blocks.len())?;
            let end = entries.last().map_or(HEADER_LEN, |(_, r)| r.end);
            for (entry, _) in &entries {
                high = high.max(entry.seq);
            }
            tail = Some((block, hdr, end));
        }
        if let Some((block, hdr, end)) = tail {
            let page = &mut self.swept.page;
            page.buf.copy_from_slice(&buf);
            page.block = Some(block);
            page.tag = hdr.tag;
            page.seq = hdr.seq;
            page.used = end;
        }
        info!(blocks = blocks.len(), high, "resuming interrupted sweep");
        Ok(high)
    }

    /// Finish a sweep that was interrupted before the last shutdown.
    pub fn complete(&mut self, policy: &mut dyn SweepPolicy) -> WalResult<()> {
        if self.swept.blocks.is_empty() {
            return Ok(());
        }
        info!(blocks = self.swept.blocks.len(), "completing interrupted sweep");
        self.sweep(policy)
    }

    /// Feed every entry stored on disk in one segment to `apply`, in order.
    /// Entries still sitting in an unflushed page are not seen.
    pub fn replay<E, F>(&self, kind: SegmentKind, mut apply: F) -> Result<(), E>
    where
        F: FnMut(&LogEntry) -> Result<(), E>,
        E: From<WalError>,
    {
        let seg = self.seg(kind);
        let mut buf = vec![0u8; self.bsize];
        let n = seg.blocks.len();
        for (i, &block) in seg.blocks.iter().enumerate() {
            let hdr = self.load_block(block, &mut buf)?;
            for (entry, _) in parse_entries(&buf, &hdr, block, i + 1 == n)? {
                apply(&entry)?;
            }
        }
        Ok(())
    }

    /// Flush, then collect every entry of a segment.
    pub fn entries(&mut self, kind: SegmentKind) -> WalResult<Vec<LogEntry>> {
        if self.flush_page(kind)? {
            self.region.sync()?;
        }
        let mut out = Vec::new();
        self.replay(kind, |e: &LogEntry| -> WalResult<()> {
            out.push(e.clone());
            Ok(())
        })?;
        Ok(out)
    }

    /// Returns current log statistics.
    pub fn stats(&self) -> LogStats {
        LogStats {
            block_size: self.bsize as u32,
            total_blocks: self.nblocks,
            free_blocks: self.empty.len() as u32,
            active_blocks: self.active.blocks.len() as u32,
            swept_blocks: self.swept.blocks.len() as u32,
            ..self.stats.clone()
        }
    }
}
