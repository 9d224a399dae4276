//! Buddy extent allocator for the data region.
//!
//! Free space is kept in 32 size classes; class `n` holds blocks of `2^n`
//! sectors, each aligned to its own size. Freed space is always merged with
//! its buddy (the block whose address differs only in the size bit), so no
//! class ever holds two adjacent buddies. See Koch, "Disk file allocation
//! based on the buddy system" (1987).
//!
//! Allocation never fails with an error: exhaustion yields [`Extent::EMPTY`].
//! Replay uses [`BuddyAllocator::allocate_at`] to re-derive a previously
//! recorded allocation at its exact address.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::extent::Extent;

/// Number of size classes.
pub const NSLICE: usize = 32;

/// Maximum number of extents a single file may grow to.
pub const MAX_EXTENTS: usize = 24;

/// Configuration for the buddy allocator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Sector size in bytes; must be a power of two.
    pub sector_size: u32,
    /// Length of the managed region in bytes.
    pub length: u64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            sector_size: 1024,
            length: 64 * 1024 * 1024,
        }
    }
}

/// Rounds up to the next power of two and returns its exponent.
/// `log2_ceil(0)` and `log2_ceil(1)` are both 0.
pub fn log2_ceil(v: u64) -> u32 {
    if v <= 1 {
        0
    } else {
        64 - (v - 1).leading_zeros()
    }
}

/// Buddy allocator over a sector-addressed region.
#[derive(Debug, Clone)]
pub struct BuddyAllocator {
    sector_shift: u32,
    total_sectors: u64,
    free_lists: Vec<BTreeSet<u64>>,
    total_allocations: u64,
    total_frees: u64,
}

impl BuddyAllocator {
    /// Create a new allocator with every sector of the region free.
    /// The region is carved into the largest aligned power-of-two blocks.
    pub fn new(config: AllocatorConfig) -> StorageResult<Self> {
        if config.sector_size == 0 || !config.sector_size.is_power_of_two() {
            return Err(StorageError::InvalidSectorSize(config.sector_size));
        }
        let sector_shift = config.sector_size.trailing_zeros();
        let total_sectors = config.length >> sector_shift;
        if total_sectors >= 1u64 << (NSLICE - 1) {
            return Err(StorageError::AllocatorError(format!(
                "region of {} sectors exceeds the largest size class",
                total_sectors
            )));
        }

        let mut alloc = Self {
            sector_shift,
            total_sectors,
            free_lists: vec![BTreeSet::new(); NSLICE],
            total_allocations: 0,
            total_frees: 0,
        };
        alloc.free_slices(0, total_sectors)?;

        debug!(
            sector_size = config.sector_size,
            sectors = total_sectors,
            "initialized buddy allocator"
        );
        Ok(alloc)
    }

    /// Sector size in bytes.
    pub fn sector_size(&self) -> u32 {
        1 << self.sector_shift
    }

    /// Managed region size in bytes (whole sectors only).
    pub fn total_bytes(&self) -> u64 {
        self.total_sectors << self.sector_shift
    }

    /// Bytes currently on the free lists.
    pub fn free_bytes(&self) -> u64 {
        let sectors: u64 = self
            .free_lists
            .iter()
            .enumerate()
            .map(|(n, list)| (list.len() as u64) << n)
            .sum();
        sectors << self.sector_shift
    }

    fn to_sectors(&self, bytes: u64) -> u64 {
        (bytes + self.sector_size() as u64 - 1) >> self.sector_shift
    }

    /// Size class for a request, or None if the rounded block could not be
    /// described by an extent.
    fn class_for(&self, bytes: u64) -> Option<usize> {
        let n0 = log2_ceil(self.to_sectors(bytes)) as usize;
        if n0 >= NSLICE || (1u64 << (n0 as u32 + self.sector_shift)) > u32::MAX as u64 {
            return None;
        }
        Some(n0)
    }

    fn extent_of(&self, addr: u64, n: usize) -> Extent {
        Extent::new(
            addr << self.sector_shift,
            (1u64 << (n as u32 + self.sector_shift)) as u32,
        )
    }

    /// Allocate at least `size` bytes, rounded up to sectors and then to a
    /// power of two. The lowest-addressed block of the smallest sufficient
    /// class is split down, freeing the upper half at each step.
    /// Returns [`Extent::EMPTY`] when no block is large enough.
    pub fn allocate(&mut self, size: u64) -> Extent {
        let Some(n0) = self.class_for(size) else {
            return Extent::EMPTY;
        };
        for n in n0..NSLICE {
            let Some(addr) = self.free_lists[n].pop_first() else {
                continue;
            };
            let mut k = n;
            while k > n0 {
                k -= 1;
                self.free_lists[k].insert(addr + (1u64 << k));
            }
            self.total_allocations += 1;
            let ext = self.extent_of(addr, n0);
            debug!(extent = %ext, split_from = n, "allocated extent");
            return ext;
        }
        debug!(size, "allocator exhausted");
        Extent::EMPTY
    }

    /// Allocate the block of `size` bytes that starts exactly at `addr`.
    /// Space around it in the containing free block is returned to the free
    /// lists. Returns None if no free block contains the address or the
    /// address is not aligned to the requested class.
    pub fn allocate_at(&mut self, addr: u64, size: u64) -> Option<Extent> {
        let n0 = self.class_for(size)?;
        if addr & ((1u64 << self.sector_shift) - 1) != 0 {
            return None;
        }
        let req = addr >> self.sector_shift;
        if req & ((1u64 << n0) - 1) != 0 {
            return None;
        }
        for n in n0..NSLICE {
            let start = match self.free_lists[n].range(..=req).next_back() {
                Some(&start) if start + (1u64 << n) > req => start,
                _ => continue,
            };
            self.free_lists[n].remove(&start);
            // both frees cover ranges that were free a moment ago
            if start != req && self.free_slices(start, req - start).is_err() {
                return None;
            }
            if n != n0 {
                let avail = req + (1u64 << n0);
                if self.free_slices(avail, start + (1u64 << n) - avail).is_err() {
                    return None;
                }
            }
            self.total_allocations += 1;
            let ext = self.extent_of(req, n0);
            debug!(extent = %ext, "allocated extent at fixed address");
            return Some(ext);
        }
        None
    }

    /// Return an extent to the free lists.
    pub fn free(&mut self, ext: Extent) -> StorageResult<()> {
        let mask = (1u64 << self.sector_shift) - 1;
        if ext.base & mask != 0 || ext.length as u64 & mask != 0 {
            return Err(StorageError::NotAligned {
                offset: ext.base,
                alignment: self.sector_size() as u64,
            });
        }
        let addr = ext.base >> self.sector_shift;
        let size = ext.length as u64 >> self.sector_shift;
        if addr + size > self.total_sectors {
            return Err(StorageError::AllocatorError(format!(
                "extent {} beyond region of {} sectors",
                ext, self.total_sectors
            )));
        }
        if let Some((start, n)) = self.free_block_overlapping(addr, size) {
            return Err(StorageError::AllocatorError(format!(
                "double free: extent {} overlaps free sector {} class {}",
                ext, start, n
            )));
        }
        self.free_slices(addr, size)?;
        self.total_frees += 1;
        debug!(extent = %ext, "freed extent");
        Ok(())
    }

    /// The first free block, as `(sector, class)`, sharing a sector with
    /// `size` sectors at `addr`.
    fn free_block_overlapping(&self, addr: u64, size: u64) -> Option<(u64, usize)> {
        let end = addr + size;
        (0..NSLICE).find_map(|n| match self.free_lists[n].range(..end).next_back() {
            Some(&start) if start + (1u64 << n) > addr => Some((start, n)),
            _ => None,
        })
    }

    /// Free `size` sectors at `addr`: peel the misaligned low-order prefix,
    /// then split the rest from the largest power of two down.
    fn free_slices(&mut self, mut addr: u64, mut size: u64) -> StorageResult<()> {
        for i in 0..NSLICE {
            let m = 1u64 << i;
            if size < m {
                break;
            }
            if addr & m != 0 {
                self.free_slice(addr, i)?;
                size -= m;
                addr += m;
            }
        }
        let mut n = log2_ceil(size) as usize;
        loop {
            let m = 1u64 << n;
            if size & m != 0 {
                self.free_slice(addr, n)?;
                size -= m;
                addr += m;
            }
            if n == 0 {
                break;
            }
            n -= 1;
        }
        Ok(())
    }

    /// Insert one aligned block of class `n`, merging with its buddy for as
    /// long as the buddy is free.
    fn free_slice(&mut self, mut addr: u64, mut n: usize) -> StorageResult<()> {
        if n >= NSLICE || addr & ((1u64 << n) - 1) != 0 {
            return Err(StorageError::NotAligned {
                offset: addr,
                alignment: 1u64 << n.min(63),
            });
        }
        if self.free_lists[n].contains(&addr) {
            return Err(StorageError::AllocatorError(format!(
                "double free of sector {} class {}",
                addr, n
            )));
        }
        while n + 1 < NSLICE {
            let buddy = addr ^ (1u64 << n);
            if !self.free_lists[n].remove(&buddy) {
                break;
            }
            addr = addr.min(buddy);
            n += 1;
        }
        self.free_lists[n].insert(addr);
        Ok(())
    }

    /// Size for the next extent of a file: the larger of the request and the
    /// file's current capacity capped at `2^index` sectors, rounded to a power
    /// of two. Returns None once a file has [`MAX_EXTENTS`] extents.
    pub fn extent_growth(&self, request: u64, current: u64, index: usize) -> Option<u64> {
        if index >= MAX_EXTENTS {
            return None;
        }
        let b = self.to_sectors(request);
        let l = self.to_sectors(current);
        let p = (1u64 << index).min(l).max(b);
        let bytes = 1u64.checked_shl(log2_ceil(p) + self.sector_shift)?;
        if bytes > u32::MAX as u64 {
            return None;
        }
        Some(bytes)
    }

    /// All free blocks as `(base, length)` byte ranges, ordered by address.
    pub fn free_ranges(&self) -> Vec<(u64, u64)> {
        let shift = self.sector_shift;
        let mut out: Vec<(u64, u64)> = self
            .free_lists
            .iter()
            .enumerate()
            .flat_map(|(n, list)| list.iter().map(move |&addr| (addr << shift, 1u64 << (n as u32 + shift))))
            .collect();
        out.sort_unstable();
        out
    }

    /// Returns current allocation statistics.
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            sector_size: self.sector_size(),
            total_bytes: self.total_bytes(),
            free_bytes: self.free_bytes(),
            free_count_per_class: self
                .free_lists
                .iter()
                .enumerate()
                .filter(|(_, l)| !l.is_empty())
                .map(|(n, l)| (n as u32, l.len()))
                .collect(),
            total_allocations: self.total_allocations,
            total_frees: self.total_frees,
        }
    }
}

/// Statistics about the allocator's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorStats {
    /// Sector size in bytes
    pub sector_size: u32,
    /// Managed bytes
    pub total_bytes: u64,
    /// Bytes on the free lists
    pub free_bytes: u64,
    /// Number of free blocks per non-empty size class
    pub free_count_per_class: Vec<(u32, usize)>,
    /// Total allocations performed
    pub total_allocations: u64,
    /// Total frees performed
    pub total_frees: u64,
}
