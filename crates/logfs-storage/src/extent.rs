//! Contiguous byte ranges handed out by the allocator.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A contiguous range of bytes within the data region.
///
/// Extents are values: once the allocator returns one it never changes, and
/// two extents are the same extent exactly when base and length are equal.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    /// Byte offset relative to the start of the data region.
    pub base: u64,
    /// Length in bytes.
    pub length: u32,
}

impl Extent {
    /// The zero-length extent, returned when the allocator is exhausted.
    pub const EMPTY: Extent = Extent { base: 0, length: 0 };

    /// Creates a new extent.
    pub fn new(base: u64, length: u32) -> Self {
        Self { base, length }
    }

    /// Returns true for a zero-length extent.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// One past the last byte of the extent.
    pub fn end(&self) -> u64 {
        self.base + self.length as u64
    }

    /// Returns true if the two extents share at least one byte.
    pub fn overlaps(&self, other: &Extent) -> bool {
        self.base < other.end() && other.base < self.end()
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}+{}", self.base, self.length)
    }
}
