//! Interned identity strings.
//!
//! Owner, group and modifier ids repeat across every entry and fid, so each
//! distinct string is stored once and shared. A string leaves the table when
//! its last holder releases it.

use std::collections::HashSet;
use std::sync::Arc;

/// Table of shared strings.
#[derive(Debug, Default)]
pub struct StringTable {
    strings: HashSet<Arc<str>>,
}

impl StringTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the shared copy of `s`, adding it if needed.
    pub fn intern(&mut self, s: &str) -> Arc<str> {
        if let Some(existing) = self.strings.get(s) {
            return Arc::clone(existing);
        }
        let shared: Arc<str> = Arc::from(s);
        self.strings.insert(Arc::clone(&shared));
        shared
    }

    /// Give back one reference. The string is dropped from the table once
    /// only the table holds it.
    pub fn release(&mut self, s: Arc<str>) {
        let last = self
            .strings
            .get(&*s)
            .is_some_and(|t| Arc::ptr_eq(t, &s) && Arc::strong_count(&s) == 2);
        if last {
            self.strings.remove(&*s);
        }
    }

    /// Number of distinct strings held.
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// Returns true if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// Returns true if `s` is interned.
    pub fn contains(&self, s: &str) -> bool {
        self.strings.contains(s)
    }
}
