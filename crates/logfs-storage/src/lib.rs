#![warn(missing_docs)]

//! LogFS storage subsystem: block devices, byte regions, buddy extent allocator
//!
//! This crate provides the bottom layer of LogFS. A [`BlockDevice`] is a flat
//! byte-addressed store (a file or an in-memory buffer), a [`Region`] is a
//! window onto a device with its own base offset, and the [`BuddyAllocator`]
//! hands out power-of-two [`Extent`]s from the data region.

pub mod allocator;
pub mod device;
pub mod error;
pub mod extent;

pub use allocator::{AllocatorConfig, AllocatorStats, BuddyAllocator, MAX_EXTENTS, NSLICE};
pub use device::{BlockDevice, FileDevice, MemDevice, Region};
pub use error::{StorageError, StorageResult};
pub use extent::Extent;
