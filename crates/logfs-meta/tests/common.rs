//! Common test utilities: in-memory disks that survive a simulated crash.

#![allow(dead_code)]

use std::sync::Arc;

use logfs_meta::{Filesystem, FsOptions, ManualClock, UserTable};
use logfs_storage::{BlockDevice, MemDevice, Region};
use logfs_wal::LogConfig;

/// Data and log devices shared across filesystem instances. Dropping a
/// filesystem without flushing and opening a new one over the same disks is
/// a crash and restart.
pub struct TestDisks {
    pub data: MemDevice,
    pub log: MemDevice,
    pub clock: ManualClock,
    pub options: FsOptions,
}

impl TestDisks {
    pub fn new(data_len: usize, log_blocks: usize) -> Self {
        let options = FsOptions {
            log: LogConfig {
                block_size: 1024,
                reserve_blocks: 3,
            },
            ..FsOptions::default()
        };
        Self {
            data: MemDevice::new(data_len),
            log: MemDevice::new(log_blocks * 1024),
            clock: ManualClock::new(1_000_000),
            options,
        }
    }

    fn regions(&self) -> (Region, Region) {
        let data: Arc<dyn BlockDevice> = Arc::new(self.data.clone());
        let log: Arc<dyn BlockDevice> = Arc::new(self.log.clone());
        (Region::whole(data), Region::whole(log))
    }

    pub fn users() -> UserTable {
        let mut users = UserTable::new();
        users
            .apply_text("adm adm\nglenda glenda\nsys sys adm adm glenda\n")
            .unwrap();
        users
    }

    pub fn format(&self) -> Filesystem {
        let (data, log) = self.regions();
        Filesystem::format(
            data,
            log,
            self.options.clone(),
            Self::users(),
            Box::new(self.clock.clone()),
        )
        .unwrap()
    }

    pub fn open(&self) -> Filesystem {
        let (data, log) = self.regions();
        Filesystem::recover(
            data,
            log,
            self.options.clone(),
            Self::users(),
            Box::new(self.clock.clone()),
        )
        .unwrap()
    }
}
