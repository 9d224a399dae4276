//! Filesystem configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use logfs_storage::{BlockDevice, FileDevice, Region};
use logfs_wal::LogConfig;
use serde::{Deserialize, Serialize};

use crate::error::MetaResult;
use crate::excl::DEFAULT_LEASE_SECS;
use crate::fs::{FsOptions, DEFAULT_IOUNIT};
use crate::pseudo::ControlState;
use crate::users::UserTable;

/// Where the filesystem lives and how it behaves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Image file holding the data region.
    pub data_image: PathBuf,
    /// Offset of the data region in its image.
    pub data_base: u64,
    /// Length of the data region.
    pub data_length: u64,
    /// Image file holding the log region. May equal `data_image`.
    pub log_image: PathBuf,
    /// Offset of the log region in its image.
    pub log_base: u64,
    /// Length of the log region.
    pub log_length: u64,
    /// Data allocation unit.
    pub sector_size: u32,
    /// Log block size.
    pub block_size: u32,
    /// Free log blocks below which a sweep runs.
    pub reserve_blocks: usize,
    /// Owner of the root directory.
    pub owner: String,
    /// Exclusive lock lease.
    pub lease_secs: u32,
    /// Flush the log after every mutating operation.
    pub commit_flush: bool,
    /// Start with permission checks off.
    pub nopermcheck: bool,
    /// Start with privileged wstat allowed.
    pub wstatallow: bool,
    /// Initial user directory in the `users` file text form.
    pub users_file: Option<PathBuf>,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            data_image: PathBuf::from("logfs.data"),
            data_base: 0,
            data_length: 64 * 1024 * 1024,
            log_image: PathBuf::from("logfs.log"),
            log_base: 0,
            log_length: 4 * 1024 * 1024,
            sector_size: 512,
            block_size: 4096,
            reserve_blocks: 3,
            owner: String::from("adm"),
            lease_secs: DEFAULT_LEASE_SECS,
            commit_flush: true,
            nopermcheck: false,
            wstatallow: false,
            users_file: None,
        }
    }
}

impl FsConfig {
    /// Load a TOML or JSON configuration, chosen by file extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: FsConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: FsConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Settings handed to the filesystem.
    pub fn options(&self) -> FsOptions {
        FsOptions {
            sector_size: self.sector_size,
            log: LogConfig {
                block_size: self.block_size,
                reserve_blocks: self.reserve_blocks,
            },
            owner: self.owner.clone(),
            lease_secs: self.lease_secs,
            commit_flush: self.commit_flush,
            iounit: DEFAULT_IOUNIT,
            control: ControlState {
                nopermcheck: self.nopermcheck,
                wstatallow: self.wstatallow,
                ..ControlState::default()
            },
        }
    }

    /// Create zero-filled image files large enough for both regions.
    pub fn create_images(&self) -> MetaResult<()> {
        if self.data_image == self.log_image {
            let len = (self.data_base + self.data_length).max(self.log_base + self.log_length);
            FileDevice::create(&self.data_image, len)?;
        } else {
            FileDevice::create(&self.data_image, self.data_base + self.data_length)?;
            FileDevice::create(&self.log_image, self.log_base + self.log_length)?;
        }
        Ok(())
    }

    /// Open the data and log regions.
    pub fn regions(&self) -> MetaResult<(Region, Region)> {
        let data: Arc<dyn BlockDevice> = Arc::new(FileDevice::open(&self.data_image)?);
        let log: Arc<dyn BlockDevice> = if self.log_image == self.data_image {
            Arc::clone(&data)
        } else {
            Arc::new(FileDevice::open(&self.log_image)?)
        };
        Ok((
            Region::new(data, self.data_base, self.data_length)?,
            Region::new(log, self.log_base, self.log_length)?,
        ))
    }

    /// The initial user directory: the users file if one is configured,
    /// otherwise just the owner.
    pub fn users(&self) -> anyhow::Result<UserTable> {
        let mut users = UserTable::new();
        match &self.users_file {
            Some(path) => users.apply_text(&std::fs::read_to_string(path)?)?,
            None => users.add(&self.owner, &self.owner, None, &[])?,
        }
        Ok(users)
    }
}
