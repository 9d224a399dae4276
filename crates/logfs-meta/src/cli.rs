//! The `logfs` command line.

use crate::clock::SystemClock;
use crate::config::FsConfig;
use crate::fs::Filesystem;
use crate::types::{DMAPPEND, DMDIR, DMEXCL, DMTMP};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use logfs_wal::{LogFile, SegmentKind};
use std::path::PathBuf;

/// Command line of the `logfs` tool.
#[derive(Parser)]
#[command(name = "logfs")]
#[command(about = "LogFS image maintenance tool", long_about = None)]
pub struct Cli {
    /// Configuration file (TOML or JSON); defaults apply without one.
    #[arg(short, long, env = "LOGFS_CONFIG")]
    pub config: Option<PathBuf>,

    /// What to do.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Create zeroed images and an empty filesystem.
    Format,
    /// Replay the log and print statistics.
    Check,
    /// Print every log entry, swept segment first.
    Dump,
    /// Replay, compact the log, and print statistics.
    Sweep,
    /// Print the tree.
    Ls,
}

impl Cli {
    /// Run the selected command.
    pub fn run(self) -> Result<()> {
        let config = match &self.config {
            Some(path) => FsConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => FsConfig::default(),
        };
        match self.command {
            Command::Format => format(&config),
            Command::Check => check(&config),
            Command::Dump => dump(&config),
            Command::Sweep => sweep(&config),
            Command::Ls => ls(&config),
        }
    }
}

fn open(config: &FsConfig) -> Result<Filesystem> {
    let (data, log) = config.regions()?;
    let fs = Filesystem::recover(
        data,
        log,
        config.options(),
        config.users()?,
        Box::new(SystemClock),
    )?;
    Ok(fs)
}

fn format(config: &FsConfig) -> Result<()> {
    config.create_images()?;
    let (data, log) = config.regions()?;
    Filesystem::format(
        data,
        log,
        config.options(),
        config.users()?,
        Box::new(SystemClock),
    )?;
    tracing::info!(
        data = %config.data_image.display(),
        log = %config.log_image.display(),
        "formatted"
    );
    Ok(())
}

fn check(config: &FsConfig) -> Result<()> {
    let fs = open(config)?;
    println!("{}", serde_json::to_string_pretty(&fs.stats())?);
    Ok(())
}

fn dump(config: &FsConfig) -> Result<()> {
    let (_, region) = config.regions()?;
    let mut log = LogFile::open(region, config.options().log)?;
    for (kind, label) in [(SegmentKind::Swept, "swept"), (SegmentKind::Active, "active")] {
        let entries = log.entries(kind)?;
        println!("# {} segment: {} entries", label, entries.len());
        for entry in entries {
            println!("{}", entry);
        }
    }
    Ok(())
}

fn sweep(config: &FsConfig) -> Result<()> {
    let mut fs = open(config)?;
    fs.sweep()?;
    fs.flush()?;
    println!("{}", serde_json::to_string_pretty(&fs.stats())?);
    Ok(())
}

fn ls(config: &FsConfig) -> Result<()> {
    let fs = open(config)?;
    for (depth, st) in fs.list()? {
        let name = if depth == 0 { "/" } else { st.name.as_str() };
        println!(
            "{} {:>8} {:>8} {:>10} {}{}",
            mode_string(st.mode),
            st.uid,
            st.gid,
            st.length,
            "  ".repeat(depth),
            name
        );
    }
    Ok(())
}

fn mode_string(mode: u32) -> String {
    let mut s = String::with_capacity(11);
    s.push(if mode & DMDIR != 0 {
        'd'
    } else if mode & DMAPPEND != 0 {
        'a'
    } else if mode & DMEXCL != 0 {
        'l'
    } else if mode & DMTMP != 0 {
        't'
    } else {
        '-'
    });
    for shift in [6, 3, 0] {
        let bits = mode >> shift;
        s.push(if bits & 4 != 0 { 'r' } else { '-' });
        s.push(if bits & 2 != 0 { 'w' } else { '-' });
        s.push(if bits & 1 != 0 { 'x' } else { '-' });
    }
    s
}
