//! Runtime configuration for level-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Tiers are listed coldest first: index 0 receives new writes, the last
//! entry is the hottest tier and the final promotion target.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::cache::compressor::DEFAULT_ZSTD_LEVEL;
use crate::error::{Error, Result};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "level-cache", about = "Maintenance tool for a multi-tier segment cache")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "level-cache.json")]
    pub config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print tier usage and catalogue size.
    Stats,

    /// Register a file as an object and store all of its segments.
    Put {
        /// Object id (32 hex digits or UUID form).
        id: String,
        /// File holding the object bytes.
        file: PathBuf,
        /// Expiry as unix seconds (0 = never matched by purge-expired).
        #[arg(long, default_value_t = 0)]
        expire: i64,
    },

    /// Read an object range, promoting hits.
    Get {
        id: String,
        #[arg(long, default_value_t = 0)]
        start: u64,
        /// End offset; omit to read through the end of the object.
        #[arg(long)]
        end: Option<u64>,
        /// Write the returned segments here instead of printing a summary.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Remove an object from the registry and every tier.
    Del { id: String },

    /// Remove every object whose expiry lies in the past.
    PurgeExpired,

    /// Persist the registry and every tier.
    Dump,
}

/// Storage backend behind a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Segments held in RAM, written to `dir` only on dump.
    Memory,
    /// One file per segment under `dir`.
    #[default]
    Disk,
}

/// One storage tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Display name, reported as the hit source on reads.
    pub name: String,

    /// Backend storage location.
    pub dir: PathBuf,

    /// Byte limit (0 = unbounded).
    pub capacity: u64,

    #[serde(default)]
    pub backend: BackendKind,

    /// zstd-compress segment files (disk backend only).
    #[serde(default)]
    pub compress: bool,

    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,
}

fn default_zstd_level() -> i32 {
    DEFAULT_ZSTD_LEVEL
}

impl TierConfig {
    pub fn memory(name: impl Into<String>, dir: impl Into<PathBuf>, capacity: u64) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
            capacity,
            backend: BackendKind::Memory,
            compress: false,
            zstd_level: DEFAULT_ZSTD_LEVEL,
        }
    }

    pub fn disk(name: impl Into<String>, dir: impl Into<PathBuf>, capacity: u64) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
            capacity,
            backend: BackendKind::Disk,
            compress: false,
            zstd_level: DEFAULT_ZSTD_LEVEL,
        }
    }

    pub fn with_compression(mut self, level: i32) -> Self {
        self.compress = true;
        self.zstd_level = level;
        self
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Where the registry persists its catalogue and auxiliary index.
    pub meta_dir: PathBuf,

    /// Worker count for dump and batch delete.
    pub action_parallel: usize,

    /// Tiers, coldest first.
    pub tiers: Vec<TierConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            meta_dir: PathBuf::from("/tmp/level-cache/meta"),
            action_parallel: 4,
            tiers: vec![
                TierConfig::disk("hdd", "/tmp/level-cache/hdd", 0).with_compression(DEFAULT_ZSTD_LEVEL),
                TierConfig::disk("ssd", "/tmp/level-cache/ssd", 20 * 1024 * 1024 * 1024), // 20 GB
                TierConfig::memory("ram", "/tmp/level-cache/ram", 2 * 1024 * 1024 * 1024), // 2 GB
            ],
        }
    }
}

impl CacheConfig {
    /// Load configuration from a JSON file, falling back to defaults when it is missing.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: CacheConfig = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(CacheConfig::default())
        }
    }

    /// Reject configurations the cache cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.tiers.is_empty() {
            return Err(Error::Config("at least one tier is required".into()));
        }
        if self.action_parallel == 0 {
            return Err(Error::Config("action_parallel must be at least 1".into()));
        }
        let mut names = HashSet::new();
        let mut dirs = HashSet::new();
        for tier in &self.tiers {
            if !names.insert(tier.name.as_str()) {
                return Err(Error::Config(format!("duplicate tier name {:?}", tier.name)));
            }
            if !dirs.insert(tier.dir.as_path()) {
                return Err(Error::Config(format!(
                    "tier {:?} shares directory {} with another tier",
                    tier.name,
                    tier.dir.display()
                )));
            }
        }
        Ok(())
    }

    /// Index of the hottest tier.
    pub fn top_level(&self) -> usize {
        self.tiers.len().saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = CacheConfig::default();
        assert_eq!(cfg.action_parallel, 4);
        assert_eq!(cfg.tiers.len(), 3);
        assert_eq!(cfg.tiers[0].backend, BackendKind::Disk);
        assert_eq!(cfg.tiers[2].backend, BackendKind::Memory);
        assert_eq!(cfg.top_level(), 2);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_parse_with_defaults() {
        let json = r#"{
            "meta_dir": "/data/meta",
            "action_parallel": 8,
            "tiers": [
                {"name": "hdd", "dir": "/data/hdd", "capacity": 0},
                {"name": "ram", "dir": "/data/ram", "capacity": 1024, "backend": "memory"}
            ]
        }"#;
        let cfg: CacheConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.tiers[0].backend, BackendKind::Disk);
        assert!(!cfg.tiers[0].compress);
        assert_eq!(cfg.tiers[0].zstd_level, DEFAULT_ZSTD_LEVEL);
        assert_eq!(cfg.tiers[1].backend, BackendKind::Memory);
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let mut cfg = CacheConfig::default();
        cfg.tiers.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = CacheConfig::default();
        cfg.action_parallel = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = CacheConfig::default();
        cfg.tiers[1].name = "hdd".into();
        assert!(cfg.validate().is_err());

        let mut cfg = CacheConfig::default();
        cfg.tiers[1].dir = cfg.tiers[0].dir.clone();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let cfg = CacheConfig::load(Path::new("/nonexistent/level-cache.json")).unwrap();
        assert_eq!(cfg, CacheConfig::default());
    }
}
