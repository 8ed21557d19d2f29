//! Error types shared by the registry, tiers and the orchestrator.

use std::fmt;

use thiserror::Error;

use crate::cache::compressor::CompressionError;
use crate::cache::id::ObjectId;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Item not registered: {0}")]
    ItemNotFound(ObjectId),

    #[error("Invalid byte range [{start}, {end}) for item of size {size}")]
    InvalidRange { start: u64, end: u64, size: u64 },

    #[error("Segment of {size} bytes exceeds capacity {capacity} of tier {tier}")]
    SegmentTooLarge {
        tier: String,
        size: u64,
        capacity: u64,
    },

    #[error("Tier {0} is closed")]
    TierClosed(String),

    #[error("Unsupported dump version {found} in {path} (expected {expected})")]
    UnsupportedVersion {
        path: String,
        found: u32,
        expected: u32,
    },

    #[error("Item of {size} bytes needs more than u32::MAX segments")]
    ItemTooLarge { size: u64 },

    #[error("Invalid dump {path}: {reason}")]
    InvalidDump { path: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Compression failed: {0}")]
    Compression(#[from] CompressionError),

    #[error("Metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error(transparent)]
    Batch(#[from] BatchError),
}

/// Failures collected from one fan-out operation.
///
/// Workers keep going after a sibling fails, so a batch reports every
/// failure it met rather than the first one.
#[derive(Debug, Default)]
pub struct BatchError {
    pub failures: Vec<(String, String)>,
}

impl BatchError {
    pub fn push(&mut self, context: impl Into<String>, err: impl fmt::Display) {
        self.failures.push((context.into(), err.to_string()));
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// `Ok(())` when nothing failed.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Batch(self))
        }
    }
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} operation(s) failed", self.failures.len())?;
        for (context, message) in &self.failures {
            write!(f, "; {context}: {message}")?;
        }
        Ok(())
    }
}

impl std::error::Error for BatchError {}
