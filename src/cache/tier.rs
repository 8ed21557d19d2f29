//! One level of the cache hierarchy.
//!
//! A [`Tier`] pairs a segment store with its identity (level, name,
//! capacity) and its own auxiliary index. Level 0 is the coldest tier and
//! the write target; the highest level is read first.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tracing::{debug, info};

use crate::cache::auxiliary::Auxiliary;
use crate::cache::compressor::Compressor;
use crate::cache::id::ObjectId;
use crate::config::{BackendKind, TierConfig};
use crate::error::{Error, Result};
use crate::transfer::disk_io::DiskStore;
use crate::transfer::memory::MemoryStore;
use crate::transfer::store::{PutOutcome, SegmentStore};

const AUX_FILE: &str = "aux.json";

/// Per-tier usage statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TierStats {
    pub name: String,
    pub level: usize,
    /// Number of segments resident in this tier.
    pub segment_count: usize,
    /// Total bytes used in this tier.
    pub bytes_used: u64,
    /// Capacity budget in bytes (0 = unbounded).
    pub capacity: u64,
}

impl TierStats {
    /// Usage as a fraction of capacity (0.0 - 1.0). Unbounded tiers report 0.
    pub fn usage_fraction(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.bytes_used as f64 / self.capacity as f64
    }
}

pub struct Tier<A> {
    level: usize,
    config: TierConfig,
    store: Box<dyn SegmentStore>,
    aux: A,
    closed: AtomicBool,
}

impl<A: Auxiliary> Tier<A> {
    /// Build the tier and its backend. Persisted state is restored by [`load`](Self::load).
    pub async fn open(level: usize, config: TierConfig, aux: A) -> Result<Self> {
        let store: Box<dyn SegmentStore> = match config.backend {
            BackendKind::Memory => Box::new(MemoryStore::new(
                &config.name,
                config.dir.clone(),
                config.capacity,
            )),
            BackendKind::Disk => {
                let compressor = if config.compress {
                    Compressor::new(config.zstd_level)
                } else {
                    Compressor::disabled()
                };
                Box::new(
                    DiskStore::new(&config.name, config.dir.clone(), config.capacity, compressor)
                        .await?,
                )
            }
        };
        Ok(Self::with_store(level, config, store, aux))
    }

    /// Wrap a caller-supplied backend.
    pub fn with_store(level: usize, config: TierConfig, store: Box<dyn SegmentStore>, aux: A) -> Self {
        Self {
            level,
            config,
            store,
            aux,
            closed: AtomicBool::new(false),
        }
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &TierConfig {
        &self.config
    }

    /// This tier's auxiliary index. Independent of the registry's.
    pub fn auxiliary(&self) -> &A {
        &self.aux
    }

    fn aux_path(&self) -> PathBuf {
        self.config.dir.join(AUX_FILE)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::TierClosed(self.config.name.clone()));
        }
        Ok(())
    }

    /// Segment bytes, or `None` on a miss.
    pub async fn get(&self, id: &ObjectId, idx: u32) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        self.store.get(id, idx).await
    }

    pub async fn contains(&self, id: &ObjectId, idx: u32) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.store.contains(id, idx).await)
    }

    /// Store one segment. Fails only when the segment alone exceeds capacity.
    pub async fn add(&self, id: ObjectId, idx: u32, data: Bytes) -> Result<PutOutcome> {
        self.ensure_open()?;
        let size = data.len();
        let outcome = self.store.put(id, idx, data).await?;
        debug!(
            tier = %self.config.name,
            level = self.level,
            %id,
            idx,
            size,
            evicted = outcome.evicted,
            "Stored segment"
        );
        Ok(outcome)
    }

    /// Remove every segment of `id` and this tier's auxiliary entry for it.
    pub async fn del(&self, id: &ObjectId) -> Result<usize> {
        self.ensure_open()?;
        let removed = self.store.delete(id).await?;
        self.aux.del(id);
        Ok(removed)
    }

    /// Ids with resident segments.
    pub async fn ids(&self) -> Vec<ObjectId> {
        self.store.ids().await
    }

    pub async fn stats(&self) -> TierStats {
        let usage = self.store.usage().await;
        TierStats {
            name: self.config.name.clone(),
            level: self.level,
            segment_count: usage.segments,
            bytes_used: usage.bytes_used,
            capacity: usage.capacity,
        }
    }

    pub async fn load(&self) -> Result<()> {
        self.store.load().await?;
        self.aux.load(&self.aux_path()).await
    }

    pub async fn dump(&self, parallelism: usize) -> Result<()> {
        self.ensure_open()?;
        self.store.dump(parallelism).await?;
        self.aux.dump(&self.aux_path()).await?;
        info!(tier = %self.config.name, level = self.level, "Dumped tier");
        Ok(())
    }

    /// Flush and refuse further operations. Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.store.flush().await?;
        debug!(tier = %self.config.name, "Closed tier");
        Ok(())
    }
}
