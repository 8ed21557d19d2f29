//! The cache orchestrator.
//!
//! [`Cache`] owns the metadata registry and the ordered tier list. Writes
//! land in tier 0 (the coldest); reads scan from the hottest tier down and
//! copy each hit one step closer to the top.

use std::ops::Range;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::cache::auxiliary::{AuxFactory, AuxSlot, Auxiliary, Matcher};
use crate::cache::id::ObjectId;
use crate::cache::item::{seg_size_for, Item};
use crate::cache::promoter::{checked_target, OneLevelUp, PromotionPolicy};
use crate::cache::registry::{ItemHandle, Registry, SegmentWrite};
use crate::cache::tier::{Tier, TierStats};
use crate::config::CacheConfig;
use crate::error::{BatchError, Error, Result};
use crate::metrics::CacheMetrics;

/// Result of a read against a known item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fetched {
    /// Bytes of every segment found, in segment order.
    pub chunks: Vec<Bytes>,
    /// Name of the tier each chunk came from.
    pub hit_tiers: Vec<String>,
    /// Segment index of each chunk.
    pub hit_segments: Vec<u32>,
    /// Byte ranges of segments found in no tier.
    pub missed: Vec<Range<u64>>,
}

impl Fetched {
    /// Whether every requested segment was found.
    pub fn is_complete(&self) -> bool {
        self.missed.is_empty()
    }

    /// Total bytes returned.
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

pub struct Cache<A: Auxiliary> {
    config: CacheConfig,
    registry: Registry<A>,
    tiers: Vec<Tier<A>>,
    policy: Box<dyn PromotionPolicy>,
    metrics: CacheMetrics,
}

impl<A: Auxiliary> Cache<A> {
    /// Build the registry and one tier per configured entry, restore their
    /// persisted state, then drop tier data for ids the registry does not
    /// know.
    pub async fn open(config: CacheConfig, aux_factory: &AuxFactory<'_, A>) -> Result<Self> {
        config.validate()?;

        let registry = Registry::open(&config.meta_dir, aux_factory(AuxSlot::Registry)).await?;

        let mut tiers = Vec::with_capacity(config.tiers.len());
        for (level, tier_config) in config.tiers.iter().enumerate() {
            let tier = Tier::open(level, tier_config.clone(), aux_factory(AuxSlot::Tier(level))).await?;
            tier.load().await?;
            tiers.push(tier);
        }

        let cache = Self {
            config,
            registry,
            tiers,
            policy: Box::new(OneLevelUp),
            metrics: CacheMetrics::new()?,
        };
        let reclaimed = cache.reclaim_strays().await?;

        info!(
            tiers = cache.tiers.len(),
            items = cache.registry.len().await,
            reclaimed,
            "Cache opened"
        );
        Ok(cache)
    }

    /// Replace the promotion policy (default: [`OneLevelUp`]).
    pub fn with_policy(mut self, policy: impl PromotionPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    /// Remove tier data whose id has no registry record.
    async fn reclaim_strays(&self) -> Result<usize> {
        let mut reclaimed = 0;
        for tier in &self.tiers {
            for id in tier.ids().await {
                if self.registry.contains(&id).await {
                    continue;
                }
                let segments = tier.del(&id).await?;
                warn!(tier = tier.name(), %id, segments, "Reclaimed stray tier data");
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    /// Close every tier. Failures are collected, not short-circuited.
    pub async fn close(&self) -> Result<()> {
        let mut batch = BatchError::default();
        for tier in &self.tiers {
            if let Err(e) = tier.close().await {
                batch.push(format!("close tier {}", tier.name()), e);
            }
        }
        batch.into_result()
    }

    /// Persist the registry, then every tier.
    pub async fn dump(&self) -> Result<()> {
        let parallelism = self.config.action_parallel;
        let mut batch = BatchError::default();

        if let Err(e) = self.registry.dump(parallelism).await {
            batch.push("dump registry", e);
        }
        for tier in &self.tiers {
            if let Err(e) = tier.dump(parallelism).await {
                batch.push(format!("dump tier {}", tier.name()), e);
            }
        }

        if !batch.is_empty() {
            warn!(failed = batch.len(), "Dump finished with failures");
        }
        batch.into_result()
    }

    /// Register an object of `size` bytes.
    ///
    /// The segment size targets ~1024 segments per object, clamped to
    /// [1 MiB, 64 MiB]. Re-adding a known id recreates it: its segment set is
    /// reset and any tier copies are dropped so stale bytes are never served.
    pub async fn add_item(
        &self,
        id: ObjectId,
        expire: i64,
        size: u64,
        payload: A::Payload,
    ) -> Result<Item> {
        let seg_size = seg_size_for(size);
        if size.div_ceil(seg_size) > u64::from(u32::MAX) {
            return Err(Error::ItemTooLarge { size });
        }

        let item = Item::new(expire, size, seg_size);
        let existed = self.registry.contains(&id).await;
        // Register first: a promotion that lands after the purge below sees
        // its handle retired and drops its own copy.
        self.registry.add_item(id, item.clone(), payload).await;
        if existed {
            self.purge_tiers(&id).await?;
        }
        debug!(%id, size, seg_size = item.seg_size, segments = item.segment_count(), "Added item");
        Ok(item)
    }

    /// Store `data` at byte offset `start` of the object, into tier 0.
    ///
    /// Only segments `data` covers completely are written; segments already
    /// stored are left alone.
    pub async fn add_segment(&self, id: &ObjectId, start: u64, data: Bytes) -> Result<SegmentWrite> {
        let Some(end) = start.checked_add(data.len() as u64) else {
            let size = self.registry.get(id).await.map_or(0, |item| item.size);
            return Err(Error::InvalidRange {
                start,
                end: u64::MAX,
                size,
            });
        };
        let coldest = &self.tiers[0];
        let metrics = &self.metrics;
        let data = &data;

        let outcome = self
            .registry
            .add_segment(id, start, end, move |idx, bytes| {
                let slice = data.slice((bytes.start - start) as usize..(bytes.end - start) as usize);
                async move {
                    let outcome = coldest.add(*id, idx, slice).await?;
                    metrics.record_segment_write();
                    metrics.record_evictions(coldest.name(), outcome.evicted);
                    Ok(())
                }
            })
            .await?;

        // A delete that ran during the write has already purged the tiers.
        if !outcome.written.is_empty() && !self.registry.contains(id).await {
            coldest.del(id).await?;
            debug!(%id, "Dropped write of deleted item");
        }
        Ok(outcome)
    }

    /// Read the segments overlapping `[start, end]`; `end == None` reads
    /// through the end of the object.
    ///
    /// Returns `Ok(None)` for an unregistered id, so callers can tell
    /// "unknown object" apart from "known object, nothing resident".
    pub async fn get(&self, id: &ObjectId, start: u64, end: Option<u64>) -> Result<Option<Fetched>> {
        let Some(handle) = self.registry.handle(id).await else {
            return Ok(None);
        };
        let item = handle.item().await;
        let end = end.unwrap_or(item.size);

        let mut fetched = Fetched::default();
        let Some(segments) = item.read_segments(start, end) else {
            return Ok(Some(fetched));
        };

        for idx in segments {
            let hit = if item.segments.contains(&idx) {
                self.scan(id, idx).await?
            } else {
                None
            };

            match hit {
                Some((level, data)) => {
                    let name = self.tiers[level].name();
                    self.metrics.record_hit(name);
                    self.promote(id, &handle, idx, level, &data).await?;
                    fetched.hit_tiers.push(name.to_string());
                    fetched.hit_segments.push(idx);
                    fetched.chunks.push(data);
                }
                None => {
                    self.metrics.record_miss();
                    fetched.missed.push(item.segment_bytes(idx));
                }
            }
        }

        debug!(
            %id,
            start,
            end,
            hits = fetched.chunks.len(),
            misses = fetched.missed.len(),
            "Get complete"
        );
        Ok(Some(fetched))
    }

    /// First tier holding the segment, scanning from the hottest down.
    async fn scan(&self, id: &ObjectId, idx: u32) -> Result<Option<(usize, Bytes)>> {
        for tier in self.tiers.iter().rev() {
            if let Some(data) = tier.get(id, idx).await? {
                return Ok(Some((tier.level(), data)));
            }
        }
        Ok(None)
    }

    /// Copy a hit toward the hottest tier as the policy directs.
    ///
    /// `handle` is the registration `data` was read for. If the id was
    /// deleted or re-added meanwhile, the copy is dropped again so neither a
    /// deleted item nor an older registration's bytes stay resident.
    async fn promote(
        &self,
        id: &ObjectId,
        handle: &ItemHandle,
        idx: u32,
        hit_level: usize,
        data: &Bytes,
    ) -> Result<()> {
        let top = self.tiers.len() - 1;
        let Some(target) = checked_target(self.policy.as_ref(), hit_level, top) else {
            return Ok(());
        };
        let tier = &self.tiers[target];
        if tier.contains(id, idx).await? {
            return Ok(());
        }

        let outcome = tier.add(*id, idx, data.clone()).await?;
        self.metrics.record_promotion(tier.name());
        self.metrics.record_evictions(tier.name(), outcome.evicted);

        if !self.registry.is_current(id, handle).await {
            tier.del(id).await?;
            debug!(%id, idx, tier = tier.name(), "Dropped promotion of retired item");
            return Ok(());
        }

        debug!(%id, idx, from = hit_level, to = target, "Promoted segment");
        Ok(())
    }

    /// Remove the object from the registry and from every tier.
    ///
    /// Every tier is visited even if some never held the object or an
    /// earlier one fails. Returns whether the registry knew the id.
    pub async fn del(&self, id: &ObjectId) -> Result<bool> {
        let existed = self.registry.del(id).await;
        self.purge_tiers(id).await?;
        debug!(%id, existed, "Deleted item");
        Ok(existed)
    }

    async fn purge_tiers(&self, id: &ObjectId) -> Result<()> {
        let mut batch = BatchError::default();
        for tier in &self.tiers {
            if let Err(e) = tier.del(id).await {
                batch.push(format!("tier {}", tier.name()), e);
            }
        }
        batch.into_result()
    }

    /// Delete every object `matcher` selects from the registry's auxiliary
    /// index, `action_parallel` at a time. Returns the number deleted.
    pub async fn del_batch(&self, matcher: &Matcher<'_, A>) -> Result<usize> {
        self.registry
            .del_batch(self.config.action_parallel, matcher, move |id| async move {
                self.purge_tiers(&id).await
            })
            .await
    }

    /// Registry snapshot of an item.
    pub async fn item(&self, id: &ObjectId) -> Option<Item> {
        self.registry.get(id).await
    }

    pub fn tier(&self, level: usize) -> Option<&Tier<A>> {
        self.tiers.get(level)
    }

    pub fn tiers(&self) -> &[Tier<A>] {
        &self.tiers
    }

    pub async fn tier_stats(&self) -> Vec<TierStats> {
        let mut stats = Vec::with_capacity(self.tiers.len());
        for tier in &self.tiers {
            stats.push(tier.stats().await);
        }
        stats
    }

    pub fn registry(&self) -> &Registry<A> {
        &self.registry
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}
