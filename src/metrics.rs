//! Cache counters.
//!
//! Each cache owns its own prometheus registry so several caches can live in
//! one process. Nothing is exported over the network; callers gather or
//! render the registry themselves.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::error::Result;

pub struct CacheMetrics {
    registry: Registry,
    hits: IntCounterVec,
    misses: IntCounter,
    promotions: IntCounterVec,
    evictions: IntCounterVec,
    segment_writes: IntCounter,
}

impl CacheMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let hits = IntCounterVec::new(
            Opts::new("levelcache_hits_total", "Segment reads served, by tier"),
            &["tier"],
        )?;
        let misses = IntCounter::new(
            "levelcache_misses_total",
            "Segment reads not found in any tier",
        )?;
        let promotions = IntCounterVec::new(
            Opts::new("levelcache_promotions_total", "Segments copied up, by target tier"),
            &["tier"],
        )?;
        let evictions = IntCounterVec::new(
            Opts::new("levelcache_evictions_total", "Segments evicted to make room, by tier"),
            &["tier"],
        )?;
        let segment_writes = IntCounter::new(
            "levelcache_segment_writes_total",
            "Segments written by callers",
        )?;

        registry.register(Box::new(hits.clone()))?;
        registry.register(Box::new(misses.clone()))?;
        registry.register(Box::new(promotions.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(segment_writes.clone()))?;

        Ok(Self {
            registry,
            hits,
            misses,
            promotions,
            evictions,
            segment_writes,
        })
    }

    pub fn record_hit(&self, tier: &str) {
        self.hits.with_label_values(&[tier]).inc();
    }

    pub fn record_miss(&self) {
        self.misses.inc();
    }

    pub fn record_promotion(&self, tier: &str) {
        self.promotions.with_label_values(&[tier]).inc();
    }

    pub fn record_evictions(&self, tier: &str, count: usize) {
        if count > 0 {
            self.evictions.with_label_values(&[tier]).inc_by(count as u64);
        }
    }

    pub fn record_segment_write(&self) {
        self.segment_writes.inc();
    }

    pub fn hits(&self, tier: &str) -> u64 {
        self.hits.with_label_values(&[tier]).get()
    }

    pub fn misses(&self) -> u64 {
        self.misses.get()
    }

    pub fn promotions(&self, tier: &str) -> u64 {
        self.promotions.with_label_values(&[tier]).get()
    }

    pub fn evictions(&self, tier: &str) -> u64 {
        self.evictions.with_label_values(&[tier]).get()
    }

    pub fn segment_writes(&self) -> u64 {
        self.segment_writes.get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of every counter.
    pub fn render(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}
