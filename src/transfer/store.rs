//! Segment store abstraction: the byte backend behind one tier.

use async_trait::async_trait;
use bytes::Bytes;

use crate::cache::id::ObjectId;
use crate::error::Result;

/// Outcome of a successful [`SegmentStore::put`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutOutcome {
    /// Segments pushed out to make room.
    pub evicted: usize,
}

/// Usage snapshot of a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreUsage {
    pub segments: usize,
    pub bytes_used: u64,
    pub capacity: u64,
}

/// Raw storage for segment bytes keyed by `(ObjectId, segment index)`.
///
/// Stores own their eviction policy and on-disk layout. A miss is `Ok(None)`.
#[async_trait]
pub trait SegmentStore: Send + Sync {
    async fn get(&self, id: &ObjectId, idx: u32) -> Result<Option<Bytes>>;

    async fn contains(&self, id: &ObjectId, idx: u32) -> bool;

    /// Store (or overwrite) one segment, evicting as needed.
    async fn put(&self, id: ObjectId, idx: u32, data: Bytes) -> Result<PutOutcome>;

    /// Drop every segment of `id`. Returns how many were removed.
    async fn delete(&self, id: &ObjectId) -> Result<usize>;

    /// Ids with at least one resident segment.
    async fn ids(&self) -> Vec<ObjectId>;

    async fn usage(&self) -> StoreUsage;

    async fn flush(&self) -> Result<()>;

    async fn load(&self) -> Result<()>;

    async fn dump(&self, parallelism: usize) -> Result<()>;
}
