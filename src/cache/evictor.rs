//! Capacity accounting and FIFO eviction for segment stores.
//!
//! Each store keeps one [`FifoEvictor`] that tracks which segments it holds,
//! how large they are and the order they arrived in. Admitting a segment
//! that does not fit pushes the oldest segments out until it does.

use std::collections::{HashMap, VecDeque};

use crate::cache::id::ObjectId;
use crate::error::{Error, Result};

/// Physical address of a segment inside a store.
pub type SegmentKey = (ObjectId, u32);

/// FIFO residency index for one store. A capacity of 0 means unbounded.
#[derive(Debug)]
pub struct FifoEvictor {
    tier: String,
    capacity: u64,
    used: u64,
    order: VecDeque<SegmentKey>,
    sizes: HashMap<SegmentKey, u64>,
}

impl FifoEvictor {
    pub fn new(tier: impl Into<String>, capacity: u64) -> Self {
        Self {
            tier: tier.into(),
            capacity,
            used: 0,
            order: VecDeque::new(),
            sizes: HashMap::new(),
        }
    }

    pub fn contains(&self, key: &SegmentKey) -> bool {
        self.sizes.contains_key(key)
    }

    /// Make room for `size` bytes under `key` and record it.
    ///
    /// Replacing a resident key releases its old size first and keeps its
    /// queue position. Returns the keys evicted to make room, oldest first.
    pub fn admit(&mut self, key: SegmentKey, size: u64) -> Result<Vec<SegmentKey>> {
        if self.capacity > 0 && size > self.capacity {
            return Err(Error::SegmentTooLarge {
                tier: self.tier.clone(),
                size,
                capacity: self.capacity,
            });
        }

        let replacing = match self.sizes.remove(&key) {
            Some(old) => {
                self.used -= old;
                true
            }
            None => false,
        };

        let mut victims = Vec::new();
        while self.capacity > 0 && self.used + size > self.capacity {
            let Some(victim) = self.order.pop_front() else {
                break;
            };
            if victim == key {
                // Keep our own slot; it is re-queued below.
                continue;
            }
            if let Some(freed) = self.sizes.remove(&victim) {
                self.used -= freed;
                victims.push(victim);
            }
        }

        if !replacing || !self.order.contains(&key) {
            self.order.push_back(key);
        }
        self.sizes.insert(key, size);
        self.used += size;
        Ok(victims)
    }

    /// Forget one segment. Returns its size if it was resident.
    pub fn remove(&mut self, key: &SegmentKey) -> Option<u64> {
        let size = self.sizes.remove(key)?;
        self.used -= size;
        self.order.retain(|k| k != key);
        Some(size)
    }

    /// Forget every segment of `id`, returning the removed keys.
    pub fn remove_object(&mut self, id: &ObjectId) -> Vec<SegmentKey> {
        let mut removed = Vec::new();
        self.order.retain(|key| {
            if &key.0 == id {
                removed.push(*key);
                false
            } else {
                true
            }
        });
        for key in &removed {
            if let Some(size) = self.sizes.remove(key) {
                self.used -= size;
            }
        }
        removed
    }

    /// Resident segments in arrival order, with their sizes.
    pub fn entries(&self) -> impl Iterator<Item = (SegmentKey, u64)> + '_ {
        self.order
            .iter()
            .filter_map(|key| self.sizes.get(key).map(|size| (*key, *size)))
    }

    /// Distinct object ids with at least one resident segment.
    pub fn ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self.sizes.keys().map(|(id, _)| *id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}
