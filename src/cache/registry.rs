//! Metadata registry: the authoritative item catalogue.
//!
//! The registry decides whether an object exists, how it is segmented and
//! which segments have been stored. It also owns the auxiliary index that
//! holds the caller's per-item payloads, which batch deletes match against.
//!
//! The catalogue is split into 256 buckets by the first id byte. Each item
//! sits behind its own async mutex: `add_segment` holds it across the device
//! write so concurrent writers to one item never interleave their update of
//! the segment set, and the write always lands before the segment is marked.

use std::collections::HashMap;
use std::future::Future;
use std::io::ErrorKind;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::cache::auxiliary::{Auxiliary, Matcher};
use crate::cache::id::ObjectId;
use crate::cache::item::Item;
use crate::error::{BatchError, Error, Result};
use crate::transfer::disk_io::DUMP_VERSION;
use crate::transfer::pool::run_bounded;

/// Number of catalogue buckets; one per value of the first id byte.
pub const BUCKET_COUNT: usize = 256;

const AUX_FILE: &str = "aux.json";

type ItemCell = Arc<Mutex<Item>>;
type Bucket = RwLock<HashMap<ObjectId, ItemCell>>;

#[derive(Serialize, Deserialize)]
struct BucketDump {
    version: u32,
    items: Vec<(ObjectId, Item)>,
}

/// What an `add_segment` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentWrite {
    /// Segments written and marked by this call.
    pub written: Vec<u32>,
    /// Covered segments skipped because they were already stored.
    pub already_present: Vec<u32>,
    /// Segments the range only partly covered; their bytes were dropped.
    pub skipped_partial: Vec<u32>,
}

/// One registration of an id.
///
/// Re-adding or deleting the id retires the handle, even though the id
/// itself may be registered again.
#[derive(Clone)]
pub struct ItemHandle(ItemCell);

impl ItemHandle {
    /// Snapshot of the item as registered under this handle.
    pub async fn item(&self) -> Item {
        self.0.lock().await.clone()
    }
}

pub struct Registry<A> {
    dir: PathBuf,
    buckets: Vec<Bucket>,
    aux: A,
}

impl<A: Auxiliary> Registry<A> {
    /// Open the registry rooted at `dir`, restoring any previous dump.
    pub async fn open(dir: impl Into<PathBuf>, aux: A) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let registry = Self {
            dir,
            buckets: (0..BUCKET_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            aux,
        };
        registry.load().await?;
        Ok(registry)
    }

    fn bucket(&self, id: &ObjectId) -> &Bucket {
        &self.buckets[id.bucket()]
    }

    fn bucket_path(&self, bucket: usize) -> PathBuf {
        bucket_path(&self.dir, bucket)
    }

    async fn cell(&self, id: &ObjectId) -> Option<ItemCell> {
        self.bucket(id).read().await.get(id).cloned()
    }

    /// Snapshot of an item. Never mutates.
    pub async fn get(&self, id: &ObjectId) -> Option<Item> {
        let cell = self.cell(id).await?;
        let item = cell.lock().await.clone();
        Some(item)
    }

    pub async fn contains(&self, id: &ObjectId) -> bool {
        self.bucket(id).read().await.contains_key(id)
    }

    /// Handle on the current registration of `id`.
    pub async fn handle(&self, id: &ObjectId) -> Option<ItemHandle> {
        self.cell(id).await.map(ItemHandle)
    }

    /// Whether `handle` is still the live registration of `id`.
    pub async fn is_current(&self, id: &ObjectId, handle: &ItemHandle) -> bool {
        self.bucket(id)
            .read()
            .await
            .get(id)
            .is_some_and(|cell| Arc::ptr_eq(cell, &handle.0))
    }

    /// Register `item` and store `payload` in the registry's auxiliary index.
    ///
    /// Re-adding a known id recreates it: the previous segment set is
    /// discarded, not merged.
    pub async fn add_item(&self, id: ObjectId, item: Item, payload: A::Payload) {
        let replaced = self
            .bucket(&id)
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(item)))
            .is_some();
        self.aux.add(id, payload);
        debug!(%id, replaced, "Registered item");
    }

    /// Store the segments covered by `[start, end)` that are not yet present.
    ///
    /// `write(idx, bytes)` receives the segment index and its byte range
    /// within the object. A segment is marked present only after its write
    /// returns `Ok`; an error stops the call with earlier segments kept.
    pub async fn add_segment<F, Fut>(
        &self,
        id: &ObjectId,
        start: u64,
        end: u64,
        mut write: F,
    ) -> Result<SegmentWrite>
    where
        F: FnMut(u32, Range<u64>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let cell = self.cell(id).await.ok_or(Error::ItemNotFound(*id))?;
        let mut item = cell.lock().await;

        if start >= end || end > item.size {
            return Err(Error::InvalidRange {
                start,
                end,
                size: item.size,
            });
        }

        let covered = item.covered_segments(start, end);
        let mut outcome = SegmentWrite {
            skipped_partial: item
                .touched_segments(start, end)
                .filter(|idx| !covered.contains(idx))
                .collect(),
            ..Default::default()
        };
        for idx in covered {
            if item.segments.contains(&idx) {
                outcome.already_present.push(idx);
                continue;
            }
            write(idx, item.segment_bytes(idx)).await?;
            item.segments.insert(idx);
            outcome.written.push(idx);
        }

        debug!(
            %id,
            start,
            end,
            written = outcome.written.len(),
            already_present = outcome.already_present.len(),
            skipped_partial = outcome.skipped_partial.len(),
            "Added segments"
        );
        Ok(outcome)
    }

    /// Remove the item and its auxiliary entry. Returns whether it existed.
    pub async fn del(&self, id: &ObjectId) -> bool {
        let existed = self.bucket(id).write().await.remove(id).is_some();
        self.aux.del(id);
        existed
    }

    /// Delete every id `matcher` selects, `parallelism` at a time.
    ///
    /// The id set is taken once, before any deletion; items registered
    /// afterwards are untouched. `on_delete` runs after each registry
    /// removal (the orchestrator uses it to clear the tiers). Returns the
    /// number of ids fully deleted; per-id failures are collected into one
    /// [`BatchError`].
    pub async fn del_batch<F, Fut>(
        &self,
        parallelism: usize,
        matcher: &Matcher<'_, A>,
        on_delete: F,
    ) -> Result<usize>
    where
        F: Fn(ObjectId) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut ids = matcher(&self.aux);
        ids.sort_unstable();
        ids.dedup();
        let matched = ids.len();

        let on_delete = &on_delete;
        let failures = run_bounded(parallelism, ids, move |id| async move {
            self.del(&id).await;
            on_delete(id).await
        })
        .await;

        let deleted = matched - failures.len();
        let mut batch = BatchError::default();
        for (id, e) in failures {
            batch.push(id.to_string(), e);
        }
        if !batch.is_empty() {
            warn!(matched, failed = batch.len(), "Batch delete finished with failures");
        }
        info!(matched, deleted, "Batch delete complete");
        batch.into_result()?;
        Ok(deleted)
    }

    /// Persist the catalogue (one file per bucket) and the auxiliary index.
    pub async fn dump(&self, parallelism: usize) -> Result<()> {
        let failures = run_bounded(parallelism, 0..BUCKET_COUNT, move |bucket| {
            self.dump_bucket(bucket)
        })
        .await;

        let mut batch = BatchError::default();
        for (bucket, e) in failures {
            batch.push(format!("bucket {bucket:02x}"), e);
        }
        if let Err(e) = self.aux.dump(&self.dir.join(AUX_FILE)).await {
            batch.push("registry auxiliary", e);
        }
        batch.into_result()?;

        info!(dir = %self.dir.display(), items = self.len().await, "Dumped registry");
        Ok(())
    }

    async fn dump_bucket(&self, bucket: usize) -> Result<()> {
        let cells: Vec<(ObjectId, ItemCell)> = self.buckets[bucket]
            .read()
            .await
            .iter()
            .map(|(id, cell)| (*id, cell.clone()))
            .collect();

        let path = self.bucket_path(bucket);
        if cells.is_empty() {
            return match fs::remove_file(&path).await {
                Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            };
        }

        let mut items = Vec::with_capacity(cells.len());
        for (id, cell) in cells {
            items.push((id, cell.lock().await.clone()));
        }
        let dump = BucketDump {
            version: DUMP_VERSION,
            items,
        };

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(&dump)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load(&self) -> Result<()> {
        let mut loaded = 0usize;
        for bucket in 0..BUCKET_COUNT {
            let path = self.bucket_path(bucket);
            let data = match fs::read(&path).await {
                Ok(data) => data,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let dump: BucketDump = serde_json::from_slice(&data)?;
            if dump.version != DUMP_VERSION {
                return Err(Error::UnsupportedVersion {
                    path: path.display().to_string(),
                    found: dump.version,
                    expected: DUMP_VERSION,
                });
            }

            if let Some((id, _)) = dump.items.iter().find(|(_, item)| item.seg_size == 0) {
                return Err(Error::InvalidDump {
                    path: path.display().to_string(),
                    reason: format!("item {id} has a zero segment size"),
                });
            }

            let mut map = self.buckets[bucket].write().await;
            for (id, item) in dump.items {
                map.insert(id, Arc::new(Mutex::new(item)));
                loaded += 1;
            }
        }
        self.aux.load(&self.dir.join(AUX_FILE)).await?;
        if loaded > 0 {
            info!(dir = %self.dir.display(), items = loaded, "Loaded registry");
        }
        Ok(())
    }

    /// Number of registered items.
    pub async fn len(&self) -> usize {
        let mut total = 0;
        for bucket in &self.buckets {
            total += bucket.read().await.len();
        }
        total
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of every registered id.
    pub async fn ids(&self) -> Vec<ObjectId> {
        let mut ids = Vec::new();
        for bucket in &self.buckets {
            ids.extend(bucket.read().await.keys().copied());
        }
        ids
    }

    /// Ids whose expiry is set (non-zero) and lies at or before `now`.
    pub async fn expired(&self, now: i64) -> Vec<ObjectId> {
        let mut ids = Vec::new();
        for bucket in &self.buckets {
            for (id, cell) in bucket.read().await.iter() {
                let item = cell.lock().await;
                if item.expire != 0 && item.is_expired(now) {
                    ids.push(*id);
                }
            }
        }
        ids
    }

    pub fn auxiliary(&self) -> &A {
        &self.aux
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn bucket_path(dir: &Path, bucket: usize) -> PathBuf {
    dir.join(format!("bucket-{bucket:02x}.json"))
}
