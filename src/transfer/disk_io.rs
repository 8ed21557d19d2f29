//! Disk-backed segment store.
//!
//! Each segment is one file under a two-level directory tree keyed by the
//! first byte of the object id, so no single directory grows unbounded:
//! `<dir>/9c/9c0f...e1-12.seg`. An `index.json` next to the shards records
//! the FIFO order and sizes so eviction survives a restart.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::compressor::Compressor;
use crate::cache::evictor::{FifoEvictor, SegmentKey};
use crate::cache::id::ObjectId;
use crate::error::{Error, Result};
use crate::transfer::store::{PutOutcome, SegmentStore, StoreUsage};

/// Version stamped into every index and catalogue file.
pub const DUMP_VERSION: u32 = 1000;

const INDEX_FILE: &str = "index.json";
const SEGMENT_EXT: &str = "seg";

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct IndexEntry {
    pub id: ObjectId,
    pub idx: u32,
    pub size: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SegmentIndex {
    pub version: u32,
    pub entries: Vec<IndexEntry>,
}

/// File path of a segment under `base`.
pub(crate) fn segment_path(base: &Path, id: &ObjectId, idx: u32) -> PathBuf {
    let hex = id.to_hex();
    base.join(&hex[..2])
        .join(format!("{hex}-{idx}.{SEGMENT_EXT}"))
}

/// Recover `(id, idx)` from a segment file name.
pub(crate) fn parse_segment_file(name: &str) -> Option<SegmentKey> {
    let stem = name.strip_suffix(&format!(".{SEGMENT_EXT}"))?;
    let (hex, idx) = stem.split_once('-')?;
    Some((hex.parse().ok()?, idx.parse().ok()?))
}

pub(crate) async fn write_index(dir: &Path, fifo: &FifoEvictor) -> Result<()> {
    let index = SegmentIndex {
        version: DUMP_VERSION,
        entries: fifo
            .entries()
            .map(|((id, idx), size)| IndexEntry { id, idx, size })
            .collect(),
    };
    fs::create_dir_all(dir).await?;
    let tmp = dir.join(format!("{INDEX_FILE}.tmp"));
    fs::write(&tmp, serde_json::to_vec(&index)?).await?;
    fs::rename(&tmp, dir.join(INDEX_FILE)).await?;
    Ok(())
}

pub(crate) async fn read_index(dir: &Path) -> Result<Option<SegmentIndex>> {
    let path = dir.join(INDEX_FILE);
    let data = match fs::read(&path).await {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let index: SegmentIndex = serde_json::from_slice(&data)?;
    if index.version != DUMP_VERSION {
        return Err(Error::UnsupportedVersion {
            path: path.display().to_string(),
            found: index.version,
            expected: DUMP_VERSION,
        });
    }
    Ok(Some(index))
}

/// Every segment file found under the shard directories of `dir`.
pub(crate) async fn scan_segments(dir: &Path) -> Result<Vec<(SegmentKey, u64)>> {
    let mut found = Vec::new();
    let mut shards = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e.into()),
    };
    while let Some(shard) = shards.next_entry().await? {
        if !shard.metadata().await?.is_dir() {
            continue;
        }
        let mut files = fs::read_dir(shard.path()).await?;
        while let Some(file) = files.next_entry().await? {
            let name = file.file_name();
            let Some(key) = name.to_str().and_then(parse_segment_file) else {
                continue;
            };
            found.push((key, file.metadata().await?.len()));
        }
    }
    Ok(found)
}

pub(crate) async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Segment store keeping one file per segment.
pub struct DiskStore {
    dir: PathBuf,
    compressor: Compressor,
    state: Mutex<FifoEvictor>,
}

impl DiskStore {
    /// Create a store rooted at `dir`, creating the directory if needed.
    pub async fn new(
        name: &str,
        dir: impl Into<PathBuf>,
        capacity: u64,
        compressor: Compressor,
    ) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            compressor,
            state: Mutex::new(FifoEvictor::new(name, capacity)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl SegmentStore for DiskStore {
    async fn get(&self, id: &ObjectId, idx: u32) -> Result<Option<Bytes>> {
        let key = (*id, idx);
        if !self.state.lock().await.contains(&key) {
            return Ok(None);
        }

        // Read outside the lock; a concurrent delete or eviction may unlink
        // the file in between.
        let path = segment_path(&self.dir, id, idx);
        let frame = match fs::read(&path).await {
            Ok(frame) => frame,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let mut fifo = self.state.lock().await;
                if fifo.contains(&key) && !fs::try_exists(&path).await? {
                    warn!(path = %path.display(), "Indexed segment file vanished");
                    fifo.remove(&key);
                }
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let data = self.compressor.decode(&frame)?;
        debug!(%id, idx, size = data.len(), "Read segment from disk");
        Ok(Some(data))
    }

    async fn contains(&self, id: &ObjectId, idx: u32) -> bool {
        self.state.lock().await.contains(&(*id, idx))
    }

    async fn put(&self, id: ObjectId, idx: u32, data: Bytes) -> Result<PutOutcome> {
        let frame = self.compressor.encode(&data)?;
        let path = segment_path(&self.dir, &id, idx);

        // The payload goes to a private temp file without the lock held;
        // only the rename into place happens under it.
        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&tmp, &frame).await?;

        let mut fifo = self.state.lock().await;
        let victims = match fifo.admit((id, idx), frame.len() as u64) {
            Ok(victims) => victims,
            Err(e) => {
                remove_file_if_exists(&tmp).await?;
                return Err(e);
            }
        };
        for (victim_id, victim_idx) in &victims {
            remove_file_if_exists(&segment_path(&self.dir, victim_id, *victim_idx)).await?;
        }
        if let Err(e) = fs::rename(&tmp, &path).await {
            fifo.remove(&(id, idx));
            remove_file_if_exists(&tmp).await?;
            return Err(e.into());
        }
        drop(fifo);

        debug!(
            %id,
            idx,
            size = data.len(),
            stored = frame.len(),
            evicted = victims.len(),
            "Wrote segment to disk"
        );
        Ok(PutOutcome {
            evicted: victims.len(),
        })
    }

    async fn delete(&self, id: &ObjectId) -> Result<usize> {
        let mut fifo = self.state.lock().await;
        let removed = fifo.remove_object(id);
        for (_, idx) in &removed {
            remove_file_if_exists(&segment_path(&self.dir, id, *idx)).await?;
        }
        Ok(removed.len())
    }

    async fn ids(&self) -> Vec<ObjectId> {
        self.state.lock().await.ids()
    }

    async fn usage(&self) -> StoreUsage {
        let fifo = self.state.lock().await;
        StoreUsage {
            segments: fifo.len(),
            bytes_used: fifo.used(),
            capacity: fifo.capacity(),
        }
    }

    async fn flush(&self) -> Result<()> {
        let fifo = self.state.lock().await;
        write_index(&self.dir, &fifo).await
    }

    async fn load(&self) -> Result<()> {
        let mut fifo = self.state.lock().await;

        if let Some(index) = read_index(&self.dir).await? {
            for entry in index.entries {
                let path = segment_path(&self.dir, &entry.id, entry.idx);
                if !fs::try_exists(&path).await? {
                    continue;
                }
                for (id, idx) in fifo.admit((entry.id, entry.idx), entry.size)? {
                    remove_file_if_exists(&segment_path(&self.dir, &id, idx)).await?;
                }
            }
        }

        // Segment files written after the last index dump.
        let mut adopted = 0usize;
        for (key, size) in scan_segments(&self.dir).await? {
            if fifo.contains(&key) {
                continue;
            }
            for (id, idx) in fifo.admit(key, size)? {
                remove_file_if_exists(&segment_path(&self.dir, &id, idx)).await?;
            }
            adopted += 1;
        }

        info!(
            dir = %self.dir.display(),
            segments = fifo.len(),
            bytes = fifo.used(),
            adopted,
            "Loaded disk store"
        );
        Ok(())
    }

    async fn dump(&self, _parallelism: usize) -> Result<()> {
        // Segment files are durable as written; only the order needs saving.
        self.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::compressor::DEFAULT_ZSTD_LEVEL;
    use futures::future::join_all;
    use tempfile::TempDir;

    async fn store(tmp: &TempDir, capacity: u64) -> DiskStore {
        DiskStore::new("ssd", tmp.path().join("ssd"), capacity, Compressor::disabled())
            .await
            .unwrap()
    }

    #[test]
    fn test_segment_file_names() {
        let id = ObjectId::from_bytes([0x9c; 16]);
        let path = segment_path(Path::new("/base"), &id, 12);
        assert!(path.starts_with("/base/9c"));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(parse_segment_file(name), Some((id, 12)));
        assert_eq!(parse_segment_file("index.json"), None);
    }

    #[tokio::test]
    async fn test_write_and_read_segment() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp, 0).await;
        let id = ObjectId::new_random();

        store.put(id, 3, Bytes::from(vec![42u8; 4096])).await.unwrap();
        let data = store.get(&id, 3).await.unwrap().unwrap();
        assert_eq!(&data[..], &[42u8; 4096][..]);
        assert!(store.get(&id, 4).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_object() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp, 0).await;
        let id = ObjectId::new_random();

        store.put(id, 0, Bytes::from_static(b"a")).await.unwrap();
        store.put(id, 1, Bytes::from_static(b"b")).await.unwrap();
        assert_eq!(store.delete(&id).await.unwrap(), 2);
        assert!(store.get(&id, 0).await.unwrap().is_none());
        assert!(!segment_path(store.dir(), &id, 1).exists());
    }

    #[tokio::test]
    async fn test_eviction_removes_files() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp, 200).await;
        let first = ObjectId::from_bytes([1; 16]);
        let second = ObjectId::from_bytes([2; 16]);

        store.put(first, 0, Bytes::from(vec![0u8; 150])).await.unwrap();
        let outcome = store.put(second, 0, Bytes::from(vec![0u8; 150])).await.unwrap();
        assert_eq!(outcome.evicted, 1);
        assert!(!segment_path(store.dir(), &first, 0).exists());
        assert!(store.get(&second, 0).await.unwrap().is_some());

        let err = store.put(second, 1, Bytes::from(vec![0u8; 201])).await.unwrap_err();
        assert!(matches!(err, Error::SegmentTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_reload_from_index_and_scan() {
        let tmp = TempDir::new().unwrap();
        let id = ObjectId::new_random();
        {
            let store = store(&tmp, 0).await;
            store.put(id, 0, Bytes::from_static(b"indexed")).await.unwrap();
            store.dump(1).await.unwrap();
            // Written after the dump: found by the directory scan.
            store.put(id, 1, Bytes::from_static(b"scanned")).await.unwrap();
        }

        let reopened = store(&tmp, 0).await;
        reopened.load().await.unwrap();
        assert_eq!(&reopened.get(&id, 0).await.unwrap().unwrap()[..], b"indexed");
        assert_eq!(&reopened.get(&id, 1).await.unwrap().unwrap()[..], b"scanned");
        assert_eq!(reopened.usage().await.segments, 2);
    }

    #[tokio::test]
    async fn test_compressed_store() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::new(
            "hdd",
            tmp.path().join("hdd"),
            0,
            Compressor::new(DEFAULT_ZSTD_LEVEL),
        )
        .await
        .unwrap();
        let id = ObjectId::new_random();

        store.put(id, 0, Bytes::from(vec![7u8; 64 * 1024])).await.unwrap();
        assert!(store.usage().await.bytes_used < 64 * 1024);
        let data = store.get(&id, 0).await.unwrap().unwrap();
        assert_eq!(data.len(), 64 * 1024);
    }

    #[tokio::test]
    async fn test_concurrent_puts_and_gets() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp, 0).await;
        let ids: Vec<ObjectId> = (0..16u8).map(|i| ObjectId::from_bytes([i; 16])).collect();

        let s = &store;
        let writes = ids.iter().enumerate().map(|(i, id)| async move {
            s.put(*id, 0, Bytes::from(vec![i as u8; 8192])).await
        });
        for result in join_all(writes).await {
            result.unwrap();
        }

        let reads = ids.iter().map(|id| s.get(id, 0));
        for (i, data) in join_all(reads).await.into_iter().enumerate() {
            assert_eq!(data.unwrap().unwrap(), Bytes::from(vec![i as u8; 8192]));
        }

        // No temp files left next to the segments.
        let shard = segment_path(store.dir(), &ids[3], 0);
        let mut entries = std::fs::read_dir(shard.parent().unwrap()).unwrap();
        assert!(entries.all(|e| e.unwrap().path().extension().unwrap() == "seg"));
        assert_eq!(store.usage().await.segments, ids.len());
    }

    #[tokio::test]
    async fn test_get_racing_delete_returns_none() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp, 0).await;
        let id = ObjectId::new_random();
        store.put(id, 0, Bytes::from(vec![1u8; 4096])).await.unwrap();

        // File unlinked behind the index: the read misses and forgets it.
        std::fs::remove_file(segment_path(store.dir(), &id, 0)).unwrap();
        assert!(store.get(&id, 0).await.unwrap().is_none());
        assert!(!store.contains(&id, 0).await);

        let (read, deleted) = tokio::join!(store.get(&id, 0), store.delete(&id));
        assert!(read.unwrap().is_none());
        assert_eq!(deleted.unwrap(), 0);
    }
}
