//! In-memory segment store.
//!
//! Segments live in a hash map; capacity is enforced with the same FIFO
//! accounting the disk store uses. `dump` writes the resident set to the
//! tier directory in the disk store's file layout so `load` can bring it
//! back after a restart.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::cache::evictor::{FifoEvictor, SegmentKey};
use crate::cache::id::ObjectId;
use crate::error::{BatchError, Error, Result};
use crate::transfer::disk_io::{
    read_index, remove_file_if_exists, scan_segments, segment_path, write_index,
};
use crate::transfer::pool::run_bounded;
use crate::transfer::store::{PutOutcome, SegmentStore, StoreUsage};

#[derive(Debug)]
struct MemoryState {
    segments: HashMap<SegmentKey, Bytes>,
    fifo: FifoEvictor,
}

/// RAM-resident segment store.
pub struct MemoryStore {
    dir: PathBuf,
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// `dir` is only touched by `dump` and `load`.
    pub fn new(name: &str, dir: impl Into<PathBuf>, capacity: u64) -> Self {
        Self {
            dir: dir.into(),
            state: Mutex::new(MemoryState {
                segments: HashMap::new(),
                fifo: FifoEvictor::new(name, capacity),
            }),
        }
    }
}

#[async_trait]
impl SegmentStore for MemoryStore {
    async fn get(&self, id: &ObjectId, idx: u32) -> Result<Option<Bytes>> {
        Ok(self.state.lock().await.segments.get(&(*id, idx)).cloned())
    }

    async fn contains(&self, id: &ObjectId, idx: u32) -> bool {
        self.state.lock().await.segments.contains_key(&(*id, idx))
    }

    async fn put(&self, id: ObjectId, idx: u32, data: Bytes) -> Result<PutOutcome> {
        let mut state = self.state.lock().await;
        let victims = state.fifo.admit((id, idx), data.len() as u64)?;
        for victim in &victims {
            state.segments.remove(victim);
        }
        state.segments.insert((id, idx), data);
        Ok(PutOutcome {
            evicted: victims.len(),
        })
    }

    async fn delete(&self, id: &ObjectId) -> Result<usize> {
        let mut state = self.state.lock().await;
        let removed = state.fifo.remove_object(id);
        for key in &removed {
            state.segments.remove(key);
        }
        Ok(removed.len())
    }

    async fn ids(&self) -> Vec<ObjectId> {
        self.state.lock().await.fifo.ids()
    }

    async fn usage(&self) -> StoreUsage {
        let state = self.state.lock().await;
        StoreUsage {
            segments: state.fifo.len(),
            bytes_used: state.fifo.used(),
            capacity: state.fifo.capacity(),
        }
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn load(&self) -> Result<()> {
        let Some(index) = read_index(&self.dir).await? else {
            return Ok(());
        };

        let mut state = self.state.lock().await;
        for entry in index.entries {
            let path = segment_path(&self.dir, &entry.id, entry.idx);
            if !fs::try_exists(&path).await? {
                continue;
            }
            let data = Bytes::from(fs::read(&path).await?);
            let key = (entry.id, entry.idx);
            for victim in state.fifo.admit(key, data.len() as u64)? {
                state.segments.remove(&victim);
            }
            state.segments.insert(key, data);
        }

        info!(
            dir = %self.dir.display(),
            segments = state.segments.len(),
            bytes = state.fifo.used(),
            "Loaded memory store"
        );
        Ok(())
    }

    async fn dump(&self, parallelism: usize) -> Result<()> {
        // Snapshot under the lock, write without it.
        let (snapshot, fifo) = {
            let state = self.state.lock().await;
            let snapshot: Vec<(SegmentKey, Bytes)> = state
                .fifo
                .entries()
                .filter_map(|(key, _)| state.segments.get(&key).map(|data| (key, data.clone())))
                .collect();
            let mut fifo = FifoEvictor::new("snapshot", 0);
            for (key, data) in &snapshot {
                fifo.admit(*key, data.len() as u64)?;
            }
            (snapshot, fifo)
        };

        let dir = &self.dir;
        let failures = run_bounded(parallelism, snapshot, move |((id, idx), data)| async move {
            let path = segment_path(dir, &id, idx);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&path, &data).await?;
            Ok::<(), Error>(())
        })
        .await;

        let mut batch = BatchError::default();
        for (((id, idx), _), e) in failures {
            batch.push(format!("segment {id}/{idx}"), e);
        }
        batch.into_result()?;

        write_index(dir, &fifo).await?;

        // Files of segments deleted or evicted since the previous dump.
        let mut removed = 0usize;
        for ((id, idx), _) in scan_segments(dir).await? {
            if !fifo.contains(&(id, idx)) {
                remove_file_if_exists(&segment_path(dir, &id, idx)).await?;
                removed += 1;
            }
        }

        debug!(dir = %dir.display(), segments = fifo.len(), removed, "Dumped memory store");
        Ok(())
    }
}
