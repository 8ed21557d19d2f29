//! Pluggable auxiliary indexes.
//!
//! The registry and every tier each own one [`Auxiliary`] instance, built by
//! an [`AuxFactory`] from the slot it will serve. The namespaces are
//! independent: the registry's entry for an id has nothing to do with a
//! tier's entry for the same id.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::cache::id::ObjectId;
use crate::error::Result;

/// Where an auxiliary instance is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuxSlot {
    /// The metadata registry's own instance.
    Registry,
    /// The instance of the tier at this level.
    Tier(usize),
}

/// Caller-defined side index keyed by object id.
#[async_trait]
pub trait Auxiliary: Send + Sync + 'static {
    type Payload: Clone + Send + Sync + 'static;

    fn add(&self, id: ObjectId, payload: Self::Payload);

    fn get(&self, id: &ObjectId) -> Option<Self::Payload>;

    fn del(&self, id: &ObjectId);

    /// Restore from `path`. A missing file means an empty index.
    async fn load(&self, path: &Path) -> Result<()>;

    async fn dump(&self, path: &Path) -> Result<()>;
}

/// Builds the auxiliary instance for a slot.
pub type AuxFactory<'a, A> = dyn Fn(AuxSlot) -> A + Send + Sync + 'a;

/// Selects the ids a batch delete should remove.
pub type Matcher<'a, A> = dyn Fn(&A) -> Vec<ObjectId> + Send + Sync + 'a;

#[derive(Serialize, Deserialize)]
struct MapDump<P> {
    entries: Vec<(ObjectId, P)>,
}

/// In-memory auxiliary index persisted as JSON.
#[derive(Debug)]
pub struct MapAuxiliary<P> {
    entries: RwLock<HashMap<ObjectId, P>>,
}

impl<P> Default for MapAuxiliary<P> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<P> MapAuxiliary<P>
where
    P: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids whose payload satisfies `pred`. The building block for matchers.
    pub fn select(&self, pred: impl Fn(&ObjectId, &P) -> bool) -> Vec<ObjectId> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(id, payload)| pred(id, payload))
            .map(|(id, _)| *id)
            .collect()
    }
}

#[async_trait]
impl<P> Auxiliary for MapAuxiliary<P>
where
    P: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    type Payload = P;

    fn add(&self, id: ObjectId, payload: P) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, payload);
    }

    fn get(&self, id: &ObjectId) -> Option<P> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn del(&self, id: &ObjectId) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    async fn load(&self, path: &Path) -> Result<()> {
        if !fs::try_exists(path).await? {
            return Ok(());
        }
        let data = fs::read(path).await?;
        let dump: MapDump<P> = serde_json::from_slice(&data)?;
        let count = dump.entries.len();
        *self.entries.write().unwrap_or_else(PoisonError::into_inner) =
            dump.entries.into_iter().collect();
        debug!(path = %path.display(), count, "Loaded auxiliary index");
        Ok(())
    }

    async fn dump(&self, path: &Path) -> Result<()> {
        let dump = MapDump {
            entries: self
                .entries
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .map(|(id, payload)| (*id, payload.clone()))
                .collect(),
        };
        let data = serde_json::to_vec(&dump)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, data).await?;
        debug!(path = %path.display(), count = dump.entries.len(), "Dumped auxiliary index");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_add_get_del() {
        let aux = MapAuxiliary::<u32>::new();
        let id = ObjectId::new_random();

        assert!(aux.get(&id).is_none());
        aux.add(id, 7);
        assert_eq!(aux.get(&id), Some(7));
        aux.add(id, 8);
        assert_eq!(aux.get(&id), Some(8));
        aux.del(&id);
        assert!(aux.get(&id).is_none());
        assert!(aux.is_empty());
    }

    #[test]
    fn test_select() {
        let aux = MapAuxiliary::<i64>::new();
        let old = ObjectId::from_bytes([1; 16]);
        let fresh = ObjectId::from_bytes([2; 16]);
        aux.add(old, 10);
        aux.add(fresh, 1000);

        let picked = aux.select(|_, expire| *expire < 100);
        assert_eq!(picked, vec![old]);
    }

    #[tokio::test]
    async fn test_dump_and_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("aux.json");

        let aux = MapAuxiliary::<String>::new();
        let id = ObjectId::new_random();
        aux.add(id, "payload".to_string());
        aux.dump(&path).await.unwrap();

        let restored = MapAuxiliary::<String>::new();
        restored.load(&path).await.unwrap();
        assert_eq!(restored.get(&id).as_deref(), Some("payload"));
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        let aux = MapAuxiliary::<String>::new();
        aux.load(&tmp.path().join("absent.json")).await.unwrap();
        assert!(aux.is_empty());
    }
}
