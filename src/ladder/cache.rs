//! Loaded rank ladders, persisted through the data store

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::RankLadder;
use crate::data::Change;
use crate::error::{PermsError, Result};
use crate::store::DataStore;

/// Rank ladders by name, loaded on demand
pub struct RankLadderCache {
    store: Arc<dyn DataStore>,
    ladders: RwLock<HashMap<String, Arc<RankLadder>>>,
    /// Serializes writers so each works from the latest committed ladder
    update_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for RankLadderCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RankLadderCache")
            .field("loaded", &self.ladders.read().len())
            .finish()
    }
}

impl RankLadderCache {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self {
            store,
            ladders: RwLock::new(HashMap::new()),
            update_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The ladder called `name`; an unknown name yields an empty ladder
    pub async fn get(&self, name: &str) -> Result<Arc<RankLadder>> {
        let cached = self.ladders.read().get(name).cloned();
        if let Some(ladder) = cached {
            return Ok(ladder);
        }

        let loaded = self
            .store
            .get_rank_ladder(name)
            .await?
            .unwrap_or_else(|| RankLadder::new(name, Vec::new()));
        let mut ladders = self.ladders.write();
        let ladder = ladders
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(loaded))
            .clone();
        Ok(ladder)
    }

    /// Replace the ladder called `name`, persisting it first
    pub async fn set(&self, name: &str, ladder: Arc<RankLadder>) -> Result<Change<RankLadder>> {
        let _guard = self.update_lock.lock().await;
        let old = self.get(name).await?;
        self.commit(name, old, ladder).await
    }

    /// Apply `f` to the current ladder and commit the result
    pub async fn update<F>(&self, name: &str, f: F) -> Result<Change<RankLadder>>
    where
        F: FnOnce(&Arc<RankLadder>) -> Arc<RankLadder> + Send,
    {
        let _guard = self.update_lock.lock().await;
        let old = self.get(name).await?;
        let new = f(&old);
        self.commit(name, old, new).await
    }

    /// Names of every stored or loaded ladder
    pub async fn names(&self) -> Result<Vec<String>> {
        let mut names = self.store.rank_ladder_names().await?;
        names.extend(
            self.ladders
                .read()
                .iter()
                .filter(|(_, ladder)| !ladder.is_empty())
                .map(|(name, _)| name.clone()),
        );
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Forget a loaded ladder; the next `get` reloads it from storage
    pub fn uncache(&self, name: &str) {
        self.ladders.write().remove(name);
    }

    pub fn clear(&self) {
        self.ladders.write().clear();
    }

    async fn commit(
        &self,
        name: &str,
        old: Arc<RankLadder>,
        new: Arc<RankLadder>,
    ) -> Result<Change<RankLadder>> {
        if Arc::ptr_eq(&old, &new) || *old == *new {
            return Ok(Change::unchanged(old));
        }

        let stored = (!new.is_empty()).then_some(new.as_ref());
        if let Err(e) = self.store.set_rank_ladder(name, stored).await {
            warn!("Failed to persist rank ladder {}: {}", name, e);
            return Err(PermsError::Storage(e));
        }
        debug!("Saved rank ladder {} with {} ranks", name, new.ranks().len());

        self.ladders.write().insert(name.to_string(), new.clone());
        Ok(Change::new(old, new))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDataStore;
    use crate::subject::SubjectRef;

    fn group(name: &str) -> SubjectRef {
        SubjectRef::new("group", name)
    }

    #[tokio::test]
    async fn test_unknown_ladder_is_empty() {
        let cache = RankLadderCache::new(Arc::new(MemoryDataStore::new()));
        let ladder = cache.get("staff").await.unwrap();
        assert!(ladder.is_empty());
        assert_eq!(ladder.name(), "staff");
        assert!(cache.names().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_persists() {
        let store = Arc::new(MemoryDataStore::new());
        let cache = RankLadderCache::new(store.clone());

        let change = cache
            .update("staff", |l| l.add_rank(group("mod")).add_rank(group("admin")))
            .await
            .unwrap();
        assert!(change.changed());
        assert!(change.old().is_empty());

        let stored = store.get_rank_ladder("staff").await.unwrap().unwrap();
        assert_eq!(stored.ranks(), &[group("mod"), group("admin")]);
        assert_eq!(cache.names().await.unwrap(), vec!["staff"]);

        // Reload from storage
        cache.uncache("staff");
        assert_eq!(cache.get("staff").await.unwrap().ranks().len(), 2);
    }

    #[tokio::test]
    async fn test_noop_update_is_unchanged() {
        let cache = RankLadderCache::new(Arc::new(MemoryDataStore::new()));
        cache
            .update("staff", |l| l.add_rank(group("mod")))
            .await
            .unwrap();
        let change = cache
            .update("staff", |l| l.add_rank(group("mod")))
            .await
            .unwrap();
        assert!(!change.changed());

        let same = cache.get("staff").await.unwrap();
        assert!(!cache.set("staff", same).await.unwrap().changed());
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_serialized() {
        let cache = Arc::new(RankLadderCache::new(Arc::new(MemoryDataStore::new())));
        let (a, b) = tokio::join!(
            cache.update("staff", |l| l.add_rank(group("a"))),
            cache.update("staff", |l| l.add_rank(group("b")))
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(cache.get("staff").await.unwrap().ranks().len(), 2);
    }

    #[tokio::test]
    async fn test_emptied_ladder_is_deleted() {
        let store = Arc::new(MemoryDataStore::new());
        let cache = RankLadderCache::new(store.clone());
        cache
            .update("staff", |l| l.add_rank(group("a")))
            .await
            .unwrap();
        cache
            .update("staff", |l| l.remove_rank(&group("a")))
            .await
            .unwrap();
        assert!(store.get_rank_ladder("staff").await.unwrap().is_none());
        assert!(cache.names().await.unwrap().is_empty());
    }
}
