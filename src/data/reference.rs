//! Mutable, versioned handle over a subject's immutable data
//!
//! Writers go through [`SubjectDataReference::update`], which is serialized
//! per reference: each update sees the latest committed snapshot, persists
//! the result, and only then swaps the pointer and notifies listeners.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};

use super::subject_data::ImmutableSubjectData;
use crate::error::{PermsError, Result};
use crate::store::DataStore;
use crate::subject::SubjectRef;

/// Old and new value of a reference after an update
///
/// `changed()` is false when both sides are the same allocation, which is
/// how no-op updates and ladder moves are reported.
#[derive(Debug)]
pub struct Change<T> {
    old: Arc<T>,
    new: Arc<T>,
}

impl<T> Clone for Change<T> {
    fn clone(&self) -> Self {
        Self {
            old: self.old.clone(),
            new: self.new.clone(),
        }
    }
}

impl<T> Change<T> {
    pub fn new(old: Arc<T>, new: Arc<T>) -> Self {
        Self { old, new }
    }

    /// A change whose old and new values are identical
    pub fn unchanged(value: Arc<T>) -> Self {
        Self {
            old: value.clone(),
            new: value,
        }
    }

    pub fn old(&self) -> &Arc<T> {
        &self.old
    }

    pub fn new_value(&self) -> &Arc<T> {
        &self.new
    }

    pub fn changed(&self) -> bool {
        !Arc::ptr_eq(&self.old, &self.new)
    }
}

/// Callback fired after a reference commits a new value
pub type ChangeListener = dyn Fn(&Change<ImmutableSubjectData>) + Send + Sync;

/// Current data for one (subject, persistent-or-transient) pair
pub struct SubjectDataReference {
    subject: SubjectRef,
    current: RwLock<Arc<ImmutableSubjectData>>,
    update_lock: tokio::sync::Mutex<()>,
    /// `None` for transient (session-only) data
    store: Option<Arc<dyn DataStore>>,
    listeners: Mutex<Vec<Arc<ChangeListener>>>,
}

impl fmt::Debug for SubjectDataReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubjectDataReference")
            .field("subject", &self.subject)
            .field("transient", &self.store.is_none())
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

impl SubjectDataReference {
    /// Reference whose updates are persisted through `store`
    pub fn persistent(
        subject: SubjectRef,
        initial: ImmutableSubjectData,
        store: Arc<dyn DataStore>,
    ) -> Self {
        Self::build(subject, initial, Some(store))
    }

    /// Session-only reference; updates are never persisted
    pub fn transient(subject: SubjectRef, initial: ImmutableSubjectData) -> Self {
        Self::build(subject, initial, None)
    }

    fn build(
        subject: SubjectRef,
        initial: ImmutableSubjectData,
        store: Option<Arc<dyn DataStore>>,
    ) -> Self {
        Self {
            subject,
            current: RwLock::new(Arc::new(initial)),
            update_lock: tokio::sync::Mutex::new(()),
            store,
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn subject(&self) -> &SubjectRef {
        &self.subject
    }

    pub fn is_transient(&self) -> bool {
        self.store.is_none()
    }

    /// Latest committed snapshot
    pub fn get(&self) -> Arc<ImmutableSubjectData> {
        self.current.read().clone()
    }

    /// Apply `f` to the latest committed snapshot and commit the result
    ///
    /// Concurrent calls are queued; none of them works from a stale value.
    /// If `f` produces equal data nothing is persisted and the returned
    /// change is unchanged. On persistence failure the reference keeps its
    /// previous value.
    pub async fn update<F>(&self, f: F) -> Result<Change<ImmutableSubjectData>>
    where
        F: FnOnce(&ImmutableSubjectData) -> ImmutableSubjectData + Send,
    {
        let _guard = self.update_lock.lock().await;
        let old = self.get();
        let new = f(&old);
        if new == *old {
            return Ok(Change::unchanged(old));
        }

        if let Some(ref store) = self.store {
            if let Err(e) = store.set_data(&self.subject, Some(&new)).await {
                warn!("Failed to persist data for {}: {}", self.subject, e);
                return Err(PermsError::Storage(e));
            }
        }

        let change = self.swap(old, new);
        self.notify(&change);
        Ok(change)
    }

    /// Replace the snapshot with `data` outright
    pub async fn set(&self, data: ImmutableSubjectData) -> Result<Change<ImmutableSubjectData>> {
        self.update(move |_| data).await
    }

    /// Adopt data that changed in the backing store without writing it back
    pub async fn refresh(&self, data: ImmutableSubjectData) -> Change<ImmutableSubjectData> {
        let _guard = self.update_lock.lock().await;
        let old = self.get();
        if data == *old {
            return Change::unchanged(old);
        }
        debug!("Refreshed data for {} from storage", self.subject);
        let change = self.swap(old, data);
        self.notify(&change);
        change
    }

    /// Wait for any in-flight update to finish
    pub async fn flush(&self) {
        let _guard = self.update_lock.lock().await;
    }

    /// Register a listener fired after every committed change
    pub fn register_listener<F>(&self, listener: F)
    where
        F: Fn(&Change<ImmutableSubjectData>) + Send + Sync + 'static,
    {
        self.listeners.lock().push(Arc::new(listener));
    }

    pub fn clear_listeners(&self) {
        self.listeners.lock().clear();
    }

    fn swap(
        &self,
        old: Arc<ImmutableSubjectData>,
        new: ImmutableSubjectData,
    ) -> Change<ImmutableSubjectData> {
        let new = Arc::new(new);
        *self.current.write() = new.clone();
        Change::new(old, new)
    }

    fn notify(&self, change: &Change<ImmutableSubjectData>) {
        let listeners: Vec<_> = self.listeners.lock().clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(change))).is_err() {
                error!("Data change listener for {} panicked", self.subject);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::context::{ContextInheritance, ContextSet};
    use crate::ladder::RankLadder;
    use crate::store::MemoryDataStore;

    fn subject() -> SubjectRef {
        SubjectRef::new("group", "admin")
    }

    fn counter(data: &ImmutableSubjectData) -> i64 {
        data.option(&ContextSet::global(), "counter")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    fn increment(data: &ImmutableSubjectData) -> ImmutableSubjectData {
        let next = (counter(data) + 1).to_string();
        data.set_option(&ContextSet::global(), "counter", Some(&next))
    }

    /// Store that refuses every write
    struct ReadOnlyStore;

    #[async_trait]
    impl DataStore for ReadOnlyStore {
        async fn get_data(&self, _: &SubjectRef) -> anyhow::Result<Option<ImmutableSubjectData>> {
            Ok(None)
        }
        async fn set_data(
            &self,
            _: &SubjectRef,
            _: Option<&ImmutableSubjectData>,
        ) -> anyhow::Result<()> {
            anyhow::bail!("store is read-only")
        }
        async fn is_registered(&self, _: &SubjectRef) -> anyhow::Result<bool> {
            Ok(false)
        }
        async fn identifiers(&self, _: &str) -> anyhow::Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn get_rank_ladder(&self, _: &str) -> anyhow::Result<Option<RankLadder>> {
            Ok(None)
        }
        async fn set_rank_ladder(&self, _: &str, _: Option<&RankLadder>) -> anyhow::Result<()> {
            anyhow::bail!("store is read-only")
        }
        async fn rank_ladder_names(&self) -> anyhow::Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn get_context_inheritance(&self) -> anyhow::Result<ContextInheritance> {
            Ok(ContextInheritance::new())
        }
        async fn set_context_inheritance(&self, _: &ContextInheritance) -> anyhow::Result<()> {
            anyhow::bail!("store is read-only")
        }
    }

    #[tokio::test]
    async fn test_update_persists_and_swaps() {
        let store = Arc::new(MemoryDataStore::new());
        let reference =
            SubjectDataReference::persistent(subject(), ImmutableSubjectData::new(), store.clone());

        let change = reference
            .update(|d| d.set_permission(&ContextSet::global(), "fly", 1))
            .await
            .unwrap();
        assert!(change.changed());
        assert_eq!(change.old().permission(&ContextSet::global(), "fly"), 0);
        assert_eq!(reference.get().permission(&ContextSet::global(), "fly"), 1);

        let stored = store.get_data(&subject()).await.unwrap().unwrap();
        assert_eq!(stored.permission(&ContextSet::global(), "fly"), 1);
    }

    #[tokio::test]
    async fn test_noop_update_is_unchanged() {
        let reference = SubjectDataReference::transient(subject(), ImmutableSubjectData::new());
        let change = reference.update(|d| d.clone()).await.unwrap();
        assert!(!change.changed());
        assert!(Arc::ptr_eq(change.old(), &reference.get()));
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_serialized() {
        let store = Arc::new(MemoryDataStore::new());
        let reference = Arc::new(SubjectDataReference::persistent(
            subject(),
            ImmutableSubjectData::new(),
            store,
        ));

        let (a, b) = tokio::join!(reference.update(increment), reference.update(increment));
        a.unwrap();
        b.unwrap();
        assert_eq!(counter(&reference.get()), 2);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let reference = reference.clone();
                tokio::spawn(async move { reference.update(increment).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(counter(&reference.get()), 18);
    }

    #[tokio::test]
    async fn test_failed_persist_keeps_last_good_value() {
        let initial = ImmutableSubjectData::new().set_permission(&ContextSet::global(), "a", 1);
        let reference =
            SubjectDataReference::persistent(subject(), initial.clone(), Arc::new(ReadOnlyStore));

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        reference.register_listener(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        let result = reference
            .update(|d| d.set_permission(&ContextSet::global(), "a", -1))
            .await;
        assert!(matches!(result, Err(PermsError::Storage(_))));
        assert_eq!(*reference.get(), initial);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_listener_panic_does_not_stop_others() {
        let reference = SubjectDataReference::transient(subject(), ImmutableSubjectData::new());
        let fired = Arc::new(AtomicUsize::new(0));

        reference.register_listener(|_| panic!("listener failure"));
        let fired_clone = fired.clone();
        reference.register_listener(move |change| {
            assert!(change.changed());
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        let change = reference.update(increment).await.unwrap();
        assert!(change.changed());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_does_not_persist() {
        let reference =
            SubjectDataReference::persistent(subject(), ImmutableSubjectData::new(), Arc::new(ReadOnlyStore));
        let incoming = ImmutableSubjectData::new().set_permission(&ContextSet::global(), "b", 1);

        let change = reference.refresh(incoming.clone()).await;
        assert!(change.changed());
        assert_eq!(*reference.get(), incoming);
        assert!(!reference.refresh(incoming).await.changed());
    }
}
