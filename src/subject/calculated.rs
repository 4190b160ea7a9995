//! Live, cached aggregation of one subject's own and inherited data

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tracing::{error, info, trace, warn};

use super::baker::{bake, BakeOptions, BakedSubjectData, SubjectSnapshot};
use super::matcher::SegmentMatcher;
use super::{AssociatedObject, SubjectRef, SubjectTypeDefinition};
use crate::config::ContextMatching;
use crate::context::{ContextDefinitionRegistry, ContextInheritance, ContextSet};
use crate::data::{Change, ImmutableSubjectData, SubjectDataReference};
use crate::engine::PermissionsEngine;
use crate::error::Result;

/// Callback fired when a subject's cached results are invalidated
pub type SubjectListener = dyn Fn(&CalculatedSubject) + Send + Sync;

/// A subject as seen by permission checks
///
/// Results are cached per context set, least recently used first out, and
/// dropped whenever this subject's data, or the data of anything it
/// inherited from, changes.
pub struct CalculatedSubject {
    subject: SubjectRef,
    type_definition: SubjectTypeDefinition,
    data: Arc<SubjectDataReference>,
    transient: Arc<SubjectDataReference>,
    engine: Weak<PermissionsEngine>,
    cache: Mutex<LruCache<ContextSet, Arc<BakedSubjectData>>>,
    associated: RwLock<Option<AssociatedObject>>,
    listeners: Mutex<Vec<Arc<SubjectListener>>>,
}

impl fmt::Debug for CalculatedSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalculatedSubject")
            .field("subject", &self.subject)
            .field("cached_context_sets", &self.cache.lock().len())
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

impl CalculatedSubject {
    pub(crate) fn new(
        subject: SubjectRef,
        type_definition: SubjectTypeDefinition,
        data: SubjectDataReference,
        transient: SubjectDataReference,
        engine: Weak<PermissionsEngine>,
        cache_capacity: NonZeroUsize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<CalculatedSubject>| {
            for reference in [&data, &transient] {
                let weak = weak.clone();
                reference.register_listener(move |change| {
                    if let Some(subject) = weak.upgrade() {
                        subject.on_data_changed(change);
                    }
                });
            }

            Self {
                subject,
                type_definition,
                data: Arc::new(data),
                transient: Arc::new(transient),
                engine,
                cache: Mutex::new(LruCache::new(cache_capacity)),
                associated: RwLock::new(None),
                listeners: Mutex::new(Vec::new()),
            }
        })
    }

    pub fn subject(&self) -> &SubjectRef {
        &self.subject
    }

    pub fn identifier(&self) -> &str {
        self.subject.identifier()
    }

    pub fn subject_type(&self) -> &str {
        self.subject.subject_type()
    }

    pub fn type_definition(&self) -> &SubjectTypeDefinition {
        &self.type_definition
    }

    /// Persistent data
    pub fn data(&self) -> &Arc<SubjectDataReference> {
        &self.data
    }

    /// Session-only data
    pub fn transient_data(&self) -> &Arc<SubjectDataReference> {
        &self.transient
    }

    /// The bound native object, or the type's provided one
    pub fn associated_object(&self) -> Option<AssociatedObject> {
        if let Some(obj) = self.associated.read().clone() {
            return Some(obj);
        }
        self.type_definition.associated_object(self.identifier())
    }

    pub fn set_associated_object(&self, object: Option<AssociatedObject>) {
        *self.associated.write() = object;
    }

    /// Contexts currently active for this subject, as reported by every
    /// registered context definition
    pub fn active_contexts(&self) -> ContextSet {
        match self.engine.upgrade() {
            Some(engine) => engine.context_registry().accumulate(self),
            None => ContextSet::global(),
        }
    }

    /// Effective value of `permission` under `contexts`; 0 when undefined
    pub fn permission(&self, contexts: &ContextSet, permission: &str) -> i32 {
        let value = self.baked(contexts).permission(permission);
        self.log_check("permission", contexts, permission, &value);
        value
    }

    pub fn has_permission(&self, contexts: &ContextSet, permission: &str) -> bool {
        self.permission(contexts, permission) > 0
    }

    /// Every explicitly configured permission with its effective value
    pub fn permissions(&self, contexts: &ContextSet) -> HashMap<String, i32> {
        self.baked(contexts).permissions()
    }

    /// Value applied to permissions nothing configures
    pub fn default_value(&self, contexts: &ContextSet) -> i32 {
        self.baked(contexts).default_value()
    }

    pub fn option(&self, contexts: &ContextSet, key: &str) -> Option<String> {
        let value = self.baked(contexts).option(key).map(str::to_string);
        self.log_check("option", contexts, key, &value);
        value
    }

    pub fn options(&self, contexts: &ContextSet) -> HashMap<String, String> {
        self.baked(contexts).options().clone()
    }

    /// Direct parents under `contexts`, transient and persistent combined
    pub fn parents(&self, contexts: &ContextSet) -> Vec<SubjectRef> {
        self.baked(contexts).parents().to_vec()
    }

    /// Resident subjects for [`parents`](Self::parents)
    pub fn parent_subjects(&self, contexts: &ContextSet) -> Vec<Arc<CalculatedSubject>> {
        let Some(engine) = self.engine.upgrade() else {
            return Vec::new();
        };
        self.parents(contexts)
            .iter()
            .filter_map(|parent| engine.resident(parent))
            .collect()
    }

    /// Update persistent (or transient) data and load any parents it introduced
    ///
    /// Once this returns, queries on this subject and its dependents see the
    /// new data.
    pub async fn update<F>(&self, transient: bool, f: F) -> Result<Change<ImmutableSubjectData>>
    where
        F: FnOnce(&ImmutableSubjectData) -> ImmutableSubjectData + Send,
    {
        let reference = if transient { &self.transient } else { &self.data };
        let change = reference.update(f).await?;
        if change.changed() {
            if let Some(engine) = self.engine.upgrade() {
                engine.load_ancestors(&self.subject).await?;
            }
        }
        Ok(change)
    }

    /// Register a callback fired whenever cached results are dropped
    pub fn register_listener<F>(&self, listener: F)
    where
        F: Fn(&CalculatedSubject) + Send + Sync + 'static,
    {
        self.listeners.lock().push(Arc::new(listener));
    }

    /// Drop cached results and notify listeners
    pub(crate) fn invalidate(&self) {
        {
            let mut cache = self.cache.lock();
            cache.clear();
            if let Some(engine) = self.engine.upgrade() {
                engine.forget_dependencies(&self.subject);
            }
        }
        let listeners: Vec<_> = self.listeners.lock().clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(self))).is_err() {
                error!("Listener for subject {} panicked", self.subject);
            }
        }
    }

    /// Release caches and listeners once the engine lets go of this subject
    pub(crate) fn detach(&self) {
        self.cache.lock().clear();
        self.listeners.lock().clear();
    }

    pub(crate) fn snapshot(&self) -> SubjectSnapshot {
        SubjectSnapshot {
            persistent: self.data.get(),
            transient: self.transient.get(),
            transient_has_priority: self.type_definition.transient_has_priority(),
        }
    }

    fn on_data_changed(&self, change: &Change<ImmutableSubjectData>) {
        if !change.changed() {
            return;
        }
        let Some(engine) = self.engine.upgrade() else {
            self.invalidate();
            return;
        };
        engine.invalidate_dependents(&self.subject);

        // Changes arriving outside `update` (storage refreshes) may reference
        // parents that are not resident yet
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let subject = self.subject.clone();
            handle.spawn(async move {
                if let Err(e) = engine.load_ancestors(&subject).await {
                    warn!("Failed to load ancestors of {}: {}", subject, e);
                }
            });
        }
    }

    fn baked(&self, contexts: &ContextSet) -> Arc<BakedSubjectData> {
        let cached = self.cache.lock().get(contexts).cloned();
        if let Some(hit) = cached {
            return hit;
        }

        let Some(engine) = self.engine.upgrade() else {
            return Arc::new(self.bake_detached(contexts));
        };

        let generation = engine.generation();
        let inheritance = engine.context_inheritance();
        let options = BakeOptions {
            matcher: SegmentMatcher::new(
                engine.config().context_matching,
                engine.context_registry(),
                &inheritance,
            ),
            defaults: engine.defaults_for(&self.subject),
        };
        let baked = Arc::new(bake(&self.subject, contexts, &options, |s| {
            if *s == self.subject {
                Some(self.snapshot())
            } else {
                engine.resident(s).map(|r| r.snapshot())
            }
        }));

        // `invalidate` clears and forgets under this same lock
        let mut cache = self.cache.lock();
        engine.record_dependencies(&self.subject, baked.ancestors());
        // A change that landed mid-bake may not be reflected; serve but don't keep it
        if engine.generation() == generation {
            cache.put(contexts.clone(), baked.clone());
        }
        baked
    }

    /// Own data only, used once the engine is gone
    fn bake_detached(&self, contexts: &ContextSet) -> BakedSubjectData {
        let registry = ContextDefinitionRegistry::new();
        let inheritance = ContextInheritance::new();
        let options = BakeOptions {
            matcher: SegmentMatcher::new(ContextMatching::Exact, &registry, &inheritance),
            defaults: Vec::new(),
        };
        bake(&self.subject, contexts, &options, |s| {
            (*s == self.subject).then(|| self.snapshot())
        })
    }

    fn log_check(&self, kind: &str, contexts: &ContextSet, key: &str, result: &dyn fmt::Debug) {
        let debug = self
            .engine
            .upgrade()
            .map(|engine| engine.config().debug)
            .unwrap_or(false);
        if debug {
            info!(
                "{} check: {} {} in {} -> {:?}",
                kind, self.subject, key, contexts, result
            );
        } else {
            trace!(
                "{} check: {} {} in {} -> {:?}",
                kind, self.subject, key, contexts, result
            );
        }
    }
}
