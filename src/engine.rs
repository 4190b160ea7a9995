//! Permission engine: resident subjects, context registry and invalidation
//!
//! The engine loads subjects from the [`DataStore`] together with everything
//! they inherit from, so that permission checks never block. Each bake
//! records which subjects it visited; a change to any of them drops the
//! cached results of every subject that depended on it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::context::{
    ContextDefinition, ContextDefinitionRegistry, ContextInheritance, SimpleContextDefinition,
    TimeContextDefinition, SERVER_TAG_CONTEXT,
};
use crate::data::{Change, ImmutableSubjectData, SubjectDataReference};
use crate::error::{PermsError, Result};
use crate::ladder::RankLadderCache;
use crate::store::DataStore;
use crate::subject::{CalculatedSubject, SubjectRef, SubjectTypeDefinition};

/// Central permission engine
pub struct PermissionsEngine {
    config: EngineConfig,
    store: Arc<dyn DataStore>,
    contexts: ContextDefinitionRegistry,
    context_inheritance: RwLock<Arc<ContextInheritance>>,
    inheritance_lock: tokio::sync::Mutex<()>,
    subject_types: RwLock<HashMap<String, SubjectTypeDefinition>>,
    /// Loaded subjects by reference
    subjects: RwLock<HashMap<SubjectRef, Arc<CalculatedSubject>>>,
    load_lock: tokio::sync::Mutex<()>,
    /// Which subjects each cached bake visited
    dependencies: Mutex<DependencyIndex>,
    /// Bumped before every invalidation
    generation: AtomicU64,
    ladders: RankLadderCache,
    shut_down: AtomicBool,
    self_ref: Weak<PermissionsEngine>,
}

impl fmt::Debug for PermissionsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionsEngine")
            .field("config", &self.config)
            .field("resident_subjects", &self.subjects.read().len())
            .field("contexts", &self.contexts)
            .field("generation", &self.generation.load(Ordering::SeqCst))
            .finish()
    }
}

impl PermissionsEngine {
    /// Start an engine over `store`
    ///
    /// Registers the `user`, `group` and defaults subject types, plus the
    /// `before`, `after` and `server-tag` contexts.
    pub async fn new(config: EngineConfig, store: Arc<dyn DataStore>) -> Result<Arc<Self>> {
        let inheritance = store.get_context_inheritance().await?;

        let engine = Arc::new_cyclic(|weak: &Weak<PermissionsEngine>| Self {
            ladders: RankLadderCache::new(store.clone()),
            config,
            store,
            contexts: ContextDefinitionRegistry::new(),
            context_inheritance: RwLock::new(Arc::new(inheritance)),
            inheritance_lock: tokio::sync::Mutex::new(()),
            subject_types: RwLock::new(HashMap::new()),
            subjects: RwLock::new(HashMap::new()),
            load_lock: tokio::sync::Mutex::new(()),
            dependencies: Mutex::new(DependencyIndex::default()),
            generation: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            self_ref: weak.clone(),
        });

        engine.register_subject_type(SubjectTypeDefinition::user());
        engine.register_subject_type(SubjectTypeDefinition::group());
        engine.register_subject_type(SubjectTypeDefinition::new(
            engine.config.defaults_type.clone(),
        ));

        engine.contexts.register(TimeContextDefinition::before());
        engine.contexts.register(TimeContextDefinition::after());
        engine.contexts.register(SimpleContextDefinition::fixed(
            SERVER_TAG_CONTEXT,
            engine.config.server_tags.clone(),
        ));

        info!(
            "Permissions engine started ({:?} context matching)",
            engine.config.context_matching
        );
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    pub fn context_registry(&self) -> &ContextDefinitionRegistry {
        &self.contexts
    }

    pub fn ladders(&self) -> &RankLadderCache {
        &self.ladders
    }

    /// Register a context definition; cached results are dropped
    pub fn register_context_definition<D: ContextDefinition>(&self, definition: D) {
        self.contexts.register(definition);
        self.invalidate_all();
    }

    pub fn register_subject_type(&self, definition: SubjectTypeDefinition) {
        debug!("Registered subject type {}", definition.name());
        self.subject_types
            .write()
            .insert(definition.name().to_string(), definition);
    }

    /// Definition for `name`, or a permissive default for unregistered types
    pub fn subject_type(&self, name: &str) -> SubjectTypeDefinition {
        self.subject_types
            .read()
            .get(name)
            .cloned()
            .unwrap_or_else(|| SubjectTypeDefinition::new(name))
    }

    /// Get a subject, loading it and everything it inherits from if needed
    pub async fn subject(
        &self,
        subject_type: &str,
        identifier: &str,
    ) -> Result<Arc<CalculatedSubject>> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(PermsError::EngineShutdown);
        }
        let identifier = self
            .subject_type(subject_type)
            .normalize_identifier(identifier)
            .ok_or_else(|| PermsError::InvalidIdentifier {
                subject_type: subject_type.to_string(),
                identifier: identifier.to_string(),
            })?;
        let subject = SubjectRef::new(subject_type, identifier);

        if let Some(resident) = self.resident(&subject) {
            // Ancestors may have been uncached since the last visit
            self.load_ancestors(&subject).await?;
            return Ok(resident);
        }
        let (calculated, _) = self.load_subject(&subject).await?;
        self.load_ancestors(&subject).await?;
        Ok(calculated)
    }

    /// Get a subject by `type:identifier` reference
    pub async fn subject_by_ref(&self, subject: &SubjectRef) -> Result<Arc<CalculatedSubject>> {
        self.subject(subject.subject_type(), subject.identifier())
            .await
    }

    /// An already loaded subject
    pub fn resident(&self, subject: &SubjectRef) -> Option<Arc<CalculatedSubject>> {
        self.subjects.read().get(subject).cloned()
    }

    pub fn resident_subjects(&self) -> Vec<SubjectRef> {
        let mut subjects: Vec<SubjectRef> = self.subjects.read().keys().cloned().collect();
        subjects.sort();
        subjects
    }

    /// Load `root`'s defaults and every transitive parent across all segments
    ///
    /// Returns how many subjects were newly loaded. Parents that fail to
    /// load are skipped; only a failure on `root` itself is returned.
    pub async fn load_ancestors(&self, root: &SubjectRef) -> Result<usize> {
        let mut queue: Vec<SubjectRef> = self.defaults_for(root);
        queue.reverse();
        queue.push(root.clone());
        let mut seen: HashSet<SubjectRef> = HashSet::new();
        let mut loaded = 0;

        while let Some(next) = queue.pop() {
            if !seen.insert(next.clone()) {
                continue;
            }
            let subject = match self.resident(&next) {
                Some(subject) => subject,
                None => match self.load_subject(&next).await {
                    Ok((subject, fresh)) => {
                        if fresh {
                            loaded += 1;
                        }
                        subject
                    }
                    Err(e) if next == *root => return Err(e),
                    Err(e) => {
                        warn!("Failed to load {} (inherited by {}): {}", next, root, e);
                        continue;
                    }
                },
            };

            for data in [subject.data().get(), subject.transient_data().get()] {
                for parents in data.all_parents().into_values() {
                    queue.extend(parents.into_iter().filter(|p| !seen.contains(p)));
                }
            }
        }
        Ok(loaded)
    }

    /// Drop a subject from memory; it is reloaded from storage on next access
    ///
    /// Resident subjects that inherited from it load it back in the
    /// background, so their results keep its data.
    pub fn uncache(&self, subject: &SubjectRef) {
        let Some(removed) = self.subjects.write().remove(subject) else {
            return;
        };
        removed.detach();
        let affected = self.dependencies.lock().remove(subject);
        self.invalidate_subjects(subject, affected.clone());
        debug!("Uncached subject {}", subject);

        let dependents: Vec<SubjectRef> = affected
            .into_iter()
            .filter(|s| self.resident(s).is_some())
            .collect();
        if dependents.is_empty() {
            return;
        }
        let (Some(engine), Ok(handle)) =
            (self.self_ref.upgrade(), tokio::runtime::Handle::try_current())
        else {
            return;
        };
        handle.spawn(async move {
            for dependent in dependents {
                if let Err(e) = engine.load_ancestors(&dependent).await {
                    warn!("Failed to reload ancestors of {}: {}", dependent, e);
                }
            }
        });
    }

    /// Re-read a resident subject's persistent data from storage
    ///
    /// For backends changed behind the engine's back. Nothing is written.
    pub async fn reload(&self, subject: &SubjectRef) -> Result<Change<ImmutableSubjectData>> {
        let Some(resident) = self.resident(subject) else {
            let empty = Arc::new(ImmutableSubjectData::new());
            return Ok(Change::unchanged(empty));
        };
        let data = self.store.get_data(subject).await?.unwrap_or_default();
        let change = resident.data().refresh(data).await;
        if change.changed() {
            self.load_ancestors(subject).await?;
        }
        Ok(change)
    }

    pub fn context_inheritance(&self) -> Arc<ContextInheritance> {
        self.context_inheritance.read().clone()
    }

    /// Apply `f` to the context inheritance, persist it, and drop all cached results
    pub async fn update_context_inheritance<F>(&self, f: F) -> Result<Change<ContextInheritance>>
    where
        F: FnOnce(&ContextInheritance) -> ContextInheritance + Send,
    {
        let _guard = self.inheritance_lock.lock().await;
        let old = self.context_inheritance();
        let new = f(&old);
        if new == *old {
            return Ok(Change::unchanged(old));
        }

        if let Err(e) = self.store.set_context_inheritance(&new).await {
            warn!("Failed to persist context inheritance: {}", e);
            return Err(PermsError::Storage(e));
        }
        let new = Arc::new(new);
        *self.context_inheritance.write() = new.clone();
        self.invalidate_all();
        Ok(Change::new(old, new))
    }

    /// Wait for in-flight updates, then release every subject and ladder
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let subjects: Vec<Arc<CalculatedSubject>> =
            self.subjects.read().values().cloned().collect();
        for subject in &subjects {
            subject.data().flush().await;
            subject.transient_data().flush().await;
        }

        self.generation.fetch_add(1, Ordering::SeqCst);
        let drained: Vec<Arc<CalculatedSubject>> =
            self.subjects.write().drain().map(|(_, s)| s).collect();
        for subject in &drained {
            subject.detach();
        }
        self.dependencies.lock().clear();
        self.ladders.clear();
        info!("Permissions engine shut down ({} subjects released)", drained.len());
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Type defaults, then global defaults, for `subject`
    pub(crate) fn defaults_for(&self, subject: &SubjectRef) -> Vec<SubjectRef> {
        let type_defaults = SubjectRef::new(&self.config.defaults_type, subject.subject_type());
        let global_defaults = SubjectRef::new(
            &self.config.defaults_type,
            &self.config.global_defaults_identifier,
        );
        if type_defaults == global_defaults {
            vec![global_defaults]
        } else {
            vec![type_defaults, global_defaults]
        }
    }

    pub(crate) fn record_dependencies(&self, dependent: &SubjectRef, ancestors: &HashSet<SubjectRef>) {
        self.dependencies.lock().record(dependent, ancestors);
    }

    /// Called once `dependent` holds no cached results
    pub(crate) fn forget_dependencies(&self, dependent: &SubjectRef) {
        self.dependencies.lock().forget(dependent);
    }

    /// Drop cached results of `changed` and of every subject that inherited from it
    pub(crate) fn invalidate_dependents(&self, changed: &SubjectRef) {
        let affected = self.dependencies.lock().dependents_of(changed);
        self.invalidate_subjects(changed, affected);
    }

    fn invalidate_subjects(&self, changed: &SubjectRef, mut affected: HashSet<SubjectRef>) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        affected.insert(changed.clone());

        let subjects: Vec<Arc<CalculatedSubject>> = {
            let resident = self.subjects.read();
            affected.iter().filter_map(|s| resident.get(s).cloned()).collect()
        };
        debug!(
            "Change to {} invalidated {} resident subjects",
            changed,
            subjects.len()
        );
        for subject in subjects {
            subject.invalidate();
        }
    }

    fn invalidate_all(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let subjects: Vec<Arc<CalculatedSubject>> =
            self.subjects.read().values().cloned().collect();
        for subject in subjects {
            subject.invalidate();
        }
    }

    async fn load_subject(&self, subject: &SubjectRef) -> Result<(Arc<CalculatedSubject>, bool)> {
        let _guard = self.load_lock.lock().await;
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(PermsError::EngineShutdown);
        }
        if let Some(resident) = self.resident(subject) {
            return Ok((resident, false));
        }

        let data = self.store.get_data(subject).await?.unwrap_or_default();
        let calculated = CalculatedSubject::new(
            subject.clone(),
            self.subject_type(subject.subject_type()),
            SubjectDataReference::persistent(subject.clone(), data, self.store.clone()),
            SubjectDataReference::transient(subject.clone(), ImmutableSubjectData::new()),
            self.self_ref.clone(),
            self.config.cache_capacity(),
        );
        self.subjects
            .write()
            .insert(subject.clone(), calculated.clone());
        debug!("Loaded subject {}", subject);

        // Subjects baked while this one was missing must see it now
        self.invalidate_dependents(subject);
        Ok((calculated, true))
    }
}

/// Two-way index between subjects and the ancestors their cached bakes visited
#[derive(Debug, Default)]
struct DependencyIndex {
    /// Ancestor -> subjects that visited it
    dependents: HashMap<SubjectRef, HashSet<SubjectRef>>,
    /// Subject -> ancestors it visited
    ancestors: HashMap<SubjectRef, HashSet<SubjectRef>>,
}

impl DependencyIndex {
    fn record(&mut self, dependent: &SubjectRef, ancestors: &HashSet<SubjectRef>) {
        for ancestor in ancestors.iter().filter(|a| *a != dependent) {
            self.dependents
                .entry(ancestor.clone())
                .or_default()
                .insert(dependent.clone());
            self.ancestors
                .entry(dependent.clone())
                .or_default()
                .insert(ancestor.clone());
        }
    }

    fn forget(&mut self, dependent: &SubjectRef) {
        let Some(ancestors) = self.ancestors.remove(dependent) else {
            return;
        };
        for ancestor in ancestors {
            if let Some(set) = self.dependents.get_mut(&ancestor) {
                set.remove(dependent);
                if set.is_empty() {
                    self.dependents.remove(&ancestor);
                }
            }
        }
    }

    fn dependents_of(&self, ancestor: &SubjectRef) -> HashSet<SubjectRef> {
        self.dependents.get(ancestor).cloned().unwrap_or_default()
    }

    /// Drop `subject` from both sides, returning the subjects that depended on it
    fn remove(&mut self, subject: &SubjectRef) -> HashSet<SubjectRef> {
        self.forget(subject);
        self.dependents.remove(subject).unwrap_or_default()
    }

    fn clear(&mut self) {
        self.dependents.clear();
        self.ancestors.clear();
    }
}
