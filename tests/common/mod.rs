//! Common test utilities - PermsTest harness over an in-memory store

#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use permsd::{
    CalculatedSubject, ContextSet, ContextValue, EngineConfig, MemoryDataStore, PermissionsEngine,
    SubjectRef,
};

/// Engine plus the store backing it
pub struct PermsTest {
    pub engine: Arc<PermissionsEngine>,
    pub store: Arc<MemoryDataStore>,
}

impl PermsTest {
    /// Start an engine with default configuration and an empty store
    pub async fn start() -> Result<Self> {
        Self::with_config(EngineConfig::default()).await
    }

    pub async fn with_config(config: EngineConfig) -> Result<Self> {
        Self::with_store(config, MemoryDataStore::new()).await
    }

    /// Start an engine over a store seeded from JSON
    pub async fn seeded(config: EngineConfig, json: &str) -> Result<Self> {
        Self::with_store(config, MemoryDataStore::from_json(json)?).await
    }

    async fn with_store(config: EngineConfig, store: MemoryDataStore) -> Result<Self> {
        init_tracing();
        let store = Arc::new(store);
        let engine = PermissionsEngine::new(config, store.clone()).await?;
        Ok(Self { engine, store })
    }

    pub async fn group(&self, name: &str) -> Arc<CalculatedSubject> {
        self.engine
            .subject("group", name)
            .await
            .expect("Failed to load group")
    }

    pub async fn user(&self, uuid: &str) -> Arc<CalculatedSubject> {
        self.engine
            .subject("user", uuid)
            .await
            .expect("Failed to load user")
    }
}

/// Install a tracing subscriber once; honours RUST_LOG
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn group_ref(name: &str) -> SubjectRef {
    SubjectRef::new("group", name)
}

pub fn global() -> ContextSet {
    ContextSet::global()
}

pub fn world(name: &str) -> ContextSet {
    ContextSet::of([ContextValue::new("world", name)])
}

pub const PLAYER: &str = "b3b1c0de-0000-4000-8000-000000000001";
