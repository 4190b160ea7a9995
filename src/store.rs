//! Storage seam
//!
//! Persistent backends (files, SQL) live outside the engine and plug in
//! through [`DataStore`]. [`MemoryDataStore`] keeps everything in memory; it
//! backs transient deployments and tests, and can be seeded from JSON.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::context::ContextInheritance;
use crate::data::ImmutableSubjectData;
use crate::ladder::RankLadder;
use crate::subject::SubjectRef;

/// Backing storage for subject data, rank ladders and context inheritance
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Stored data for `subject`, `None` if it has never been written
    async fn get_data(&self, subject: &SubjectRef) -> Result<Option<ImmutableSubjectData>>;

    /// Write `subject`'s data; `None` deletes it
    async fn set_data(&self, subject: &SubjectRef, data: Option<&ImmutableSubjectData>)
        -> Result<()>;

    async fn is_registered(&self, subject: &SubjectRef) -> Result<bool>;

    /// Identifiers with stored data for one subject type
    async fn identifiers(&self, subject_type: &str) -> Result<Vec<String>>;

    async fn get_rank_ladder(&self, name: &str) -> Result<Option<RankLadder>>;

    /// Write a ladder; `None` deletes it
    async fn set_rank_ladder(&self, name: &str, ladder: Option<&RankLadder>) -> Result<()>;

    async fn rank_ladder_names(&self) -> Result<Vec<String>>;

    async fn get_context_inheritance(&self) -> Result<ContextInheritance>;

    async fn set_context_inheritance(&self, inheritance: &ContextInheritance) -> Result<()>;
}

/// Everything a [`MemoryDataStore`] holds, in serializable form
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSnapshot {
    pub subjects: BTreeMap<SubjectRef, ImmutableSubjectData>,
    pub rank_ladders: BTreeMap<String, Vec<SubjectRef>>,
    pub context_inheritance: ContextInheritance,
}

/// In-memory [`DataStore`]
#[derive(Debug, Default)]
pub struct MemoryDataStore {
    subjects: RwLock<HashMap<SubjectRef, ImmutableSubjectData>>,
    ladders: RwLock<HashMap<String, RankLadder>>,
    context_inheritance: RwLock<ContextInheritance>,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let ladders = snapshot
            .rank_ladders
            .into_iter()
            .map(|(name, ranks)| {
                let ladder = RankLadder::new(&name, ranks);
                (name, ladder)
            })
            .collect();

        Self {
            subjects: RwLock::new(snapshot.subjects.into_iter().collect()),
            ladders: RwLock::new(ladders),
            context_inheritance: RwLock::new(snapshot.context_inheritance),
        }
    }

    /// Seed a store from a JSON [`StoreSnapshot`]
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: StoreSnapshot = serde_json::from_str(json)?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        let subjects = self
            .subjects
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let rank_ladders = self
            .ladders
            .read()
            .await
            .iter()
            .map(|(name, ladder)| (name.clone(), ladder.ranks().to_vec()))
            .collect();
        let context_inheritance = self.context_inheritance.read().await.clone();

        StoreSnapshot {
            subjects,
            rank_ladders,
            context_inheritance,
        }
    }

    pub async fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.snapshot().await)?)
    }
}

#[async_trait]
impl DataStore for MemoryDataStore {
    async fn get_data(&self, subject: &SubjectRef) -> Result<Option<ImmutableSubjectData>> {
        Ok(self.subjects.read().await.get(subject).cloned())
    }

    async fn set_data(
        &self,
        subject: &SubjectRef,
        data: Option<&ImmutableSubjectData>,
    ) -> Result<()> {
        let mut subjects = self.subjects.write().await;
        match data {
            Some(data) if !data.is_empty() => {
                subjects.insert(subject.clone(), data.clone());
            }
            _ => {
                subjects.remove(subject);
            }
        }
        Ok(())
    }

    async fn is_registered(&self, subject: &SubjectRef) -> Result<bool> {
        Ok(self.subjects.read().await.contains_key(subject))
    }

    async fn identifiers(&self, subject_type: &str) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .subjects
            .read()
            .await
            .keys()
            .filter(|s| s.subject_type() == subject_type)
            .map(|s| s.identifier().to_string())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn get_rank_ladder(&self, name: &str) -> Result<Option<RankLadder>> {
        Ok(self.ladders.read().await.get(name).cloned())
    }

    async fn set_rank_ladder(&self, name: &str, ladder: Option<&RankLadder>) -> Result<()> {
        let mut ladders = self.ladders.write().await;
        match ladder {
            Some(ladder) => {
                ladders.insert(name.to_string(), ladder.clone());
            }
            None => {
                ladders.remove(name);
            }
        }
        Ok(())
    }

    async fn rank_ladder_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.ladders.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn get_context_inheritance(&self) -> Result<ContextInheritance> {
        Ok(self.context_inheritance.read().await.clone())
    }

    async fn set_context_inheritance(&self, inheritance: &ContextInheritance) -> Result<()> {
        *self.context_inheritance.write().await = inheritance.clone();
        Ok(())
    }
}
