//! permsd - context-aware permission resolution engine
//!
//! Resolves effective permissions, options and parents for subjects (players,
//! groups) under a set of active contexts, aggregating each subject's own
//! data with everything it inherits from.

pub mod config;
pub mod context;
pub mod data;
pub mod engine;
pub mod error;
pub mod ladder;
pub mod node_tree;
pub mod store;
pub mod subject;

pub use config::{ContextMatching, EngineConfig};
pub use context::{ContextDefinition, ContextInheritance, ContextSet, ContextValue};
pub use data::{Change, ImmutableSubjectData, Segment, SubjectDataReference};
pub use engine::PermissionsEngine;
pub use error::{PermsError, Result};
pub use ladder::{RankLadder, RankLadderCache};
pub use node_tree::NodeTree;
pub use store::{DataStore, MemoryDataStore};
pub use subject::{CalculatedSubject, SubjectRef, SubjectTypeDefinition};
