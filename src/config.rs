//! Engine configuration
//!
//! Layered with figment: built-in defaults, then an optional TOML file, then
//! `PERMSD_`-prefixed environment variables (`PERMSD_DEBUG=true`,
//! `PERMSD_CONTEXT_MATCHING=subset`, ...).

use std::num::NonZeroUsize;
use std::path::Path;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "PERMSD_";

/// How stored segments are selected for an active context set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextMatching {
    /// A segment applies only when its context set equals the query set
    #[default]
    Exact,
    /// Every segment whose contexts are all present in the query set applies,
    /// most specific first
    Subset,
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Segment selection strategy used when aggregating
    pub context_matching: ContextMatching,
    /// Subject type holding per-type and global defaults
    pub defaults_type: String,
    /// Identifier of the global defaults subject within `defaults_type`
    pub global_defaults_identifier: String,
    /// Values reported for the `server-tag` context
    pub server_tags: Vec<String>,
    /// Context sets each subject keeps baked results for
    pub cached_context_sets: usize,
    /// Log every permission and option check at info level
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            context_matching: ContextMatching::Exact,
            defaults_type: "default".to_string(),
            global_defaults_identifier: "default".to_string(),
            server_tags: Vec::new(),
            cached_context_sets: 64,
            debug: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from defaults, an optional TOML file, and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config = figment.merge(Env::prefixed(ENV_PREFIX)).extract()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string layered over the defaults
    pub fn from_toml(source: &str) -> Result<Self> {
        let config = Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Toml::string(source))
            .extract()?;
        Ok(config)
    }

    /// Set the context matching mode
    pub fn with_context_matching(mut self, mode: ContextMatching) -> Self {
        self.context_matching = mode;
        self
    }

    /// Set the server tags
    pub fn with_server_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.server_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Per-subject result cache capacity; zero is treated as one
    pub fn cache_capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.cached_context_sets).unwrap_or(NonZeroUsize::MIN)
    }
}
