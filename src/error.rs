//! Engine error types

use thiserror::Error;

/// Errors surfaced by the permission engine
///
/// Absence of data (unknown subjects, unresolvable parents, ladder moves that
/// change nothing) is never an error; those are reported through empty results
/// or unchanged [`Change`](crate::Change)s.
#[derive(Debug, Error)]
pub enum PermsError {
    #[error("invalid identifier '{identifier}' for subject type '{subject_type}'")]
    InvalidIdentifier {
        subject_type: String,
        identifier: String,
    },

    #[error("invalid value '{value}' for context '{key}'")]
    InvalidContext { key: String, value: String },

    #[error("invalid subject reference '{0}' (expected type:identifier)")]
    InvalidSubjectRef(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("permission engine has been shut down")]
    EngineShutdown,
}

impl From<figment::Error> for PermsError {
    fn from(e: figment::Error) -> Self {
        PermsError::Config(Box::new(e))
    }
}

pub type Result<T, E = PermsError> = std::result::Result<T, E>;
