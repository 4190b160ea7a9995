//! Subjects: references, type definitions and calculated aggregation

mod baker;
mod calculated;
mod matcher;

pub use calculated::{CalculatedSubject, SubjectListener};

use std::any::Any;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::PermsError;

/// Subject type for players
pub const USER_TYPE: &str = "user";

/// Subject type for groups
pub const GROUP_TYPE: &str = "group";

/// A `(type, identifier)` pair naming a subject, written `type:identifier`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubjectRef {
    subject_type: String,
    identifier: String,
}

impl SubjectRef {
    pub fn new(subject_type: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            subject_type: subject_type.into(),
            identifier: identifier.into(),
        }
    }

    pub fn subject_type(&self) -> &str {
        &self.subject_type
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

impl fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.subject_type, self.identifier)
    }
}

impl FromStr for SubjectRef {
    type Err = PermsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((subject_type, identifier))
                if !subject_type.is_empty() && !identifier.is_empty() =>
            {
                Ok(SubjectRef::new(subject_type, identifier))
            }
            _ => Err(PermsError::InvalidSubjectRef(s.to_string())),
        }
    }
}

impl TryFrom<String> for SubjectRef {
    type Error = PermsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SubjectRef> for String {
    fn from(subject: SubjectRef) -> Self {
        subject.to_string()
    }
}

/// Native object bound to a subject (e.g. the connected player)
pub type AssociatedObject = Arc<dyn Any + Send + Sync>;

type IdentifierValidator = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;
type AssociatedObjectProvider = Arc<dyn Fn(&str) -> Option<AssociatedObject> + Send + Sync>;

/// Behaviour shared by all subjects of one type
#[derive(Clone)]
pub struct SubjectTypeDefinition {
    name: String,
    transient_has_priority: bool,
    validator: Option<IdentifierValidator>,
    associated_object: Option<AssociatedObjectProvider>,
}

impl fmt::Debug for SubjectTypeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubjectTypeDefinition")
            .field("name", &self.name)
            .field("transient_has_priority", &self.transient_has_priority)
            .field("validator", &self.validator.is_some())
            .field("associated_object", &self.associated_object.is_some())
            .finish()
    }
}

impl SubjectTypeDefinition {
    /// A type accepting any identifier, with transient data taking priority
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transient_has_priority: true,
            validator: None,
            associated_object: None,
        }
    }

    /// Players: identifiers must be UUIDs, normalized to lowercase hyphenated form
    pub fn user() -> Self {
        Self::new(USER_TYPE).with_identifier_validator(|id| {
            uuid::Uuid::parse_str(id)
                .ok()
                .map(|uuid| uuid.hyphenated().to_string())
        })
    }

    pub fn group() -> Self {
        Self::new(GROUP_TYPE)
    }

    pub fn with_transient_priority(mut self, transient_has_priority: bool) -> Self {
        self.transient_has_priority = transient_has_priority;
        self
    }

    /// Validate and normalize identifiers; returning `None` rejects one
    pub fn with_identifier_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn with_associated_object<F>(mut self, provider: F) -> Self
    where
        F: Fn(&str) -> Option<AssociatedObject> + Send + Sync + 'static,
    {
        self.associated_object = Some(Arc::new(provider));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transient_has_priority(&self) -> bool {
        self.transient_has_priority
    }

    /// Normalized identifier, or `None` if this type rejects it
    pub fn normalize_identifier(&self, identifier: &str) -> Option<String> {
        match self.validator {
            Some(ref validator) => validator(identifier),
            None => Some(identifier.to_string()),
        }
    }

    pub fn associated_object(&self, identifier: &str) -> Option<AssociatedObject> {
        self.associated_object
            .as_ref()
            .and_then(|provider| provider(identifier))
    }
}
