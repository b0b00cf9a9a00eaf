//! Error types for resource model validation.

use thiserror::Error;

/// Errors raised while building or validating resource model values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// The resource name is empty.
    #[error("resource name cannot be empty")]
    EmptyName,

    /// The namespace is empty.
    #[error("namespace cannot be empty")]
    EmptyNamespace,

    /// A label key or value cannot be expressed in a selector.
    #[error("invalid label selector term '{term}': {reason}")]
    InvalidSelector { term: String, reason: &'static str },

    /// The resource body is missing required metadata.
    #[error("resource is missing metadata field '{0}'")]
    MissingMetadata(&'static str),
}

impl ResourceError {
    /// Returns true if this error came from an empty identifier.
    pub fn is_empty_identifier(&self) -> bool {
        matches!(self, ResourceError::EmptyName | ResourceError::EmptyNamespace)
    }
}
