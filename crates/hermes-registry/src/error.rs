//! Registry error types.

use hermes_state::StateError;
use thiserror::Error;

/// Errors surfaced by [`ServiceRegistry`](crate::ServiceRegistry) operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("service with name {0:?} already exists")]
    DuplicateName(String),

    #[error("version {version} already exists for service {service_id}")]
    DuplicateVersion { service_id: String, version: String },

    #[error("circular dependency detected: {dependency_id} already depends on {service_id}")]
    CircularDependency {
        service_id: String,
        dependency_id: String,
    },

    #[error("dependency {service_id} -> {dependency_id} already exists")]
    DuplicateDependency {
        service_id: String,
        dependency_id: String,
    },

    #[error("dependency relationship not found")]
    DependencyNotFound,

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl RegistryError {
    /// Whether the referenced record does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RegistryError::NotFound(_) | RegistryError::DependencyNotFound
        ) || matches!(self, RegistryError::State(e) if e.is_not_found())
    }

    /// Whether the request collided with existing state.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            RegistryError::DuplicateName(_)
                | RegistryError::DuplicateVersion { .. }
                | RegistryError::CircularDependency { .. }
                | RegistryError::DuplicateDependency { .. }
        )
    }
}

pub type RegistryResult<T> = Result<T, RegistryError>;
