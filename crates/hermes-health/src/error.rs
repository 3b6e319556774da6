//! Health and scheduler error types.

use hermes_state::StateError;
use thiserror::Error;

/// Errors surfaced by [`HealthService`](crate::HealthService) operations.
#[derive(Debug, Error)]
pub enum HealthError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl HealthError {
    /// Whether the referenced record does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            HealthError::NotFound(_) => true,
            HealthError::State(e) => e.is_not_found(),
            HealthError::Validation(_) => false,
        }
    }
}

pub type HealthResult<T> = Result<T, HealthError>;

/// Errors returned when starting the health check scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("health check scheduler is already running")]
    AlreadyRunning,

    #[error("health check scheduler needs a tokio runtime")]
    NoRuntime,
}
