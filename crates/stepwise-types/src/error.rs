use thiserror::Error;

/// Errors from execution store operations (used by trait definitions in stepwise-core).
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("execution not found for key '{0}'")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),
}
