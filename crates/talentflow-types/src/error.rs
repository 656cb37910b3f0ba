use thiserror::Error;

/// Errors from store operations (used by trait definitions in talentflow-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    /// Optimistic version check failed, or a unique key already exists.
    #[error("conflict: {0}")]
    Conflict(String),
}
