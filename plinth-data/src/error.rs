use thiserror::Error;

/// Errors from the schema-scoped data layer.
#[derive(Debug, Error)]
pub enum DataError {
    /// The caller tried to escape its schema: a handle for a schema it does
    /// not own, an invalid schema identifier, or raw SQL that manipulates
    /// `search_path` directly.
    #[error("isolation violation: {0}")]
    IsolationViolation(String),

    /// No row matched where exactly one was required.
    #[error("row not found")]
    NotFound,

    /// Any other database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A plugin migration failed to apply.
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}
