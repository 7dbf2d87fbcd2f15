use tollgate_core::BusinessId;

/// Errors raised by store backends
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database driver or connection failure
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed at startup
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Conditional update matched no rows (stale version or insufficient balance)
    #[error("optimistic lock conflict on wallet {0}")]
    Conflict(i64),

    /// A record for this business id already exists
    #[error("duplicate record for {0}")]
    Duplicate(BusinessId),

    #[error("{0} not found")]
    NotFound(String),

    /// Stored value could not be mapped back to a model
    #[error("corrupt row: {0}")]
    Corrupt(String),
}
