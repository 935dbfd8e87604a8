//! Persistence error types.

use thiserror::Error;

/// Repository and vault errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// Migration directory not found in the current environment.
    #[error("migration directory not found; tried {tried}")]
    MigrationDirNotFound { tried: String },

    /// No record with this id.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// A record with this id already exists.
    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: &'static str, id: String },

    /// Record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DbError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub(crate) fn deployment_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            kind: "deployment",
            id: id.to_string(),
        }
    }

    pub(crate) fn secret_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            kind: "secret",
            id: id.to_string(),
        }
    }
}
