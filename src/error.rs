use std::time::Duration;

/// Errors raised by the migration runner, for either scope.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("Failed to load migrations from {path}: {reason}")]
    Load { path: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration {version} was applied but is missing from the migration directory")]
    VersionMissing { version: i64 },

    #[error("Migration {version} was modified after it was applied (checksum mismatch)")]
    ChecksumMismatch { version: i64 },

    #[error("Migration {name} has no down script and cannot be rolled back")]
    MissingDown { name: String },

    /// A migration failed inside a batch. `applied` holds the files of the same
    /// batch that were committed before the failure.
    #[error("Migration {name} failed in batch {batch}: {source}")]
    Failed {
        batch: i32,
        applied: Vec<String>,
        name: String,
        #[source]
        source: sqlx::Error,
    },
}

impl MigrationError {
    /// Batch left partially applied by this error, if any.
    pub fn partial_batch(&self) -> Option<i32> {
        match self {
            MigrationError::Failed { batch, applied, .. } if !applied.is_empty() => Some(*batch),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Registry database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Tenant not found in registry: {0}")]
    TenantNotFound(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed to create schema objects for {schema}: {source}")]
    SchemaCreation {
        schema: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Migration failed for {schema}: {source}")]
    Migration {
        schema: String,
        #[source]
        source: MigrationError,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Failure of the compensating rollback after a failed migration. Logged, never returned.
#[derive(Debug, thiserror::Error)]
#[error("Rollback of {schema} failed: {source}")]
pub struct RollbackError {
    pub schema: String,
    #[source]
    pub source: MigrationError,
}

/// Per-tenant failure during a fleet pass.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("Could not open tenant session: {0}")]
    Connect(#[source] MigrationError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}
