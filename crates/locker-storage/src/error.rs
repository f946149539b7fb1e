use locker_core::ErrorKind;
use thiserror::Error;

/// Failures of the locker database.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Connection, query or constraint failure reported by SQLite.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Entity not found: {entity_type} with {field}={value}")]
    NotFound {
        entity_type: String,
        field: String,
        value: String,
    },

    /// The row exists but is not in the status the operation requires.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// A JSON payload or result column could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl StorageError {
    pub(crate) fn not_found(entity_type: &str, field: &str, value: impl ToString) -> Self {
        Self::NotFound {
            entity_type: entity_type.to_string(),
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    /// Stable classification for callers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::AssignmentConflict,
            Self::Validation(_) => ErrorKind::InvalidParameters,
            _ => ErrorKind::Storage,
        }
    }
}

impl From<locker_core::Error> for StorageError {
    fn from(error: locker_core::Error) -> Self {
        Self::Validation(error.to_string())
    }
}

/// Specialized result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
