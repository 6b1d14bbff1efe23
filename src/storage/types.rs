use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another instance of the application has locked the database
    #[error("Another instance of digest-notify appears to be using the state database. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        // SQLITE_CANTOPEN (14): unable to open database file
        if is_lock_message(&error_string) || error_string.contains("unable to open database file") {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

pub(crate) fn is_lock_message(lowercased: &str) -> bool {
    lowercased.contains("database is locked")
        || lowercased.contains("database table is locked")
        || lowercased.contains("sqlite_busy")
        || lowercased.contains("sqlite_locked")
}
