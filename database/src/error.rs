//! Database error types

use estate_core::EstateError;
use thiserror::Error;

/// Database-related errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A stored row could not be mapped back to a domain value
    #[error("Corrupt row in {table}: {message}")]
    Corrupt { table: &'static str, message: String },

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),
}

impl DatabaseError {
    pub fn corrupt(table: &'static str, message: impl std::fmt::Display) -> Self {
        Self::Corrupt {
            table,
            message: message.to_string(),
        }
    }

    /// Name of the violated constraint, if the database reported one
    pub fn constraint(&self) -> Option<&str> {
        match self {
            Self::Sql(sqlx::Error::Database(db)) => db.constraint(),
            _ => None,
        }
    }
}

impl From<config::ConfigError> for DatabaseError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

// Every persistence failure aborts the engine session as a storage error.
impl From<DatabaseError> for EstateError {
    fn from(err: DatabaseError) -> Self {
        match err.constraint() {
            Some(constraint) => EstateError::Storage(format!("constraint {} violated: {}", constraint, err)),
            None => EstateError::Storage(err.to_string()),
        }
    }
}

/// Type alias for database results
pub type DatabaseResult<T> = Result<T, DatabaseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maps_to_storage() {
        let err: EstateError = DatabaseError::corrupt("users", "negative balance").into();
        assert_eq!(
            err,
            EstateError::Storage("Corrupt row in users: negative balance".to_string())
        );
        assert!(!err.is_domain());
    }
}
