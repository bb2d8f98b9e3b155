//! Common error types for tagrank

use thiserror::Error;
use uuid::Uuid;

/// Common result type for tagrank operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across tagrank crates
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Rejected author action; nothing was written
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Cycle or dangling edge found while walking the tag taxonomy
    #[error("Inconsistent taxonomy: {0}")]
    InconsistentTaxonomy(String),

    /// Classification of a single work failed
    #[error("Classification failed for work {work_id}: {reason}")]
    Classification { work_id: Uuid, reason: String },

    /// Score document could not be delivered to the search index
    #[error("Publish error: {0}")]
    Publish(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Author-facing validation failures
///
/// Messages name the tag(s) involved so the author can act on them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Promoting the tag would exceed the primary relationship cap
    #[error(
        "Cannot mark '{tag_name}' as primary: work {work_id} already has {cap} primary relationship tags ({}). Demote one of them first.",
        blocking_tags.join(", ")
    )]
    CapacityExceeded {
        work_id: Uuid,
        tag_id: i64,
        tag_name: String,
        cap: usize,
        blocking_tags: Vec<String>,
    },

    /// Authors pick a concrete level; `unassigned` is reserved for the classifier
    #[error("Tag {tag_id} cannot be manually set to 'unassigned'")]
    ManualUnassign { tag_id: i64 },

    /// The tag is not attached to the work
    #[error("Tag {tag_id} is not attached to work {work_id}")]
    NotAttached { work_id: Uuid, tag_id: i64 },
}

impl Error {
    /// True for SQLite lock contention that is worth retrying
    pub fn is_lock_contention(&self) -> bool {
        match self {
            Error::Database(db_err) => db_err.to_string().contains("database is locked"),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_exceeded_names_blocking_tags() {
        let err = Error::from(ValidationError::CapacityExceeded {
            work_id: Uuid::nil(),
            tag_id: 7,
            tag_name: "E/F".to_string(),
            cap: 3,
            blocking_tags: vec!["A/B".to_string(), "C/D".to_string(), "G/H".to_string()],
        });

        let message = err.to_string();
        assert!(message.contains("'E/F'"));
        assert!(message.contains("A/B, C/D, G/H"));
        assert!(message.contains("3 primary"));
    }

    #[test]
    fn test_lock_contention_only_for_database_errors() {
        assert!(!Error::Internal("database is locked".to_string()).is_lock_contention());
    }
}
