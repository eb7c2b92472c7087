//! Error taxonomy for AVC
//!
//! Every fatal fault the engine can raise lives here. Resumable conditions
//! met while applying a commit (already-applied steps, missing delete
//! targets) are not errors; see [`crate::apply::StepOutcome`].

use crate::object::CommitId;

/// Result type for AVC operations
pub type Result<T> = std::result::Result<T, AvcError>;

/// Errors that can occur while staging, committing or applying
#[derive(Debug, thiserror::Error)]
pub enum AvcError {
    #[error("HEAD ({}) is not equal to main ({})", display_ref(.head), display_ref(.main))]
    RefMismatch {
        head: Option<CommitId>,
        main: Option<CommitId>,
    },

    #[error("{path} is not {declared} bytes long (only {available} bytes on disk)")]
    InsufficientBytes {
        path: String,
        declared: u64,
        available: u64,
    },

    #[error("Consistency fault: {0}")]
    Consistency(String),

    #[error("HEAD ({}) is not an ancestor of main ({})", display_ref(.head), display_ref(.main))]
    NotAncestor {
        head: Option<CommitId>,
        main: Option<CommitId>,
    },

    #[error("Cannot proceed with {0} staged changes")]
    StagingNotEmpty(usize),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Commit not found: {0}")]
    NotFound(CommitId),

    #[error("Repository layout error: {0}")]
    Layout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl AvcError {
    pub(crate) fn consistency(msg: impl Into<String>) -> Self {
        AvcError::Consistency(msg.into())
    }
}

impl From<rusqlite::Error> for AvcError {
    fn from(e: rusqlite::Error) -> Self {
        AvcError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for AvcError {
    fn from(e: serde_json::Error) -> Self {
        AvcError::Serialization(e.to_string())
    }
}

fn display_ref(r: &Option<CommitId>) -> String {
    match r {
        Some(id) => id.to_string(),
        None => "<none>".to_string(),
    }
}
