//! Error types for Quern

/// Application-specific error types
#[derive(thiserror::Error, Debug)]
pub enum QuernError {
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("cluster '{0}' is not tracked")]
    ClusterNotFound(String),

    #[error("malformed membership entry at '{path}': {reason}")]
    MalformedMembershipEntry { path: String, reason: String },

    #[error("coordination session lost")]
    CoordinationSessionLost,

    #[error("membership store error: {0}")]
    Store(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, QuernError>;
