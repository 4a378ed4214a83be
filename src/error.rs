//! Error types for the filter core.
//!
//! Validation rejections have their own type in `validation`; they are an
//! expected outcome rather than a failure and carry measurement details.

use thiserror::Error;

/// Topic pattern and registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    /// A concrete (received) topic carried a wildcard token
    #[error("Invalid topic '{0}': wildcards are only legal in subscription patterns")]
    InvalidTopic(String),

    /// A subscription pattern is malformed
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: &'static str },
}

/// Errors surfaced by the filter runtime
#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Topic error: {0}")]
    Topic(#[from] TopicError),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type alias for filter operations
pub type Result<T> = std::result::Result<T, FilterError>;
