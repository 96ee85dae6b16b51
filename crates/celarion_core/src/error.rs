//! Core error types for CELARION.

use std::fmt;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Invalid encoding
    InvalidEncoding,

    /// Broken hash chain
    BrokenChain { position: usize },

    /// Invalid ID format
    InvalidId { reason: String },

    /// Value outside its declared range
    RangeViolation { value: i64, min: i64, max: i64 },

    /// Malformed input (graph, config, log)
    ParseError { message: String },

    /// Validation error
    Validation { field: String, reason: String },

    /// Not found
    NotFound { kind: String, id: String },

    /// Already exists
    AlreadyExists { kind: String, id: String },

    /// Capacity exceeded
    CapacityExceeded { resource: String, limit: u64 },

    /// Timeout
    Timeout {
        /// Operation that timed out
        operation: String,
    },

    /// Cancelled
    Cancelled,

    /// Internal error (for unexpected errors)
    Internal {
        /// Error message
        message: String,
    },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEncoding => write!(f, "Invalid encoding"),
            Self::BrokenChain { position } => {
                write!(f, "Broken hash chain at position {}", position)
            }
            Self::InvalidId { reason } => write!(f, "Invalid ID: {}", reason),
            Self::RangeViolation { value, min, max } => {
                write!(f, "Range violation: {} not in [{}::{}]", value, min, max)
            }
            Self::ParseError { message } => write!(f, "Parse error: {}", message),
            Self::Validation { field, reason } => {
                write!(f, "Validation failed for {}: {}", field, reason)
            }
            Self::NotFound { kind, id } => write!(f, "{} not found: {}", kind, id),
            Self::AlreadyExists { kind, id } => write!(f, "{} already exists: {}", kind, id),
            Self::CapacityExceeded { resource, limit } => {
                write!(f, "Capacity exceeded for {}: {}", resource, limit)
            }
            Self::Timeout { operation } => write!(f, "Timeout: {}", operation),
            Self::Cancelled => write!(f, "Operation cancelled"),
            Self::Internal { message } => write!(f, "Internal error: {}", message),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::ParseError {
            message: err.to_string(),
        }
    }
}

impl From<postcard::Error> for CoreError {
    fn from(_: postcard::Error) -> Self {
        Self::InvalidEncoding
    }
}
