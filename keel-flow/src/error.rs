//! Flow control errors.

use std::fmt;

/// Result type for flow control operations.
pub type FlowResult<T> = std::result::Result<T, FlowError>;

/// Errors from flow control operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    /// Not enough tokens are available for the request.
    RateLimitExceeded {
        /// Tokens requested.
        requested: u64,
        /// Tokens currently available.
        available: u64,
    },

    /// The limiter configuration cannot satisfy the request.
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimitExceeded {
                requested,
                available,
            } => write!(
                f,
                "rate limit exceeded: requested {requested} tokens, {available} available"
            ),
            Self::InvalidConfig { message } => write!(f, "invalid limiter config: {message}"),
        }
    }
}

impl std::error::Error for FlowError {}
