//! Error types for the reactive runtime

use thiserror::Error;

/// Core Duo errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DuoError {
    /// Deferred tasks kept enqueueing more work past the pass limit
    #[error("Flush limit exceeded: {passes} passes, {pending} tasks still pending")]
    FlushLimitExceeded { passes: usize, pending: usize },

    #[error("Flush called from inside a deferred task")]
    ReentrantFlush,
}

/// Result type for Duo operations
pub type DuoResult<T> = Result<T, DuoError>;
