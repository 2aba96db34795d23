//! Error types for weft-rs.

use thiserror::Error;

/// Errors that can occur when building a pool or scheduling work on it.
#[derive(Debug, Error)]
pub enum WeftError {
    /// The group was stopped before it completed naturally.
    #[error("group was stopped before completion")]
    Cancelled,

    /// A wait deadline elapsed before the group reached the stopped state.
    #[error("operation timed out")]
    TimedOut,

    /// A submission would exceed the configured nesting depth cap.
    #[error("nesting depth {depth} exceeds the configured maximum of {max}")]
    NestingDepthExceeded { depth: usize, max: usize },

    /// The work item is already enrolled in a group.
    #[error("work item is already enrolled in a group")]
    AlreadyEnrolled,

    /// The operation is not valid in the current state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Per-device I/O telemetry is not available on this platform or device.
    #[error("i/o telemetry is not supported for this platform or device")]
    Unsupported,

    /// Error extracting configuration from figment.
    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Error spawning a worker or timer thread.
    #[error("failed to spawn pool thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    /// The pool failed to schedule enrolled work; the group was abandoned.
    #[error("scheduling failure: {0}")]
    Scheduling(String),

    /// A work item's `run` hook failed.
    #[error("work item failed: {0}")]
    Task(String),
}

/// Result type alias for weft operations.
pub type Result<T> = std::result::Result<T, WeftError>;
