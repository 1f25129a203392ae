//! Error types for the container runtime layer.

use droidbox_error::CommonError;
use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors that can occur while driving the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Common errors shared across droidbox crates.
    #[error(transparent)]
    Common(#[from] CommonError),

    /// Container engine API failure.
    #[error("container engine error: {0}")]
    Engine(#[from] bollard::errors::Error),

    /// Operation requires a running sandbox.
    #[error("sandbox not running: {0}")]
    NotRunning(String),

    /// Health probe failed; recoverable on the next monitor sweep.
    #[error("health check failed: {0}")]
    Health(String),

    /// Command execution inside the sandbox failed.
    #[error("exec error: {0}")]
    Exec(String),
}

impl RuntimeError {
    /// Creates a new not-running error.
    #[must_use]
    pub fn not_running(msg: impl Into<String>) -> Self {
        Self::NotRunning(msg.into())
    }

    /// Creates a new health error.
    #[must_use]
    pub fn health(msg: impl Into<String>) -> Self {
        Self::Health(msg.into())
    }

    /// Returns true for errors the monitor treats as recoverable.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Health(_))
    }
}

// Route std::io::Error through CommonError so `?` works on process and
// filesystem operations.
impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        Self::Common(CommonError::from(err))
    }
}
