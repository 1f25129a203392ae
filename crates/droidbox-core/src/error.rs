//! Error types for the instance management layer.

use droidbox_error::CommonError;
use droidbox_net::NetError;
use droidbox_runtime::RuntimeError;
use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while managing instances.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Common errors shared across droidbox crates.
    #[error(transparent)]
    Common(#[from] CommonError),

    /// Network isolation or routing failure.
    #[error("network error: {0}")]
    Net(#[from] NetError),

    /// Container runtime failure.
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Configuration file could not be loaded or parsed.
    #[error("config error: {0}")]
    ConfigFile(#[from] figment::Error),

    /// Provisioning was cancelled by a concurrent delete.
    #[error("provisioning aborted: {0}")]
    Aborted(String),
}

impl CoreError {
    /// Creates a new aborted error.
    #[must_use]
    pub fn aborted(msg: impl Into<String>) -> Self {
        Self::Aborted(msg.into())
    }

    /// Returns true if provisioning was cancelled rather than failed.
    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }

    /// Returns the underlying common error, if any.
    ///
    /// Walks through the transparent wrapper layers so callers can classify
    /// failures without matching on every crate boundary.
    #[must_use]
    pub const fn common(&self) -> Option<&CommonError> {
        match self {
            Self::Common(err) => Some(err),
            Self::Net(NetError::Common(err)) | Self::Runtime(RuntimeError::Common(err)) => {
                Some(err)
            }
            _ => None,
        }
    }
}

// Route std::io::Error through CommonError so `?` works on filesystem
// operations in the manager.
impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Common(CommonError::from(err))
    }
}
