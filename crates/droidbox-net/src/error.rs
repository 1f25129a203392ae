//! Error types for the network isolation stack.

use droidbox_error::CommonError;
use thiserror::Error;

/// Result type alias for network operations.
pub type Result<T> = std::result::Result<T, NetError>;

/// Errors that can occur during network operations.
#[derive(Debug, Error)]
pub enum NetError {
    /// Common errors shared across droidbox crates.
    #[error(transparent)]
    Common(#[from] CommonError),

    /// Namespace lifecycle error.
    #[error("namespace error: {0}")]
    Namespace(String),

    /// Virtual link error.
    #[error("link error: {0}")]
    Link(String),

    /// Address allocation error.
    #[error("address allocation error: {0}")]
    Address(String),

    /// Filter rule error.
    #[error("firewall error: {0}")]
    Firewall(String),

    /// Egress routing error.
    #[error("routing error: {0}")]
    Routing(String),
}

impl NetError {
    /// Returns true if this error maps to the network-configuration failure
    /// kind surfaced to callers.
    #[must_use]
    pub const fn is_config_failure(&self) -> bool {
        matches!(
            self,
            Self::Namespace(_) | Self::Link(_) | Self::Firewall(_) | Self::Routing(_)
        )
    }
}

// Route std::io::Error through CommonError so `?` works on file and process
// operations.
impl From<std::io::Error> for NetError {
    fn from(err: std::io::Error) -> Self {
        Self::Common(CommonError::from(err))
    }
}
