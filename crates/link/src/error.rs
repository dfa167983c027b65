//! Link error types

use thiserror::Error;

/// Link setup errors
///
/// Per-frame failures are reported through `contracts::TransportError`.
#[derive(Debug, Error)]
pub enum LinkError {
    /// A receiver is already delivering for this link
    #[error("link '{link}' already has a receiver attached")]
    AlreadyAttached { link: String },

    /// Configuration cannot drive a link
    #[error("invalid configuration for link '{link}': {message}")]
    InvalidConfig { link: String, message: String },
}

impl LinkError {
    /// Create an invalid configuration error
    pub fn invalid_config(link: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            link: link.into(),
            message: message.into(),
        }
    }
}
