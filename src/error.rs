//! Error types for the proxy

use thiserror::Error;

/// Main error type for proxy operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid or incomplete configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// A provider could not be constructed from its credential block
    #[error("provider error: {0}")]
    Provider(String),

    /// The request carried no usable client credential
    #[error("missing client credential")]
    CredentialMissing,

    /// The presented access token is not known to the authorizer
    #[error("access token not recognized")]
    InvalidToken,

    /// The access token is known but does not grant access to the path
    #[error("token not permitted for path {0}")]
    NotPermitted(String),

    /// The provider failed to produce an upstream credential
    #[error("upstream authorization failed: {0}")]
    UpstreamAuth(String),

    /// The upstream request could not be completed
    #[error("upstream request failed: {0}")]
    Upstream(String),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a provider error with the given message
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create an upstream authorization error with the given message
    pub fn upstream_auth(msg: impl Into<String>) -> Self {
        Self::UpstreamAuth(msg.into())
    }

    /// Create an upstream request error with the given message
    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
