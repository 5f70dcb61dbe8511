//! git-auth-proxy - authenticating reverse proxy for Git hosting providers
//!
//! Workloads in a cluster talk to Azure DevOps and GitHub repositories
//! without ever holding the real upstream credential. The proxy mints an
//! opaque token per repository, projects it into Kubernetes Secrets, and
//! on every request authenticates the caller against the opaque token,
//! authorizes the path, and swaps in the real upstream credential before
//! forwarding.
//!
//! # Modules
//!
//! - [`config`] - Configuration file parsing and validation
//! - [`auth`] - Authorization registry, endpoints, and provider adapters
//! - [`server`] - Proxy listener and the request-rewriting pipeline
//! - [`token_writer`] - Credential secret reconciliation
//! - [`metrics`] - Prometheus metrics and the metrics listener
//! - [`error`] - Error types for the proxy

#![deny(missing_docs)]

pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod server;
pub mod token_writer;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
