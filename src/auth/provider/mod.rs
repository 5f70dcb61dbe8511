//! Provider adapters
//!
//! A provider adapter isolates everything the proxy has to know about one
//! Git hosting product: which request paths belong to a repository, how to
//! mint the upstream credential, and how host and path are rewritten on
//! the way out.

pub mod azure_devops;
pub mod github;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use regex::Regex;

use crate::error::Error;

use super::endpoint::Endpoint;

pub use azure_devops::AzureDevOpsProvider;
pub use github::{AppTokenSource, GitHubProvider, InstallationTokenSource};

/// Provider-specific knowledge behind a common seam
///
/// Implementations own their credential state and must be safe to share
/// across concurrently handled requests.
#[async_trait]
pub trait GitProvider: Send + Sync {
    /// Ordered case-insensitive path matchers for a repository.
    ///
    /// A path is permitted if any matcher matches; order carries no
    /// further meaning.
    fn path_regexes(
        &self,
        organization: &str,
        project: Option<&str>,
        repository: &str,
    ) -> Result<Vec<Regex>, Error>;

    /// Produce the upstream `Authorization` header value for a request path.
    ///
    /// May perform I/O, e.g. a GitHub App installation token exchange.
    async fn authorization_header(&self, path: &str) -> Result<String, Error>;

    /// The upstream host the request should be forwarded to.
    fn target_host(&self, endpoint: &Endpoint, path: &str) -> String;

    /// The upstream path the request should carry.
    fn target_path(&self, endpoint: &Endpoint, path: &str) -> String;
}

/// Format a basic-auth `Authorization` header value.
///
/// Uses the padded standard alphabet, the conventional encoding for
/// outbound HTTP basic auth.
pub(crate) fn basic_auth_value(username: &str, secret: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{username}:{secret}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_uses_standard_alphabet() {
        // "pat:secret" encodes with padding under the standard alphabet
        assert_eq!(basic_auth_value("pat", "secret"), "Basic cGF0OnNlY3JldA==");
    }
}
