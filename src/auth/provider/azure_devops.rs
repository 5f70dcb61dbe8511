//! Azure DevOps provider adapter

use async_trait::async_trait;
use regex::Regex;

use crate::auth::endpoint::Endpoint;
use crate::error::Error;

use super::{basic_auth_value, GitProvider};

/// Azure DevOps adapter authenticating with a personal access token
pub struct AzureDevOpsProvider {
    pat: String,
}

impl AzureDevOpsProvider {
    /// Create an adapter for an organization's PAT.
    pub fn new(pat: impl Into<String>) -> Self {
        Self { pat: pat.into() }
    }
}

#[async_trait]
impl GitProvider for AzureDevOpsProvider {
    fn path_regexes(
        &self,
        organization: &str,
        project: Option<&str>,
        repository: &str,
    ) -> Result<Vec<Regex>, Error> {
        let project = project.ok_or_else(|| {
            Error::config(format!(
                "repository {repository}: project is required for Azure DevOps"
            ))
        })?;
        let patterns = [
            format!(r"(?i)/{organization}/_apis\b"),
            format!(r"(?i)/{organization}/{project}/_git/{repository}(/.*)?\b"),
            format!(r"(?i)/{organization}/{project}/_apis/git/repositories/{repository}(/.*)?\b"),
        ];
        patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| Error::config(format!("invalid path matcher: {e}")))
            })
            .collect()
    }

    async fn authorization_header(&self, _path: &str) -> Result<String, Error> {
        Ok(basic_auth_value("pat", &self.pat))
    }

    fn target_host(&self, endpoint: &Endpoint, _path: &str) -> String {
        endpoint.host.clone()
    }

    fn target_path(&self, _endpoint: &Endpoint, path: &str) -> String {
        path.to_string()
    }
}
