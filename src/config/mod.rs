//! Configuration file parsing and validation
//!
//! The configuration is a JSON document listing Git hosting organizations,
//! their upstream credentials, and the repositories the proxy mediates
//! access to. It is read once at startup and is immutable afterwards.

use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::error::Error;

/// Git hosting providers the proxy knows how to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Azure DevOps, authenticated with a personal access token
    AzureDevOps,
    /// GitHub or GitHub Enterprise, authenticated as a GitHub App installation
    GitHub,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::AzureDevOps => write!(f, "azuredevops"),
            ProviderKind::GitHub => write!(f, "github"),
        }
    }
}

/// Azure DevOps credential block
#[derive(Clone, Deserialize)]
pub struct AzureDevOpsConfig {
    /// Personal access token used for all upstream requests
    pub pat: String,
}

impl fmt::Debug for AzureDevOpsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never expose the PAT in debug output
        f.debug_struct("AzureDevOpsConfig")
            .field("pat", &"<redacted>")
            .finish()
    }
}

/// GitHub App credential block
#[derive(Clone, Deserialize)]
pub struct GitHubConfig {
    /// GitHub App identifier
    #[serde(rename = "appID")]
    pub app_id: i64,
    /// Installation of the app in the organization
    #[serde(rename = "installationID")]
    pub installation_id: i64,
    /// Base64-encoded PEM private key of the app
    #[serde(rename = "privateKey")]
    pub private_key: String,
}

impl fmt::Debug for GitHubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitHubConfig")
            .field("app_id", &self.app_id)
            .field("installation_id", &self.installation_id)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// A repository the proxy mediates access to
#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    /// Repository name
    pub name: String,
    /// Project the repository belongs to; required for Azure DevOps,
    /// absent for GitHub
    #[serde(default)]
    pub project: Option<String>,
    /// Namespaces the repository credential is projected into
    pub namespaces: Vec<String>,
    /// Overrides the generated credential secret name
    #[serde(rename = "secretNameOverride", default)]
    pub secret_name_override: Option<String>,
}

/// A Git hosting organization and its repositories
#[derive(Debug, Clone, Deserialize)]
pub struct Organization {
    /// Which provider hosts the organization
    pub provider: ProviderKind,
    /// Upstream host name, e.g. `dev.azure.com` or `github.com`
    pub host: String,
    /// URL scheme used towards the upstream
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Organization slug
    pub name: String,
    /// Credential block for Azure DevOps organizations
    #[serde(default)]
    pub azuredevops: Option<AzureDevOpsConfig>,
    /// Credential block for GitHub organizations
    #[serde(default)]
    pub github: Option<GitHubConfig>,
    /// Repositories the proxy mediates access to
    pub repositories: Vec<Repository>,
}

/// Top-level configuration document
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// All configured organizations
    pub organizations: Vec<Organization>,
}

fn default_scheme() -> String {
    "https".to_string()
}

impl Configuration {
    /// Parse and validate the configuration file at the given path.
    pub fn load(path: &Path) -> Result<Configuration, Error> {
        let bytes = std::fs::read(path).map_err(|e| {
            Error::config(format!("could not read {}: {}", path.display(), e))
        })?;
        Self::from_json(&bytes)
    }

    /// Parse and validate configuration from raw JSON bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Configuration, Error> {
        let cfg: Configuration = serde_json::from_slice(bytes)
            .map_err(|e| Error::config(format!("invalid configuration: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the parsed configuration.
    pub fn validate(&self) -> Result<(), Error> {
        if self.organizations.is_empty() {
            return Err(Error::config("at least one organization is required"));
        }
        for org in &self.organizations {
            org.validate()?;
        }
        Ok(())
    }
}

impl Organization {
    fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::config("organization name is required"));
        }
        validate_host(&self.host, &self.name)?;
        if self.scheme != "http" && self.scheme != "https" {
            return Err(Error::config(format!(
                "organization {}: scheme must be http or https, got {}",
                self.name, self.scheme
            )));
        }
        match self.provider {
            ProviderKind::AzureDevOps => {
                if self.azuredevops.is_none() {
                    return Err(Error::config(format!(
                        "organization {}: azuredevops credential block is required",
                        self.name
                    )));
                }
            }
            ProviderKind::GitHub => {
                if self.github.is_none() {
                    return Err(Error::config(format!(
                        "organization {}: github credential block is required",
                        self.name
                    )));
                }
            }
        }
        if self.repositories.is_empty() {
            return Err(Error::config(format!(
                "organization {}: at least one repository is required",
                self.name
            )));
        }
        for repo in &self.repositories {
            self.validate_repository(repo)?;
        }
        Ok(())
    }

    fn validate_repository(&self, repo: &Repository) -> Result<(), Error> {
        if repo.name.is_empty() {
            return Err(Error::config(format!(
                "organization {}: repository name is required",
                self.name
            )));
        }
        match self.provider {
            ProviderKind::AzureDevOps => {
                if repo.project.as_deref().unwrap_or("").is_empty() {
                    return Err(Error::config(format!(
                        "repository {}: project is required for Azure DevOps",
                        repo.name
                    )));
                }
            }
            ProviderKind::GitHub => {
                if repo.project.is_some() {
                    return Err(Error::config(format!(
                        "repository {}: project is not valid for GitHub",
                        repo.name
                    )));
                }
            }
        }
        if repo.namespaces.is_empty() || repo.namespaces.iter().any(String::is_empty) {
            return Err(Error::config(format!(
                "repository {}: at least one non-empty namespace is required",
                repo.name
            )));
        }
        Ok(())
    }
}

fn validate_host(host: &str, org: &str) -> Result<(), Error> {
    let valid = !host.is_empty()
        && !host.contains('/')
        && !host.contains('@')
        && !host.contains("://")
        && !host.chars().any(char::is_whitespace);
    if valid {
        Ok(())
    } else {
        Err(Error::config(format!(
            "organization {org}: host must be a bare host name, got {host:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_config_json() -> &'static str {
        r#"{
            "organizations": [
                {
                    "provider": "azuredevops",
                    "host": "dev.azure.com",
                    "name": "xenit",
                    "azuredevops": {"pat": "pat-secret"},
                    "repositories": [
                        {
                            "name": "fleet-infra",
                            "project": "platform",
                            "namespaces": ["team-a", "team-b"],
                            "secretNameOverride": "fleet-credentials"
                        }
                    ]
                },
                {
                    "provider": "github",
                    "host": "github.com",
                    "name": "org",
                    "github": {"appID": 123, "installationID": 456, "privateKey": "Zm9v"},
                    "repositories": [
                        {"name": "repo", "namespaces": ["default"]}
                    ]
                }
            ]
        }"#
    }

    #[test]
    fn parses_complete_configuration() {
        let cfg = Configuration::from_json(full_config_json().as_bytes()).unwrap();
        assert_eq!(cfg.organizations.len(), 2);

        let azdo = &cfg.organizations[0];
        assert_eq!(azdo.provider, ProviderKind::AzureDevOps);
        assert_eq!(azdo.scheme, "https", "scheme should default to https");
        assert_eq!(azdo.azuredevops.as_ref().unwrap().pat, "pat-secret");
        let repo = &azdo.repositories[0];
        assert_eq!(repo.project.as_deref(), Some("platform"));
        assert_eq!(repo.secret_name_override.as_deref(), Some("fleet-credentials"));

        let gh = &cfg.organizations[1];
        assert_eq!(gh.provider, ProviderKind::GitHub);
        assert_eq!(gh.github.as_ref().unwrap().app_id, 123);
        assert!(gh.repositories[0].project.is_none());
    }

    #[test]
    fn rejects_unknown_provider() {
        let json = r#"{"organizations": [{"provider": "gitlab", "host": "gitlab.com", "name": "o", "repositories": []}]}"#;
        let err = Configuration::from_json(json.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("configuration error"));
    }

    #[test]
    fn rejects_empty_organizations() {
        let err = Configuration::from_json(br#"{"organizations": []}"#).unwrap_err();
        assert!(err.to_string().contains("at least one organization"));
    }

    #[test]
    fn rejects_missing_credential_block() {
        let json = r#"{
            "organizations": [{
                "provider": "azuredevops",
                "host": "dev.azure.com",
                "name": "org",
                "repositories": [{"name": "repo", "project": "proj", "namespaces": ["ns"]}]
            }]
        }"#;
        let err = Configuration::from_json(json.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("azuredevops credential block"));
    }

    #[test]
    fn rejects_azure_devops_repository_without_project() {
        let json = r#"{
            "organizations": [{
                "provider": "azuredevops",
                "host": "dev.azure.com",
                "name": "org",
                "azuredevops": {"pat": "p"},
                "repositories": [{"name": "repo", "namespaces": ["ns"]}]
            }]
        }"#;
        let err = Configuration::from_json(json.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("project is required"));
    }

    #[test]
    fn rejects_github_repository_with_project() {
        let json = r#"{
            "organizations": [{
                "provider": "github",
                "host": "github.com",
                "name": "org",
                "github": {"appID": 1, "installationID": 2, "privateKey": "a"},
                "repositories": [{"name": "repo", "project": "proj", "namespaces": ["ns"]}]
            }]
        }"#;
        let err = Configuration::from_json(json.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("project is not valid"));
    }

    #[test]
    fn rejects_empty_namespaces() {
        let json = r#"{
            "organizations": [{
                "provider": "github",
                "host": "github.com",
                "name": "org",
                "github": {"appID": 1, "installationID": 2, "privateKey": "a"},
                "repositories": [{"name": "repo", "namespaces": []}]
            }]
        }"#;
        let err = Configuration::from_json(json.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("namespace"));
    }

    #[test]
    fn rejects_host_with_scheme_or_path() {
        for host in ["https://dev.azure.com", "dev.azure.com/org", ""] {
            let json = format!(
                r#"{{
                    "organizations": [{{
                        "provider": "azuredevops",
                        "host": "{host}",
                        "name": "org",
                        "azuredevops": {{"pat": "p"}},
                        "repositories": [{{"name": "r", "project": "p", "namespaces": ["ns"]}}]
                    }}]
                }}"#
            );
            let err = Configuration::from_json(json.as_bytes()).unwrap_err();
            assert!(err.to_string().contains("host"), "host {host:?} should be rejected");
        }
    }

    #[test]
    fn debug_output_redacts_credentials() {
        let cfg = Configuration::from_json(full_config_json().as_bytes()).unwrap();
        let debug = format!("{cfg:?}");
        assert!(!debug.contains("pat-secret"));
        assert!(!debug.contains("Zm9v"));
        assert!(debug.contains("<redacted>"));
    }
}
