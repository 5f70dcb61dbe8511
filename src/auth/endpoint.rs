//! Endpoint identity and access tokens
//!
//! An endpoint is the unit of authorization: one repository, one opaque
//! access token, and the namespaces its credential is projected into.
//! Endpoints are built once at startup and never change afterwards.

use std::fmt;

use regex::Regex;

use crate::config::{Organization, Repository};
use crate::error::Error;

use super::util::random_secure_token;

/// The opaque per-repository token handed out to clients
///
/// Carries no upstream meaning; it only identifies an endpoint inside
/// the proxy.
#[derive(Clone)]
pub struct AccessToken(String);

impl AccessToken {
    /// Generate a new random access token.
    pub fn generate() -> Result<Self, Error> {
        Ok(Self(random_secure_token()?))
    }

    /// The token as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never expose the token value in debug output
        f.write_str("AccessToken(<redacted>)")
    }
}

/// A single proxied repository and everything needed to authorize
/// and rewrite requests for it
pub struct Endpoint {
    /// URL scheme used towards the upstream
    pub scheme: String,
    /// Upstream host the repository lives on
    pub host: String,
    /// Organization slug
    pub organization: String,
    /// Project the repository belongs to (Azure DevOps only)
    pub project: Option<String>,
    /// Repository name
    pub repository: String,
    /// The opaque token clients authenticate with
    pub token: AccessToken,
    /// Namespaces the credential secret is created in
    pub namespaces: Vec<String>,
    /// Name of the credential secret
    pub secret_name: String,
    regexes: Vec<Regex>,
}

impl Endpoint {
    /// Build an endpoint for a repository within an organization.
    pub fn new(
        org: &Organization,
        repo: &Repository,
        regexes: Vec<Regex>,
        token: AccessToken,
    ) -> Self {
        Self {
            scheme: org.scheme.clone(),
            host: org.host.clone(),
            organization: org.name.clone(),
            project: repo.project.clone(),
            repository: repo.name.clone(),
            token,
            namespaces: repo.namespaces.clone(),
            secret_name: secret_name(org, repo),
            regexes,
        }
    }

    /// Stable identity of the endpoint, unique across the configuration.
    pub fn id(&self) -> String {
        let mut comps = vec![self.host.as_str(), self.organization.as_str()];
        if let Some(project) = &self.project {
            comps.push(project);
        }
        comps.push(&self.repository);
        comps.join("-")
    }

    /// Whether any of the endpoint's path matchers permits the path.
    pub fn permits(&self, path: &str) -> bool {
        self.regexes.iter().any(|r| r.is_match(path))
    }

    /// The ordered path matchers of the endpoint
    pub fn regexes(&self) -> &[Regex] {
        &self.regexes
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id())
            .field("namespaces", &self.namespaces)
            .field("secret_name", &self.secret_name)
            .finish()
    }
}

fn secret_name(org: &Organization, repo: &Repository) -> String {
    if let Some(name) = &repo.secret_name_override {
        return name.clone();
    }
    let mut comps = vec![org.name.as_str()];
    if let Some(project) = &repo.project {
        comps.push(project);
    }
    comps.push(&repo.name);
    comps.join("-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;

    fn azdo_org() -> Organization {
        Organization {
            provider: ProviderKind::AzureDevOps,
            host: "dev.azure.com".to_string(),
            scheme: "https".to_string(),
            name: "xenit".to_string(),
            azuredevops: None,
            github: None,
            repositories: vec![],
        }
    }

    fn repo(project: Option<&str>, override_name: Option<&str>) -> Repository {
        Repository {
            name: "fleet-infra".to_string(),
            project: project.map(str::to_string),
            namespaces: vec!["team-a".to_string()],
            secret_name_override: override_name.map(str::to_string),
        }
    }

    fn endpoint(project: Option<&str>, override_name: Option<&str>) -> Endpoint {
        Endpoint::new(
            &azdo_org(),
            &repo(project, override_name),
            vec![Regex::new("(?i)/xenit/platform/_git/fleet-infra(/.*)?\\b").unwrap()],
            AccessToken::generate().unwrap(),
        )
    }

    #[test]
    fn id_joins_identity_components() {
        assert_eq!(
            endpoint(Some("platform"), None).id(),
            "dev.azure.com-xenit-platform-fleet-infra"
        );
        assert_eq!(endpoint(None, None).id(), "dev.azure.com-xenit-fleet-infra");
    }

    #[test]
    fn secret_name_defaults_and_respects_override() {
        assert_eq!(
            endpoint(Some("platform"), None).secret_name,
            "xenit-platform-fleet-infra"
        );
        assert_eq!(endpoint(None, None).secret_name, "xenit-fleet-infra");
        assert_eq!(
            endpoint(Some("platform"), Some("fleet-credentials")).secret_name,
            "fleet-credentials"
        );
    }

    #[test]
    fn permits_consults_every_matcher() {
        let e = endpoint(Some("platform"), None);
        assert!(e.permits("/xenit/platform/_git/fleet-infra"));
        assert!(e.permits("/XENIT/Platform/_git/Fleet-Infra/info/refs"));
        assert!(!e.permits("/xenit/platform/_git/other"));
    }

    #[test]
    fn debug_output_never_contains_the_token() {
        let e = endpoint(Some("platform"), None);
        let token = e.token.as_str().to_string();
        let debug = format!("{e:?} {:?}", e.token);
        assert!(!debug.contains(&token));
    }
}
