//! Authorization model
//!
//! The [`Authorizer`] owns every endpoint and its provider adapter. It is
//! built once from the validated configuration, before any listener
//! starts, and is read-only afterwards. Request handlers and the token
//! writer share it without locking.

pub mod endpoint;
pub mod provider;
mod util;

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::uri::Uri;
use axum::http::{header, HeaderValue, Request};

use crate::config::{Configuration, ProviderKind};
use crate::error::Error;

pub use endpoint::{AccessToken, Endpoint};
pub use provider::{
    AppTokenSource, AzureDevOpsProvider, GitHubProvider, GitProvider, InstallationTokenSource,
};

pub(crate) use util::decode_base64_loose;

/// How often token generation is retried on a collision before giving up
const TOKEN_RETRIES: usize = 5;

/// Registry of endpoints and provider adapters
pub struct Authorizer {
    endpoints: Vec<Arc<Endpoint>>,
    endpoints_by_id: HashMap<String, Arc<Endpoint>>,
    endpoints_by_token: HashMap<String, Arc<Endpoint>>,
    providers_by_id: HashMap<String, Arc<dyn GitProvider>>,
}

impl std::fmt::Debug for Authorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authorizer")
            .field("endpoints", &self.endpoints)
            .field("endpoints_by_id", &self.endpoints_by_id.keys().collect::<Vec<_>>())
            .field("endpoints_by_token", &self.endpoints_by_token.keys().len())
            .field("providers_by_id", &self.providers_by_id.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Authorizer {
    /// Build the authorizer from a validated configuration.
    ///
    /// Constructs one provider adapter per organization and one endpoint
    /// per repository, minting each endpoint's opaque token. Fails on
    /// duplicate endpoint identities and on provider misconfiguration.
    pub fn new(cfg: &Configuration) -> Result<Self, Error> {
        let mut endpoints = Vec::new();
        let mut endpoints_by_id = HashMap::new();
        let mut endpoints_by_token: HashMap<String, Arc<Endpoint>> = HashMap::new();
        let mut providers_by_id = HashMap::new();

        for org in &cfg.organizations {
            let provider: Arc<dyn GitProvider> = match org.provider {
                ProviderKind::AzureDevOps => {
                    let creds = org.azuredevops.as_ref().ok_or_else(|| {
                        Error::config(format!(
                            "organization {}: azuredevops credential block is required",
                            org.name
                        ))
                    })?;
                    Arc::new(AzureDevOpsProvider::new(&creds.pat))
                }
                ProviderKind::GitHub => {
                    let creds = org.github.as_ref().ok_or_else(|| {
                        Error::config(format!(
                            "organization {}: github credential block is required",
                            org.name
                        ))
                    })?;
                    let pem = decode_base64_loose(&creds.private_key).map_err(|_| {
                        Error::provider(format!(
                            "organization {}: private key is not valid base64",
                            org.name
                        ))
                    })?;
                    Arc::new(GitHubProvider::new(AppTokenSource::new(
                        &org.scheme,
                        &org.host,
                        creds.app_id,
                        creds.installation_id,
                        &pem,
                    )?))
                }
            };

            for repo in &org.repositories {
                let regexes =
                    provider.path_regexes(&org.name, repo.project.as_deref(), &repo.name)?;
                if regexes.is_empty() {
                    return Err(Error::config(format!(
                        "repository {}: provider produced no path matchers",
                        repo.name
                    )));
                }
                let token = mint_token(&endpoints_by_token)?;
                let endpoint = Arc::new(Endpoint::new(org, repo, regexes, token));
                let id = endpoint.id();
                if endpoints_by_id.contains_key(&id) {
                    return Err(Error::config(format!("duplicate endpoint id {id}")));
                }
                providers_by_id.insert(id.clone(), provider.clone());
                endpoints_by_token
                    .insert(endpoint.token.as_str().to_string(), endpoint.clone());
                endpoints_by_id.insert(id, endpoint.clone());
                endpoints.push(endpoint);
            }
        }

        Ok(Self {
            endpoints,
            endpoints_by_id,
            endpoints_by_token,
            providers_by_id,
        })
    }

    /// All endpoints, in configuration order.
    ///
    /// The order is stable for the lifetime of the process.
    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    /// Look up an endpoint by its identity.
    pub fn endpoint_by_id(&self, id: &str) -> Option<&Arc<Endpoint>> {
        self.endpoints_by_id.get(id)
    }

    /// Look up an endpoint by its opaque token.
    pub fn endpoint_by_token(&self, token: &str) -> Result<&Arc<Endpoint>, Error> {
        self.endpoints_by_token
            .get(token)
            .ok_or(Error::InvalidToken)
    }

    /// Check whether the token grants access to the (escaped) request path.
    pub fn is_permitted(&self, path: &str, token: &str) -> Result<(), Error> {
        let endpoint = self.endpoint_by_token(token)?;
        if endpoint.permits(path) {
            Ok(())
        } else {
            Err(Error::NotPermitted(path.to_string()))
        }
    }

    /// Rewrite a request for its upstream.
    ///
    /// Sets the `Host` header and URI path chosen by the provider, strips
    /// any inbound `Authorization` header, and adds the provider-minted
    /// one. Returns the rewritten request together with the upstream base
    /// URL (`scheme://host`).
    pub async fn update_request<B>(
        &self,
        req: Request<B>,
        token: &str,
    ) -> Result<(Request<B>, String), Error> {
        let endpoint = self.endpoint_by_token(token)?;
        let provider = self
            .providers_by_id
            .get(&endpoint.id())
            .ok_or_else(|| Error::internal(format!("provider not found for {}", endpoint.id())))?;

        let path = req.uri().path();
        let host = provider.target_host(endpoint, path);
        let target_path = provider.target_path(endpoint, path);
        let authorization = provider.authorization_header(path).await?;
        let upstream = format!("{}://{}", endpoint.scheme, host);

        let (mut parts, body) = req.into_parts();
        let path_and_query = match parts.uri.query() {
            Some(query) => format!("{target_path}?{query}"),
            None => target_path,
        };
        let mut uri_parts = parts.uri.into_parts();
        uri_parts.path_and_query = Some(path_and_query.parse().map_err(|e| {
            Error::internal(format!("rewritten path is not a valid uri: {e}"))
        })?);
        parts.uri = Uri::from_parts(uri_parts)
            .map_err(|e| Error::internal(format!("could not rebuild request uri: {e}")))?;

        parts.headers.remove(header::AUTHORIZATION);
        parts.headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&authorization)
                .map_err(|e| Error::internal(format!("invalid authorization header: {e}")))?,
        );
        parts.headers.insert(
            header::HOST,
            HeaderValue::from_str(&host)
                .map_err(|e| Error::internal(format!("invalid host header: {e}")))?,
        );

        Ok((Request::from_parts(parts, body), upstream))
    }
}

fn mint_token(taken: &HashMap<String, Arc<Endpoint>>) -> Result<AccessToken, Error> {
    for _ in 0..TOKEN_RETRIES {
        let token = AccessToken::generate()?;
        if !taken.contains_key(token.as_str()) {
            return Ok(token);
        }
    }
    Err(Error::internal("could not mint a unique access token"))
}
