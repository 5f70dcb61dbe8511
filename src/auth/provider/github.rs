//! GitHub provider adapter
//!
//! Authenticates as a GitHub App installation: a short-lived app JWT is
//! exchanged for an installation access token, which is cached until just
//! before it expires. Works against both `github.com` and GitHub
//! Enterprise hosts.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use regex::Regex;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::auth::endpoint::Endpoint;
use crate::error::Error;

use super::{basic_auth_value, GitProvider};

/// Host name of the hosted GitHub product
pub const STANDARD_GITHUB_HOST: &str = "github.com";

const API_V3_PREFIX: &str = "/api/v3/";

/// Source of GitHub installation access tokens
///
/// Split out behind a trait so tests can substitute a fixed token for the
/// JWT exchange.
#[async_trait]
pub trait InstallationTokenSource: Send + Sync {
    /// A currently valid installation access token.
    async fn token(&self) -> Result<String, Error>;
}

#[derive(Debug)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        // Refresh a minute early so an almost-expired token is never
        // handed to an upstream request.
        Utc::now() + Duration::seconds(60) < self.expires_at
    }
}

#[derive(Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Exchanges app JWTs for installation access tokens, with caching
pub struct AppTokenSource {
    app_id: i64,
    key: EncodingKey,
    exchange_url: String,
    http: reqwest::Client,
    cached: RwLock<Option<CachedToken>>,
}

impl std::fmt::Debug for AppTokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppTokenSource")
            .field("app_id", &self.app_id)
            .field("exchange_url", &self.exchange_url)
            .finish_non_exhaustive()
    }
}

impl AppTokenSource {
    /// Create a token source for an app installation on the given host.
    ///
    /// Fails if the private key is not a valid RSA PEM.
    pub fn new(
        scheme: &str,
        host: &str,
        app_id: i64,
        installation_id: i64,
        private_key_pem: &[u8],
    ) -> Result<Self, Error> {
        let key = EncodingKey::from_rsa_pem(private_key_pem)
            .map_err(|e| Error::provider(format!("invalid GitHub App private key: {e}")))?;
        let exchange_url = if host == STANDARD_GITHUB_HOST {
            format!("https://api.github.com/app/installations/{installation_id}/access_tokens")
        } else {
            format!("{scheme}://{host}/api/v3/app/installations/{installation_id}/access_tokens")
        };
        let http = reqwest::Client::builder()
            .user_agent(concat!("git-auth-proxy/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::provider(format!("could not build http client: {e}")))?;
        Ok(Self {
            app_id,
            key,
            exchange_url,
            http,
            cached: RwLock::new(None),
        })
    }

    fn app_jwt(&self) -> Result<String, Error> {
        let now = Utc::now().timestamp();
        let claims = AppClaims {
            // Backdated to tolerate clock drift against GitHub
            iat: now - 60,
            exp: now + 540,
            iss: self.app_id.to_string(),
        };
        encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|e| Error::upstream_auth(format!("could not sign app JWT: {e}")))
    }

    async fn exchange(&self) -> Result<CachedToken, Error> {
        let jwt = self.app_jwt()?;
        let response = self
            .http
            .post(&self.exchange_url)
            .bearer_auth(jwt)
            .header(ACCEPT, "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| Error::upstream_auth(format!("installation token exchange failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::upstream_auth(format!(
                "installation token exchange returned {}",
                response.status()
            )));
        }
        let body: InstallationTokenResponse = response.json().await.map_err(|e| {
            Error::upstream_auth(format!("invalid installation token response: {e}"))
        })?;
        debug!(expires_at = %body.expires_at, "obtained installation access token");
        Ok(CachedToken {
            token: body.token,
            expires_at: body.expires_at,
        })
    }
}

#[async_trait]
impl InstallationTokenSource for AppTokenSource {
    async fn token(&self) -> Result<String, Error> {
        if let Some(cached) = self.cached.read().await.as_ref() {
            if cached.is_fresh() {
                return Ok(cached.token.clone());
            }
        }
        let mut guard = self.cached.write().await;
        // Another request may have refreshed while we waited for the lock
        if let Some(cached) = guard.as_ref() {
            if cached.is_fresh() {
                return Ok(cached.token.clone());
            }
        }
        let fresh = self.exchange().await?;
        let token = fresh.token.clone();
        *guard = Some(fresh);
        Ok(token)
    }
}

/// GitHub adapter authenticating as an app installation
pub struct GitHubProvider {
    tokens: Arc<dyn InstallationTokenSource>,
}

impl GitHubProvider {
    /// Create an adapter backed by the app installation token exchange.
    pub fn new(tokens: AppTokenSource) -> Self {
        Self {
            tokens: Arc::new(tokens),
        }
    }

    /// Create an adapter with a custom token source.
    pub fn with_token_source(tokens: Arc<dyn InstallationTokenSource>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl GitProvider for GitHubProvider {
    fn path_regexes(
        &self,
        organization: &str,
        _project: Option<&str>,
        repository: &str,
    ) -> Result<Vec<Regex>, Error> {
        let patterns = [
            format!(r"(?i)/{organization}/{repository}(/.*)?\b"),
            format!(r"(?i)/api/v3/(.*)/{organization}/{repository}/(/.*)?\b"),
        ];
        patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| Error::config(format!("invalid path matcher: {e}")))
            })
            .collect()
    }

    async fn authorization_header(&self, path: &str) -> Result<String, Error> {
        let token = self.tokens.token().await?;
        if path.starts_with(API_V3_PREFIX) {
            Ok(format!("Bearer {token}"))
        } else {
            Ok(basic_auth_value("x-access-token", &token))
        }
    }

    fn target_host(&self, endpoint: &Endpoint, path: &str) -> String {
        if endpoint.host != STANDARD_GITHUB_HOST {
            return endpoint.host.clone();
        }
        if path.starts_with(API_V3_PREFIX) {
            return format!("api.{}", endpoint.host);
        }
        endpoint.host.clone()
    }

    fn target_path(&self, endpoint: &Endpoint, path: &str) -> String {
        if endpoint.host != STANDARD_GITHUB_HOST {
            return path.to_string();
        }
        path.strip_prefix("/api/v3").unwrap_or(path).to_string()
    }
}
