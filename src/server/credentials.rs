//! Client credential extraction
//!
//! Git clients send the opaque token as the basic-auth password, some
//! tooling sends it as the username, and API clients send it as a bearer
//! token. All three are accepted.

use axum::http::{header, HeaderMap};

use crate::auth::decode_base64_loose;
use crate::error::Error;

const BASIC_PREFIX: &str = "Basic ";
const BEARER_PREFIX: &str = "Bearer ";

/// Extract the opaque access token from the request headers.
pub fn token_from_headers(headers: &HeaderMap) -> Result<String, Error> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(Error::CredentialMissing)?;

    if let Some(token) = value.strip_prefix(BEARER_PREFIX) {
        if token.is_empty() {
            return Err(Error::CredentialMissing);
        }
        return Ok(token.to_string());
    }

    let encoded = value.strip_prefix(BASIC_PREFIX).ok_or(Error::CredentialMissing)?;
    let decoded = decode_base64_loose(encoded).map_err(|_| Error::CredentialMissing)?;
    let decoded = String::from_utf8(decoded).map_err(|_| Error::CredentialMissing)?;
    let (username, password) = decoded.split_once(':').ok_or(Error::CredentialMissing)?;
    if !password.is_empty() {
        return Ok(password.to_string());
    }
    if !username.is_empty() {
        return Ok(username.to_string());
    }
    Err(Error::CredentialMissing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::{STANDARD, URL_SAFE};
    use base64::Engine;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, value.parse().unwrap());
        headers
    }

    fn basic(credentials: &str) -> String {
        format!("Basic {}", STANDARD.encode(credentials))
    }

    #[test]
    fn password_wins_over_username() {
        let headers = headers_with(&basic("user:the-token"));
        assert_eq!(token_from_headers(&headers).unwrap(), "the-token");
    }

    #[test]
    fn empty_password_falls_back_to_username() {
        let headers = headers_with(&basic("the-token:"));
        assert_eq!(token_from_headers(&headers).unwrap(), "the-token");
    }

    #[test]
    fn empty_username_is_fine() {
        let headers = headers_with(&basic(":the-token"));
        assert_eq!(token_from_headers(&headers).unwrap(), "the-token");
    }

    #[test]
    fn both_components_empty_is_an_error() {
        let headers = headers_with(&basic(":"));
        assert!(matches!(
            token_from_headers(&headers),
            Err(Error::CredentialMissing)
        ));
    }

    #[test]
    fn password_may_contain_colons() {
        let headers = headers_with(&basic("user:to:ken"));
        assert_eq!(token_from_headers(&headers).unwrap(), "to:ken");
    }

    #[test]
    fn url_safe_encoding_is_accepted() {
        let encoded = URL_SAFE.encode("user:the-token");
        let headers = headers_with(&format!("Basic {encoded}"));
        assert_eq!(token_from_headers(&headers).unwrap(), "the-token");
    }

    #[test]
    fn bearer_tokens_pass_through() {
        let headers = headers_with("Bearer opaque-token");
        assert_eq!(token_from_headers(&headers).unwrap(), "opaque-token");
    }

    #[test]
    fn missing_or_malformed_headers_are_rejected() {
        assert!(matches!(
            token_from_headers(&HeaderMap::new()),
            Err(Error::CredentialMissing)
        ));
        for value in ["Digest abc", "Basic !!!not-base64!!!", "Bearer "] {
            assert!(
                matches!(token_from_headers(&headers_with(value)), Err(Error::CredentialMissing)),
                "{value:?} should be rejected"
            );
        }
    }
}
