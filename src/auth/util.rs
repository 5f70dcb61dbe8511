//! Small helpers shared by the authorization code

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;

use crate::error::Error;

/// Number of random bytes in a generated access token
const TOKEN_LENGTH: usize = 64;

/// Generate a cryptographically secure random token string.
///
/// 64 random bytes, URL-safe base64 without padding.
pub(crate) fn random_secure_token() -> Result<String, Error> {
    let mut raw = [0u8; TOKEN_LENGTH];
    aws_lc_rs::rand::fill(&mut raw)
        .map_err(|_| Error::internal("random token generation failed"))?;
    Ok(URL_SAFE_NO_PAD.encode(raw))
}

/// Decode base64 input regardless of alphabet and padding.
///
/// Git clients encode basic-auth credentials with the standard alphabet
/// while some tooling (and older configuration files) use the URL-safe
/// one, padded or not. Accept all four.
pub(crate) fn decode_base64_loose(input: &str) -> Result<Vec<u8>, Error> {
    let input = input.trim();
    for engine in [&STANDARD, &URL_SAFE] {
        if let Ok(decoded) = engine.decode(input) {
            return Ok(decoded);
        }
    }
    for engine in [&STANDARD_NO_PAD, &URL_SAFE_NO_PAD] {
        if let Ok(decoded) = engine.decode(input) {
            return Ok(decoded);
        }
    }
    Err(Error::internal("input is not valid base64"))
}
