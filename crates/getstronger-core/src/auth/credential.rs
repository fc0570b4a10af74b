use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClaimsError {
    #[error("access token is empty")]
    Empty,

    #[error("access token is not a JWT")]
    Malformed,

    #[error("access token payload is not base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("access token claims are not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("access token has no subject")]
    MissingSubject,
}

/// Claims the client cares about. The server puts the user id in `userId`.
#[derive(Debug, Deserialize)]
struct AccessTokenClaims {
    #[serde(rename = "userId")]
    user_id: Option<String>,
    sub: Option<String>,
}

/// Decode the subject identifier from a JWT without verifying its signature.
/// Verification is the server's job; the client only needs the identity.
pub fn decode_subject(token: &str) -> Result<String, ClaimsError> {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => return Err(ClaimsError::Malformed),
    };

    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('='))?;
    let claims: AccessTokenClaims = serde_json::from_slice(&bytes)?;

    claims
        .user_id
        .or(claims.sub)
        .filter(|subject| !subject.is_empty())
        .ok_or(ClaimsError::MissingSubject)
}

/// A bearer token plus the identity decoded from it.
///
/// A credential is always complete: it cannot be built from an empty token,
/// and the identity is decoded exactly once when it is created.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    subject_id: String,
}

impl Credential {
    pub fn from_access_token(token: impl Into<String>) -> Result<Self, ClaimsError> {
        let token = token.into();
        if token.is_empty() {
            return Err(ClaimsError::Empty);
        }
        let subject_id = decode_subject(&token)?;
        Ok(Self { token, subject_id })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("subject_id", &self.subject_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::token_for;

    #[test]
    fn test_decode_subject_from_user_id_claim() {
        let token = token_for("user-42");
        assert_eq!(decode_subject(&token).unwrap(), "user-42");
    }

    #[test]
    fn test_decode_subject_falls_back_to_sub() {
        let payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"abc","exp":1}"#);
        let token = format!("e30.{}.sig", payload);
        assert_eq!(decode_subject(&token).unwrap(), "abc");
    }

    #[test]
    fn test_decode_subject_errors() {
        assert!(matches!(decode_subject("only.two"), Err(ClaimsError::Malformed)));
        assert!(matches!(decode_subject("a.b.c.d"), Err(ClaimsError::Malformed)));
        assert!(matches!(decode_subject("a.!!!.c"), Err(ClaimsError::Base64(_))));

        let payload = URL_SAFE_NO_PAD.encode(br#"{"exp":1}"#);
        assert!(matches!(
            decode_subject(&format!("e30.{}.sig", payload)),
            Err(ClaimsError::MissingSubject)
        ));
    }

    #[test]
    fn test_credential_rejects_empty_token() {
        assert!(matches!(Credential::from_access_token(""), Err(ClaimsError::Empty)));
    }

    #[test]
    fn test_credential_debug_redacts_token() {
        let credential = Credential::from_access_token(token_for("u1")).unwrap();
        let debug = format!("{:?}", credential);
        assert!(debug.contains("u1"));
        assert!(!debug.contains(credential.token()));
    }
}
