//! Bearer credential check run before any session is created or resumed.

use std::fmt;

use axum::http::{header::AUTHORIZATION, HeaderMap};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Configured bearer credential. Neither `Debug` nor `Display` reveal it.
#[derive(Clone)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    fn digest(&self) -> [u8; 32] {
        Sha256::digest(self.0.as_bytes()).into()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential([redacted])")
    }
}

/// Parses a non-empty credential from configuration.
pub fn parse_credential(value: &str) -> Result<Credential, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("credential must not be empty".to_string());
    }
    Ok(Credential::new(value))
}

#[derive(Debug, Clone)]
pub struct AuthGate {
    expected: Option<[u8; 32]>,
}

impl AuthGate {
    pub fn new(credential: Option<&Credential>) -> Self {
        Self {
            expected: credential.map(Credential::digest),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.expected.is_some()
    }

    /// Both sides are hashed to fixed-length digests and compared without
    /// early exit, so timing does not depend on where the inputs differ or on
    /// whether anything was presented at all.
    pub fn authenticate(&self, presented: Option<&str>) -> bool {
        let Some(expected) = &self.expected else {
            return true;
        };
        let candidate: [u8; 32] = Sha256::digest(presented.unwrap_or("").as_bytes()).into();
        let matches: bool = expected[..].ct_eq(&candidate[..]).into();
        matches && presented.is_some()
    }
}

/// Extracts the credential from `Authorization: Bearer <v>`, falling back to
/// the `auth` query parameter for clients that cannot set headers.
pub fn presented_credential<'a>(
    headers: &'a HeaderMap,
    query_auth: Option<&'a str>,
) -> Option<&'a str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(strip_bearer)
        .or_else(|| query_auth.map(str::trim).filter(|v| !v.is_empty()))
}

fn strip_bearer(value: &str) -> Option<&str> {
    let value = value.trim();
    let (scheme, rest) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = rest.trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn gate(secret: &str) -> AuthGate {
        AuthGate::new(Some(&Credential::new(secret)))
    }

    #[test]
    fn test_disabled_gate_accepts_anything() {
        let gate = AuthGate::new(None);
        assert!(!gate.is_enabled());
        assert!(gate.authenticate(None));
        assert!(gate.authenticate(Some("whatever")));
    }

    #[test]
    fn test_valid_credential() {
        assert!(gate("s3cret").authenticate(Some("s3cret")));
    }

    #[test]
    fn test_invalid_or_missing_credential() {
        let gate = gate("s3cret");
        assert!(!gate.authenticate(Some("s3cret ")));
        assert!(!gate.authenticate(Some("wrong")));
        assert!(!gate.authenticate(Some("")));
        assert!(!gate.authenticate(None));
    }

    #[test]
    fn test_prefix_and_extension_rejected() {
        let gate = gate("s3cret");
        assert!(!gate.authenticate(Some("s3cre")));
        assert!(!gate.authenticate(Some("s3cret-and-more")));
        assert!(!gate.authenticate(Some("S3CRET")));
        assert!(gate.authenticate(Some("s3cret")));
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let credential = Credential::new("hunter2");
        assert!(!format!("{:?}", credential).contains("hunter2"));
        assert!(!format!("{:?}", gate("hunter2")).contains("hunter2"));
    }

    #[test]
    fn test_parse_credential_rejects_empty() {
        assert!(parse_credential("   ").is_err());
        assert!(parse_credential(" abc ").is_ok());
    }

    #[test]
    fn test_bearer_header_wins_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer  from-header "));
        assert_eq!(
            presented_credential(&headers, Some("from-query")),
            Some("from-header")
        );
    }

    #[test]
    fn test_query_fallback() {
        let headers = HeaderMap::new();
        assert_eq!(presented_credential(&headers, Some("q")), Some("q"));
        assert_eq!(presented_credential(&headers, Some("  ")), None);
        assert_eq!(presented_credential(&headers, None), None);
    }

    #[test]
    fn test_non_bearer_scheme_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(presented_credential(&headers, None), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer abc"));
        assert_eq!(presented_credential(&headers, None), Some("abc"));
    }
}
