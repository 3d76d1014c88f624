//! Best-effort connection identity.
//!
//! Telemetry is readable anonymously; a verified principal only narrows
//! which addressed notifications a connection receives.

use std::collections::HashMap;

use serde::Serialize;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Principal {
    pub user_id: String,
}

impl Principal {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

/// Resolves a bearer token to a principal. Never fails: anything it cannot
/// verify is simply anonymous.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Option<Principal>;
}

/// Every connection is anonymous.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAnonymous;

impl TokenVerifier for AllowAnonymous {
    fn verify(&self, _token: &str) -> Option<Principal> {
        None
    }
}

/// Fixed token table. Only SHA-256 digests of the tokens are kept.
#[derive(Debug, Default, Clone)]
pub struct StaticTokenVerifier {
    digests: HashMap<[u8; 32], String>,
}

impl StaticTokenVerifier {
    pub fn new<I, U, T>(entries: I) -> Self
    where
        I: IntoIterator<Item = (U, T)>,
        U: Into<String>,
        T: AsRef<str>,
    {
        let digests = entries
            .into_iter()
            .map(|(user, token)| (digest(token.as_ref()), user.into()))
            .collect();
        Self { digests }
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Option<Principal> {
        if token.is_empty() {
            return None;
        }
        self.digests.get(&digest(token)).map(Principal::new)
    }
}

fn digest(token: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(token.as_bytes()));
    out
}

/// Token from `?token=` or, failing that, an `Authorization: Bearer` header.
pub fn extract_token(query: Option<&str>, authorization: Option<&str>) -> Option<String> {
    if let Some(token) = query.map(str::trim).filter(|t| !t.is_empty()) {
        return Some(token.to_string());
    }
    let header = authorization?.trim();
    let (scheme, token) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_verifier_matches_known_tokens_only() {
        let verifier = StaticTokenVerifier::new([("alice", "s3cret"), ("bob", "hunter2")]);
        assert_eq!(verifier.len(), 2);
        assert_eq!(verifier.verify("s3cret"), Some(Principal::new("alice")));
        assert_eq!(verifier.verify("hunter2"), Some(Principal::new("bob")));
        assert_eq!(verifier.verify("nope"), None);
        assert_eq!(verifier.verify(""), None);
        assert_eq!(AllowAnonymous.verify("s3cret"), None);
    }

    #[test]
    fn token_extraction_prefers_query() {
        assert_eq!(
            extract_token(Some("q"), Some("Bearer h")),
            Some("q".to_string())
        );
        assert_eq!(extract_token(None, Some("bearer  h ")), Some("h".to_string()));
        assert_eq!(extract_token(Some(""), Some("Bearer h")), Some("h".to_string()));
        assert_eq!(extract_token(None, Some("Basic abc")), None);
        assert_eq!(extract_token(None, Some("Bearer")), None);
        assert_eq!(extract_token(None, None), None);
    }
}
