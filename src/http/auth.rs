//! HTTP authentication challenge handling.
//!
//! Servers that answer a transfer with `401 Unauthorized` include a
//! `WWW-Authenticate` header naming the scheme and realm. The transfer
//! engine parses the challenge and asks a [`CredentialStore`] for a
//! matching `Authorization` header value, bounded by
//! `EngineConfig::max_auth_attempts` rounds per transfer.

use async_trait::async_trait;

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    /// Authentication scheme, e.g. `Basic` or `Digest`.
    pub scheme: String,
    /// Protection space the server advertised. Empty when absent.
    pub realm: String,
}

/// Parses the first challenge out of a `WWW-Authenticate` header value.
///
/// Accepts the common `Scheme realm="name"` shape and tolerates unquoted
/// realms and missing realm parameters. Returns `None` for an empty or
/// unparseable value.
pub fn parse_www_authenticate(value: &str) -> Option<AuthChallenge> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let (scheme, params) = match value.split_once(char::is_whitespace) {
        Some((s, rest)) => (s, rest.trim()),
        None => (value, ""),
    };
    if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return None;
    }

    let mut realm = String::new();
    for part in params.split(',') {
        let part = part.trim();
        if let Some(rest) = part
            .strip_prefix("realm=")
            .or_else(|| part.strip_prefix("Realm="))
        {
            realm = rest.trim_matches('"').to_string();
            break;
        }
    }

    Some(AuthChallenge {
        scheme: scheme.to_string(),
        realm,
    })
}

/// Source of stored HTTP credentials.
///
/// Implemented by the frontend side of the daemon. `find_http_auth`
/// returns a complete `Authorization` header value (for example
/// `Basic dXNlcjpwYXNz`) or `None` when no stored credential matches
/// the challenge.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_http_auth(
        &self,
        url: &str,
        scheme: &str,
        realm: &str,
    ) -> Option<String>;
}

/// A store holding no credentials. Every challenge fails immediately.
pub struct NoCredentials;

#[async_trait]
impl CredentialStore for NoCredentials {
    async fn find_http_auth(&self, _url: &str, _scheme: &str, _realm: &str) -> Option<String> {
        None
    }
}
