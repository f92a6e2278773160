//! Locating the bearer token on an inbound request.
//!
//! Streaming transports (SSE, WebSocket upgrades from browsers) cannot set
//! headers, so the token may also arrive URL-encoded in a query parameter.

use url::form_urlencoded;

/// Where a bearer token was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// `Authorization: Bearer <token>`.
    Header,
    /// A query string parameter.
    Query,
}

/// A token and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerToken {
    /// The raw token.
    pub token: String,
    /// Where it was found.
    pub source: TokenSource,
}

/// Token from an `Authorization` header value.
pub fn bearer_from_authorization(value: &str) -> Option<&str> {
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

/// URL-decoded value of `param` in `query` (without the leading `?`).
pub fn bearer_from_query(query: &str, param: &str) -> Option<String> {
    let query = query.strip_prefix('?').unwrap_or(query);
    form_urlencoded::parse(query.as_bytes())
        .find(|(name, _)| name == param)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Find the token, preferring the header over the query parameter.
pub fn extract_bearer(
    authorization: Option<&str>,
    query: Option<&str>,
    param: &str,
) -> Option<BearerToken> {
    if let Some(token) = authorization.and_then(bearer_from_authorization) {
        return Some(BearerToken {
            token: token.to_string(),
            source: TokenSource::Header,
        });
    }

    query
        .and_then(|q| bearer_from_query(q, param))
        .map(|token| BearerToken {
            token,
            source: TokenSource::Query,
        })
}
