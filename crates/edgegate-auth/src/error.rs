//! Error types.

use thiserror::Error;

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while obtaining or decoding signing keys.
///
/// Token verification itself never surfaces these; see
/// [`VerificationResult`](crate::VerificationResult).
#[derive(Debug, Error)]
pub enum Error {
    /// The DER certificate is missing an expected structural element.
    #[error("malformed certificate: {0}")]
    MalformedCertificate(String),

    /// The PEM text could not be turned into DER bytes.
    #[error("invalid PEM: {0}")]
    InvalidPem(String),

    /// The extracted public key could not be imported as an RSA key.
    #[error("key import failed: {0}")]
    KeyImport(String),

    /// The key endpoint answered with a non-success status.
    #[error("key fetch failed: {0}")]
    KeyFetch(String),

    /// The key document contained no importable key.
    #[error("no usable signing keys in key document")]
    NoUsableKeys,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An error occurred while performing HTTP requests.
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    /// JSON parsing error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
