//! edgegate-auth
//!
//! Bearer token verification for the edge proxy. Given a compact RS256 token
//! and the expected project id it decides, without a round trip to the
//! identity provider per request, whether the token is authentic, current and
//! meant for this project, and returns the subject it authorizes.
//!
//! - **Certificate key extraction**: a tolerant DER walk that pulls the
//!   SubjectPublicKeyInfo out of the issuer's X.509 certificates
//! - **Key provider**: fetches the published `kid` -> certificate document and
//!   caches it for the `max-age` the issuer advertises
//! - **Token verifier**: claim checks, key lookup by `kid` and RSA PKCS#1 v1.5
//!   signature verification, folded into a [`VerificationResult`]
//!
//! ## Quick start
//! ```no_run
//! use edgegate_auth::{TokenVerifier, VerificationResult, VerifierConfig};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let verifier = TokenVerifier::from_config(&VerifierConfig::for_project("my-project"))?;
//!
//! match verifier.verify("eyJ...", "my-project").await {
//!     VerificationResult::Authenticated { subject } => println!("sub={subject}"),
//!     VerificationResult::Rejected { reason } => println!("401: {reason}"),
//! }
//! # Ok(()) }
//! ```

#![forbid(unsafe_code)]

pub mod asn1;
mod bearer;
pub mod cert;
mod clock;
mod config;
mod error;
mod keys;
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
mod verifier;

pub use bearer::{
    BearerToken, TokenSource, bearer_from_authorization, bearer_from_query, extract_bearer,
};
pub use cert::{extract_spki, pem_to_der};
pub use clock::{Clock, SystemClock};
pub use config::{
    DEFAULT_KEYS_URL, ENV_FETCH_TIMEOUT, ENV_KEYS_URL, ENV_PROJECT_ID, ISSUER_PREFIX,
    VerifierConfig, expected_issuer,
};
pub use error::{Error, Result};
pub use keys::{KeyProvider, KeySet, SigningKey, parse_cache_control_max_age};
pub use verifier::{RejectReason, TokenVerifier, VerificationResult, decode_unverified};
