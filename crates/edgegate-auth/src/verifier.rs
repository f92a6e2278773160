//! Bearer token verification.
//!
//! Checks run cheapest first: structure, claims, then key lookup and the
//! signature. The first failing check decides the [`RejectReason`].

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::alphabet::URL_SAFE;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::Result;
use crate::clock::{Clock, SystemClock};
use crate::config::{VerifierConfig, expected_issuer};
use crate::keys::KeyProvider;

/// base64url, with or without padding.
const B64URL: GeneralPurpose = GeneralPurpose::new(
    &URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Why a token was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Not three non-empty base64url segments, header/payload is not a JSON
    /// object, or the payload has no `exp`.
    MalformedToken,
    /// `exp` is not in the future.
    Expired,
    /// `nbf` is in the future.
    NotYetValid,
    /// `iss` does not name the expected project.
    InvalidIssuer,
    /// `aud` is not the expected project.
    InvalidAudience,
    /// The header `kid` is not among the current signing keys.
    UnknownKey,
    /// The signature does not verify against the key.
    InvalidSignature,
    /// Neither `sub` nor `user_id` is present.
    MissingSubject,
    /// Signing keys could not be obtained.
    InternalError,
}

impl RejectReason {
    /// Stable machine-readable code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MalformedToken => "malformed_token",
            Self::Expired => "expired",
            Self::NotYetValid => "not_yet_valid",
            Self::InvalidIssuer => "invalid_issuer",
            Self::InvalidAudience => "invalid_audience",
            Self::UnknownKey => "unknown_key",
            Self::InvalidSignature => "invalid_signature",
            Self::MissingSubject => "missing_subject",
            Self::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::MalformedToken => "Invalid token format",
            Self::Expired => "Token expired",
            Self::NotYetValid => "Token not yet valid",
            Self::InvalidIssuer => "Invalid issuer",
            Self::InvalidAudience => "Invalid audience",
            Self::UnknownKey => "Invalid key ID",
            Self::InvalidSignature => "Invalid signature",
            Self::MissingSubject => "No user ID in token",
            Self::InternalError => "Token verification failed",
        };
        f.write_str(msg)
    }
}

/// Outcome of [`TokenVerifier::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationResult {
    /// The token is authentic and valid for the project.
    Authenticated {
        /// The authenticated user id.
        subject: String,
    },
    /// The token must not be honoured.
    Rejected {
        /// First check that failed.
        reason: RejectReason,
    },
}

impl VerificationResult {
    /// True for [`VerificationResult::Authenticated`].
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated { .. })
    }

    /// The subject, if authenticated.
    pub fn subject(&self) -> Option<&str> {
        match self {
            Self::Authenticated { subject } => Some(subject),
            Self::Rejected { .. } => None,
        }
    }

    /// The rejection reason, if rejected.
    pub fn reason(&self) -> Option<RejectReason> {
        match self {
            Self::Authenticated { .. } => None,
            Self::Rejected { reason } => Some(*reason),
        }
    }
}

// Fields stay untyped so that a JSON payload with a mistyped claim fails at
// the check for that claim rather than as a malformed token.
#[derive(Debug, Deserialize)]
struct TokenHeader {
    #[serde(default)]
    alg: Option<Value>,
    #[serde(default)]
    kid: Option<Value>,
}

impl TokenHeader {
    fn kid(&self) -> Option<&str> {
        self.kid.as_ref().and_then(Value::as_str)
    }

    fn alg(&self) -> Option<&str> {
        self.alg.as_ref().and_then(Value::as_str)
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    iss: Option<Value>,
    #[serde(default)]
    aud: Option<Value>,
    #[serde(default)]
    sub: Option<Value>,
    #[serde(default)]
    user_id: Option<Value>,
    #[serde(default)]
    exp: Option<Value>,
    #[serde(default)]
    nbf: Option<Value>,
}

impl Claims {
    // Tokens from this issuer carry `sub`; `user_id` is accepted for tokens
    // minted elsewhere in the same deployment. Empty or non-string values
    // count as absent.
    fn subject(&self) -> Option<&str> {
        non_empty_str(self.sub.as_ref()).or_else(|| non_empty_str(self.user_id.as_ref()))
    }

    fn iss(&self) -> Option<&str> {
        self.iss.as_ref().and_then(Value::as_str)
    }

    fn aud(&self) -> Option<&str> {
        self.aud.as_ref().and_then(Value::as_str)
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// A NumericDate claim in whole seconds.
///
/// Fractions round up: against an integral `now`, `now >= t` and
/// `now >= ceil(t)` agree, as do `now < t` and `now < ceil(t)`.
#[allow(clippy::cast_possible_truncation)]
fn numeric_date(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|secs| secs.ceil() as i64))
}

/// The three raw segments of a compact token.
struct Segments<'a> {
    header: &'a str,
    payload: &'a str,
    signature: &'a str,
    /// `header.payload` exactly as received.
    signing_input: &'a str,
}

impl<'a> Segments<'a> {
    fn split(token: &'a str) -> Option<Self> {
        let mut parts = token.split('.');
        let header = parts.next()?;
        let payload = parts.next()?;
        let signature = parts.next()?;
        if parts.next().is_some() || [header, payload, signature].iter().any(|s| s.is_empty()) {
            return None;
        }
        let signing_input = &token[..header.len() + 1 + payload.len()];
        Some(Self {
            header,
            payload,
            signature,
            signing_input,
        })
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(segment: &str) -> Option<T> {
    let bytes = B64URL.decode(segment).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Decode header and payload without verifying anything.
///
/// For diagnostics only; never base an access decision on this.
pub fn decode_unverified(token: &str) -> Option<(Value, Value)> {
    let segments = Segments::split(token)?;
    Some((
        decode_json(segments.header)?,
        decode_json(segments.payload)?,
    ))
}

/// Verifies bearer tokens against the issuer's current signing keys.
///
/// Cheap to clone; clones share the [`KeyProvider`].
#[derive(Debug, Clone)]
pub struct TokenVerifier {
    keys: Arc<KeyProvider>,
    clock: Arc<dyn Clock>,
    project_id: Option<String>,
}

impl TokenVerifier {
    /// Verifier using `keys` and the system clock.
    pub fn new(keys: Arc<KeyProvider>) -> Self {
        Self {
            keys,
            clock: Arc::new(SystemClock),
            project_id: None,
        }
    }

    /// Verifier and key provider built from `config`, sharing `clock`.
    ///
    /// # Errors
    ///
    /// Any error from [`VerifierConfig::validate`] or [`KeyProvider::with_clock`].
    pub fn from_config_with_clock(config: &VerifierConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let keys = Arc::new(KeyProvider::with_clock(config, Arc::clone(&clock))?);
        Ok(Self {
            keys,
            clock,
            project_id: Some(config.project_id.clone()),
        })
    }

    /// Verifier and key provider built from `config`.
    ///
    /// # Errors
    ///
    /// See [`TokenVerifier::from_config_with_clock`].
    pub fn from_config(config: &VerifierConfig) -> Result<Self> {
        Self::from_config_with_clock(config, Arc::new(SystemClock))
    }

    /// Read time for claim checks from `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Project used by [`TokenVerifier::verify_configured`].
    #[must_use]
    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// The shared key provider.
    pub fn key_provider(&self) -> &Arc<KeyProvider> {
        &self.keys
    }

    /// Verify `token` for the configured project.
    pub async fn verify_configured(&self, token: &str) -> VerificationResult {
        match self.project_id.as_deref() {
            Some(project_id) => self.verify(token, project_id).await,
            None => {
                warn!("verify_configured called without a project id");
                reject(RejectReason::InternalError)
            }
        }
    }

    /// Verify `token` for `project_id`.
    ///
    /// Never fails: every problem, including key fetch errors, becomes a
    /// [`VerificationResult::Rejected`].
    pub async fn verify(&self, token: &str, project_id: &str) -> VerificationResult {
        let Some(segments) = Segments::split(token) else {
            return reject(RejectReason::MalformedToken);
        };
        let Some(header) = decode_json::<TokenHeader>(segments.header) else {
            return reject(RejectReason::MalformedToken);
        };
        let Some(claims) = decode_json::<Claims>(segments.payload) else {
            return reject(RejectReason::MalformedToken);
        };
        debug!(
            alg = header.alg().unwrap_or(""),
            kid = header.kid().unwrap_or(""),
            subject = claims.subject().unwrap_or(""),
            "decoded token"
        );

        let now = i64::try_from(self.clock.unix_now()).unwrap_or(i64::MAX);
        let Some(exp) = claims.exp.as_ref() else {
            return reject(RejectReason::MalformedToken);
        };
        if numeric_date(exp).is_none_or(|exp| now >= exp) {
            return reject(RejectReason::Expired);
        }
        if claims
            .nbf
            .as_ref()
            .is_some_and(|nbf| numeric_date(nbf).is_none_or(|nbf| now < nbf))
        {
            return reject(RejectReason::NotYetValid);
        }
        if claims.iss() != Some(expected_issuer(project_id).as_str()) {
            return reject(RejectReason::InvalidIssuer);
        }
        if claims.aud() != Some(project_id) {
            return reject(RejectReason::InvalidAudience);
        }

        let keys = match self.keys.signing_keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "signing keys unavailable");
                return reject(RejectReason::InternalError);
            }
        };
        let Some(key) = header.kid().and_then(|kid| keys.get(kid)) else {
            debug!(
                kid = header.kid().unwrap_or(""),
                available = ?keys.kids().collect::<Vec<_>>(),
                "key id not found"
            );
            return reject(RejectReason::UnknownKey);
        };

        let Ok(signature) = B64URL.decode(segments.signature) else {
            return reject(RejectReason::InvalidSignature);
        };
        if !key.verify(segments.signing_input.as_bytes(), &signature) {
            return reject(RejectReason::InvalidSignature);
        }

        match claims.subject() {
            Some(subject) => {
                debug!(kid = key.kid(), subject, "token verified");
                VerificationResult::Authenticated {
                    subject: subject.to_string(),
                }
            }
            None => reject(RejectReason::MissingSubject),
        }
    }
}

fn reject(reason: RejectReason) -> VerificationResult {
    debug!(reason = reason.as_str(), "token rejected");
    VerificationResult::Rejected { reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encode(value: &Value) -> String {
        B64URL.encode(serde_json::to_vec(value).unwrap())
    }

    #[test]
    fn split_requires_three_non_empty_segments() {
        assert!(Segments::split("a.b.c").is_some());
        assert!(Segments::split("a.b").is_none());
        assert!(Segments::split("a.b.c.d").is_none());
        assert!(Segments::split("a..c").is_none());
        assert!(Segments::split(".b.c").is_none());
        assert!(Segments::split("a.b.").is_none());
        assert!(Segments::split("").is_none());
    }

    #[test]
    fn signing_input_is_the_raw_prefix() {
        let segments = Segments::split("aGVhZA.cGF5bG9hZA.c2ln").unwrap();
        assert_eq!(segments.signing_input, "aGVhZA.cGF5bG9hZA");
        assert_eq!(segments.signature, "c2ln");
    }

    #[test]
    fn decodes_padded_and_unpadded_segments() {
        let value: Value = decode_json("eyJhIjoxfQ").unwrap();
        assert_eq!(value, json!({"a": 1}));
        let value: Value = decode_json("eyJhIjoxfQ==").unwrap();
        assert_eq!(value, json!({"a": 1}));
        assert!(decode_json::<Value>("not*base64").is_none());
    }

    #[test]
    fn subject_falls_back_to_user_id() {
        let claims: Claims =
            serde_json::from_value(json!({"exp": 1, "user_id": "legacy"})).unwrap();
        assert_eq!(claims.subject(), Some("legacy"));

        let claims: Claims =
            serde_json::from_value(json!({"exp": 1, "sub": "", "user_id": "legacy"})).unwrap();
        assert_eq!(claims.subject(), Some("legacy"));

        let claims: Claims =
            serde_json::from_value(json!({"exp": 1, "sub": "s", "user_id": "u"})).unwrap();
        assert_eq!(claims.subject(), Some("s"));

        let claims: Claims = serde_json::from_value(json!({"exp": 1})).unwrap();
        assert_eq!(claims.subject(), None);

        let claims: Claims =
            serde_json::from_value(json!({"exp": 1, "sub": 42, "user_id": "legacy"})).unwrap();
        assert_eq!(claims.subject(), Some("legacy"));
    }

    #[test]
    fn mistyped_claims_still_decode() {
        let claims: Claims =
            serde_json::from_value(json!({"iss": 123, "aud": ["p"], "exp": "soon"})).unwrap();
        assert_eq!(claims.iss(), None);
        assert_eq!(claims.aud(), None);
        assert_eq!(claims.exp.as_ref().and_then(numeric_date), None);

        let header: TokenHeader = serde_json::from_value(json!({"alg": 1, "kid": 7})).unwrap();
        assert_eq!(header.kid(), None);
        assert_eq!(header.alg(), None);

        assert!(serde_json::from_value::<Claims>(json!(["not", "an", "object"])).is_err());
    }

    #[test]
    fn numeric_dates_round_fractions_up() {
        assert_eq!(numeric_date(&json!(1_700_000_000)), Some(1_700_000_000));
        assert_eq!(numeric_date(&json!(10.5)), Some(11));
        assert_eq!(numeric_date(&json!(10.0)), Some(10));
        assert_eq!(numeric_date(&json!(-0.5)), Some(0));
        assert_eq!(numeric_date(&json!("10")), None);
        assert_eq!(numeric_date(&json!(null)), None);
    }

    #[test]
    fn decode_unverified_returns_both_parts() {
        let token = format!(
            "{}.{}.sig",
            encode(&json!({"alg": "RS256", "kid": "k1"})),
            encode(&json!({"sub": "u"}))
        );
        let (header, payload) = decode_unverified(&token).unwrap();
        assert_eq!(header["kid"], "k1");
        assert_eq!(payload["sub"], "u");
        assert!(decode_unverified("x.y").is_none());
    }

    #[test]
    fn reason_codes_and_messages() {
        assert_eq!(RejectReason::InvalidAudience.as_str(), "invalid_audience");
        assert_eq!(RejectReason::UnknownKey.to_string(), "Invalid key ID");
        assert_eq!(
            serde_json::to_value(RejectReason::NotYetValid).unwrap(),
            json!("not_yet_valid")
        );
    }

    #[test]
    fn result_accessors() {
        let ok = VerificationResult::Authenticated {
            subject: "u".to_string(),
        };
        assert!(ok.is_authenticated());
        assert_eq!(ok.subject(), Some("u"));
        assert_eq!(ok.reason(), None);

        let no = VerificationResult::Rejected {
            reason: RejectReason::Expired,
        };
        assert!(!no.is_authenticated());
        assert_eq!(no.reason(), Some(RejectReason::Expired));
    }
}
