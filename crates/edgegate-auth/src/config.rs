//! Verifier configuration.

use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::bearer::{BearerToken, extract_bearer};
use crate::{Error, Result};

/// Where the issuer publishes its current signing certificates.
pub const DEFAULT_KEYS_URL: &str =
    "https://www.googleapis.com/robot/v1/metadata/x509/securetoken@system.gserviceaccount.com";

/// Prefix of the expected `iss` claim; the project id is appended.
pub const ISSUER_PREFIX: &str = "https://securetoken.google.com/";

/// Environment variable holding the project id.
pub const ENV_PROJECT_ID: &str = "FIREBASE_PROJECT_ID";
/// Environment variable overriding the key document URL.
pub const ENV_KEYS_URL: &str = "EDGEGATE_KEYS_URL";
/// Environment variable overriding the fetch timeout (seconds).
pub const ENV_FETCH_TIMEOUT: &str = "EDGEGATE_FETCH_TIMEOUT_SECS";

/// Settings shared by the key provider and the token verifier.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Expected project id. Tokens must carry it as `aud` and as the suffix of `iss`.
    pub project_id: String,

    /// URL of the key document (`kid` -> PEM certificate).
    pub keys_url: String,

    /// Timeout for a single key document fetch.
    pub fetch_timeout_secs: u64,

    /// Cache lifetime used when the response carries no `max-age`.
    pub default_key_ttl_secs: u64,

    /// Query parameter that may carry the token when headers are unavailable.
    pub query_param: String,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            keys_url: DEFAULT_KEYS_URL.to_string(),
            fetch_timeout_secs: 10,
            default_key_ttl_secs: 3600,
            query_param: "auth".to_string(),
        }
    }
}

impl VerifierConfig {
    /// Defaults for `project_id`.
    pub fn for_project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            ..Self::default()
        }
    }

    /// Defaults overlaid with the process environment.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    /// Parse a TOML document; missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] on invalid TOML or mistyped fields.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("invalid TOML: {e}")))
    }

    /// Overlay values from the process environment.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when a variable is set but cannot be parsed.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    /// Overlay values from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when a variable is set but cannot be parsed.
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(project_id) = lookup(ENV_PROJECT_ID) {
            self.project_id = project_id;
        }
        if let Some(keys_url) = lookup(ENV_KEYS_URL) {
            self.keys_url = keys_url;
        }
        if let Some(raw) = lookup(ENV_FETCH_TIMEOUT) {
            self.fetch_timeout_secs = raw
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("{ENV_FETCH_TIMEOUT}: {e}")))?;
        }
        Ok(self)
    }

    /// Check the settings are usable.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an empty project id, an unparsable key URL, a
    /// plain-HTTP key URL that does not point at a loopback host, or a zero
    /// fetch timeout.
    pub fn validate(&self) -> Result<()> {
        if self.project_id.trim().is_empty() {
            return Err(Error::Config("project_id must not be empty".to_string()));
        }
        validate_keys_url(&self.keys_url)?;
        validate_fetch_timeout(self.fetch_timeout_secs)
    }

    /// The `iss` value tokens for this project must carry.
    pub fn expected_issuer(&self) -> String {
        expected_issuer(&self.project_id)
    }

    /// Locate the bearer token on a request, falling back to the configured
    /// [`query_param`](Self::query_param) when the header carries none.
    pub fn extract_bearer(
        &self,
        authorization: Option<&str>,
        query: Option<&str>,
    ) -> Option<BearerToken> {
        extract_bearer(authorization, query, &self.query_param)
    }

    /// Fetch timeout as a [`Duration`].
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// The `iss` value tokens for `project_id` must carry.
pub fn expected_issuer(project_id: &str) -> String {
    format!("{ISSUER_PREFIX}{project_id}")
}

pub(crate) fn validate_keys_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw).map_err(|e| Error::Config(format!("invalid keys_url {raw}: {e}")))?;
    match url.scheme() {
        "https" => Ok(()),
        "http" if is_loopback(&url) => Ok(()),
        _ => Err(Error::Config(format!(
            "keys_url must use HTTPS (HTTP only allowed for loopback): {raw}"
        ))),
    }
}

pub(crate) fn validate_fetch_timeout(secs: u64) -> Result<()> {
    if secs == 0 {
        return Err(Error::Config("fetch_timeout_secs must be positive".to_string()));
    }
    Ok(())
}

fn is_loopback(url: &Url) -> bool {
    matches!(
        url.host_str(),
        Some("localhost" | "127.0.0.1" | "[::1]")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bearer::TokenSource;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let cfg = VerifierConfig::default();
        assert_eq!(cfg.keys_url, DEFAULT_KEYS_URL);
        assert_eq!(cfg.default_key_ttl_secs, 3600);
        assert_eq!(cfg.fetch_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.query_param, "auth");
        assert!(cfg.validate().is_err(), "empty project id must not validate");
    }

    #[test]
    fn issuer_is_derived_from_project() {
        let cfg = VerifierConfig::for_project("proj1");
        assert_eq!(cfg.expected_issuer(), "https://securetoken.google.com/proj1");
        cfg.validate().unwrap();
    }

    #[test]
    fn toml_keeps_defaults_for_missing_keys() {
        let cfg = VerifierConfig::from_toml_str(
            r#"
            project_id = "proj1"
            fetch_timeout_secs = 3
            "#,
        )
        .unwrap();
        assert_eq!(cfg.project_id, "proj1");
        assert_eq!(cfg.fetch_timeout_secs, 3);
        assert_eq!(cfg.keys_url, DEFAULT_KEYS_URL);

        assert!(matches!(
            VerifierConfig::from_toml_str("fetch_timeout_secs = \"soon\""),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn example_config_parses() {
        let cfg = VerifierConfig::from_toml_str(include_str!(
            "../../../docs/edgegate/edgegate.toml.example"
        ))
        .unwrap();
        assert_eq!(cfg.project_id, "my-firebase-project");
        cfg.validate().unwrap();
    }

    #[test]
    fn env_overrides() {
        let vars = HashMap::from([
            (ENV_PROJECT_ID, "from-env"),
            (ENV_KEYS_URL, "http://127.0.0.1:9999/keys"),
            (ENV_FETCH_TIMEOUT, " 7 "),
        ]);
        let cfg = VerifierConfig::default()
            .with_overrides_from(|k| vars.get(k).map(ToString::to_string))
            .unwrap();
        assert_eq!(cfg.project_id, "from-env");
        assert_eq!(cfg.keys_url, "http://127.0.0.1:9999/keys");
        assert_eq!(cfg.fetch_timeout_secs, 7);
        cfg.validate().unwrap();

        let bad = VerifierConfig::default()
            .with_overrides_from(|k| (k == ENV_FETCH_TIMEOUT).then(|| "x".to_string()));
        assert!(matches!(bad, Err(Error::Config(_))));
    }

    #[test]
    fn bearer_extraction_uses_configured_query_param() {
        let cfg = VerifierConfig {
            query_param: "token".to_string(),
            ..VerifierConfig::for_project("proj1")
        };
        let found = cfg.extract_bearer(None, Some("auth=nope&token=a.b.c")).unwrap();
        assert_eq!(found.token, "a.b.c");
        assert_eq!(found.source, TokenSource::Query);

        assert_eq!(
            VerifierConfig::default()
                .extract_bearer(None, Some("auth=x.y.z"))
                .map(|b| b.token),
            Some("x.y.z".to_string())
        );
        assert_eq!(cfg.extract_bearer(None, Some("auth=x.y.z")), None);

        let found = cfg
            .extract_bearer(Some("Bearer h.h.h"), Some("token=q.q.q"))
            .unwrap();
        assert_eq!(found.source, TokenSource::Header);
    }

    #[test]
    fn zero_fetch_timeout_is_rejected() {
        let cfg = VerifierConfig {
            fetch_timeout_secs: 0,
            ..VerifierConfig::for_project("proj1")
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn keys_url_must_be_https_unless_loopback() {
        assert!(validate_keys_url("https://example.com/keys").is_ok());
        assert!(validate_keys_url("http://localhost:8080/keys").is_ok());
        assert!(validate_keys_url("http://[::1]/keys").is_ok());
        assert!(validate_keys_url("http://example.com/keys").is_err());
        assert!(validate_keys_url("ftp://127.0.0.1/keys").is_err());
        assert!(validate_keys_url("not a url").is_err());
    }
}
