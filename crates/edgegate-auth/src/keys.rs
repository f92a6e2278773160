//! Signing key retrieval and caching.
//!
//! The issuer publishes every current key in a single JSON document mapping
//! `kid` to a PEM certificate. The whole document is fetched, decoded and
//! swapped in as one [`KeySet`]; readers always see a complete set.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use reqwest::header::CACHE_CONTROL;
use rsa::RsaPublicKey;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cert::{extract_spki, pem_to_der};
use crate::clock::{Clock, SystemClock};
use crate::config::{VerifierConfig, validate_fetch_timeout, validate_keys_url};
use crate::{Error, Result};

/// An imported RSA public key usable for RS256 verification.
#[derive(Clone)]
pub struct SigningKey {
    kid: String,
    key: VerifyingKey<Sha256>,
}

impl SigningKey {
    /// Import a DER SubjectPublicKeyInfo.
    ///
    /// # Errors
    ///
    /// [`Error::KeyImport`] if the bytes are not an RSA SPKI.
    pub fn from_spki_der(kid: impl Into<String>, spki: &[u8]) -> Result<Self> {
        let public =
            RsaPublicKey::from_public_key_der(spki).map_err(|e| Error::KeyImport(e.to_string()))?;
        Ok(Self {
            kid: kid.into(),
            key: VerifyingKey::new(public),
        })
    }

    /// Decode a PEM certificate and import its public key.
    ///
    /// # Errors
    ///
    /// Any error from [`pem_to_der`], [`extract_spki`] or
    /// [`SigningKey::from_spki_der`].
    pub fn from_certificate_pem(kid: impl Into<String>, pem: &str) -> Result<Self> {
        let der = pem_to_der(pem)?;
        let spki = extract_spki(&der)?;
        Self::from_spki_der(kid, spki)
    }

    /// Key id this key was published under.
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// RSASSA-PKCS1-v1_5 / SHA-256 verification of `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::try_from(signature) else {
            return false;
        };
        self.key.verify(message, &signature).is_ok()
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey").field("kid", &self.kid).finish()
    }
}

/// One published generation of signing keys.
#[derive(Debug, Clone, Default)]
pub struct KeySet {
    keys: BTreeMap<String, Arc<SigningKey>>,
    expires_at: u64,
}

impl KeySet {
    /// Build a set from `(kid, pem)` pairs, expiring at `expires_at` (Unix seconds).
    ///
    /// Entries that fail to decode are logged and left out, so their `kid`
    /// resolves to nothing.
    ///
    /// # Errors
    ///
    /// [`Error::NoUsableKeys`] when no entry could be imported.
    pub fn from_document<I>(document: I, expires_at: u64) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut keys = BTreeMap::new();
        for (kid, pem) in document {
            match SigningKey::from_certificate_pem(kid.clone(), &pem) {
                Ok(key) => {
                    keys.insert(kid, Arc::new(key));
                }
                Err(e) => warn!(kid = %kid, error = %e, "skipping unusable signing key"),
            }
        }

        if keys.is_empty() {
            return Err(Error::NoUsableKeys);
        }
        Ok(Self { keys, expires_at })
    }

    /// Key published under `kid`.
    pub fn get(&self, kid: &str) -> Option<&Arc<SigningKey>> {
        self.keys.get(kid)
    }

    /// Key ids in the set, sorted.
    pub fn kids(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    /// Number of usable keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True if the set holds no keys.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Expiry as Unix seconds.
    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    /// True while `now` is strictly before the expiry.
    pub fn is_fresh(&self, now: u64) -> bool {
        now < self.expires_at
    }
}

/// Fetches and caches the issuer's signing keys.
///
/// Construct one per process and share it behind an [`Arc`]. Reads are
/// lock-free; concurrent refreshes are collapsed into a single fetch.
#[derive(Debug)]
pub struct KeyProvider {
    keys_url: String,
    default_ttl_secs: u64,
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
    current: ArcSwapOption<KeySet>,
    refresh_lock: Mutex<()>,
}

impl KeyProvider {
    /// Provider for `config.keys_url` using the system clock.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an unacceptable URL or a zero fetch timeout,
    /// [`Error::Reqwest`] if the HTTP client cannot be built.
    pub fn new(config: &VerifierConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Provider reading time from `clock`.
    ///
    /// # Errors
    ///
    /// See [`KeyProvider::new`].
    pub fn with_clock(config: &VerifierConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        validate_keys_url(&config.keys_url)?;
        validate_fetch_timeout(config.fetch_timeout_secs)?;
        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout())
            .build()?;

        Ok(Self {
            keys_url: config.keys_url.clone(),
            default_ttl_secs: config.default_key_ttl_secs,
            client,
            clock,
            current: ArcSwapOption::empty(),
            refresh_lock: Mutex::new(()),
        })
    }

    /// URL the key document is fetched from.
    pub fn keys_url(&self) -> &str {
        &self.keys_url
    }

    /// The current snapshot, fresh or not, without any I/O.
    pub fn cached(&self) -> Option<Arc<KeySet>> {
        self.current.load_full()
    }

    /// Current signing keys, fetching them if the cache is empty or expired.
    ///
    /// An expired set is never returned; if the refetch fails the error is
    /// returned instead.
    ///
    /// # Errors
    ///
    /// Transport failures, [`Error::KeyFetch`] on a non-success status,
    /// [`Error::Json`] for an unparsable document and
    /// [`Error::NoUsableKeys`] when nothing in it could be imported.
    pub async fn signing_keys(&self) -> Result<Arc<KeySet>> {
        if let Some(set) = self.fresh_snapshot() {
            debug!(keys = set.len(), "using cached signing keys");
            return Ok(set);
        }

        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited.
        if let Some(set) = self.fresh_snapshot() {
            return Ok(set);
        }
        self.fetch_and_store().await
    }

    /// Fetch the key document now, regardless of cache state.
    ///
    /// # Errors
    ///
    /// See [`KeyProvider::signing_keys`].
    pub async fn refresh(&self) -> Result<Arc<KeySet>> {
        let _guard = self.refresh_lock.lock().await;
        self.fetch_and_store().await
    }

    fn fresh_snapshot(&self) -> Option<Arc<KeySet>> {
        let now = self.clock.unix_now();
        self.current.load_full().filter(|set| set.is_fresh(now))
    }

    async fn fetch_and_store(&self) -> Result<Arc<KeySet>> {
        let set = Arc::new(self.fetch().await?);
        self.current.store(Some(Arc::clone(&set)));
        Ok(set)
    }

    async fn fetch(&self) -> Result<KeySet> {
        info!(url = %self.keys_url, "fetching signing keys");

        let resp = self.client.get(&self.keys_url).send().await?;
        if !resp.status().is_success() {
            warn!(url = %self.keys_url, status = %resp.status(), "signing key fetch failed");
            return Err(Error::KeyFetch(format!(
                "{} returned {}",
                self.keys_url,
                resp.status()
            )));
        }

        let max_age = resp
            .headers()
            .get(CACHE_CONTROL)
            .and_then(|h| h.to_str().ok())
            .and_then(parse_cache_control_max_age);
        let ttl = max_age.unwrap_or(self.default_ttl_secs);
        let fetched_at = self.clock.unix_now();

        let text = resp.text().await?;
        let document: HashMap<String, String> = serde_json::from_str(&text)?;
        let set = KeySet::from_document(document, fetched_at.saturating_add(ttl))?;

        info!(
            keys = set.len(),
            max_age_secs = ?max_age,
            ttl_secs = ttl,
            "signing keys refreshed"
        );
        Ok(set)
    }
}

/// Extract the `max-age` directive from a `Cache-Control` value.
pub fn parse_cache_control_max_age(cc: &str) -> Option<u64> {
    cc.split(',').find_map(|part| {
        let (name, value) = part.trim().split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("max-age") {
            return None;
        }
        value.trim().trim_matches('"').parse().ok()
    })
}
