//! Shared test utilities.
//!
//! RSA key pairs, a small DER certificate builder, PEM armor, token signing
//! and a controllable clock. Feature-gated behind `testutil` so nothing here
//! reaches production builds:
//!
//! ```toml
//! [dev-dependencies]
//! edgegate-auth = { path = "../edgegate-auth", features = ["testutil"] }
//! ```

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rsa::RsaPrivateKey;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey as Pkcs1SigningKey;
use rsa::pkcs8::EncodePublicKey;
use rsa::signature::{SignatureEncoding, Signer};
use serde_json::{Map, Value, json};
use sha2::Sha256;

use crate::clock::Clock;
use crate::config::expected_issuer;

/// An RSA key pair with its public half encoded as SPKI DER.
pub struct TestKeypair {
    private: RsaPrivateKey,
    spki_der: Vec<u8>,
}

impl TestKeypair {
    /// Generate a fresh 2048-bit key pair. Slow; prefer [`test_keypair`].
    ///
    /// # Panics
    ///
    /// If key generation or encoding fails.
    pub fn generate() -> Self {
        let private =
            RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("generate RSA key");
        let spki_der = private
            .to_public_key()
            .to_public_key_der()
            .expect("encode SPKI")
            .as_bytes()
            .to_vec();
        Self { private, spki_der }
    }

    /// SubjectPublicKeyInfo DER of the public key.
    pub fn spki_der(&self) -> &[u8] {
        &self.spki_der
    }

    /// A v3 certificate carrying this key, PEM encoded.
    pub fn certificate_pem(&self) -> String {
        pem_armor(&CertificateBuilder::new(&self.spki_der).build())
    }

    /// RSASSA-PKCS1-v1_5 / SHA-256 signature over `message`.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        Pkcs1SigningKey::<Sha256>::new(self.private.clone())
            .sign(message)
            .to_vec()
    }

    /// Sign `claims` as an RS256 token with `kid` in the header.
    ///
    /// # Panics
    ///
    /// If encoding fails.
    pub fn sign_token(&self, kid: &str, claims: &Value) -> String {
        let der = self.private.to_pkcs1_der().expect("encode PKCS#1");
        let key = EncodingKey::from_rsa_der(der.as_bytes());
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(kid.to_string());
        jsonwebtoken::encode(&header, claims, &key).expect("sign token")
    }

    /// Sign `claims` under an arbitrary JSON `header`, for headers
    /// [`Header`] cannot express.
    ///
    /// # Panics
    ///
    /// If either value fails to serialize.
    pub fn sign_raw(&self, header: &Value, claims: &Value) -> String {
        let encode = |value: &Value| {
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(value).expect("serialize JSON"))
        };
        let signing_input = format!("{}.{}", encode(header), encode(claims));
        let signature = URL_SAFE_NO_PAD.encode(self.sign(signing_input.as_bytes()));
        format!("{signing_input}.{signature}")
    }
}

/// Process-wide key pair, generated once.
pub fn test_keypair() -> &'static TestKeypair {
    static KEYPAIR: OnceLock<TestKeypair> = OnceLock::new();
    KEYPAIR.get_or_init(TestKeypair::generate)
}

/// A second, unrelated key pair.
pub fn second_keypair() -> &'static TestKeypair {
    static KEYPAIR: OnceLock<TestKeypair> = OnceLock::new();
    KEYPAIR.get_or_init(TestKeypair::generate)
}

/// Claims that pass every check for `project_id` at time `now`.
pub fn valid_claims(project_id: &str, subject: &str, now: u64) -> Value {
    json!({
        "iss": expected_issuer(project_id),
        "aud": project_id,
        "sub": subject,
        "iat": now,
        "exp": now + 3600,
    })
}

/// Key document body mapping each `kid` to its certificate PEM.
pub fn key_document(entries: &[(&str, &TestKeypair)]) -> Value {
    let map: Map<String, Value> = entries
        .iter()
        .map(|(kid, keypair)| ((*kid).to_string(), Value::String(keypair.certificate_pem())))
        .collect();
    Value::Object(map)
}

/// PEM armor with 64-column lines.
pub fn pem_armor(der: &[u8]) -> String {
    let body = STANDARD.encode(der);
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for line in body.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

/// Builds structurally valid, unsigned X.509 certificates around an SPKI.
#[derive(Debug, Clone)]
pub struct CertificateBuilder {
    spki: Vec<u8>,
    version: bool,
    serial: Vec<u8>,
}

impl CertificateBuilder {
    /// v3 certificate with a small serial.
    pub fn new(spki: &[u8]) -> Self {
        Self {
            spki: spki.to_vec(),
            version: true,
            serial: vec![0x01, 0x23, 0x45, 0x67],
        }
    }

    /// Omit the `[0] version` field (v1 certificate).
    #[must_use]
    pub fn without_version(mut self) -> Self {
        self.version = false;
        self
    }

    /// Use `serial` as the INTEGER content.
    #[must_use]
    pub fn serial(mut self, serial: &[u8]) -> Self {
        self.serial = serial.to_vec();
        self
    }

    /// DER encoding of the certificate.
    pub fn build(&self) -> Vec<u8> {
        // sha256WithRSAEncryption, NULL parameters
        let algorithm = tlv(
            0x30,
            &[
                tlv(0x06, &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x0b]),
                tlv(0x05, &[]),
            ]
            .concat(),
        );
        let name = tlv(
            0x30,
            &tlv(
                0x31,
                &tlv(
                    0x30,
                    &[tlv(0x06, &[0x55, 0x04, 0x03]), tlv(0x0c, b"securetoken.test")].concat(),
                ),
            ),
        );
        let validity = tlv(
            0x30,
            &[tlv(0x17, b"250101000000Z"), tlv(0x17, b"350101000000Z")].concat(),
        );

        let mut tbs = Vec::new();
        if self.version {
            tbs.extend(tlv(0xa0, &tlv(0x02, &[0x02])));
        }
        tbs.extend(tlv(0x02, &self.serial));
        tbs.extend(&algorithm);
        tbs.extend(&name);
        tbs.extend(validity);
        tbs.extend(&name);
        tbs.extend(&self.spki);
        if self.version {
            // Empty extensions block.
            tbs.extend(tlv(0xa3, &tlv(0x30, &[])));
        }

        let mut signature = vec![0x00];
        signature.extend([0x5a; 256]);

        tlv(
            0x30,
            &[tlv(0x30, &tbs), algorithm, tlv(0x03, &signature)].concat(),
        )
    }
}

fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 0x80 {
        out.push(u8::try_from(len).expect("short length"));
    } else {
        let octets: Vec<u8> = len
            .to_be_bytes()
            .into_iter()
            .skip_while(|b| *b == 0)
            .collect();
        out.push(0x80 | u8::try_from(octets.len()).expect("length octets"));
        out.extend(octets);
    }
    out.extend_from_slice(content);
    out
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    /// Clock reading `now`.
    pub fn new(now: u64) -> Self {
        Self(AtomicU64::new(now))
    }

    /// Jump to `now`.
    pub fn set(&self, now: u64) {
        self.0.store(now, Ordering::SeqCst);
    }

    /// Move forward by `secs`.
    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn unix_now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}
