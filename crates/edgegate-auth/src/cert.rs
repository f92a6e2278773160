//! Public key extraction from X.509 certificates.
//!
//! ```text
//! Certificate ::= SEQUENCE {
//!     tbsCertificate      SEQUENCE {
//!         version         [0] EXPLICIT INTEGER OPTIONAL,
//!         serialNumber    INTEGER,
//!         signature       AlgorithmIdentifier,
//!         issuer          Name,
//!         validity        Validity,
//!         subject         Name,
//!         subjectPublicKeyInfo SubjectPublicKeyInfo,   <- returned
//!         ...
//!     },
//!     signatureAlgorithm  AlgorithmIdentifier,
//!     signatureValue      BIT STRING,
//! }
//! ```
//!
//! Nothing here validates the certificate itself. The issuer is pinned by the
//! key document URL, so the certificate is only a container for the key.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::asn1::{Cursor, TAG_CONTEXT_0, TAG_INTEGER};
use crate::{Error, Result};

const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_END: &str = "-----END CERTIFICATE-----";

/// The fields between `serialNumber` and `subjectPublicKeyInfo`.
const SKIPPED_SEQUENCES: [&str; 4] = ["signature", "issuer", "validity", "subject"];

/// Return the full DER encoding of the certificate's SubjectPublicKeyInfo.
///
/// The returned slice borrows from `cert_der` and can be imported directly as
/// an SPKI public key.
///
/// # Errors
///
/// [`Error::MalformedCertificate`] when any expected element is missing or
/// truncated.
pub fn extract_spki(cert_der: &[u8]) -> Result<&[u8]> {
    let mut cursor = Cursor::new(cert_der);

    cursor
        .enter_sequence()
        .ok_or_else(|| malformed("missing certificate sequence"))?;
    // From here on the cursor cannot read past the end of tbsCertificate.
    cursor
        .enter_sequence()
        .ok_or_else(|| malformed("missing tbsCertificate sequence"))?;

    // Version is optional; detect it by tag so v1 certificates stay aligned.
    cursor
        .skip_if(TAG_CONTEXT_0)
        .ok_or_else(|| malformed("truncated version"))?;
    match cursor.skip_if(TAG_INTEGER) {
        Some(true) => {}
        Some(false) => return Err(malformed("missing serialNumber")),
        None => return Err(malformed("truncated serialNumber")),
    }

    for field in SKIPPED_SEQUENCES {
        cursor
            .skip_sequence()
            .ok_or_else(|| malformed(&format!("missing {field} sequence")))?;
    }

    let spki = cursor
        .skip_sequence()
        .ok_or_else(|| malformed("missing subjectPublicKeyInfo sequence"))?;
    Ok(spki.encoded(cursor.buf()))
}

/// Strip PEM armor and whitespace and base64-decode the certificate body.
///
/// Text without armor is treated as a bare base64 body.
///
/// # Errors
///
/// [`Error::InvalidPem`] when the body is empty or not valid base64.
pub fn pem_to_der(pem: &str) -> Result<Vec<u8>> {
    let body: String = pem
        .replace(PEM_BEGIN, "")
        .replace(PEM_END, "")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    if body.is_empty() {
        return Err(Error::InvalidPem("empty certificate body".to_string()));
    }

    STANDARD
        .decode(body.as_bytes())
        .map_err(|e| Error::InvalidPem(format!("invalid base64: {e}")))
}

fn malformed(what: &str) -> Error {
    Error::MalformedCertificate(what.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{CertificateBuilder, pem_armor, test_keypair};

    #[test]
    fn extracts_spki_from_v3_certificate() {
        let keypair = test_keypair();
        let cert = CertificateBuilder::new(keypair.spki_der()).build();
        assert_eq!(extract_spki(&cert).unwrap(), keypair.spki_der());
    }

    #[test]
    fn version_field_does_not_shift_alignment() {
        let keypair = test_keypair();
        let with_version = CertificateBuilder::new(keypair.spki_der()).build();
        let without_version = CertificateBuilder::new(keypair.spki_der())
            .without_version()
            .build();
        assert_ne!(with_version, without_version);
        assert_eq!(
            extract_spki(&with_version).unwrap(),
            extract_spki(&without_version).unwrap()
        );
    }

    #[test]
    fn serial_containing_sequence_tag_is_skipped_by_length() {
        let keypair = test_keypair();
        let cert = CertificateBuilder::new(keypair.spki_der())
            .serial(&[0x30, 0x82, 0x30, 0x30])
            .build();
        assert_eq!(extract_spki(&cert).unwrap(), keypair.spki_der());
    }

    #[test]
    fn missing_serial_is_malformed() {
        let cert = [0x30, 0x06, 0x30, 0x04, 0x30, 0x02, 0x05, 0x00];
        assert!(matches!(
            extract_spki(&cert),
            Err(Error::MalformedCertificate(_))
        ));
    }

    #[test]
    fn missing_spki_is_malformed() {
        // tbsCertificate with serial and four sequences but no key.
        let cert = [
            0x30, 0x0f, 0x30, 0x0d, 0x02, 0x01, 0x01, 0x30, 0x00, 0x30, 0x00, 0x30, 0x00, 0x30,
            0x00, 0x05, 0x00,
        ];
        let err = extract_spki(&cert).unwrap_err();
        assert!(err.to_string().contains("subjectPublicKeyInfo"), "{err}");
    }

    #[test]
    fn spki_is_never_taken_from_outside_tbs_certificate() {
        // tbsCertificate ends after subject; signatureAlgorithm and
        // signatureValue follow it in the outer sequence.
        let cert = [
            0x30, 0x14, // Certificate
            0x30, 0x0b, 0x02, 0x01, 0x01, 0x30, 0x00, 0x30, 0x00, 0x30, 0x00, 0x30, 0x00,
            0x30, 0x02, 0x05, 0x00, // signatureAlgorithm
            0x03, 0x01, 0x00, // signatureValue
        ];
        let err = extract_spki(&cert).unwrap_err();
        assert!(matches!(err, Error::MalformedCertificate(_)), "{err}");
        assert!(err.to_string().contains("subjectPublicKeyInfo"), "{err}");
    }

    #[test]
    fn empty_and_garbage_inputs_are_malformed() {
        assert!(extract_spki(&[]).is_err());
        assert!(extract_spki(&[0x02, 0x01, 0x00]).is_err());
        assert!(extract_spki(&[0x30, 0x82, 0xff, 0xff]).is_err());
    }

    #[test]
    fn pem_round_trips_through_armor_and_line_breaks() {
        let keypair = test_keypair();
        let cert = CertificateBuilder::new(keypair.spki_der()).build();
        let pem = pem_armor(&cert);
        assert!(pem.contains('\n'));
        assert_eq!(pem_to_der(&pem).unwrap(), cert);
        assert_eq!(pem_to_der(&pem.replace('\n', "\r\n")).unwrap(), cert);
    }

    #[test]
    fn pem_rejects_empty_and_non_base64() {
        assert!(matches!(
            pem_to_der(&format!("{PEM_BEGIN}\n{PEM_END}")),
            Err(Error::InvalidPem(_))
        ));
        assert!(matches!(
            pem_to_der(&format!("{PEM_BEGIN}\n!!!!\n{PEM_END}")),
            Err(Error::InvalidPem(_))
        ));
    }
}
