//! Certificate normalization and optional inspection.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::Serialize;

pub const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
pub const PEM_END: &str = "-----END CERTIFICATE-----";
const PEM_LINE_WIDTH: usize = 64;

/// The signing certificate in the two shapes consumers expect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificatePayload {
    /// Base64 body with all whitespace removed.
    pub base64_single: String,
    /// BEGIN marker, 64-character body lines, END marker.
    pub pem_lines: Vec<String>,
}

impl CertificatePayload {
    /// Normalize certificate text as found in a metadata document.
    pub fn from_base64(text: &str) -> Self {
        let base64_single: String = text.chars().filter(|c| !c.is_whitespace()).collect();

        let mut pem_lines = Vec::with_capacity(base64_single.len() / PEM_LINE_WIDTH + 3);
        pem_lines.push(PEM_BEGIN.to_string());
        pem_lines.extend(
            base64_single
                .as_bytes()
                .chunks(PEM_LINE_WIDTH)
                .map(|chunk| String::from_utf8_lossy(chunk).into_owned()),
        );
        pem_lines.push(PEM_END.to_string());

        Self {
            base64_single,
            pem_lines,
        }
    }

    /// PEM text with a trailing newline.
    pub fn pem(&self) -> String {
        let mut pem = self.pem_lines.join("\n");
        pem.push('\n');
        pem
    }

    /// Decoded DER bytes.
    pub fn der(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.base64_single)
    }
}

/// Subject, thumbprint and validity of a decoded certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateDetails {
    pub subject: String,
    /// Uppercase hex SHA-1 of the DER encoding.
    pub thumbprint_sha1: String,
    pub not_after: String,
    pub expired: bool,
}

/// Decode the payload and read its subject, thumbprint and expiry.
#[cfg(feature = "cert-inspect")]
pub fn inspect(payload: &CertificatePayload) -> Result<CertificateDetails, String> {
    use openssl::{asn1::Asn1Time, hash::MessageDigest, x509::X509};

    let der = payload
        .der()
        .map_err(|e| format!("certificate is not valid base64: {e}"))?;
    let cert = X509::from_der(&der).map_err(|e| format!("certificate is not valid DER: {e}"))?;

    let subject = cert
        .subject_name()
        .entries()
        .map(|entry| {
            let key = entry.object().nid().short_name().unwrap_or("?");
            let value = entry
                .data()
                .as_utf8()
                .map(|v| v.to_string())
                .unwrap_or_default();
            format!("{key}={value}")
        })
        .collect::<Vec<_>>()
        .join(", ");

    let thumbprint_sha1 = cert
        .digest(MessageDigest::sha1())
        .map_err(|e| format!("failed to hash certificate: {e}"))?
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect();

    let now = Asn1Time::days_from_now(0).map_err(|e| format!("failed to read clock: {e}"))?;
    let expired = cert.not_after() < &*now;

    Ok(CertificateDetails {
        subject,
        thumbprint_sha1,
        not_after: cert.not_after().to_string(),
        expired,
    })
}
