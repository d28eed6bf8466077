//! Federation metadata certificate extraction.
//!
//! Fetches the tenant's federation metadata for an application and pulls the
//! SAML signing certificate out of it. The document is fetched twice at most
//! (primary, then fallback), parsed twice at most (raw, then sanitized) and
//! searched with a cascade of structural patterns:
//!
//! 1. `X509Certificate` under a `KeyDescriptor use="signing"`
//! 2. `X509Certificate` under any `KeyDescriptor`
//! 3. any `X509Certificate`

mod certificate;
mod document;
mod fetch;

#[cfg(feature = "cert-inspect")]
pub use certificate::inspect;
pub use certificate::{CertificateDetails, CertificatePayload, PEM_BEGIN, PEM_END};
pub use document::{
    CandidateSource, CertificateCandidate, DocumentError, FederationMetadataDocument,
    METADATA_NS, XMLDSIG_NS, XmlElement,
};
pub use fetch::{FetchMethod, FetchedDocument};
use thiserror::Error;

use crate::config::FederationConfig;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CertificateError {
    #[error("Invalid metadata request: {0}")]
    InvalidRequest(String),

    /// Neither fetch produced a response.
    #[error("Failed to fetch federation metadata (primary: {primary}; fallback: {fallback})")]
    Transport { primary: String, fallback: String },

    /// The endpoint answered with a sign-in or error page instead of XML.
    #[error(
        "Federation metadata endpoint returned an HTML page (status {status}, content type {}); check that the application exists and the session may read it",
        .content_type.as_deref().unwrap_or("unknown")
    )]
    AuthzSuspected {
        status: u16,
        content_type: Option<String>,
    },

    /// The endpoint answered with something that is not markup at all.
    #[error(
        "Federation metadata endpoint returned a non-XML response (status {status}, content type {})",
        .content_type.as_deref().unwrap_or("unknown")
    )]
    UnexpectedShape {
        status: u16,
        content_type: Option<String>,
    },

    #[error("Federation metadata is not well-formed XML: {0}")]
    MalformedDocument(String),

    #[error("Federation metadata contains no X509Certificate")]
    NoCertificateFound,
}

impl CertificateError {
    /// Instruction for obtaining the certificate by hand.
    pub fn remediation(&self) -> &'static str {
        match self {
            CertificateError::AuthzSuspected { .. } => {
                "Download the Federation Metadata XML from the application's Single sign-on blade after confirming the signed-in account can read it, then set SAML_CERT manually"
            }
            CertificateError::UnexpectedShape { .. } => {
                "Retry once the metadata endpoint recovers, or download the Base64 certificate from the application's Single sign-on blade and set SAML_CERT manually"
            }
            CertificateError::NoCertificateFound => {
                "Confirm a token-signing certificate is active on the application, then download the Base64 certificate from the Single sign-on blade and set SAML_CERT manually"
            }
            _ => {
                "Download the Base64 certificate from the application's Single sign-on blade and set SAML_CERT manually"
            }
        }
    }
}

/// Fetches federation metadata and extracts the signing certificate.
pub struct MetadataCertificateExtractor {
    config: FederationConfig,
    primary: reqwest::Client,
    fallback: reqwest::Client,
}

impl MetadataCertificateExtractor {
    pub fn new(config: &FederationConfig) -> Result<Self, CertificateError> {
        let build_error = |e: reqwest::Error| {
            CertificateError::InvalidRequest(format!("failed to build HTTP client: {e}"))
        };
        Ok(Self {
            config: config.clone(),
            primary: fetch::build_primary_client(config).map_err(build_error)?,
            fallback: fetch::build_fallback_client(config).map_err(build_error)?,
        })
    }

    /// `<issuer>/<tenant>/federationmetadata/2007-06/federationmetadata.xml?appid=<client>`
    pub fn metadata_url(&self, tenant_id: &str, client_id: &str) -> Result<String, CertificateError> {
        if tenant_id.trim().is_empty() || client_id.trim().is_empty() {
            return Err(CertificateError::InvalidRequest(
                "tenant id and client id are required".into(),
            ));
        }

        let raw = format!(
            "{}/{}/federationmetadata/2007-06/federationmetadata.xml",
            self.config.issuer_url.trim_end_matches('/'),
            tenant_id
        );
        let mut url = url::Url::parse(&raw)
            .map_err(|e| CertificateError::InvalidRequest(format!("invalid metadata URL '{raw}': {e}")))?;
        url.query_pairs_mut().append_pair("appid", client_id);
        Ok(url.into())
    }

    pub async fn extract_certificate(
        &self,
        tenant_id: &str,
        client_id: &str,
    ) -> Result<CertificatePayload, CertificateError> {
        let url = self.metadata_url(tenant_id, client_id)?;
        let fetched = self.fetch(&url).await?;

        let document = match FederationMetadataDocument::parse(&fetched.body) {
            Ok(document) => document,
            Err(DocumentError::Html) => {
                return Err(CertificateError::AuthzSuspected {
                    status: fetched.status,
                    content_type: fetched.content_type,
                });
            }
            Err(DocumentError::NotXml | DocumentError::Malformed(_))
                if matches!(fetched.status, 401 | 403) =>
            {
                return Err(CertificateError::AuthzSuspected {
                    status: fetched.status,
                    content_type: fetched.content_type,
                });
            }
            Err(DocumentError::NotXml) => {
                return Err(CertificateError::UnexpectedShape {
                    status: fetched.status,
                    content_type: fetched.content_type,
                });
            }
            Err(DocumentError::Malformed(reason)) => {
                return Err(CertificateError::MalformedDocument(reason));
            }
        };

        let candidate = document
            .best_candidate()
            .ok_or(CertificateError::NoCertificateFound)?;
        let payload = CertificatePayload::from_base64(&candidate.value);

        tracing::info!(
            via = fetched.method.as_str(),
            source = ?candidate.source,
            candidates = document.candidates.len(),
            length = payload.base64_single.len(),
            "Extracted signing certificate from federation metadata"
        );
        Ok(payload)
    }

    /// Primary fetch, then the fallback when the primary fails or returns
    /// something that is not XML. The fallback's response wins when it has
    /// one; otherwise the primary's response is kept for classification.
    async fn fetch(&self, url: &str) -> Result<FetchedDocument, CertificateError> {
        let primary = fetch::fetch_primary(&self.primary, url, &self.config.user_agent).await;

        let primary_outcome = match primary {
            Ok(document) if document.is_usable() => return Ok(document),
            Ok(document) => {
                tracing::warn!(
                    status = document.status,
                    content_type = document.content_type.as_deref().unwrap_or("none"),
                    "Federation metadata response is not XML, retrying with fallback client"
                );
                Ok(document)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Federation metadata fetch failed, retrying with fallback client");
                Err(e.to_string())
            }
        };

        match fetch::fetch_fallback(&self.fallback, url).await {
            Ok(document) => Ok(document),
            Err(fallback) => match primary_outcome {
                Ok(document) => {
                    tracing::warn!(error = %fallback, "Fallback fetch failed, using primary response");
                    Ok(document)
                }
                Err(primary) => Err(CertificateError::Transport {
                    primary,
                    fallback: fallback.to_string(),
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{header, method, path, query_param},
    };

    use super::*;

    const TENANT: &str = "11111111-1111-1111-1111-111111111111";
    const CLIENT: &str = "33333333-3333-3333-3333-333333333333";
    const METADATA_PATH: &str =
        "/11111111-1111-1111-1111-111111111111/federationmetadata/2007-06/federationmetadata.xml";

    const METADATA: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<EntityDescriptor xmlns="urn:oasis:names:tc:SAML:2.0:metadata" ID="_x" entityID="https://sts.windows.net/t/">
  <Signature xmlns="http://www.w3.org/2000/09/xmldsig#">
    <KeyInfo><X509Data><X509Certificate>U0lHTkFUVVJF</X509Certificate></X509Data></KeyInfo>
  </Signature>
  <IDPSSODescriptor protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">
    <KeyDescriptor use="signing">
      <KeyInfo xmlns="http://www.w3.org/2000/09/xmldsig#">
        <X509Data>
          <X509Certificate>
            TUlJQzhEQ0NBZGlnQXdJQkFnSVFTSUdOSU5HQ0VSVElGSUNBVEVTSUdOSU5HQ0VSVElGSUNB
            VEVTSUdOSU5H
          </X509Certificate>
        </X509Data>
      </KeyInfo>
    </KeyDescriptor>
  </IDPSSODescriptor>
</EntityDescriptor>"#;

    fn extractor(server: &MockServer) -> MetadataCertificateExtractor {
        MetadataCertificateExtractor::new(&FederationConfig {
            issuer_url: server.uri(),
            timeout_secs: 5,
            fallback_timeout_secs: 5,
            ..FederationConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_metadata_url() {
        let extractor = MetadataCertificateExtractor::new(&FederationConfig::default()).unwrap();
        assert_eq!(
            extractor.metadata_url(TENANT, CLIENT).unwrap(),
            format!("https://login.microsoftonline.com{METADATA_PATH}?appid={CLIENT}")
        );
        assert!(matches!(
            extractor.metadata_url("", CLIENT),
            Err(CertificateError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_extracts_signing_certificate() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(METADATA_PATH))
            .and(query_param("appid", CLIENT))
            .and(header("accept", "application/xml"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/xml; charset=utf-8")
                    .set_body_string(METADATA),
            )
            .expect(1)
            .mount(&server)
            .await;

        let payload = extractor(&server)
            .extract_certificate(TENANT, CLIENT)
            .await
            .unwrap();

        assert!(payload.base64_single.starts_with("TUlJQzhE"));
        assert!(payload.base64_single.ends_with("VEVTSUdOSU5H"));
        assert!(!payload.base64_single.contains(char::is_whitespace));
        assert_eq!(
            payload.pem_lines[1..payload.pem_lines.len() - 1].concat(),
            payload.base64_single
        );
    }

    #[tokio::test]
    async fn test_fallback_recovers_from_non_xml_primary() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(METADATA_PATH))
            .and(header("accept", "application/xml"))
            .respond_with(ResponseTemplate::new(406).set_body_string("Not Acceptable"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(METADATA_PATH))
            .and(header("accept", "*/*"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/samlmetadata+xml")
                    .set_body_string(format!("\u{feff}\n{METADATA}")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let payload = extractor(&server)
            .extract_certificate(TENANT, CLIENT)
            .await
            .unwrap();
        assert!(payload.base64_single.starts_with("TUlJQzhE"));
    }

    #[tokio::test]
    async fn test_html_page_is_authz_suspected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("<!DOCTYPE html><html><head><title>Sign in to your account</title></head><body></body></html>", "text/html; charset=utf-8"),
            )
            .mount(&server)
            .await;

        let err = extractor(&server)
            .extract_certificate(TENANT, CLIENT)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            CertificateError::AuthzSuspected {
                status: 200,
                content_type: Some("text/html; charset=utf-8".into()),
            }
        );
    }

    #[tokio::test]
    async fn test_malformed_document() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<EntityDescriptor><KeyDescriptor>"))
            .mount(&server)
            .await;

        let err = extractor(&server)
            .extract_certificate(TENANT, CLIENT)
            .await
            .unwrap_err();
        assert!(matches!(err, CertificateError::MalformedDocument(_)));
    }

    #[tokio::test]
    async fn test_json_error_on_both_fetches_is_unexpected_shape() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(METADATA_PATH))
            .respond_with(
                ResponseTemplate::new(503)
                    .set_body_raw(r#"{"error":"temporarily_unavailable"}"#, "application/json"),
            )
            .expect(2)
            .mount(&server)
            .await;

        let err = extractor(&server)
            .extract_certificate(TENANT, CLIENT)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            CertificateError::UnexpectedShape {
                status: 503,
                content_type: Some("application/json".into()),
            }
        );
        assert!(err.remediation().starts_with("Retry"));
    }

    #[tokio::test]
    async fn test_forbidden_plain_text_is_authz_suspected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("Forbidden"))
            .mount(&server)
            .await;

        let err = extractor(&server)
            .extract_certificate(TENANT, CLIENT)
            .await
            .unwrap_err();
        assert!(matches!(err, CertificateError::AuthzSuspected { status: 403, .. }));
    }

    #[tokio::test]
    async fn test_document_without_certificate() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<EntityDescriptor xmlns="urn:oasis:names:tc:SAML:2.0:metadata"><IDPSSODescriptor/></EntityDescriptor>"#,
            ))
            .mount(&server)
            .await;

        let err = extractor(&server)
            .extract_certificate(TENANT, CLIENT)
            .await
            .unwrap_err();
        assert_eq!(err, CertificateError::NoCertificateFound);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport() {
        // Nothing listens on the discard port.
        let extractor = MetadataCertificateExtractor::new(&FederationConfig {
            issuer_url: "http://127.0.0.1:9".into(),
            timeout_secs: 2,
            fallback_timeout_secs: 2,
            ..FederationConfig::default()
        })
        .unwrap();

        let err = extractor.extract_certificate(TENANT, CLIENT).await.unwrap_err();
        assert!(matches!(err, CertificateError::Transport { .. }));
    }
}
