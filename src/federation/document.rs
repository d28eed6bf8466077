//! Federation metadata parsing and certificate candidate search.

use quick_xml::{
    NsReader,
    events::{BytesStart, Event},
    name::ResolveResult,
};
use serde::Serialize;

/// SAML 2.0 metadata namespace.
pub const METADATA_NS: &str = "urn:oasis:names:tc:SAML:2.0:metadata";

/// XML digital signature namespace.
pub const XMLDSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";

const BOM: char = '\u{feff}';

/// Where a certificate candidate was found. Declaration order is priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    /// Under a `KeyDescriptor` with `use="signing"`.
    SigningKeyDescriptor,
    /// Under any other `KeyDescriptor`.
    AnyKeyDescriptor,
    /// An `X509Certificate` outside any `KeyDescriptor`.
    BareCertificate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateCandidate {
    pub source: CandidateSource,
    /// Element text as found, whitespace included.
    pub value: String,
}

/// Minimal element tree. Namespace is the resolved URI, not the prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    pub namespace: Option<String>,
    pub local_name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlElement>,
    pub text: String,
}

impl XmlElement {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Matches `local_name` in `namespace`, or with no namespace at all.
    fn is(&self, namespace: &str, local_name: &str) -> bool {
        self.local_name == local_name
            && self.namespace.as_deref().is_none_or(|ns| ns == namespace)
    }
}

/// Why a body could not be read as metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    /// The body is an HTML page (typically a sign-in or error page).
    Html,
    /// The body does not start with markup at all (JSON, plain text, empty).
    NotXml,
    /// Markup that fails both parses.
    Malformed(String),
}

#[derive(Debug, Clone)]
pub struct FederationMetadataDocument {
    pub raw: String,
    pub tree: Option<XmlElement>,
    /// Every candidate in document order.
    pub candidates: Vec<CertificateCandidate>,
}

impl FederationMetadataDocument {
    /// Parse the raw body, then a sanitized copy (BOM and surrounding
    /// whitespace removed) if the raw body is rejected.
    pub fn parse(raw: &str) -> Result<Self, DocumentError> {
        if !looks_like_xml(raw) {
            return Err(DocumentError::NotXml);
        }

        let tree = match parse_tree(raw) {
            Ok(tree) => tree,
            Err(first) => {
                let sanitized = sanitize(raw);
                match parse_tree(sanitized) {
                    Ok(tree) => {
                        tracing::debug!(error = %first, "Metadata parsed after sanitizing");
                        tree
                    }
                    Err(second) if looks_like_html(sanitized) => {
                        tracing::debug!(error = %second, "Metadata body is HTML");
                        return Err(DocumentError::Html);
                    }
                    Err(second) => return Err(DocumentError::Malformed(second)),
                }
            }
        };

        if tree.local_name.eq_ignore_ascii_case("html") {
            return Err(DocumentError::Html);
        }

        let mut candidates = Vec::new();
        collect_candidates(&tree, None, &mut candidates);

        Ok(Self {
            raw: raw.to_string(),
            tree: Some(tree),
            candidates,
        })
    }

    /// Highest-priority candidate; document order breaks ties.
    pub fn best_candidate(&self) -> Option<&CertificateCandidate> {
        self.candidates.iter().min_by_key(|c| c.source)
    }
}

/// Strip a leading byte-order mark and surrounding whitespace.
pub fn sanitize(body: &str) -> &str {
    body.trim().trim_start_matches(BOM).trim()
}

/// Whether the body starts like an XML document.
pub fn looks_like_xml(body: &str) -> bool {
    sanitize(body).starts_with('<')
}

pub fn looks_like_html(body: &str) -> bool {
    let head: String = sanitize(body).chars().take(512).collect::<String>().to_ascii_lowercase();
    head.starts_with("<!doctype html") || head.contains("<html")
}

fn collect_candidates(
    element: &XmlElement,
    key_descriptor: Option<CandidateSource>,
    out: &mut Vec<CertificateCandidate>,
) {
    if element.is(XMLDSIG_NS, "X509Certificate") {
        if !element.text.trim().is_empty() {
            out.push(CertificateCandidate {
                source: key_descriptor.unwrap_or(CandidateSource::BareCertificate),
                value: element.text.clone(),
            });
        }
        return;
    }

    // The innermost KeyDescriptor decides the source.
    let scope = if element.is(METADATA_NS, "KeyDescriptor") {
        match element.attribute("use") {
            Some(usage) if usage.eq_ignore_ascii_case("signing") => {
                Some(CandidateSource::SigningKeyDescriptor)
            }
            _ => Some(CandidateSource::AnyKeyDescriptor),
        }
    } else {
        key_descriptor
    };

    for child in &element.children {
        collect_candidates(child, scope, out);
    }
}

fn resolve_namespace(resolved: ResolveResult<'_>) -> Option<String> {
    match resolved {
        ResolveResult::Bound(ns) => Some(String::from_utf8_lossy(ns.as_ref()).into_owned()),
        ResolveResult::Unbound | ResolveResult::Unknown(_) => None,
    }
}

fn start_element(namespace: Option<String>, start: &BytesStart<'_>) -> Result<XmlElement, String> {
    let mut attributes = Vec::new();
    for attribute in start.attributes() {
        let attribute = attribute.map_err(|e| format!("invalid attribute: {e}"))?;
        let key = String::from_utf8_lossy(attribute.key.local_name().as_ref()).into_owned();
        let value = attribute
            .unescape_value()
            .map_err(|e| format!("invalid attribute value: {e}"))?
            .into_owned();
        attributes.push((key, value));
    }

    Ok(XmlElement {
        namespace,
        local_name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
        attributes,
        children: Vec::new(),
        text: String::new(),
    })
}

/// Build an element tree, rejecting anything that is not a single
/// well-formed root element.
fn parse_tree(xml: &str) -> Result<XmlElement, String> {
    let mut reader = NsReader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        let (resolved, event) = reader.read_resolved_event().map_err(|e| e.to_string())?;
        let namespace = resolve_namespace(resolved);

        match event {
            Event::Start(start) => {
                if root.is_some() {
                    return Err("content after the root element".into());
                }
                stack.push(start_element(namespace, &start)?);
            }
            Event::Empty(start) => {
                let element = start_element(namespace, &start)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None if root.is_none() => root = Some(element),
                    None => return Err("content after the root element".into()),
                }
            }
            Event::End(_) => {
                let element = stack.pop().ok_or("unexpected closing tag")?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            }
            Event::Text(text) => {
                let text = text.unescape().map_err(|e| format!("invalid text: {e}"))?;
                match stack.last_mut() {
                    Some(current) => current.text.push_str(&text),
                    None if text.trim().is_empty() => {}
                    None => return Err("text outside the root element".into()),
                }
            }
            Event::CData(data) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        return Err(format!("unclosed element '{}'", open.local_name));
    }
    root.ok_or_else(|| "no root element".to_string())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn entity(body: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<EntityDescriptor xmlns="urn:oasis:names:tc:SAML:2.0:metadata" entityID="https://sts.windows.net/t/">
  <IDPSSODescriptor protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">
    {body}
  </IDPSSODescriptor>
</EntityDescriptor>"#
        )
    }

    fn key_descriptor(usage: Option<&str>, cert: &str) -> String {
        let usage = usage.map(|u| format!(r#" use="{u}""#)).unwrap_or_default();
        format!(
            r#"<KeyDescriptor{usage}>
      <KeyInfo xmlns="http://www.w3.org/2000/09/xmldsig#">
        <X509Data><X509Certificate>{cert}</X509Certificate></X509Data>
      </KeyInfo>
    </KeyDescriptor>"#
        )
    }

    #[rstest]
    #[case::signing_wins_over_encryption(
        entity(&format!("{}{}", key_descriptor(Some("encryption"), "AAA"), key_descriptor(Some("signing"), "BBB"))),
        "BBB",
        CandidateSource::SigningKeyDescriptor
    )]
    #[case::signing_wins_over_unmarked(
        entity(&format!("{}{}", key_descriptor(None, "AAA"), key_descriptor(Some("signing"), "BBB"))),
        "BBB",
        CandidateSource::SigningKeyDescriptor
    )]
    #[case::first_unmarked_in_document_order(
        entity(&format!("{}{}", key_descriptor(None, "AAA"), key_descriptor(None, "BBB"))),
        "AAA",
        CandidateSource::AnyKeyDescriptor
    )]
    #[case::bare_certificate_fallback(
        entity(r#"<Signature xmlns="http://www.w3.org/2000/09/xmldsig#"><KeyInfo><X509Data><X509Certificate>CCC</X509Certificate></X509Data></KeyInfo></Signature>"#),
        "CCC",
        CandidateSource::BareCertificate
    )]
    #[case::prefixed_namespaces(
        r#"<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" xmlns:ds="http://www.w3.org/2000/09/xmldsig#">
             <md:KeyDescriptor use="signing"><ds:KeyInfo><ds:X509Data><ds:X509Certificate>DDD</ds:X509Certificate></ds:X509Data></ds:KeyInfo></md:KeyDescriptor>
           </md:EntityDescriptor>"#.to_string(),
        "DDD",
        CandidateSource::SigningKeyDescriptor
    )]
    #[case::unqualified_names(
        "<EntityDescriptor><KeyDescriptor use=\"signing\"><X509Certificate>EEE</X509Certificate></KeyDescriptor></EntityDescriptor>".to_string(),
        "EEE",
        CandidateSource::SigningKeyDescriptor
    )]
    fn test_candidate_cascade(
        #[case] xml: String,
        #[case] expected: &str,
        #[case] source: CandidateSource,
    ) {
        let document = FederationMetadataDocument::parse(&xml).unwrap();
        let best = document.best_candidate().unwrap();
        assert_eq!(best.value.trim(), expected);
        assert_eq!(best.source, source);
    }

    #[test]
    fn test_foreign_namespace_is_ignored() {
        let xml = r#"<Root xmlns:x="urn:other"><x:X509Certificate>ZZZ</x:X509Certificate></Root>"#;
        let document = FederationMetadataDocument::parse(xml).unwrap();
        assert!(document.best_candidate().is_none());
    }

    #[test]
    fn test_document_without_certificate() {
        let document = FederationMetadataDocument::parse(&entity("")).unwrap();
        assert!(document.candidates.is_empty());
        assert!(document.tree.is_some());
    }

    #[test]
    fn test_bom_and_whitespace_are_sanitized() {
        let xml = format!("\u{feff}\n  {}\n", entity(&key_descriptor(Some("signing"), "BBB")));
        let document = FederationMetadataDocument::parse(&xml).unwrap();
        assert_eq!(document.best_candidate().unwrap().value, "BBB");
    }

    #[rstest]
    #[case::doctype("<!DOCTYPE html><html><head><title>Sign in</title><meta charset=utf-8></head><body>x</body></html>")]
    #[case::well_formed_html("<html><body><p>Access denied</p></body></html>")]
    #[case::html_with_bom("\u{feff}<!doctype html>\n<html><body><br></body></html>")]
    fn test_html_is_classified(#[case] body: &str) {
        assert_eq!(
            FederationMetadataDocument::parse(body).unwrap_err(),
            DocumentError::Html
        );
    }

    #[rstest]
    #[case::truncated("<EntityDescriptor><KeyDescriptor>")]
    #[case::mismatched("<a><b></a></b>")]
    #[case::text_after_root("<EntityDescriptor/>trailing")]
    fn test_malformed_is_distinct_from_html(#[case] body: &str) {
        assert!(matches!(
            FederationMetadataDocument::parse(body),
            Err(DocumentError::Malformed(_))
        ));
    }

    #[rstest]
    #[case::plain_text("Service unavailable")]
    #[case::empty("")]
    #[case::whitespace_only("\u{feff}  \n")]
    #[case::json_error(r#"{"error":"temporarily_unavailable"}"#)]
    fn test_non_markup_is_not_xml(#[case] body: &str) {
        assert_eq!(
            FederationMetadataDocument::parse(body).unwrap_err(),
            DocumentError::NotXml
        );
    }

    #[test]
    fn test_shape_helpers() {
        assert!(looks_like_xml("\u{feff}  <?xml version=\"1.0\"?><a/>"));
        assert!(!looks_like_xml("{\"error\":\"invalid_request\"}"));
        assert!(looks_like_html("  <!DOCTYPE HTML PUBLIC>"));
    }
}
