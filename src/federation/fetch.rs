//! Federation metadata HTTP retrieval.
//!
//! The primary client asks for XML explicitly. The fallback client is built
//! separately, speaks HTTP/1.1 only and accepts any content type, which
//! gets past proxies and edge nodes that mishandle the first request.

use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};

use super::document::looks_like_xml;
use crate::config::FederationConfig;

/// Which request produced a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMethod {
    Primary,
    Fallback,
}

impl FetchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchMethod::Primary => "primary",
            FetchMethod::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub method: FetchMethod,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl FetchedDocument {
    /// A 2xx response whose body starts like XML.
    pub fn is_usable(&self) -> bool {
        (200..300).contains(&self.status) && looks_like_xml(&self.body)
    }
}

pub(super) fn build_primary_client(config: &FederationConfig) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .user_agent(&config.user_agent)
        .build()
}

pub(super) fn build_fallback_client(config: &FederationConfig) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.fallback_timeout_secs))
        .http1_only()
        .build()
}

fn content_type(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Attempt 1: explicit User-Agent and `Accept: application/xml`. The body is
/// read as bytes and decoded as UTF-8.
pub(super) async fn fetch_primary(
    client: &reqwest::Client,
    url: &str,
    user_agent: &str,
) -> Result<FetchedDocument, reqwest::Error> {
    let response = client
        .get(url)
        .header(USER_AGENT, user_agent)
        .header(ACCEPT, "application/xml")
        .send()
        .await?;

    let status = response.status().as_u16();
    let content_type = content_type(&response);
    let bytes = response.bytes().await?;

    Ok(FetchedDocument {
        method: FetchMethod::Primary,
        status,
        content_type,
        body: String::from_utf8_lossy(&bytes).into_owned(),
    })
}

/// Attempt 2: `Accept: */*`, body decoded using the charset the server
/// declares.
pub(super) async fn fetch_fallback(
    client: &reqwest::Client,
    url: &str,
) -> Result<FetchedDocument, reqwest::Error> {
    let response = client.get(url).header(ACCEPT, "*/*").send().await?;

    let status = response.status().as_u16();
    let content_type = content_type(&response);
    let body = response.text().await?;

    Ok(FetchedDocument {
        method: FetchMethod::Fallback,
        status,
        content_type,
        body,
    })
}
