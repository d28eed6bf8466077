//! Authenticated JSON requests against ARM and Microsoft Graph.

use std::sync::Arc;

use reqwest::{Method, header::AUTHORIZATION};
use serde_json::Value;

use super::{
    retry::with_retry,
    token::{Audience, AzureTokenSource},
};
use crate::{
    config::RetryConfig,
    provider::{ProviderError, ProviderResult},
};

/// Upper bound on followed `nextLink` pages.
const MAX_PAGES: usize = 50;

/// Whether a request may be repeated without side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Idempotency {
    /// GET, PUT, PATCH and DELETE.
    Idempotent,
    /// POSTs that create a new object per call.
    Mutation,
}

pub(crate) struct RestResponse {
    pub status: u16,
    pub body: Value,
}

impl RestResponse {
    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub(crate) struct RestClient {
    http: reqwest::Client,
    tokens: Arc<AzureTokenSource>,
    retry: RetryConfig,
}

impl RestClient {
    pub fn new(http: reqwest::Client, tokens: Arc<AzureTokenSource>, retry: RetryConfig) -> Self {
        Self {
            http,
            tokens,
            retry,
        }
    }

    /// Send a request and return status and decoded body, whatever the status.
    pub async fn send(
        &self,
        audience: Audience,
        method: Method,
        url: &str,
        body: Option<&Value>,
        idempotency: Idempotency,
    ) -> ProviderResult<RestResponse> {
        let bearer = self.tokens.bearer_header(audience).await?;
        let retry = match idempotency {
            Idempotency::Idempotent => std::borrow::Cow::Borrowed(&self.retry),
            Idempotency::Mutation => self.retry.for_mutation(),
        };
        let operation = method.as_str().to_string();

        tracing::debug!(service = audience.label(), %method, url, "Azure request");

        let response = with_retry(&retry, audience.label(), &operation, || {
            let mut request = self
                .http
                .request(method.clone(), url)
                .header(AUTHORIZATION, bearer.as_ref());
            if let Some(body) = body {
                request = request.json(body);
            }
            request.send()
        })
        .await
        .map_err(|e| ProviderError::Transport(format!("{method} {url}: {e}")))?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProviderError::Transport(format!("{method} {url}: reading body: {e}")))?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };

        Ok(RestResponse { status, body })
    }

    /// Send and require a 2xx response.
    pub async fn call(
        &self,
        audience: Audience,
        method: Method,
        url: &str,
        body: Option<&Value>,
        idempotency: Idempotency,
    ) -> ProviderResult<Value> {
        let response = self.send(audience, method, url, body, idempotency).await?;
        if response.is_success() {
            Ok(response.body)
        } else {
            Err(classify(response.status, &response.body))
        }
    }

    /// GET that maps 404 to `None`.
    pub async fn get_optional(&self, audience: Audience, url: &str) -> ProviderResult<Option<Value>> {
        let response = self
            .send(audience, Method::GET, url, None, Idempotency::Idempotent)
            .await?;
        match response.status {
            404 => Ok(None),
            _ if response.is_success() => Ok(Some(response.body)),
            status => Err(classify(status, &response.body)),
        }
    }

    /// GET a collection, following `nextLink` / `@odata.nextLink`.
    pub async fn list(&self, audience: Audience, url: &str) -> ProviderResult<Vec<Value>> {
        let mut items = Vec::new();
        let mut next = Some(url.to_string());
        let mut pages = 0;

        while let Some(page_url) = next.take() {
            pages += 1;
            if pages > MAX_PAGES {
                tracing::warn!(url, pages = MAX_PAGES, "Stopped following nextLink");
                break;
            }

            let body = self
                .call(audience, Method::GET, &page_url, None, Idempotency::Idempotent)
                .await?;
            if let Some(Value::Array(values)) = body.get("value") {
                items.extend(values.iter().cloned());
            }
            next = body
                .get("@odata.nextLink")
                .or_else(|| body.get("nextLink"))
                .and_then(Value::as_str)
                .map(str::to_string);
        }

        Ok(items)
    }
}

/// Map a non-success response to a [`ProviderError`].
///
/// ARM and Graph both wrap errors as `{"error": {"code", "message"}}`. Graph
/// reports duplicate references as 400 "... already exist ...".
pub(crate) fn classify(status: u16, body: &Value) -> ProviderError {
    let error = body.get("error").unwrap_or(body);
    let code = error
        .get("code")
        .and_then(Value::as_str)
        .unwrap_or("Unknown")
        .to_string();
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("no error message")
        .to_string();

    match status {
        401 => ProviderError::Auth(format!("{code}: {message}")),
        404 => ProviderError::NotFound(format!("{code}: {message}")),
        409 => ProviderError::Conflict(format!("{code}: {message}")),
        400 if message.to_lowercase().contains("already exist") => {
            ProviderError::Conflict(format!("{code}: {message}"))
        }
        _ => ProviderError::Api {
            status,
            code,
            message,
        },
    }
}

/// Join `base` and `path`, then append URL-encoded query pairs.
pub(crate) fn build_url(base: &str, path: &str, query: &[(&str, &str)]) -> ProviderResult<String> {
    let raw = format!("{}{}", base.trim_end_matches('/'), path);
    let mut url = url::Url::parse(&raw)
        .map_err(|e| ProviderError::Validation(format!("invalid URL '{raw}': {e}")))?;
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in query {
            pairs.append_pair(key, value);
        }
    }
    Ok(url.into())
}

/// Quote a string literal for an OData `$filter` expression.
pub(crate) fn odata_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{header, method, path, query_param},
    };

    use super::*;

    fn client() -> RestClient {
        RestClient::new(
            reqwest::Client::new(),
            Arc::new(AzureTokenSource::from_static("arm", "graph")),
            RetryConfig::disabled(),
        )
    }

    #[test]
    fn test_classify_conflicts() {
        let body = json!({"error": {"code": "RoleAssignmentExists", "message": "The role assignment already exists."}});
        assert!(classify(409, &body).is_conflict());

        let body = json!({"error": {"code": "Request_BadRequest", "message": "One or more added object references already exist for the following modified properties: 'members'."}});
        assert!(classify(400, &body).is_conflict());

        let body = json!({"error": {"code": "Request_BadRequest", "message": "Invalid value"}});
        assert!(matches!(classify(400, &body), ProviderError::Api { status: 400, .. }));
    }

    #[test]
    fn test_classify_auth_and_missing() {
        assert!(matches!(classify(401, &Value::Null), ProviderError::Auth(_)));
        assert!(matches!(
            classify(404, &json!({"error": {"code": "ResourceGroupNotFound", "message": "x"}})),
            ProviderError::NotFound(msg) if msg.starts_with("ResourceGroupNotFound")
        ));
    }

    #[test]
    fn test_build_url_encodes_filter() {
        let url = build_url(
            "https://graph.microsoft.com/",
            "/v1.0/groups",
            &[("$filter", "displayName eq 'OpenCTI Analysts'")],
        )
        .unwrap();
        assert!(url.starts_with("https://graph.microsoft.com/v1.0/groups?"));
        assert!(url.contains("displayName+eq+%27OpenCTI+Analysts%27"));
    }

    #[test]
    fn test_odata_literal_escapes_quotes() {
        assert_eq!(odata_literal("O'Brien"), "'O''Brien'");
    }

    #[tokio::test]
    async fn test_get_optional_maps_404() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let found = client()
            .get_optional(Audience::Management, &format!("{}/missing", server.uri()))
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_sends_bearer_for_audience() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me"))
            .and(header("authorization", "Bearer graph"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "me"})))
            .mount(&server)
            .await;

        let body = client()
            .call(
                Audience::Graph,
                Method::GET,
                &format!("{}/v1.0/me", server.uri()),
                None,
                Idempotency::Idempotent,
            )
            .await
            .unwrap();
        assert_eq!(body["id"], "me");
    }

    #[tokio::test]
    async fn test_list_follows_next_link() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": [{"n": 2}]})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{"n": 1}],
                "@odata.nextLink": format!("{}/items?page=2", server.uri()),
            })))
            .mount(&server)
            .await;

        let items = client()
            .list(Audience::Graph, &format!("{}/items", server.uri()))
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1]["n"], 2);
    }
}
