//! HTTP dispatch of expanded requests

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::redirect::Policy;
use reqwest::Client;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::engine::ExecError;
use crate::error::{ChangepropError, Result};
use crate::rule::ExpandedRequest;

/// Status reported when a request never produced a response.
const TRANSPORT_FAILURE_STATUS: u16 = 504;

/// Issues derived requests and classifies their responses.
///
/// Redirects are not followed; a 3xx response counts as success.
#[derive(Debug, Clone)]
pub struct HttpDispatcher {
    client: Client,
}

impl HttpDispatcher {
    /// Creates a dispatcher with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns `ChangepropError::Internal` if the client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(Policy::none())
            .build()
            .map_err(|e| ChangepropError::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Sends one request.
    ///
    /// # Returns
    ///
    /// The response status for 2xx and 3xx responses.
    ///
    /// # Errors
    ///
    /// - `ExecError::Downstream` for any other status, carrying the body and
    ///   headers; transport failures are reported as status 504
    /// - `ExecError::Internal` if the request could not be built
    pub async fn execute(&self, request: &ExpandedRequest) -> std::result::Result<u16, ExecError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.uri.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match &request.body {
            None => builder,
            Some(JsonValue::String(text)) => builder.body(text.clone()),
            Some(body) => builder.json(body),
        };

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) if e.is_builder() => {
                return Err(ExecError::Internal(format!(
                    "Invalid request to {}: {}",
                    request.uri, e
                )))
            }
            Err(e) => {
                warn!(uri = %request.uri, error = %e, "Request failed without response");
                return Err(ExecError::Downstream {
                    status: TRANSPORT_FAILURE_STATUS,
                    body: Some(e.to_string()),
                    headers: BTreeMap::new(),
                });
            }
        };

        let status = response.status();
        if status.is_success() {
            debug!(method = %request.method, uri = %request.uri, status = status.as_u16(), "Request succeeded");
            return Ok(status.as_u16());
        }
        if status.is_redirection() {
            warn!(uri = %request.uri, status = status.as_u16(), "Redirect response treated as success");
            return Ok(status.as_u16());
        }

        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = response.text().await.ok().filter(|b| !b.is_empty());
        Err(ExecError::Downstream {
            status: status.as_u16(),
            body,
            headers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(method: Method, uri: String, body: Option<JsonValue>) -> ExpandedRequest {
        let mut headers = BTreeMap::new();
        headers.insert("x-request-id".to_string(), "rid".to_string());
        ExpandedRequest {
            method,
            uri,
            headers,
            body,
        }
    }

    fn dispatcher() -> HttpDispatcher {
        HttpDispatcher::new(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_success_with_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/purge"))
            .and(header("x-request-id", "rid"))
            .and(body_json(json!({"title": "Foo"})))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let status = dispatcher()
            .execute(&request(
                Method::POST,
                format!("{}/purge", server.uri()),
                Some(json!({"title": "Foo"})),
            ))
            .await
            .unwrap();
        assert_eq!(status, 201);
    }

    #[tokio::test]
    async fn test_redirect_is_not_followed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/moved"))
            .respond_with(ResponseTemplate::new(301).insert_header("location", "/elsewhere"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/elsewhere"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let status = dispatcher()
            .execute(&request(Method::GET, format!("{}/moved", server.uri()), None))
            .await
            .unwrap();
        assert_eq!(status, 301);
    }

    #[tokio::test]
    async fn test_error_status_carries_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(503)
                    .set_body_string("down for maintenance")
                    .insert_header("retry-after", "5"),
            )
            .mount(&server)
            .await;

        let err = dispatcher()
            .execute(&request(Method::GET, format!("{}/x", server.uri()), None))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(503));
        assert!(err.is_maintenance());
        match err {
            ExecError::Downstream { headers, .. } => {
                assert_eq!(headers.get("retry-after").map(String::as_str), Some("5"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connection_failure_maps_to_gateway_timeout() {
        let err = dispatcher()
            .execute(&request(Method::GET, "http://127.0.0.1:1/".to_string(), None))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(504));
    }

    #[tokio::test]
    async fn test_invalid_uri_is_internal() {
        let err = dispatcher()
            .execute(&request(Method::GET, "not a uri".to_string(), None))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Internal(_)));
    }
}
