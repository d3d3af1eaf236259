// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP transport seam.
//!
//! The client never talks to the network directly. Every call goes through a
//! [`Transport`], which turns an [`HttpRequest`] into an [`HttpResponse`].
//! A transport only fails when no response was received: any HTTP status,
//! including 4xx and 5xx, is returned as `Ok` and classified by the caller.
//!
//! [`ReqwestTransport`] is the production implementation; tests use
//! [`crate::testkit::MockTransport`].

use crate::error::{ClientError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use http::{Method, StatusCode};
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::Duration;
use url::Url;

/// An outbound request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Per-request deadline. `None` defers to the transport's own setting.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    #[must_use]
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    #[must_use]
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A received response, whatever its status.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    #[must_use]
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Parse the body as JSON.
    ///
    /// An empty body is parsed as `null`, so `()` and `Option<T>` accept it.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Decode` if the body does not match `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        if self.body.is_empty() {
            return Ok(serde_json::from_slice(b"null")?);
        }
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Turn a non-2xx response into the matching error.
    ///
    /// The message is the body's JSON `message` field when present, else the
    /// status's canonical reason.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Server` for 5xx and `ClientError::Client` for
    /// any other non-success status.
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        let message = serde_json::from_slice::<serde_json::Value>(&self.body)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
            .unwrap_or_else(|| {
                self.status
                    .canonical_reason()
                    .unwrap_or("Request failed")
                    .to_string()
            });
        Err(ClientError::from_status(self.status, message))
    }
}

/// Sends requests over some HTTP stack.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// # Errors
    ///
    /// Returns `ClientError::Network` or `ClientError::Timeout` when no
    /// response was received.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// [`Transport`] backed by `reqwest` with rustls.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    default_timeout: Option<Duration>,
}

impl ReqwestTransport {
    /// Build a client sending `Content-Type: application/json` by default.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if the TLS backend cannot be initialized.
    pub fn new(default_timeout: Option<Duration>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .default_headers(headers);
        if let Some(timeout) = default_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| ClientError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            default_timeout,
        })
    }

    /// Wrap an existing `reqwest` client.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            default_timeout: None,
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let timeout = request.timeout.or(self.default_timeout);

        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                ClientError::Timeout(timeout.unwrap_or_default())
            } else {
                ClientError::Network(e.to_string())
            }
        };

        let response = builder.send().await.map_err(map_err)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(map_err)?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Prediction {
        home: f64,
    }

    #[test]
    fn test_request_builder() {
        let url = Url::parse("http://localhost:3001/api/matches").unwrap();
        let req = HttpRequest::get(url.clone())
            .with_body("{}")
            .with_timeout(Duration::from_secs(2));
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.url, url);
        assert_eq!(req.body.as_deref(), Some(&b"{}"[..]));
        assert_eq!(req.timeout, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_response_json() {
        let resp = HttpResponse::new(StatusCode::OK, r#"{"home":0.61}"#);
        let p: Prediction = resp.json().unwrap();
        assert_eq!(p, Prediction { home: 0.61 });

        let empty = HttpResponse::new(StatusCode::NO_CONTENT, Bytes::new());
        empty.json::<()>().unwrap();
        assert_eq!(empty.json::<Option<Prediction>>().unwrap(), None);

        let bad = HttpResponse::new(StatusCode::OK, "not json");
        assert!(matches!(bad.json::<Prediction>(), Err(ClientError::Decode(_))));
    }

    #[test]
    fn test_error_for_status_uses_body_message() {
        let resp = HttpResponse::new(StatusCode::NOT_FOUND, r#"{"message":"match not found"}"#);
        match resp.error_for_status() {
            Err(ClientError::Client { status, message }) => {
                assert_eq!(status, StatusCode::NOT_FOUND);
                assert_eq!(message, "match not found");
            }
            other => panic!("unexpected: {other:?}"),
        }

        let resp = HttpResponse::new(StatusCode::SERVICE_UNAVAILABLE, "oops");
        match resp.error_for_status() {
            Err(ClientError::Server { message, .. }) => {
                assert_eq!(message, "Service Unavailable");
            }
            other => panic!("unexpected: {other:?}"),
        }

        assert!(HttpResponse::new(StatusCode::OK, "").error_for_status().is_ok());
    }
}
