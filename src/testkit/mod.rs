// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory transport for tests and demos.
//!
//! [`MockTransport`] answers requests from a script keyed by URL (scheme,
//! host, port and path; the query string is ignored). One-shot replies queued
//! with [`MockTransport::push`] are served first, in order; after that the
//! standing reply set with [`MockTransport::respond`] is used. A request with
//! no scripted reply fails as a network error.

use crate::error::{ClientError, Result};
use crate::transport::{HttpRequest, HttpResponse, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use url::Url;

/// A scripted outcome for one request.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Respond with this status and body.
    Status(StatusCode, Bytes),
    /// Fail without a response.
    NetworkError(String),
    /// Wait, then produce the inner reply.
    Delayed(Duration, Box<MockReply>),
}

impl MockReply {
    /// 200 with a JSON body.
    #[must_use]
    pub fn json(value: &serde_json::Value) -> Self {
        Self::Status(StatusCode::OK, Bytes::from(value.to_string()))
    }

    /// A bare status with an empty body.
    #[must_use]
    pub fn status(code: u16) -> Self {
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::Status(status, Bytes::new())
    }

    #[must_use]
    pub fn network_error() -> Self {
        Self::NetworkError("connection refused".to_string())
    }

    #[must_use]
    pub fn delayed(self, delay: Duration) -> Self {
        Self::Delayed(delay, Box::new(self))
    }
}

#[derive(Debug, Default)]
struct Script {
    queued: HashMap<String, VecDeque<MockReply>>,
    standing: HashMap<String, MockReply>,
    calls: Vec<HttpRequest>,
}

/// A [`Transport`] that replays scripted replies and records every request.
#[derive(Debug, Default)]
pub struct MockTransport {
    script: Mutex<Script>,
}

fn route_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.as_str().trim_end_matches('/').to_string()
}

fn parse_key(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => route_key(&parsed),
        Err(_) => url.trim_end_matches('/').to_string(),
    }
}

impl MockTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer every request to `url` with `reply` once the queue is empty.
    pub fn respond(&self, url: &str, reply: MockReply) -> &Self {
        self.lock().standing.insert(parse_key(url), reply);
        self
    }

    /// Queue a one-shot reply for `url`.
    pub fn push(&self, url: &str, reply: MockReply) -> &Self {
        self.lock()
            .queued
            .entry(parse_key(url))
            .or_default()
            .push_back(reply);
        self
    }

    /// Every request received so far, oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<HttpRequest> {
        self.lock().calls.clone()
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Number of requests whose URL matches `url`.
    #[must_use]
    pub fn calls_to(&self, url: &str) -> usize {
        let key = parse_key(url);
        self.lock()
            .calls
            .iter()
            .filter(|req| route_key(&req.url) == key)
            .count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    fn next_reply(&self, request: &HttpRequest) -> Option<MockReply> {
        let key = route_key(&request.url);
        let mut script = self.lock();
        script.calls.push(request.clone());
        if let Some(reply) = script.queued.get_mut(&key).and_then(VecDeque::pop_front) {
            return Some(reply);
        }
        script.standing.get(&key).cloned()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut reply = self
            .next_reply(&request)
            .unwrap_or_else(|| MockReply::NetworkError(format!("no route for {}", request.url)));

        loop {
            match reply {
                MockReply::Status(status, body) => return Ok(HttpResponse::new(status, body)),
                MockReply::NetworkError(message) => return Err(ClientError::Network(message)),
                MockReply::Delayed(delay, inner) => {
                    match request.timeout {
                        Some(timeout) if timeout < delay => {
                            tokio::time::sleep(timeout).await;
                            return Err(ClientError::Timeout(timeout));
                        }
                        _ => tokio::time::sleep(delay).await,
                    }
                    reply = *inner;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn get(url: &str) -> HttpRequest {
        HttpRequest::get(Url::parse(url).unwrap())
    }

    #[tokio::test]
    async fn test_queued_replies_before_standing() {
        let mock = MockTransport::new();
        mock.respond("http://a/x", MockReply::json(&json!({"n": 2})))
            .push("http://a/x", MockReply::status(503));

        let first = mock.send(get("http://a/x")).await.unwrap();
        assert_eq!(first.status, StatusCode::SERVICE_UNAVAILABLE);

        let second = mock.send(get("http://a/x?page=2")).await.unwrap();
        assert_eq!(second.status, StatusCode::OK);
        assert_eq!(mock.calls_to("http://a/x"), 2);
    }

    #[tokio::test]
    async fn test_unscripted_url_is_network_error() {
        let mock = MockTransport::new();
        let err = mock.send(get("http://nowhere/")).await.unwrap_err();
        assert!(matches!(err, ClientError::Network(_)));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_past_timeout_is_timeout() {
        let mock = MockTransport::new();
        mock.respond(
            "http://slow/health",
            MockReply::status(200).delayed(Duration::from_secs(10)),
        );

        let req = get("http://slow/health").with_timeout(Duration::from_secs(5));
        let err = mock.send(req).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout(d) if d == Duration::from_secs(5)));
    }
}
