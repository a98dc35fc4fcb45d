//! HTTP collaborator seam
//!
//! The SFU is reached through whatever `fetch` the embedder supplies. The
//! [`HttpClient`] trait is that seam; [`ReqwestClient`] is the default
//! implementation for native hosts.

use crate::{Error, Result};
use async_trait::async_trait;

/// HTTP method subset used by the SFU API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
        }
    }
}

/// One outgoing SFU request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// JSON body; `None` sends an empty body
    pub body: Option<serde_json::Value>,
}

/// Transport-neutral response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    /// True when the server answered with a redirect instead of a body.
    /// The session coordinator treats this as credential expiration.
    pub redirected: bool,
    /// Parsed JSON body; `Value::Null` when empty or unparseable
    pub body: serde_json::Value,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The caller-supplied fetch function
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Default [`HttpClient`] backed by reqwest
///
/// Redirects are not followed: a redirect response from the SFU means the
/// caller's credentials have lapsed and the session must be rebuilt, so it
/// is surfaced as such rather than silently chased.
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Http(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
            HttpMethod::Put => self.client.put(&request.url),
        };

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Http(format!("request to {} failed: {e}", request.url)))?;

        let status = response.status();
        let redirected = status.is_redirection();
        let body = if redirected {
            serde_json::Value::Null
        } else {
            let text = response
                .text()
                .await
                .map_err(|e| Error::Http(format!("failed to read response body: {e}")))?;
            serde_json::from_str(&text).unwrap_or(serde_json::Value::Null)
        };

        Ok(HttpResponse {
            status: status.as_u16(),
            redirected,
            body,
        })
    }
}
