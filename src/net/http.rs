//! HTTP transport seam and its reqwest-backed default.
//!
//! DESIGN
//! ======
//! Requests and responses are plain structs with JSON bodies so scripted
//! fakes stay trivial. The default transport decodes every body as JSON and
//! falls back to a JSON string for non-JSON payloads; the sentinel inspection
//! upstream only cares about objects, so the fallback is inert there.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::net::TransportError;

// =============================================================================
// REQUEST / RESPONSE
// =============================================================================

/// HTTP method subset the service speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One raw call handed to the transport, headers fully assembled.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub url: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

/// What came back: status, headers, and the JSON-decoded body.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

// =============================================================================
// TRANSPORT SEAM
// =============================================================================

/// Raw request transport collaborator.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn perform(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

// =============================================================================
// REQWEST DEFAULT
// =============================================================================

/// Default [`HttpTransport`] over a shared reqwest client.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build the underlying client.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the TLS backend cannot initialize.
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| TransportError::new("http client build failed", err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn perform(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| TransportError::new("http request failed", err.to_string()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (name.to_string(), String::from_utf8_lossy(value.as_bytes()).into_owned())
            })
            .collect();
        let text = response
            .text()
            .await
            .map_err(|err| TransportError::new("http body read failed", err.to_string()))?;
        let body = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(_) => Value::String(text),
        };

        Ok(HttpResponse { status, headers, body })
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "http_test.rs"]
mod tests;
