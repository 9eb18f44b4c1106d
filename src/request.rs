//! Session-gated request pipeline.
//!
//! ARCHITECTURE
//! ============
//! Every call runs the same loop: resolve a credential through the login
//! gate, stamp it into the headers, perform the raw call, then inspect the
//! body for a session sentinel. A sentinel saying the credential expired
//! clears the store and reruns the loop, so the caller sees one renewed
//! attempt instead of an error; any other sentinel is surfaced as a typed
//! failure. The loop is bounded so a service that keeps expiring sessions
//! cannot spin forever.
//!
//! DESIGN
//! ======
//! Sentinel bodies are ordinary JSON responses flagged by the magic key; the
//! service multiplexes them over the same 200-status channel as real
//! payloads, so inspection happens here and not in the transport.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ErrorCode, ParameterError, ensure_http_url};
use crate::login::{LoginError, LoginGate};
use crate::net::{HttpRequest, HttpResponse, HttpTransport, Method, TransportError};
use crate::session::{
    CODE_SESSION_EXPIRED, Credential, HEADER_SESSION_ID, HEADER_SESSION_SKEY, SESSION_MAGIC_ID,
    SessionStore,
};

// =============================================================================
// OPTIONS
// =============================================================================

/// One request as the caller describes it, before authentication.
#[derive(Clone, Debug)]
pub struct RequestOptions {
    pub url: String,
    pub method: Method,
    /// Caller headers. The session headers are injected by the pipeline and
    /// win over any same-named entry here.
    pub header: Vec<(String, String)>,
    /// JSON body, sent for methods that carry one.
    pub data: Option<Value>,
}

impl RequestOptions {
    #[must_use]
    pub fn new(url: impl Into<String>, method: Method) -> Self {
        Self { url: url.into(), method, header: Vec::new(), data: None }
    }

    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(url, Method::Get)
    }

    #[must_use]
    pub fn post(url: impl Into<String>, data: Value) -> Self {
        let mut options = Self::new(url, Method::Post);
        options.data = Some(data);
        options
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.push((name.into(), value.into()));
        self
    }

    fn validate(&self) -> Result<(), ParameterError> {
        ensure_http_url(&self.url)
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Why a pipeline call failed.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    InvalidOptions(#[from] ParameterError),
    #[error(transparent)]
    Login(#[from] LoginError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The service rejected the session for a reason other than expiry.
    #[error("session check failed: {code}")]
    SessionCheck { code: String },
    /// Every allowed attempt ended in a fresh-credential expiry sentinel.
    #[error("request retries exhausted: the session kept expiring")]
    ExceedMaxRetryTimes,
}

impl ErrorCode for RequestError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidOptions(err) => err.error_code(),
            Self::Login(err) => err.error_code(),
            Self::Transport(_) => "ERR_REQUEST_TRANSPORT",
            Self::SessionCheck { .. } => "ERR_SESSION_CHECK_FAILED",
            Self::ExceedMaxRetryTimes => "ERR_EXCEED_MAX_RETRY_TIMES",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::InvalidOptions(_) | Self::SessionCheck { .. } | Self::ExceedMaxRetryTimes => {
                false
            }
            Self::Login(err) => err.retryable(),
            Self::Transport(_) => true,
        }
    }
}

// =============================================================================
// PIPELINE
// =============================================================================

/// The authenticated request loop. Cheap to clone; every clone shares the
/// same gate and store.
#[derive(Clone)]
pub struct RequestPipeline {
    http: Arc<dyn HttpTransport>,
    gate: LoginGate,
    store: Arc<dyn SessionStore>,
    max_retry_times: u32,
}

impl RequestPipeline {
    #[must_use]
    pub fn new(
        http: Arc<dyn HttpTransport>,
        gate: LoginGate,
        store: Arc<dyn SessionStore>,
        max_retry_times: u32,
    ) -> Self {
        Self { http, gate, store, max_retry_times }
    }

    /// Perform one authenticated call, renewing the credential on expiry.
    ///
    /// # Errors
    ///
    /// [`RequestError::InvalidOptions`] before any I/O for malformed options;
    /// otherwise login, transport, or sentinel failures as typed variants.
    pub async fn dispatch(&self, options: RequestOptions) -> Result<HttpResponse, RequestError> {
        options.validate()?;
        let request_id = Uuid::new_v4();

        let mut tries: u32 = 0;
        loop {
            if tries > self.max_retry_times {
                warn!(%request_id, tries, "request: giving up after repeated session expiry");
                return Err(RequestError::ExceedMaxRetryTimes);
            }
            tries += 1;

            let credential = self.gate.login().await?;
            debug!(%request_id, url = %options.url, tries, "request: dispatching");
            let response = self.http.perform(authorized(&options, &credential)).await?;

            match inspect_sentinel(&response.body) {
                Sentinel::Clean => return Ok(response),
                Sentinel::Expired => {
                    debug!(%request_id, tries, "request: session expired, renewing credential");
                    self.store.clear();
                }
                Sentinel::Check(code) => {
                    warn!(%request_id, code, "request: session check failed");
                    return Err(RequestError::SessionCheck { code });
                }
            }
        }
    }
}

/// Stamp the credential into the headers. Caller-supplied entries with the
/// session header names are dropped first so the credential always wins.
fn authorized(options: &RequestOptions, credential: &Credential) -> HttpRequest {
    let mut headers: Vec<(String, String)> = options
        .header
        .iter()
        .filter(|(name, _)| {
            !name.eq_ignore_ascii_case(HEADER_SESSION_ID)
                && !name.eq_ignore_ascii_case(HEADER_SESSION_SKEY)
        })
        .cloned()
        .collect();
    headers.push((HEADER_SESSION_ID.to_owned(), credential.id.clone()));
    headers.push((HEADER_SESSION_SKEY.to_owned(), credential.skey.clone()));

    HttpRequest {
        url: options.url.clone(),
        method: options.method,
        headers,
        body: options.data.clone(),
    }
}

// =============================================================================
// SENTINEL INSPECTION
// =============================================================================

enum Sentinel {
    /// Ordinary payload, hand it to the caller.
    Clean,
    /// Credential is stale; renew and retry.
    Expired,
    /// Session rejected for some other reason.
    Check(String),
}

/// Classify a response body. Only objects carrying the magic key are session
/// control messages; everything else passes through untouched.
fn inspect_sentinel(body: &Value) -> Sentinel {
    let Some(object) = body.as_object() else {
        return Sentinel::Clean;
    };
    if !object.contains_key(SESSION_MAGIC_ID) {
        return Sentinel::Clean;
    }
    match object.get("error").and_then(Value::as_str) {
        Some(code) if code == CODE_SESSION_EXPIRED => Sentinel::Expired,
        Some(code) => Sentinel::Check(code.to_owned()),
        None => Sentinel::Check("unspecified session error".to_owned()),
    }
}

#[cfg(test)]
#[path = "request_test.rs"]
mod tests;
