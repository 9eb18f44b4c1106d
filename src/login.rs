//! Login gate: single-flight credential acquisition with a timeout.
//!
//! ARCHITECTURE
//! ============
//! Every caller that needs a credential goes through [`LoginGate::login`].
//! If the store has one, it resolves immediately. Otherwise the first caller
//! launches the handshake (platform code → exchange at the login url) and
//! every caller arriving before it settles attaches to the same attempt;
//! the outcome is broadcast to all of them in arrival order.
//!
//! LIFECYCLE
//! =========
//! The handshake and its timeout race as two tasks. Whichever finishes first
//! resolves the waiters; the loser hits the generation guard in `finish` and
//! is discarded with a log line. A handshake is never aborted — only its late
//! result is ignored — so a slow exchange can still be observed in logs after
//! its waiters have already failed with `Timeout`.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::ErrorCode;
use crate::net::{HttpRequest, HttpTransport, Method};
use crate::session::{
    CodeProvider, Credential, HEADER_LOGIN_CODE, SESSION_MAGIC_ID, SessionStore,
};

// =============================================================================
// ERRORS
// =============================================================================

/// Why a login attempt failed. `Clone` because one outcome broadcasts to
/// every coalesced waiter.
#[derive(Clone, Debug, thiserror::Error)]
pub enum LoginError {
    /// The platform refused to hand out a transient code.
    #[error("platform login failed: {detail}")]
    PlatformCode { detail: String },
    /// The exchange call failed at the transport or returned a non-2xx.
    #[error("login request failed: {detail}")]
    RequestFailed { detail: String },
    /// The exchange answered without a usable session.
    #[error("login response carried no session")]
    MissingSession,
    /// The handshake outlived the configured window.
    #[error("login timed out after {after:?}")]
    Timeout { after: Duration },
    /// No login url has been configured yet.
    #[error("no login url configured")]
    MissingUrl,
}

impl ErrorCode for LoginError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::PlatformCode { .. } => "ERR_LOGIN_PLATFORM_CODE",
            Self::RequestFailed { .. } => "ERR_LOGIN_REQUEST_FAILED",
            Self::MissingSession => "ERR_LOGIN_MISSING_SESSION",
            Self::Timeout { .. } => "ERR_LOGIN_TIMEOUT",
            Self::MissingUrl => "ERR_LOGIN_MISSING_URL",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::RequestFailed { .. } | Self::Timeout { .. })
    }
}

// =============================================================================
// GATE
// =============================================================================

type LoginResult = Result<Credential, LoginError>;

/// Pending-waiters state for the at-most-one in-flight handshake.
struct Flight {
    /// Bumped when a new handshake launches; stale completions are dropped.
    generation: u64,
    busy: bool,
    waiters: Vec<oneshot::Sender<LoginResult>>,
}

struct GateInner {
    http: Arc<dyn HttpTransport>,
    codes: Arc<dyn CodeProvider>,
    store: Arc<dyn SessionStore>,
    login_url: Mutex<Option<String>>,
    timeout: Duration,
    flight: Mutex<Flight>,
}

/// Serializes concurrent login attempts into one handshake. Cheap to clone.
#[derive(Clone)]
pub struct LoginGate {
    inner: Arc<GateInner>,
}

impl LoginGate {
    #[must_use]
    pub fn new(
        http: Arc<dyn HttpTransport>,
        codes: Arc<dyn CodeProvider>,
        store: Arc<dyn SessionStore>,
        login_url: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(GateInner {
                http,
                codes,
                store,
                login_url: Mutex::new(login_url),
                timeout,
                flight: Mutex::new(Flight { generation: 0, busy: false, waiters: Vec::new() }),
            }),
        }
    }

    /// Point the exchange at a (new) login endpoint.
    pub fn set_login_url(&self, url: impl Into<String>) {
        let mut slot = self.inner.login_url.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(url.into());
    }

    #[must_use]
    pub fn login_url(&self) -> Option<String> {
        self.inner.login_url.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Resolve a credential: cached, or via the (possibly shared) handshake.
    ///
    /// # Errors
    ///
    /// Any [`LoginError`]; coalesced callers all receive the same one.
    pub async fn login(&self) -> LoginResult {
        let (rx, launched) = {
            let mut flight = self.inner.flight.lock().unwrap_or_else(PoisonError::into_inner);
            if !flight.busy {
                if let Some(credential) = self.inner.store.get() {
                    return Ok(credential);
                }
            }
            let (tx, rx) = oneshot::channel();
            flight.waiters.push(tx);
            if flight.busy {
                debug!(waiters = flight.waiters.len(), "login: joining in-flight handshake");
                (rx, None)
            } else {
                flight.busy = true;
                flight.generation += 1;
                (rx, Some(flight.generation))
            }
        };

        if let Some(generation) = launched {
            debug!(generation, "login: launching handshake");
            self.launch(generation);
        }

        match rx.await {
            Ok(result) => result,
            // The gate never drops a registered waiter while a flight is
            // pending; this arm only fires if the runtime tore down mid-login.
            Err(_) => Err(LoginError::RequestFailed { detail: "login resolver dropped".into() }),
        }
    }

    /// Race the handshake against the timeout; first `finish` wins.
    fn launch(&self, generation: u64) {
        let gate = self.clone();
        tokio::spawn(async move {
            let result = gate.handshake().await;
            gate.finish(generation, result);
        });

        let gate = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(gate.inner.timeout).await;
            gate.finish(generation, Err(LoginError::Timeout { after: gate.inner.timeout }));
        });
    }

    async fn handshake(&self) -> LoginResult {
        let Some(url) = self.login_url() else {
            return Err(LoginError::MissingUrl);
        };

        let code = self
            .inner
            .codes
            .auth_code()
            .await
            .map_err(|err| LoginError::PlatformCode { detail: err.to_string() })?;

        let request = HttpRequest {
            url: url.clone(),
            method: Method::Get,
            headers: vec![(HEADER_LOGIN_CODE.to_owned(), code)],
            body: None,
        };
        debug!(%url, "login: exchanging code for a session");
        let response = self
            .inner
            .http
            .perform(request)
            .await
            .map_err(|err| LoginError::RequestFailed { detail: err.to_string() })?;

        if !(200..300).contains(&response.status) {
            return Err(LoginError::RequestFailed {
                detail: format!("login endpoint returned status {}", response.status),
            });
        }

        parse_session(&response.body).ok_or(LoginError::MissingSession)
    }

    /// Resolve the flight if `generation` is still current; otherwise drop
    /// the result. Caching happens under the same lock so a finished login is
    /// visible to the next caller atomically.
    fn finish(&self, generation: u64, result: LoginResult) {
        let waiters = {
            let mut flight = self.inner.flight.lock().unwrap_or_else(PoisonError::into_inner);
            if flight.generation != generation || !flight.busy {
                debug!(generation, ok = result.is_ok(), "login: discarding late result");
                return;
            }
            flight.busy = false;
            if let Ok(credential) = &result {
                self.inner.store.set(credential.clone());
            }
            std::mem::take(&mut flight.waiters)
        };

        debug!(waiters = waiters.len(), ok = result.is_ok(), "login: resolving waiters");
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

/// Extract the credential from an exchange body: requires the magic marker
/// and a well-formed `session` object.
fn parse_session(body: &Value) -> Option<Credential> {
    let object = body.as_object()?;
    if !object.contains_key(SESSION_MAGIC_ID) {
        return None;
    }
    serde_json::from_value(object.get("session")?.clone()).ok()
}

#[cfg(test)]
#[path = "login_test.rs"]
mod tests;
