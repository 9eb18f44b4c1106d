//! Session credential, its storage seam, and the platform code seam.
//!
//! ARCHITECTURE
//! ============
//! The service authenticates requests with an id/skey pair minted by the login
//! exchange. The pair lives behind [`SessionStore`] so hosts can persist it in
//! platform storage; the default [`MemorySessionStore`] keeps it in memory.
//! Obtaining the transient login code is a platform UI flow, so it also sits
//! behind a seam, [`CodeProvider`].
//!
//! DESIGN
//! ======
//! - Wire constants keep the deployed service's magic values; renaming them
//!   would break live backends.
//! - Session control messages ride inside ordinary response bodies, flagged by
//!   [`SESSION_MAGIC_ID`] appearing as a key.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// =============================================================================
// WIRE CONSTANTS
// =============================================================================

/// Body key marking a response as a session-layer control message.
pub const SESSION_MAGIC_ID: &str = "F2C224D4-2BCE-4C64-AF9F-A6D872000D1A";

/// Sentinel `error` value meaning the credential is stale and must be renewed.
pub const CODE_SESSION_EXPIRED: &str = "ERR_SESSION_EXPIRED";

/// Request header carrying the credential id.
pub const HEADER_SESSION_ID: &str = "X-Session-Id";

/// Request header carrying the credential skey.
pub const HEADER_SESSION_SKEY: &str = "X-Session-Skey";

/// Request header carrying the transient platform code during login.
pub const HEADER_LOGIN_CODE: &str = "X-Login-Code";

// =============================================================================
// CREDENTIAL
// =============================================================================

/// Opaque bearer pair proving session authenticity.
///
/// Minted by the login exchange, injected into every authenticated request,
/// and cleared when the service reports it expired.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub skey: String,
}

// =============================================================================
// SESSION STORE
// =============================================================================

/// Persisted credential storage.
///
/// Implementations must be cheap to call; the request pipeline consults the
/// store on every attempt.
pub trait SessionStore: Send + Sync {
    fn get(&self) -> Option<Credential>;
    fn set(&self, credential: Credential);
    fn clear(&self);
}

/// In-memory [`SessionStore`], the default when hosts have no persistence.
#[derive(Default)]
pub struct MemorySessionStore {
    slot: Mutex<Option<Credential>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self) -> Option<Credential> {
        self.slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    fn set(&self, credential: Credential) {
        *self.slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(credential);
    }

    fn clear(&self) {
        *self.slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }
}

// =============================================================================
// CODE PROVIDER
// =============================================================================

/// Failure to obtain a transient platform code.
#[derive(Clone, Debug, thiserror::Error)]
#[error("auth code unavailable: {0}")]
pub struct CodeError(pub String);

/// The platform login flow behind a seam.
///
/// `auth_code` yields the short-lived code the login endpoint exchanges for a
/// [`Credential`]. Hosts wrap their platform bridge here; tests script it.
#[async_trait]
pub trait CodeProvider: Send + Sync {
    async fn auth_code(&self) -> Result<String, CodeError>;
}

/// [`CodeProvider`] handing out one fixed code.
///
/// Useful for development backends that accept a preconfigured code, and for
/// tests.
pub struct StaticCodeProvider {
    code: String,
}

impl StaticCodeProvider {
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into() }
    }
}

#[async_trait]
impl CodeProvider for StaticCodeProvider {
    async fn auth_code(&self) -> Result<String, CodeError> {
        Ok(self.code.clone())
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
