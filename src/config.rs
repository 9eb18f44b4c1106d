//! Client configuration.
//!
//! Plain data with defaults matching the deployed service behavior; hosts
//! embed this crate, so there is no env or file layer here.

use std::time::Duration;

/// Tunable knobs for a [`crate::Client`].
///
/// Every field has a sensible default; construct with struct update syntax:
///
/// ```
/// use tether::ClientConfig;
/// let config = ClientConfig {
///     login_url: Some("https://example.com/login".into()),
///     ..ClientConfig::default()
/// };
/// ```
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Endpoint for the login code exchange. Login fails with `MissingUrl`
    /// until one is configured here or via `set_login_url`.
    pub login_url: Option<String>,
    /// How long a login handshake may run before every waiter fails with
    /// `Timeout`.
    pub login_timeout: Duration,
    /// Completed tries a logical request may accumulate before the next
    /// retry is refused; a maximum of 3 admits at most 4 raw calls.
    pub max_retry_times: u32,
    /// Base reconnect delay; attempt N waits `reconnect_base * N`.
    pub reconnect_base: Duration,
    /// Reconnect attempts before the tunnel gives up and closes.
    pub max_reconnect_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            login_url: None,
            login_timeout: Duration::from_millis(30_000),
            max_retry_times: 3,
            reconnect_base: Duration::from_millis(1_000),
            max_reconnect_attempts: 5,
        }
    }
}
