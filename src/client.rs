//! Client context: configuration, collaborators, and subsystems in one place.
//!
//! DESIGN
//! ======
//! Everything hangs off a [`Client`] value instead of process-wide singletons,
//! so two clients in one process never share credentials, pipelines, or
//! tunnels. The context is cheap to clone; clones share the same state.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{ParameterError, ensure_http_url};
use crate::login::{LoginError, LoginGate};
use crate::net::{
    HttpResponse, HttpTransport, ReqwestTransport, SocketConnector, TransportError,
    TungsteniteConnector,
};
use crate::request::{RequestError, RequestOptions, RequestPipeline};
use crate::session::{CodeProvider, Credential, MemorySessionStore, SessionStore};
use crate::tunnel::{Tunnel, TunnelState};

/// The client context.
#[derive(Clone)]
pub struct Client {
    config: Arc<ClientConfig>,
    pipeline: RequestPipeline,
    gate: LoginGate,
    sockets: Arc<dyn SocketConnector>,
    store: Arc<dyn SessionStore>,
    /// Watcher onto the most recently constructed tunnel, for the
    /// one-live-tunnel rule.
    tunnel_state: Arc<Mutex<Option<watch::Receiver<TunnelState>>>>,
}

impl Client {
    /// Wire a client from explicit collaborators.
    #[must_use]
    pub fn new(
        config: ClientConfig,
        http: Arc<dyn HttpTransport>,
        sockets: Arc<dyn SocketConnector>,
        codes: Arc<dyn CodeProvider>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let gate = LoginGate::new(
            Arc::clone(&http),
            codes,
            Arc::clone(&store),
            config.login_url.clone(),
            config.login_timeout,
        );
        let pipeline =
            RequestPipeline::new(http, gate.clone(), Arc::clone(&store), config.max_retry_times);
        Self {
            config: Arc::new(config),
            pipeline,
            gate,
            sockets,
            store,
            tunnel_state: Arc::new(Mutex::new(None)),
        }
    }

    /// Wire a client over the default reqwest and tungstenite transports,
    /// with credentials held in memory.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the HTTP client cannot be built.
    pub fn with_defaults(
        config: ClientConfig,
        codes: Arc<dyn CodeProvider>,
    ) -> Result<Self, TransportError> {
        let http = Arc::new(ReqwestTransport::new()?);
        Ok(Self::new(
            config,
            http,
            Arc::new(TungsteniteConnector::new()),
            codes,
            Arc::new(MemorySessionStore::new()),
        ))
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Resolve a credential: cached, or via the shared login handshake.
    ///
    /// # Errors
    ///
    /// Any [`LoginError`]; concurrent callers receive the same outcome.
    pub async fn login(&self) -> Result<Credential, LoginError> {
        self.gate.login().await
    }

    /// Point the login exchange at a (new) endpoint at runtime.
    pub fn set_login_url(&self, url: impl Into<String>) {
        self.gate.set_login_url(url);
    }

    /// The cached credential, if any.
    #[must_use]
    pub fn session(&self) -> Option<Credential> {
        self.store.get()
    }

    /// Forget the cached credential; the next request logs in afresh.
    pub fn clear_session(&self) {
        self.store.clear();
    }

    /// One authenticated request with transparent session renewal.
    ///
    /// # Errors
    ///
    /// [`RequestError::InvalidOptions`] before any I/O for malformed options;
    /// otherwise login, transport, or session failures as typed variants.
    pub async fn request(&self, options: RequestOptions) -> Result<HttpResponse, RequestError> {
        self.pipeline.dispatch(options).await
    }

    /// Construct a tunnel to `service_url`. The tunnel is handed back Closed;
    /// call [`Tunnel::open`] to start it.
    ///
    /// At most one tunnel per client may be live at a time. A tunnel counts
    /// as live from construction until it settles Closed.
    ///
    /// # Errors
    ///
    /// [`ParameterError::TunnelLive`] while a previous tunnel is live, and
    /// url validation errors for a malformed `service_url`.
    pub fn tunnel(&self, service_url: impl Into<String>) -> Result<Tunnel, ParameterError> {
        let service_url = service_url.into();
        ensure_http_url(&service_url)?;

        let mut slot = self.tunnel_state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(watcher) = slot.as_ref() {
            if *watcher.borrow() != TunnelState::Closed {
                return Err(ParameterError::TunnelLive);
            }
        }

        debug!(url = %service_url, "client: tunnel constructed");
        let tunnel = Tunnel::new(
            service_url,
            self.pipeline.clone(),
            Arc::clone(&self.sockets),
            self.config.reconnect_base,
            self.config.max_reconnect_attempts,
        );
        *slot = Some(tunnel.watch_state());
        Ok(tunnel)
    }
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;
