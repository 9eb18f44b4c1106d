//! Persistent tunnel to the service over a discovered socket endpoint.
//!
//! ARCHITECTURE
//! ============
//! A [`Tunnel`] is a cheap handle around shared state; `open()` spawns one
//! driver task that owns the connection end to end: authenticated discovery
//! of the socket url, the socket itself, the heartbeat, and the linear
//! reconnect loop. Callers interact only through the handle: `emit` queues
//! or sends, `close` asks for an orderly shutdown, `on` subscribes to
//! events.
//!
//! LIFECYCLE
//! =========
//! Closed → Preparing (discovery) → Connecting (socket dial) → Active.
//! A lost connection moves to Reconnecting and back to Active, or settles
//! Closed once the attempt cap is spent. State always settles before the
//! event announcing it is dispatched, so handlers observe the new state.
//!
//! DESIGN
//! ======
//! - State lives in a `watch` channel: transitions are compare-and-swap via
//!   `send_if_modified`, and the client keeps a receiver to enforce its
//!   one-live-tunnel rule without holding a reference to the tunnel itself.
//! - The outbound sender sits in a mutex slot. Taking it is how close and
//!   the heartbeat force a shutdown; the socket pump treats a fully dropped
//!   sender as the close signal.

pub mod events;
pub mod packet;

mod driver;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::ErrorCode;
use crate::net::SocketConnector;
use crate::request::RequestPipeline;

pub use events::{EventRegistry, RESERVED_EVENTS, TunnelEvent};
pub use packet::{Envelope, Packet};

// =============================================================================
// ERRORS
// =============================================================================

/// Why a tunnel failed. `Clone` because errors are also broadcast as events.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TunnelError {
    /// Service discovery never yielded a socket url.
    #[error("tunnel service discovery failed: {detail}")]
    ConnectService { detail: String },
    /// The socket transport failed.
    #[error("tunnel socket error: {detail}")]
    Socket { detail: String },
    /// Reconnection gave up after the configured attempt cap.
    #[error("tunnel reconnect gave up after {attempts} attempts")]
    Reconnect { attempts: u32 },
}

impl TunnelError {
    /// Numeric code as deployed clients of the service report it.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            Self::ConnectService { .. } => 1001,
            Self::Reconnect { .. } => 2001,
            Self::Socket { .. } => 3001,
        }
    }
}

impl ErrorCode for TunnelError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::ConnectService { .. } => "ERR_TUNNEL_CONNECT_SERVICE",
            Self::Socket { .. } => "ERR_TUNNEL_SOCKET",
            Self::Reconnect { .. } => "ERR_TUNNEL_RECONNECT",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Socket { .. })
    }
}

// =============================================================================
// STATE
// =============================================================================

/// Tunnel lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelState {
    Closed,
    Preparing,
    Connecting,
    Active,
    Reconnecting,
}

impl TunnelState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Preparing => "preparing",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// SHARED CORE
// =============================================================================

pub(crate) struct TunnelShared {
    pub(crate) service_url: String,
    pub(crate) pipeline: RequestPipeline,
    pub(crate) sockets: Arc<dyn SocketConnector>,
    pub(crate) state: watch::Sender<TunnelState>,
    pub(crate) registry: EventRegistry,
    /// Packets emitted before the tunnel reached Active, flushed in order.
    pub(crate) queue: Mutex<VecDeque<Packet>>,
    /// Outbound sender of the live connection. Single owner: taking it (and
    /// dropping it) closes the socket.
    pub(crate) socket_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pub(crate) reconnect_base: Duration,
    pub(crate) max_reconnect_attempts: u32,
}

impl TunnelShared {
    pub(crate) fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, next: TunnelState) {
        let from = self.state.send_replace(next);
        if from != next {
            debug!(from = %from, to = %next, "tunnel: state change");
        }
    }

    /// Flush the queue and install the sender; the tunnel is Active the
    /// moment both are done. Runs under the queue lock so an emit racing
    /// activation cannot strand a packet behind the flush.
    pub(crate) fn activate(&self, tx: mpsc::UnboundedSender<String>) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(packet) = queue.pop_front() {
            let _ = tx.send(packet.encode());
        }
        *self.socket_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        self.set_state(TunnelState::Active);
    }

    /// Send immediately when Active, otherwise hold in the queue.
    pub(crate) fn emit_packet(&self, packet: Packet) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if self.state() == TunnelState::Active {
            let slot = self.socket_tx.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(tx) = slot.as_ref() {
                if tx.send(packet.encode()).is_err() {
                    debug!("tunnel: dropping a frame aimed at a dead socket");
                }
                return;
            }
        }
        queue.push_back(packet);
    }

    /// Orderly close from this side: mark Closed, send the close packet, and
    /// drop the sender so the pump shuts the socket down. No-op unless
    /// Active. The driver dispatches the close event when the socket
    /// confirms.
    pub(crate) fn request_close(&self) -> bool {
        let closing = self.state.send_if_modified(|state| {
            if *state == TunnelState::Active {
                *state = TunnelState::Closed;
                true
            } else {
                false
            }
        });
        if !closing {
            debug!(state = %self.state(), "tunnel: close ignored");
            return false;
        }
        debug!(from = %TunnelState::Active, to = %TunnelState::Closed, "tunnel: state change");

        let tx = self.socket_tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(tx) = tx {
            let _ = tx.send(Packet::Close.encode());
        }
        true
    }
}

// =============================================================================
// PUBLIC HANDLE
// =============================================================================

/// Handle to one tunnel lifecycle. Cheap to clone; every clone drives the
/// same connection.
#[derive(Clone)]
pub struct Tunnel {
    shared: Arc<TunnelShared>,
}

impl Tunnel {
    pub(crate) fn new(
        service_url: String,
        pipeline: RequestPipeline,
        sockets: Arc<dyn SocketConnector>,
        reconnect_base: Duration,
        max_reconnect_attempts: u32,
    ) -> Self {
        let (state, _) = watch::channel(TunnelState::Closed);
        Self {
            shared: Arc::new(TunnelShared {
                service_url,
                pipeline,
                sockets,
                state,
                registry: EventRegistry::new(),
                queue: Mutex::new(VecDeque::new()),
                socket_tx: Mutex::new(None),
                reconnect_base,
                max_reconnect_attempts,
            }),
        }
    }

    /// Begin connecting. Spawns the driver task; a tunnel that is not Closed
    /// ignores the call.
    pub fn open(&self) {
        let started = self.shared.state.send_if_modified(|state| {
            if *state == TunnelState::Closed {
                *state = TunnelState::Preparing;
                true
            } else {
                false
            }
        });
        if started {
            debug!(url = %self.shared.service_url, "tunnel: opening");
            driver::spawn(Arc::clone(&self.shared));
        } else {
            debug!(state = %self.state(), "tunnel: open ignored");
        }
    }

    /// Send one application message, or queue it until the tunnel is Active.
    pub fn emit(&self, kind: impl Into<String>, content: Option<Value>) {
        self.shared.emit_packet(Packet::message(kind, content));
    }

    /// Close from this side. Ignored unless the tunnel is Active.
    pub fn close(&self) {
        self.shared.request_close();
    }

    /// Register an event handler; `"*"` receives every event.
    pub fn on(&self, name: &str, handler: impl Fn(&TunnelEvent) + Send + Sync + 'static) {
        self.shared.registry.register(name, handler);
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TunnelState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions as they happen.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<TunnelState> {
        self.shared.state.subscribe()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == TunnelState::Closed
    }

    #[must_use]
    pub fn is_preparing(&self) -> bool {
        self.state() == TunnelState::Preparing
    }

    #[must_use]
    pub fn is_connecting(&self) -> bool {
        self.state() == TunnelState::Connecting
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == TunnelState::Active
    }

    #[must_use]
    pub fn is_reconnecting(&self) -> bool {
        self.state() == TunnelState::Reconnecting
    }
}

#[cfg(test)]
#[path = "tunnel_test.rs"]
mod tests;
