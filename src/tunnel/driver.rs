//! Tunnel connection driver.
//!
//! One driver task runs per `open()`. It owns everything with a lifetime:
//! discovery, the socket receiver, the heartbeat clock, and the reconnect
//! loop. The handle side only flips state and feeds the outbound sender;
//! the driver reacts to what the socket reports.

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::net::{SocketEvent, SocketHandle};
use crate::request::RequestOptions;
use crate::tunnel::packet::{Envelope, Packet};
use crate::tunnel::{TunnelError, TunnelEvent, TunnelShared, TunnelState};

pub(crate) fn spawn(shared: Arc<TunnelShared>) {
    tokio::spawn(drive(shared));
}

/// Why the active phase ended.
enum Exit {
    /// This side closed on purpose; state is already Closed.
    SelfClosed,
    /// The connection died under us.
    Lost,
}

async fn drive(shared: Arc<TunnelShared>) {
    let mut handle = match establish(&shared, true).await {
        Ok(handle) => handle,
        Err(err) => {
            shared.set_state(TunnelState::Closed);
            shared.registry.dispatch(&TunnelEvent::Error(err));
            return;
        }
    };

    let mut first = true;
    loop {
        let SocketHandle { tx, mut rx } = handle;
        shared.activate(tx);
        if first {
            shared.registry.dispatch(&TunnelEvent::Connect);
        } else {
            shared.registry.dispatch(&TunnelEvent::Reconnect);
        }
        first = false;

        match run_active(&shared, &mut rx).await {
            Exit::SelfClosed => {
                shared.registry.dispatch(&TunnelEvent::Close);
                return;
            }
            Exit::Lost => match reconnect(&shared).await {
                Some(next) => handle = next,
                None => return,
            },
        }
    }
}

/// Pump inbound events until the connection ends, keeping the heartbeat.
///
/// The heartbeat arms when the service announces `timeout:<seconds>`: a ping
/// goes out every half interval, and a pong must land before the next half
/// interval passes or the connection is declared dead.
async fn run_active(shared: &TunnelShared, rx: &mut mpsc::UnboundedReceiver<SocketEvent>) -> Exit {
    let mut interval: Option<Duration> = None;
    let mut awaiting_pong = false;
    let mut deadline = Instant::now();

    loop {
        let event = if let Some(gap) = interval {
            tokio::select! {
                event = rx.recv() => event,
                () = tokio::time::sleep_until(deadline) => {
                    if awaiting_pong {
                        warn!("tunnel: heartbeat missed, dropping the connection");
                        drop_socket_tx(shared);
                        // The pump answers with Closed; keep reading until
                        // it does.
                        interval = None;
                        awaiting_pong = false;
                    } else {
                        send_control(shared, &Packet::Ping);
                        awaiting_pong = true;
                        deadline = Instant::now() + gap / 2;
                    }
                    continue;
                }
            }
        } else {
            rx.recv().await
        };

        match event {
            Some(SocketEvent::Message(raw)) => match Packet::decode(&raw) {
                Packet::Message(Some(envelope)) => {
                    let Envelope { kind, content } = envelope;
                    shared.registry.dispatch(&TunnelEvent::inbound_message(&kind, content));
                }
                Packet::Message(None) => {
                    warn!(frame = %raw, "tunnel: discarding message frame without an envelope");
                }
                Packet::Ping => send_control(shared, &Packet::Pong),
                Packet::Pong => {
                    if let Some(gap) = interval {
                        awaiting_pong = false;
                        deadline = Instant::now() + gap / 2;
                    }
                }
                Packet::Close => {
                    debug!("tunnel: service asked for a close");
                    shared.request_close();
                }
                Packet::Timeout(Some(seconds)) if seconds.is_finite() && seconds > 0.0 => {
                    let gap = Duration::from_secs_f64(seconds);
                    debug!(?gap, "tunnel: heartbeat armed");
                    interval = Some(gap);
                    awaiting_pong = false;
                    deadline = Instant::now() + gap / 2;
                }
                Packet::Timeout(_) => {
                    debug!(frame = %raw, "tunnel: ignoring unusable heartbeat announcement");
                }
                Packet::Unknown(frame) => {
                    debug!(%frame, "tunnel: ignoring unknown packet type");
                }
            },
            Some(SocketEvent::Error(detail)) => {
                shared.registry.dispatch(&TunnelEvent::Error(TunnelError::Socket { detail }));
            }
            Some(SocketEvent::Closed) | None => {
                drop_socket_tx(shared);
                return if shared.state() == TunnelState::Closed {
                    Exit::SelfClosed
                } else {
                    Exit::Lost
                };
            }
        }
    }
}

/// Linear-backoff reconnect loop: wait `base × attempt` before each try.
/// Returns the new connection, or `None` once the cap is spent and the
/// tunnel has settled Closed with a terminal error event.
async fn reconnect(shared: &TunnelShared) -> Option<SocketHandle> {
    shared.set_state(TunnelState::Reconnecting);
    let mut attempt: u32 = 1;
    loop {
        if attempt > shared.max_reconnect_attempts {
            warn!(attempts = attempt - 1, "tunnel: reconnect exhausted");
            shared.set_state(TunnelState::Closed);
            shared
                .registry
                .dispatch(&TunnelEvent::Error(TunnelError::Reconnect { attempts: attempt - 1 }));
            return None;
        }

        shared.registry.dispatch(&TunnelEvent::Reconnecting { attempt });
        tokio::time::sleep(shared.reconnect_base * attempt).await;

        match establish(shared, false).await {
            Ok(handle) => {
                debug!(attempt, "tunnel: reconnected");
                return Some(handle);
            }
            Err(err) => {
                debug!(attempt, error = %err, "tunnel: reconnect attempt failed");
                attempt += 1;
            }
        }
    }
}

/// Authenticated discovery followed by the socket dial. The first connect
/// publishes Connecting; reconnect attempts stay in Reconnecting.
async fn establish(shared: &TunnelShared, initial: bool) -> Result<SocketHandle, TunnelError> {
    let response = shared
        .pipeline
        .dispatch(RequestOptions::get(&shared.service_url))
        .await
        .map_err(|err| TunnelError::ConnectService { detail: err.to_string() })?;
    if response.status != 200 {
        return Err(TunnelError::ConnectService {
            detail: format!("discovery returned status {}", response.status),
        });
    }
    let Some(socket_url) = response.body.get("url").and_then(Value::as_str) else {
        return Err(TunnelError::ConnectService {
            detail: "discovery response carried no url".into(),
        });
    };

    if initial {
        shared.set_state(TunnelState::Connecting);
    }
    debug!(url = %socket_url, "tunnel: connecting socket");
    shared
        .sockets
        .connect(socket_url)
        .await
        .map_err(|err| TunnelError::Socket { detail: err.to_string() })
}

/// Send a control packet through the installed sender, if it is still there.
fn send_control(shared: &TunnelShared, packet: &Packet) {
    let slot = shared.socket_tx.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(tx) = slot.as_ref() {
        let _ = tx.send(packet.encode());
    }
}

/// Take and drop the outbound sender; the pump treats that as the order to
/// shut the socket down.
fn drop_socket_tx(shared: &TunnelShared) {
    drop(shared.socket_tx.lock().unwrap_or_else(PoisonError::into_inner).take());
}
