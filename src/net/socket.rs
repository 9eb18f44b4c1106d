//! Socket transport seam and its tokio-tungstenite default.
//!
//! ARCHITECTURE
//! ============
//! A connected socket is a pair of channels, not an object: the connector
//! hands back a [`SocketHandle`] whose sender carries outbound text frames
//! and whose receiver yields inbound [`SocketEvent`]s. The default
//! implementation spawns a pump task bridging the split WebSocket stream and
//! sink onto those channels.
//!
//! LIFECYCLE
//! =========
//! Dropping every clone of the outbound sender is the close signal: the pump
//! sends a WS close frame, drains the peer's reply, and finishes with
//! [`SocketEvent::Closed`]. A transport-initiated error is reported as
//! [`SocketEvent::Error`] followed by `Closed` once the stream ends.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::debug;

use crate::net::TransportError;

// =============================================================================
// EVENTS & HANDLE
// =============================================================================

/// What a connected socket can report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketEvent {
    /// A complete inbound text frame.
    Message(String),
    /// A transport-level failure; `Closed` follows once the stream ends.
    Error(String),
    /// The connection is gone, whichever side initiated it.
    Closed,
}

/// A live socket connection as a channel pair.
pub struct SocketHandle {
    /// Outbound text frames. Dropping all senders closes the connection.
    pub tx: mpsc::UnboundedSender<String>,
    /// Inbound events, ending with [`SocketEvent::Closed`].
    pub rx: mpsc::UnboundedReceiver<SocketEvent>,
}

// =============================================================================
// CONNECTOR SEAM
// =============================================================================

/// Raw socket transport collaborator.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<SocketHandle, TransportError>;
}

// =============================================================================
// TUNGSTENITE DEFAULT
// =============================================================================

/// Default [`SocketConnector`] over tokio-tungstenite.
#[derive(Clone, Copy, Debug, Default)]
pub struct TungsteniteConnector;

impl TungsteniteConnector {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<SocketHandle, TransportError> {
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|err| TransportError::new("socket connect failed", err.to_string()))?;
        debug!(%url, "socket: connected");

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<SocketEvent>();

        tokio::spawn(async move {
            'pump: loop {
                tokio::select! {
                    outbound = out_rx.recv() => match outbound {
                        Some(text) => {
                            if let Err(err) = sink.send(WsMessage::Text(text.into())).await {
                                let _ = in_tx.send(SocketEvent::Error(err.to_string()));
                                break 'pump;
                            }
                        }
                        // Every sender dropped: local close.
                        None => {
                            let _ = sink.close().await;
                            break 'pump;
                        }
                    },
                    inbound = stream.next() => match inbound {
                        Some(Ok(WsMessage::Text(text))) => {
                            let _ = in_tx.send(SocketEvent::Message(text.to_string()));
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            let _ = in_tx.send(SocketEvent::Closed);
                            return;
                        }
                        // Binary and WS-level ping/pong frames are not part of
                        // the text protocol.
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            let _ = in_tx.send(SocketEvent::Error(err.to_string()));
                            let _ = in_tx.send(SocketEvent::Closed);
                            return;
                        }
                    },
                }
            }

            // Local close or send failure: drain until the peer acknowledges.
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            let _ = in_tx.send(SocketEvent::Closed);
        });

        Ok(SocketHandle { tx: out_tx, rx: in_rx })
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================
