//! Tunnel event vocabulary and the ordered handler registry.
//!
//! DESIGN
//! ======
//! Handlers subscribe by event name, with `"*"` as a match-everything
//! wildcard. The session layer owns five lifecycle names; an inbound
//! application message that collides with one of them is delivered under an
//! `@`-escaped name instead, so application traffic can never impersonate a
//! lifecycle notification.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Value, json};
use tracing::debug;

use crate::tunnel::TunnelError;

/// Lifecycle names emitted by the session layer itself.
pub const RESERVED_EVENTS: [&str; 5] = ["connect", "close", "reconnecting", "reconnect", "error"];

// =============================================================================
// EVENTS
// =============================================================================

/// Everything a tunnel can tell its subscribers.
#[derive(Clone, Debug)]
pub enum TunnelEvent {
    /// The tunnel reached Active for the first time.
    Connect,
    /// The tunnel closed, locally or by the service.
    Close,
    /// A reconnect attempt is about to run.
    Reconnecting { attempt: u32 },
    /// A reconnect attempt restored the connection.
    Reconnect,
    /// A terminal or transport failure.
    Error(TunnelError),
    /// Application message forwarded from the wire; reserved-name collisions
    /// arrive escaped with `@`.
    Message { kind: String, content: Option<Value> },
}

impl TunnelEvent {
    /// The name handlers subscribe under.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Connect => "connect",
            Self::Close => "close",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Reconnect => "reconnect",
            Self::Error(_) => "error",
            Self::Message { kind, .. } => kind,
        }
    }

    /// The payload as a JSON value, `Null` for bare lifecycle events.
    #[must_use]
    pub fn payload(&self) -> Value {
        match self {
            Self::Connect | Self::Close | Self::Reconnect => Value::Null,
            Self::Reconnecting { attempt } => json!({ "attempt": attempt }),
            Self::Error(err) => json!({ "code": err.code(), "message": err.to_string() }),
            Self::Message { content, .. } => content.clone().unwrap_or(Value::Null),
        }
    }

    /// Wrap an inbound application message, escaping reserved collisions.
    #[must_use]
    pub fn inbound_message(kind: &str, content: Option<Value>) -> Self {
        let kind = if RESERVED_EVENTS.contains(&kind) {
            format!("@{kind}")
        } else {
            kind.to_owned()
        };
        Self::Message { kind, content }
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

enum Filter {
    Any,
    Named(String),
}

impl Filter {
    fn matches(&self, event: &TunnelEvent) -> bool {
        match self {
            Self::Any => true,
            Self::Named(name) => event.name() == name,
        }
    }
}

type Handler = Arc<dyn Fn(&TunnelEvent) + Send + Sync>;

struct Entry {
    filter: Filter,
    handler: Handler,
}

/// Ordered handler registry: registration order is dispatch order.
#[derive(Default)]
pub struct EventRegistry {
    entries: Mutex<Vec<Entry>>,
}

impl EventRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event name, or for every event via `"*"`.
    pub fn register(&self, name: &str, handler: impl Fn(&TunnelEvent) + Send + Sync + 'static) {
        let filter = if name == "*" {
            Filter::Any
        } else {
            Filter::Named(name.to_owned())
        };
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.push(Entry { filter, handler: Arc::new(handler) });
    }

    /// Invoke every matching handler in registration order.
    ///
    /// Handlers run outside the registry lock, so a handler may register
    /// further handlers; those take effect from the next dispatch onward.
    pub fn dispatch(&self, event: &TunnelEvent) {
        let matching: Vec<Handler> = {
            let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries
                .iter()
                .filter(|entry| entry.filter.matches(event))
                .map(|entry| Arc::clone(&entry.handler))
                .collect()
        };
        debug!(event = event.name(), handlers = matching.len(), "tunnel: dispatching event");
        for handler in matching {
            handler(event);
        }
    }
}

#[cfg(test)]
#[path = "events_test.rs"]
mod tests;
