//! Client-side networking core for sandboxed mini-app backends.
//!
//! Two subsystems share one [`Client`] context:
//!
//! - a session-gated request pipeline: every call logs in (once, however many
//!   callers race), injects the credential headers, and transparently renews
//!   an expired session before the caller sees anything;
//! - an evented socket [`Tunnel`](tunnel::Tunnel): authenticated endpoint
//!   discovery, a text packet protocol with heartbeats, an outbound queue for
//!   packets emitted before the connection is up, and linear-backoff
//!   reconnection.
//!
//! Transports sit behind [`HttpTransport`] and [`SocketConnector`] seams with
//! reqwest and tokio-tungstenite defaults, so hosts can swap in their
//! platform bridges and tests can script every exchange.

pub mod client;
pub mod config;
pub mod error;
pub mod login;
pub mod net;
pub mod request;
pub mod session;
pub mod tunnel;

pub use client::Client;
pub use config::ClientConfig;
pub use error::{ErrorCode, ParameterError};
pub use login::{LoginError, LoginGate};
pub use net::{
    HttpRequest, HttpResponse, HttpTransport, Method, ReqwestTransport, SocketConnector,
    SocketEvent, SocketHandle, TransportError, TungsteniteConnector,
};
pub use request::{RequestError, RequestOptions, RequestPipeline};
pub use session::{
    CodeError, CodeProvider, Credential, MemorySessionStore, SessionStore, StaticCodeProvider,
};
pub use tunnel::{
    Envelope, Packet, RESERVED_EVENTS, Tunnel, TunnelError, TunnelEvent, TunnelState,
};
