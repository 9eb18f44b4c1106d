//! Transport seams: HTTP and socket collaborators behind traits.
//!
//! The pipeline and tunnel never touch reqwest or tungstenite directly; they
//! talk to [`HttpTransport`] and [`SocketConnector`]. Defaults live here,
//! fakes live in the tests.

pub mod http;
pub mod socket;

pub use http::{HttpRequest, HttpResponse, HttpTransport, Method, ReqwestTransport};
pub use socket::{SocketConnector, SocketEvent, SocketHandle, TungsteniteConnector};

/// Failure inside a transport implementation.
///
/// Carries a static context ("what were we doing") plus the underlying
/// detail, flattened to a string so the error stays `Clone` for broadcast.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{context}: {detail}")]
pub struct TransportError {
    pub context: &'static str,
    pub detail: String,
}

impl TransportError {
    #[must_use]
    pub fn new(context: &'static str, detail: impl Into<String>) -> Self {
        Self { context, detail: detail.into() }
    }
}
