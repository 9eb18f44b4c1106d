//! Shared error vocabulary for the crate.
//!
//! DESIGN
//! ======
//! Each subsystem owns its error enum (`LoginError` in `login`, `RequestError`
//! in `request`, `TunnelError` in `tunnel`); this module holds what they share:
//! the [`ErrorCode`] trait and [`ParameterError`], the one error class that is
//! reported before any I/O happens. Caller misuse is a plain `Err`, never a
//! panic.

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for every public error type.
///
/// `error_code` strings are stable and safe to log or match on; `retryable`
/// marks failures that a caller may reasonably attempt again unchanged.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// PARAMETER ERRORS
// =============================================================================

/// Caller misuse detectable before any I/O.
///
/// Returned synchronously from constructors and validated entry points: no
/// login, transport, or timer activity has happened when one of these comes
/// back.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParameterError {
    /// The url field was empty.
    #[error("url is empty")]
    EmptyUrl,
    /// The url is not http(s); the request and discovery endpoints require it.
    #[error("url must be http or https: {url}")]
    UnsupportedScheme { url: String },
    /// A tunnel constructed earlier from the same client has not reached
    /// Closed yet.
    #[error("a live tunnel already exists; close it before constructing another")]
    TunnelLive,
}

impl ErrorCode for ParameterError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::EmptyUrl | Self::UnsupportedScheme { .. } => "ERR_INVALID_OPTIONS",
            Self::TunnelLive => "ERR_TUNNEL_ALREADY_LIVE",
        }
    }
}

/// Shared url precheck for the request pipeline and tunnel discovery.
pub(crate) fn ensure_http_url(url: &str) -> Result<(), ParameterError> {
    if url.is_empty() {
        return Err(ParameterError::EmptyUrl);
    }
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(ParameterError::UnsupportedScheme { url: url.to_owned() });
    }
    Ok(())
}

#[cfg(test)]
#[path = "error_test.rs"]
mod tests;
