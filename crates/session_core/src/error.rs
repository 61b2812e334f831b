use std::fmt;

use shared::error::ErrorDetail;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorCode {
    Timeout,
    ConnectFailed,
    ConnectionLost,
    ResourceExhausted,
    Other,
}

impl TransportErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportErrorCode::Timeout => "timeout",
            TransportErrorCode::ConnectFailed => "connect_failed",
            TransportErrorCode::ConnectionLost => "connection_lost",
            TransportErrorCode::ResourceExhausted => "resource_exhausted",
            TransportErrorCode::Other => "other",
        }
    }

    fn hint(self) -> &'static str {
        match self {
            TransportErrorCode::Timeout => "The server took too long to respond. Please try again.",
            TransportErrorCode::ConnectFailed => {
                "Unable to reach the server. Please check your internet connection."
            }
            TransportErrorCode::ConnectionLost => {
                "The connection was interrupted. Please check your internet connection."
            }
            TransportErrorCode::ResourceExhausted => {
                "The device is out of resources. Close some tabs or applications and retry."
            }
            TransportErrorCode::Other => "A network error occurred. Please try again.",
        }
    }
}

impl fmt::Display for TransportErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// No response reached the client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct TransportError {
    pub code: TransportErrorCode,
    pub message: String,
}

impl TransportError {
    pub fn new(code: TransportErrorCode) -> Self {
        Self {
            code,
            message: code.hint().to_string(),
        }
    }

    pub(crate) fn from_reqwest(err: &reqwest::Error) -> Self {
        Self::new(classify_reqwest_error(err))
    }
}

fn classify_reqwest_error(err: &reqwest::Error) -> TransportErrorCode {
    if is_resource_exhaustion(err) {
        return TransportErrorCode::ResourceExhausted;
    }
    if err.is_timeout() {
        TransportErrorCode::Timeout
    } else if err.is_connect() {
        TransportErrorCode::ConnectFailed
    } else if err.is_request() || err.is_body() || err.is_decode() {
        TransportErrorCode::ConnectionLost
    } else {
        TransportErrorCode::Other
    }
}

const ENOMEM: i32 = 12;
const ENFILE: i32 = 23;
const EMFILE: i32 = 24;
#[cfg(target_os = "linux")]
const ENOBUFS: i32 = 105;
#[cfg(not(target_os = "linux"))]
const ENOBUFS: i32 = 55;

// Exhaustion surfaces as an io error somewhere in the source chain.
fn is_resource_exhaustion(err: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(err);
    while let Some(current) = source {
        if let Some(io) = current.downcast_ref::<std::io::Error>() {
            if is_exhausted_io(io) {
                return true;
            }
        }
        source = current.source();
    }
    false
}

fn is_exhausted_io(io: &std::io::Error) -> bool {
    if io.kind() == std::io::ErrorKind::OutOfMemory {
        return true;
    }
    // Windows reuses these numbers for unrelated errors.
    cfg!(unix)
        && matches!(
            io.raw_os_error(),
            Some(ENOMEM) | Some(ENFILE) | Some(EMFILE) | Some(ENOBUFS)
        )
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("token refresh failed: {reason}")]
    RefreshFailed { reason: String },
    #[error("request was rejected again after a token refresh")]
    RetryRejected,
    #[error("no refresh token available")]
    MissingRefreshToken,
    #[error("token refresh was abandoned before completing")]
    RefreshAbandoned,
}

/// Well-formed error response from the API, passed through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("request failed with status {status}")]
pub struct BusinessError {
    pub status: u16,
    pub body: String,
}

impl BusinessError {
    pub fn detail(&self) -> Option<String> {
        serde_json::from_str::<ErrorDetail>(&self.body)
            .ok()
            .map(|detail| detail.detail)
    }
}

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Business(#[from] BusinessError),
    #[error("failed to decode response body: {0}")]
    Decode(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    /// The caller must treat the session as invalid and force a logout.
    pub fn is_session_invalid(&self) -> bool {
        matches!(self, GatewayError::Auth(_))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::Business(err) => Some(err.status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("cannot {operation}: realtime channel is not connected")]
    NotConnected { operation: &'static str },
    #[error("no active session")]
    NoSession,
    #[error("invalid realtime url: {0}")]
    InvalidUrl(String),
    #[error("realtime connect failed: {0}")]
    Connect(String),
    #[error("realtime connect timed out")]
    ConnectTimeout,
    #[error("realtime connection closed: {0}")]
    Closed(String),
    #[error("realtime protocol error: {0}")]
    Protocol(String),
}

#[cfg(test)]
#[path = "tests/error_tests.rs"]
mod tests;
