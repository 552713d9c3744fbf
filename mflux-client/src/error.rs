//! Client error types.

use mflux_protocol::{ProtocolError, XmlElement, XmlError};
use std::fmt;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(std::io::Error),

    #[error("not connected")]
    NotConnected,

    #[error("timed out")]
    Timeout,

    #[error("HTTP response error: {0}")]
    HttpResponse(String),

    #[error("proxy authentication required")]
    ProxyAuthenticationRequired,

    #[error("incomplete packet {index}")]
    IncompletePacket { index: usize },

    #[error("protocol error: {0}")]
    Protocol(ProtocolError),

    #[error("service error: {0}")]
    Service(ServiceError),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::Timeout
                | ClientError::IncompletePacket { .. }
                | ClientError::HttpResponse(_)
        )
    }

    /// The service error, if the server rejected the call.
    pub fn service_error(&self) -> Option<&ServiceError> {
        match self {
            ClientError::Service(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => ClientError::Timeout,
            _ => ClientError::Io(err),
        }
    }
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Timeout => ClientError::Timeout,
            ProtocolError::IncompletePacket { index } => ClientError::IncompletePacket { index },
            ProtocolError::ProxyAuthenticationRequired => ClientError::ProxyAuthenticationRequired,
            e @ (ProtocolError::HttpResponse(_) | ProtocolError::HttpStatus { .. }) => {
                ClientError::HttpResponse(e.to_string())
            }
            ProtocolError::Io(e) => ClientError::from(e),
            e => ClientError::Protocol(e),
        }
    }
}

impl From<XmlError> for ClientError {
    fn from(err: XmlError) -> Self {
        ClientError::Protocol(ProtocolError::Xml(err))
    }
}

/// An error reply returned by the server.
#[derive(Debug, Clone)]
pub struct ServiceError {
    /// Short error text, often the failing service name.
    pub error: Option<String>,
    pub message: Option<String>,
    /// Server-side stack trace.
    pub stack: Option<String>,
    /// The complete `reply` element.
    pub reply: XmlElement,
}

impl ServiceError {
    pub fn from_reply(reply: XmlElement) -> Self {
        let text = |path: &str| reply.value(path).ok().flatten();
        Self {
            error: text("error"),
            message: text("message"),
            stack: text("stack"),
            reply: reply.clone(),
        }
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.error, &self.message) {
            (Some(error), Some(message)) => write!(f, "{}: {}", error, message),
            (None, Some(message)) => f.write_str(message),
            (Some(error), None) => f.write_str(error),
            (None, None) => write!(f, "{}", self.reply),
        }
    }
}

impl std::error::Error for ServiceError {}
