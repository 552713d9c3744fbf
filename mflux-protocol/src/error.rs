//! Protocol error types.

use crate::xml::XmlError;
use thiserror::Error;

/// Errors raised while framing requests or demultiplexing responses.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported packet format marker: {0:#04x}")]
    UnsupportedFormat(u8),

    #[error("invalid packet header: {0}")]
    InvalidHeader(String),

    #[error("mime type too long: {0} bytes (max {max})", max = i16::MAX)]
    MimeTypeTooLong(usize),

    #[error("incomplete packet {index}")]
    IncompletePacket { index: usize },

    #[error("mismatch number of service outputs: expecting {expected}, found {found}")]
    OutputCountMismatch { expected: usize, found: i32 },

    #[error("packet {index} declares {found} remaining packets, expected {expected}")]
    PacketCountMismatch {
        index: usize,
        expected: usize,
        found: i32,
    },

    #[error("packet {index} has unknown length but is not the final packet")]
    UnknownLengthNotFinal { index: usize },

    #[error("invalid chunk size: {0:?}")]
    InvalidChunkSize(String),

    #[error("chunk length override {declared} does not match echoed length {echoed}")]
    ChunkLengthMismatch { declared: i64, echoed: i64 },

    #[error("invalid HTTP response: {0}")]
    HttpResponse(String),

    #[error("unexpected HTTP/{version} response: {code} {reason}{}", content_suffix(.content))]
    HttpStatus {
        version: String,
        code: u16,
        reason: String,
        content: Option<String>,
    },

    #[error("proxy authentication required")]
    ProxyAuthenticationRequired,

    #[error("unexpected reply type: {0:?}")]
    UnexpectedReplyType(Option<String>),

    #[error("receive timed out")]
    Timeout,

    #[error("XML error: {0}")]
    Xml(#[from] XmlError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn content_suffix(content: &Option<String>) -> String {
    match content {
        Some(c) => format!(". Content: {}", c),
        None => String::new(),
    }
}

impl ProtocolError {
    /// Maps a socket error, separating timeouts from other failures.
    pub fn from_read(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => ProtocolError::Timeout,
            _ => ProtocolError::Io(err),
        }
    }
}
